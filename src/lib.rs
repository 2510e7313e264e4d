pub mod loom;

pub use loom::{
    Error, ErrorKind, Result,
    context::{Config, Context, Init, Limits, Placement, SourcePolicy},
    device::{DeviceId, DeviceKind},
    num::DataKind,
    ops::{Contraction, CopyControl, CopyMode},
    task::{Task, TaskStatus, wait_all, wait_all_async},
    tensor::{Shape, TensorBlock},
};
