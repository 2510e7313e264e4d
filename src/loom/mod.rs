//! The `loom` module coordinates memory and asynchronous work across heterogeneous devices
//! (the multicore host, GPUs and other accelerators) on behalf of a tensor-algebra runtime.
//! Kernels themselves are external; `loom` owns the bookkeeping around them.
//!
//! ## Key Components
//! 1. **Memory**:
//!    - Fixed-capacity slabs for small metadata records (`Slab`).
//!    - One argument buffer arena per device, carved first-fit into blocks (`Pool`).
//!    - Page-locked and registered host memory tracking (`PinnedMemory`).
//!    - A per-GPU table of resident constant kernel arguments (`ConstCache`).
//!
//! 2. **Device Abstraction**:
//!    - A closed set of device kinds and a flat/kind-local id bijection (`DeviceMap`).
//!    - Runtime capability interface (`Backend`) with a host and a simulated implementation.
//!
//! 3. **Residency**:
//!    - Tensor blocks record which devices hold a copy of their data (`TensorBlock`).
//!    - Copies are flagged unavailable while an operation writes them.
//!
//! 4. **Execution Model**:
//!    - Tasks move monotonically through `Scheduled`, `Started`, progress markers and a
//!      terminal state, driven only by the caller's `poll`/`wait`.
//!
//! All process-wide state lives in an explicit [`Context`](context::Context) with an
//! `initialize`/`shutdown` lifecycle, so independent contexts can coexist.

pub mod bounded;
pub mod context;
pub mod device;
pub mod error;
pub mod memory;
pub mod num;
pub mod ops;
pub mod platform;
pub mod task;
pub mod tensor;

pub use error::{Error, ErrorKind, Result};

/// Maximum number of devices a tensor block may reside on at once.
pub const MAX_DEV_PRESENT: usize = 16;
/// Operands of a tensor contraction: destination, left and right.
pub const MAX_TENSOR_OPERANDS: usize = 3;
/// Maximum rank of a tensor block.
pub const MAX_TENSOR_RANK: usize = 32;
/// Default bound on tasks in flight across all devices of a context.
pub const MAX_ACTIVE_TASKS: usize = 4096;
/// Default number of constant-argument slots per GPU.
pub const CONST_CACHE_ENTRIES: usize = 64;
/// Default allocation granule of argument buffer blocks, in bytes.
pub const BUFFER_GRANULE: usize = 256;
