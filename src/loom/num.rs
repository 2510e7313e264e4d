use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Numeric kind of the elements of a tensor copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataKind {
    /// Half precision real.
    F16,
    /// Single precision real.
    R4,
    /// Double precision real.
    R8,
    /// Single precision complex.
    C4,
    /// Double precision complex.
    C8,
}

impl DataKind {
    /// Returns the size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataKind::F16 => 2,
            DataKind::R4 => 4,
            DataKind::R8 => 8,
            DataKind::C4 => 8,
            DataKind::C8 => 16,
        }
    }

    pub const fn is_complex(self) -> bool {
        matches!(self, DataKind::C4 | DataKind::C8)
    }
}

pub trait Scalar: Sized + Copy + Default + Send + Sync + bytemuck::Pod {
    const DATA_KIND: DataKind;
}

impl Scalar for f16 {
    const DATA_KIND: DataKind = DataKind::F16;
}

impl Scalar for f32 {
    const DATA_KIND: DataKind = DataKind::R4;
}

impl Scalar for f64 {
    const DATA_KIND: DataKind = DataKind::R8;
}

/// Complex numbers as `[re, im]` pairs.
impl Scalar for [f32; 2] {
    const DATA_KIND: DataKind = DataKind::C4;
}

impl Scalar for [f64; 2] {
    const DATA_KIND: DataKind = DataKind::C8;
}
