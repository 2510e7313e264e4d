//! Bijection between flat device ids and `(kind, kind-local index)` pairs.

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{DeviceId, DeviceKind};
use crate::loom::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceMapError {
    #[error("no device {1} of kind {0}")]
    InvalidDevice(DeviceKind, u32),
    #[error("no device with flat id {0}")]
    InvalidFlatId(DeviceId),
    #[error("device {1} of kind {0} listed twice")]
    Duplicate(DeviceKind, u32),
    #[error("kind {0} cannot be listed")]
    InvalidKind(DeviceKind),
}

impl DeviceMapError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidArgs
    }
}

/// Built once from the per-kind device lists; read-only afterwards.
#[derive(Debug, Clone)]
pub struct DeviceMap {
    /// `(kind, local)` of each flat id.
    flat: Vec<(DeviceKind, u32)>,
    /// Flat id of each listed `(kind, local)` pair. Local indices may be sparse.
    local: HashMap<(DeviceKind, u32), DeviceId>,
}

impl DeviceMap {
    /// The host is always flat id `0`, followed by the listed GPUs, then accelerators.
    pub fn new(gpus: &[u32], accelerators: &[u32]) -> Result<Self, DeviceMapError> {
        let mut map = Self {
            flat: vec![],
            local: HashMap::default(),
        };
        map.insert(DeviceKind::Host, 0)?;
        for &local in gpus {
            map.insert(DeviceKind::Gpu, local)?;
        }
        for &local in accelerators {
            map.insert(DeviceKind::Accelerator, local)?;
        }
        Ok(map)
    }

    fn insert(&mut self, kind: DeviceKind, local: u32) -> Result<(), DeviceMapError> {
        if kind == DeviceKind::Unset {
            return Err(DeviceMapError::InvalidKind(kind));
        }
        let id = DeviceId(self.flat.len() as u32);
        if self.local.insert((kind, local), id).is_some() {
            return Err(DeviceMapError::Duplicate(kind, local));
        }
        self.flat.push((kind, local));
        Ok(())
    }

    /// Number of devices across all kinds.
    #[inline]
    pub fn len(&self) -> usize {
        self.flat.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flat.is_empty()
    }

    pub fn flat_id(&self, kind: DeviceKind, local: u32) -> Result<DeviceId, DeviceMapError> {
        self.local
            .get(&(kind, local))
            .copied()
            .ok_or(DeviceMapError::InvalidDevice(kind, local))
    }

    pub fn kind_id(&self, id: DeviceId) -> Result<(DeviceKind, u32), DeviceMapError> {
        self.flat
            .get(id.index())
            .copied()
            .ok_or(DeviceMapError::InvalidFlatId(id))
    }

    /// All flat ids, in order.
    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        (0..self.flat.len() as u32).map(DeviceId)
    }

    /// Flat ids of devices of `kind`, in listing order.
    pub fn ids_of(&self, kind: DeviceKind) -> impl Iterator<Item = DeviceId> + '_ {
        self.flat
            .iter()
            .positions(move |&(x, _)| x == kind)
            .map(|index| DeviceId(index as u32))
    }

    pub fn count(&self, kind: DeviceKind) -> usize {
        self.ids_of(kind).count()
    }
}
