//! Page-locked and registered host memory.
//!
//! Memory allocated here is owned by the manager and freed on release; memory registered
//! here is owned by the caller and only unregistered on release. The two are never confused.

use std::sync::Arc;

use derive_more::Display;
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loom::{
    ErrorKind,
    device::{Backend, BackendError},
};

#[derive(Debug, Error)]
pub enum PinError {
    #[error("no runtime is able to page-lock host memory")]
    NotAvailable,
    #[error("host address {0:#x} is not pinned or registered")]
    InvalidHandle(usize),
    #[error("host address {0:#x} is {1}, not {2}")]
    Mismatch(usize, PinState, PinState),
    #[error("host range at {0:#x} overlaps a tracked allocation")]
    Overlap(usize),
    #[error("zero-sized host allocation")]
    ZeroSize,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl PinError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PinError::NotAvailable => ErrorKind::NotAvailable,
            PinError::InvalidHandle(_) => ErrorKind::InvalidHandle,
            PinError::Mismatch(..) => ErrorKind::NotAllowed,
            PinError::Overlap(_) | PinError::ZeroSize => ErrorKind::InvalidArgs,
            PinError::Backend(err) => err.kind(),
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PinState {
    Free,
    /// Allocated and page-locked by the manager.
    Pinned,
    /// Caller memory page-locked in place.
    Registered,
}

#[derive(Debug)]
struct Allocation {
    size: usize,
    state: PinState,
    /// Present only for memory the manager allocated.
    storage: Option<Box<[u8]>>,
}

#[derive(Debug, Default)]
pub struct PinnedMemory {
    /// Runtime that owns page-locking; `None` when no device runtime supports it.
    pinner: Option<Arc<dyn Backend>>,
    allocations: HashMap<usize, Allocation>,
}

impl PinnedMemory {
    pub fn new(pinner: Option<Arc<dyn Backend>>) -> Self {
        Self {
            pinner,
            allocations: HashMap::default(),
        }
    }

    #[inline]
    pub fn can_pin(&self) -> bool {
        self.pinner.is_some()
    }

    pub fn state(&self, addr: usize) -> PinState {
        self.allocations
            .get(&addr)
            .map_or(PinState::Free, |x| x.state)
    }

    /// Allocates `size` bytes of host memory and page-locks them. Returns the host address.
    pub fn alloc_pinned(&mut self, size: usize) -> Result<usize, PinError> {
        if size == 0 {
            return Err(PinError::ZeroSize);
        }
        let pinner = self.pinner.as_ref().ok_or(PinError::NotAvailable)?;
        let storage = vec![0u8; size].into_boxed_slice();
        let addr = storage.as_ptr() as usize;
        pinner.pin(addr, size)?;

        let storage = Some(storage);
        let state = PinState::Pinned;
        self.allocations.insert(addr, Allocation { size, state, storage });
        log::debug!("pinned {size} bytes at {addr:#x}");
        Ok(addr)
    }

    /// Page-locks caller-owned memory in place.
    pub fn register(&mut self, addr: usize, size: usize) -> Result<(), PinError> {
        if size == 0 {
            return Err(PinError::ZeroSize);
        }
        let overlaps = self
            .allocations
            .iter()
            .any(|(&x, alloc)| addr < x + alloc.size && x < addr + size);
        if overlaps {
            return Err(PinError::Overlap(addr));
        }
        let pinner = self.pinner.as_ref().ok_or(PinError::NotAvailable)?;
        pinner.pin(addr, size)?;

        let state = PinState::Registered;
        self.allocations.insert(addr, Allocation { size, state, storage: None });
        log::debug!("registered {size} bytes at {addr:#x}");
        Ok(())
    }

    /// Unpins and frees memory obtained from [`alloc_pinned`](Self::alloc_pinned).
    pub fn free_pinned(&mut self, addr: usize) -> Result<(), PinError> {
        self.release(addr, PinState::Pinned)
    }

    /// Unpins memory registered with [`register`](Self::register), leaving it allocated.
    pub fn unregister(&mut self, addr: usize) -> Result<(), PinError> {
        self.release(addr, PinState::Registered)
    }

    /// Releases everything still tracked. Returns the number of allocations released.
    pub fn clear(&mut self) -> usize {
        let count = self.allocations.len();
        for (addr, alloc) in self.allocations.drain() {
            if let Some(pinner) = &self.pinner {
                if let Err(err) = pinner.unpin(addr) {
                    log::warn!("failed to unpin {addr:#x}: {err}");
                }
            }
            log::debug!("released {} host memory at {addr:#x}", alloc.state);
        }
        count
    }

    fn release(&mut self, addr: usize, expected: PinState) -> Result<(), PinError> {
        let state = self.state(addr);
        match state {
            PinState::Free => return Err(PinError::InvalidHandle(addr)),
            state if state != expected => return Err(PinError::Mismatch(addr, state, expected)),
            _ => {}
        }
        if let Some(pinner) = &self.pinner {
            pinner.unpin(addr)?;
        }
        if let Some(alloc) = self.allocations.remove(&addr) {
            let freed = alloc.storage.map_or(0, |x| x.len());
            log::debug!("released {} bytes at {addr:#x} ({freed} freed)", alloc.size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{PinError, PinState, PinnedMemory};
    use crate::loom::{
        ErrorKind,
        device::{DeviceKind, sim::Sim},
    };

    #[test]
    fn test_without_pinner() {
        let mut pinned = PinnedMemory::new(None);
        assert!(matches!(pinned.alloc_pinned(64), Err(PinError::NotAvailable)));
        assert_eq!(pinned.free_pinned(0x1000).unwrap_err().kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn test_pinned_and_registered_are_distinct() {
        let (sim, _handle) = Sim::new(DeviceKind::Gpu);
        let mut pinned = PinnedMemory::new(Some(Arc::new(sim)));

        let addr = pinned.alloc_pinned(4096).unwrap();
        assert_eq!(pinned.state(addr), PinState::Pinned);

        let caller = vec![0u8; 1024];
        let caller_addr = caller.as_ptr() as usize;
        pinned.register(caller_addr, caller.len()).unwrap();
        assert_eq!(pinned.state(caller_addr), PinState::Registered);
        assert!(matches!(
            pinned.register(caller_addr + 16, 16),
            Err(PinError::Overlap(_))
        ));

        // freeing caller memory or unregistering owned memory is refused
        let err = pinned.free_pinned(caller_addr).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAllowed);
        let err = pinned.unregister(addr).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAllowed);

        pinned.unregister(caller_addr).unwrap();
        pinned.free_pinned(addr).unwrap();
        assert_eq!(pinned.state(addr), PinState::Free);

        // double release
        let err = pinned.free_pinned(addr).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
        assert_eq!(pinned.clear(), 0);
        drop(caller);
    }
}
