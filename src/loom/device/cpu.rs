use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;

use super::{Backend, BackendError, Command, DeviceKind, Report, Ticket};
use crate::loom::{memory::Arena, ops::Launch};

/// Error code reported for tickets the runtime does not know.
pub const UNKNOWN_TICKET: i32 = -1;

/// Executes contractions on the host. Supplied by the numeric layer.
pub trait Kernel: Send + Sync {
    /// Runs the contraction to completion. Returns a kernel error code on failure.
    fn contract(&self, launch: &Launch) -> Result<(), i32>;
}

impl<F> Kernel for F
where
    F: Fn(&Launch) -> Result<(), i32> + Send + Sync,
{
    #[inline]
    fn contract(&self, launch: &Launch) -> Result<(), i32> {
        self(launch)
    }
}

/// The multicore host runtime. Commands run synchronously inside `submit`, so every
/// ticket is terminal by the time it is returned.
pub struct Cpu {
    /// Contraction kernel; contractions are not implemented without one.
    kernel: Option<Arc<dyn Kernel>>,
    /// Host arenas by base address.
    arenas: Mutex<HashMap<usize, Box<[u8]>>>,
    /// Reports of tickets not yet retired.
    reports: Mutex<HashMap<Ticket, Report>>,
    next: AtomicU64,
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("kernel", &self.kernel.is_some())
            .field("arenas", &self.arenas.lock().len())
            .field("reports", &self.reports.lock().len())
            .finish()
    }
}

impl Backend for Cpu {
    #[inline]
    fn kind(&self) -> DeviceKind {
        DeviceKind::Host
    }

    fn reserve(&self, local: u32, bytes: usize) -> Result<Arena, BackendError> {
        if local != 0 {
            return Err(BackendError::UnknownDevice(local));
        }
        // halve the request until the allocator can serve it
        let mut size = bytes;
        let storage = loop {
            if size == 0 {
                return Err(BackendError::Reserve(bytes));
            }
            let mut storage = Vec::<u8>::new();
            match storage.try_reserve_exact(size) {
                Ok(()) => {
                    storage.resize(size, 0);
                    break storage.into_boxed_slice();
                }
                Err(_) => size /= 2,
            }
        };
        if size < bytes {
            log::warn!("host arena reduced from {bytes} to {size} bytes");
        }
        let base = storage.as_ptr() as usize;
        self.arenas.lock().insert(base, storage);
        Ok(Arena { base, size })
    }

    fn release(&self, local: u32, arena: Arena) -> Result<(), BackendError> {
        if local != 0 {
            return Err(BackendError::UnknownDevice(local));
        }
        match self.arenas.lock().remove(&arena.base) {
            Some(_) => Ok(()),
            None => Err(BackendError::Rejected(UNKNOWN_TICKET)),
        }
    }

    fn submit(&self, local: u32, command: Command<'_>) -> Result<Ticket, BackendError> {
        if local != 0 {
            return Err(BackendError::UnknownDevice(local));
        }
        let report = match command {
            Command::Transfer(transfer) => {
                log::trace!("host transfer {} → {}", transfer.src, transfer.dst);
                Report::COMPLETED
            }
            Command::Contract(launch) => {
                let kernel = self
                    .kernel
                    .as_ref()
                    .ok_or(BackendError::NotImplemented("host contraction"))?;
                match kernel.contract(launch) {
                    Ok(()) => Report::COMPLETED,
                    Err(code) => Report::failed(code),
                }
            }
            Command::Upload { .. } => return Err(BackendError::NotImplemented("constant upload")),
        };
        let ticket = Ticket(self.next.fetch_add(1, Ordering::Relaxed));
        self.reports.lock().insert(ticket, report);
        Ok(ticket)
    }

    fn query(&self, ticket: Ticket) -> Report {
        self.reports
            .lock()
            .get(&ticket)
            .copied()
            .unwrap_or(Report::failed(UNKNOWN_TICKET))
    }

    fn retire(&self, ticket: Ticket) {
        self.reports.lock().remove(&ticket);
    }
}

#[derive(Default, Clone)]
pub struct CpuBuilder {
    pub kernel: Option<Arc<dyn Kernel>>,
}

impl CpuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel(mut self, kernel: impl Kernel + 'static) -> Self {
        self.kernel = Some(Arc::new(kernel));
        self
    }

    pub fn build(self) -> Cpu {
        Cpu {
            kernel: self.kernel,
            arenas: Default::default(),
            reports: Default::default(),
            next: AtomicU64::new(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CpuBuilder, UNKNOWN_TICKET};
    use crate::loom::{
        device::{Backend, BackendError, Command, DeviceId, Location, Report, Ticket, Transfer},
        task::TaskStatus,
    };

    #[test]
    fn test_reserve_and_release() {
        let cpu = CpuBuilder::new().build();
        let arena = cpu.reserve(0, 1 << 16).unwrap();
        assert_eq!(arena.size, 1 << 16);
        assert_ne!(arena.base, 0);
        assert_eq!(cpu.reserve(1, 64), Err(BackendError::UnknownDevice(1)));
        cpu.release(0, arena).unwrap();
        assert!(cpu.release(0, arena).is_err());
    }

    #[test]
    fn test_transfer_completes_on_submit() {
        let cpu = CpuBuilder::new().build();
        let location = Location {
            device: DeviceId::HOST,
            addr: 0x1000,
        };
        let transfer = Transfer {
            src: location,
            dst: location,
            bytes: 64,
        };
        let ticket = cpu.submit(0, Command::Transfer(transfer)).unwrap();
        assert_eq!(cpu.query(ticket), Report::COMPLETED);
        cpu.retire(ticket);
        assert_eq!(cpu.query(ticket).status, TaskStatus::Error);
        assert_eq!(cpu.query(Ticket(999)).error, Some(UNKNOWN_TICKET));
    }

    #[test]
    fn test_upload_not_implemented() {
        let cpu = CpuBuilder::new().build();
        let command = Command::Upload {
            slot: 0,
            contents: &[],
        };
        assert!(matches!(
            cpu.submit(0, command),
            Err(BackendError::NotImplemented(_))
        ));
    }
}
