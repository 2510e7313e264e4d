use derive_more::{Display, From, Into};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ErrorKind, memory::Arena, ops::Launch, task::TaskStatus};

pub use cpu::{Cpu, CpuBuilder, Kernel};
pub use map::{DeviceMap, DeviceMapError};
pub use sim::{Sim, SimHandle};

pub mod cpu;
pub mod map;
pub mod sim;

/// The closed set of device kinds. `Unset` stands for "no device".
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceKind {
    #[default]
    Unset,
    Host,
    Gpu,
    Accelerator,
}

/// Flat, process-global device id. Dense, starting with the host at `0`.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("#{_0}")]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub const HOST: Self = Self(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A byte address on a specific device.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{device}@{addr:#x}")]
pub struct Location {
    pub device: DeviceId,
    pub addr: usize,
}

/// Identifies one submitted command within a runtime.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("ticket {_0}")]
pub struct Ticket(pub u64);

/// Status of a submitted command as reported by its runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub status: TaskStatus,
    /// Runtime-specific error code, set together with [`TaskStatus::Error`].
    pub error: Option<i32>,
}

impl Report {
    pub const COMPLETED: Self = Self {
        status: TaskStatus::Completed,
        error: None,
    };

    #[inline]
    pub fn failed(code: i32) -> Self {
        Self {
            status: TaskStatus::Error,
            error: Some(code),
        }
    }
}

/// Asynchronous copy of `bytes` bytes between two devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub src: Location,
    pub dst: Location,
    pub bytes: usize,
}

/// Commands submitted to a device runtime.
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    Transfer(Transfer),
    /// Stages the operands, executes the contraction, then writes the result back if asked.
    Contract(&'a Launch),
    /// Populates a constant-argument slot.
    Upload { slot: usize, contents: &'a [u8] },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("capability not available on this runtime")]
    NotAvailable,
    #[error("{0} is not implemented by this runtime")]
    NotImplemented(&'static str),
    #[error("runtime has no device {0}")]
    UnknownDevice(u32),
    #[error("unable to reserve {0} bytes")]
    Reserve(usize),
    #[error("runtime rejected the command with code {0}")]
    Rejected(i32),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::NotAvailable => ErrorKind::NotAvailable,
            BackendError::NotImplemented(_) => ErrorKind::NotImplemented,
            BackendError::UnknownDevice(_) => ErrorKind::InvalidArgs,
            BackendError::Reserve(_) => ErrorKind::InsufficientBuffer,
            BackendError::Rejected(_) => ErrorKind::Failure,
        }
    }
}

/// Capability interface of a device runtime, addressed by kind-local device index.
///
/// Runtimes execute asynchronously and are never driven by threads of this crate: progress
/// is observed only through [`query`](Backend::query).
pub trait Backend: std::fmt::Debug + Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Reserves an argument arena of at most `bytes` bytes. May return a smaller arena.
    fn reserve(&self, local: u32, bytes: usize) -> Result<Arena, BackendError>;

    fn release(&self, local: u32, arena: Arena) -> Result<(), BackendError>;

    /// Page-locks a host range for fast transfers to this runtime's devices.
    fn pin(&self, _addr: usize, _size: usize) -> Result<(), BackendError> {
        Err(BackendError::NotAvailable)
    }

    fn unpin(&self, _addr: usize) -> Result<(), BackendError> {
        Err(BackendError::NotAvailable)
    }

    fn submit(&self, local: u32, command: Command<'_>) -> Result<Ticket, BackendError>;

    /// Non-blocking status query.
    fn query(&self, ticket: Ticket) -> Report;

    /// Forgets a ticket whose task has been destructed.
    fn retire(&self, _ticket: Ticket) {}
}
