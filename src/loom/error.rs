use derive_more::Display;
use thiserror::Error;

use super::{
    context::ContextError,
    device::{BackendError, DeviceMapError},
    memory::{cache::CacheError, pinned::PinError, pool::PoolError, slab::SlabError},
    task::TaskError,
    tensor::TensorError,
};

/// Classes of failure shared by every component.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed shapes, ranks, device ids or pointers.
    InvalidArgs,
    /// The object must be populated for this call.
    ObjectIsEmpty,
    /// The object must be empty for this call.
    ObjectNotEmpty,
    /// The resource has an unresolved asynchronous dependency.
    InProgress,
    /// The call is structurally forbidden in the current state.
    NotAllowed,
    InsufficientBuffer,
    LimitExceeded,
    IntegerOverflow,
    /// The device kind or capability is absent.
    NotAvailable,
    NotImplemented,
    NotInitialized,
    AlreadyInitialized,
    /// The handle does not name a live allocation.
    InvalidHandle,
    Failure,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Slab(#[from] SlabError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Pin(#[from] PinError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    DeviceMap(#[from] DeviceMapError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Slab(err) => err.kind(),
            Error::Pool(err) => err.kind(),
            Error::Pin(err) => err.kind(),
            Error::Cache(err) => err.kind(),
            Error::DeviceMap(err) => err.kind(),
            Error::Backend(err) => err.kind(),
            Error::Tensor(err) => err.kind(),
            Error::Task(err) => err.kind(),
            Error::Context(err) => err.kind(),
        }
    }

    /// Programmer errors: task state machine violations and use outside the context lifecycle.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Task(err) => err.is_fatal(),
            Error::Context(ContextError::NotInitialized) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};
    use crate::loom::{
        context::ContextError, memory::slab::SlabError, task::TaskError, tensor::TensorError,
    };

    #[test]
    fn test_kind_classes() {
        let err: Error = SlabError::Exhausted(8).into();
        assert_eq!(err.kind(), ErrorKind::LimitExceeded);
        assert!(!err.is_fatal());

        let err: Error = TensorError::Overflow.into();
        assert_eq!(err.kind(), ErrorKind::IntegerOverflow);

        let err: Error = ContextError::NotInitialized.into();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        assert!(err.is_fatal());

        let err: Error = TaskError::NotTerminal(crate::loom::task::TaskStatus::Started).into();
        assert_eq!(err.kind(), ErrorKind::NotAllowed);
        assert!(err.is_fatal());
    }
}
