use thiserror::Error;

/// Recoverable failures surfaced by the heap's status-returning entry points.
///
/// Misuse of the allocator (double free, wild free, faults) is never reported
/// through this type: it terminates the process with a diagnostic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of memory")]
    OutOfMemory,
    #[error("operation not supported")]
    Unsupported,
    #[error("address is not a live allocation")]
    NotFound,
    #[error("heap is already initialized")]
    AlreadyInitialized,
    #[error("heap is not initialized")]
    NotInitialized,
    #[error("too many heaps are registered")]
    RegistryFull,
    #[error("heap metadata is inconsistent")]
    Corrupted,
}

impl HeapError {
    /// The errno value a C caller expects for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            HeapError::InvalidArgument => libc::EINVAL,
            HeapError::OutOfMemory | HeapError::RegistryFull => libc::ENOMEM,
            HeapError::Unsupported => libc::ENOSYS,
            HeapError::NotFound => libc::ENOENT,
            HeapError::AlreadyInitialized => libc::EBUSY,
            HeapError::NotInitialized | HeapError::Corrupted => libc::EFAULT,
        }
    }
}
