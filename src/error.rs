//! Error type for context construction.
//!
//! Allocation itself never returns a `Result`: a null pointer is the only
//! failure signal on the hot paths. Errors are reserved for the operations
//! that set up or tear down OS resources.

use thiserror::Error;

/// Error returned when a [`Context`](crate::Context) cannot be created.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The OS refused to reserve the requested address range.
    #[error("failed to reserve {size} bytes of virtual address space")]
    ReserveFailed {
        /// Number of bytes that was requested from the OS.
        size: usize,
    },
}
