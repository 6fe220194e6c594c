//! Error Types
//!
//! Failure taxonomy for the HAL: missing/invalid state, GPU resource
//! allocation or mapping failures, and the bounded-wait timeout on heap
//! instance reuse.

use thiserror::Error;

use crate::mos::ResourceHandle;

#[derive(Debug, Error)]
pub enum HalError {
    /// An operation that needs the state heap was called before the heap was
    /// created, or after it was destroyed.
    #[error("state heap not created")]
    HeapNotCreated,

    /// A caller-supplied parameter was rejected.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// GPU buffer allocation failed.
    #[error("GPU resource allocation failed ({name}, {bytes} bytes)")]
    AllocationFailed { name: &'static str, bytes: usize },

    /// CPU mapping of a GPU resource failed.
    #[error("failed to lock resource {0:?}")]
    LockFailed(ResourceHandle),

    /// A resource handle did not refer to a live allocation.
    #[error("unknown resource {0:?}")]
    UnknownResource(ResourceHandle),

    /// The bounded wait for a free heap instance exhausted its iteration
    /// budget. Nothing was assigned; the caller must abort this operation.
    #[error("timed out waiting for a free heap instance ({iterations} waits)")]
    HeapWaitTimeout { iterations: u32 },

    /// The command buffer cannot hold the command being appended.
    #[error("command buffer full: need {needed} dwords, {available} available")]
    CommandBufferFull { needed: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, HalError>;
