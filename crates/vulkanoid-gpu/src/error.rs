//! GPU error types.

use ash::vk;
use std::time::Duration;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// A fence did not signal within its timeout. Indicates a GPU hang or driver fault.
    #[error("Fence wait timed out after {timeout:?} during {operation}")]
    FenceTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Queue submission was rejected.
    #[error("Queue submission failed: {0}")]
    Submission(vk::Result),

    /// The surface no longer matches the swapchain and it must be recreated.
    #[error("Surface is out of date")]
    SurfaceOutOfDate,

    /// The bindless table cannot hold the requested resources.
    #[error("Bindless table full: {requested} more handle(s) requested, capacity is {capacity}")]
    BindlessCapacityExceeded { capacity: u32, requested: u32 },

    /// A bindless operation was issued before the descriptor set was allocated.
    #[error("Bindless table has no allocated descriptor set")]
    BindlessNotAllocated,

    /// The binding does not match the descriptor kind of the table.
    #[error("Binding kind mismatch: table holds {expected}, got {actual}")]
    BindingKindMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// The handle was never assigned or has been retired.
    #[error("Unknown bindless handle {0}")]
    UnknownHandle(u32),

    /// Handle 0 has not been populated with a fallback resource.
    #[error("Bindless fallback (handle 0) has not been populated")]
    SentinelUnset,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// How an error must be handled by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Driver-level state may be inconsistent; the process must terminate.
    Fatal,
    /// The caller can correct the situation and keep rendering.
    Recoverable,
    /// A usage contract was broken by the caller.
    Precondition,
}

impl GpuError {
    /// Classify this error.
    pub fn severity(&self) -> Severity {
        match self {
            Self::SurfaceOutOfDate | Self::BindlessCapacityExceeded { .. } => Severity::Recoverable,
            Self::BindlessNotAllocated
            | Self::BindingKindMismatch { .. }
            | Self::UnknownHandle(_)
            | Self::SentinelUnset
            | Self::InvalidState(_) => Severity::Precondition,
            _ => Severity::Fatal,
        }
    }

    /// Whether this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Whether the orchestrator can continue after corrective action.
    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Recoverable
    }
}

/// Log a fatal error and abort the process.
///
/// There is no safe way to continue once GPU object lifetimes may be corrupted,
/// so this never unwinds.
pub fn fatal(operation: &str, err: &GpuError) -> ! {
    tracing::error!(operation, error = %err, "fatal GPU error, aborting");
    std::process::abort()
}

/// Report a broken usage contract.
///
/// Panics in debug builds; release builds get the error back.
#[track_caller]
pub(crate) fn precondition<T>(err: GpuError) -> Result<T> {
    debug_assert_eq!(err.severity(), Severity::Precondition);
    if cfg!(debug_assertions) {
        panic!("precondition violated: {err}");
    }
    tracing::error!(error = %err, "precondition violated");
    Err(err)
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
