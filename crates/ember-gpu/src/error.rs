//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The device stopped making progress and must be recovered.
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether this error indicates the device itself is gone rather than a
    /// recoverable per-call failure.
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost(_) | Self::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
