//! Command recording and deferred execution for the Ember renderer.
//!
//! This crate provides:
//! - A frames-in-flight ring with fence-guarded command buffer reuse
//! - Deferred destruction of GPU resources behind the frame fences
//! - A retained command stream recorded as plain data
//! - An executor that replays the stream into command buffers
//! - A scheduler that hands finished frames to a submission thread

pub mod deferred;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod runner;
pub mod scheduler;
pub mod stream;
pub mod vulkan;

#[cfg(test)]
mod mock;

pub use deferred::{DeleteCallback, DeleteList};
pub use device::{DeviceCaps, DeviceOps};
pub use diagnostics::{DiagnosticLevel, Diagnostics, DEFAULT_REPORT_LIMIT};
pub use error::{GpuError, Result};
pub use frame::{
    FrameContext, FramePipeline, PipelineConfig, DEFAULT_INFLIGHT_FRAMES, MAX_INFLIGHT_FRAMES,
};
pub use runner::{run_steps, CommandSink, RunStats};
pub use scheduler::{FrameWork, RenderScheduler};
pub use stream::{
    BlitStep, ClearValues, CopyStep, DrawCall, IndexedDrawCall, LoadAction, ReadbackStep,
    RenderCommand, RenderPassDesc, RenderStep, RenderTarget, Step, StepQueue,
};
pub use vulkan::{VulkanDevice, VulkanSink};
