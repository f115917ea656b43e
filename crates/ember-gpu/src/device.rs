//! Device seam.
//!
//! The frame pipeline and scheduler never talk to `ash` directly; they go
//! through [`DeviceOps`], which covers exactly the calls this layer needs.
//! [`crate::vulkan::VulkanDevice`] is the production implementation; tests
//! substitute a logging double.

use ash::vk;
use gpu_allocator::vulkan::Allocation;

use crate::error::Result;
use crate::runner::CommandSink;

/// Device operations consumed by this layer.
///
/// Creation, recording, and submission methods are safe: handle validity is a
/// construction invariant of the implementing type. The destroy family is
/// unsafe because the caller asserts the GPU has finished with the object,
/// which nothing here can check.
pub trait DeviceOps: Send + Sync {
    /// Create a fence, optionally already signaled.
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    /// Wait for a fence. Returns `false` if the timeout elapsed first.
    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool>;

    /// Reset a fence to the unsignaled state.
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    /// Create a command pool on the submission queue's family.
    fn create_command_pool(&self) -> Result<vk::CommandPool>;

    /// Allocate primary command buffers from a pool.
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    /// Reset a whole pool, recycling its command buffers.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;

    /// Begin one-time recording on a command buffer.
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Finish recording on a command buffer.
    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Make a sink that records replayed steps into `cmd`.
    ///
    /// Recording must be active on `cmd` for the sink's lifetime.
    fn make_sink(&self, cmd: vk::CommandBuffer) -> Box<dyn CommandSink + '_>;

    /// Submit command buffers, signaling `fence` on completion.
    fn submit(&self, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> Result<()>;

    /// Block until the device is idle.
    fn wait_idle(&self) -> Result<()>;

    /// Destroy a fence.
    ///
    /// # Safety
    /// The fence must not be in use by any pending submission.
    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// Destroy a command pool and every buffer allocated from it.
    ///
    /// # Safety
    /// No buffer from the pool may be pending execution.
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Free raw device memory.
    ///
    /// # Safety
    /// Nothing may still be bound to or reading the memory.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Destroy a buffer.
    ///
    /// # Safety
    /// The GPU must have finished with the buffer.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Destroy a buffer and release its allocation.
    ///
    /// # Safety
    /// The GPU must have finished with the buffer.
    unsafe fn destroy_buffer_with_alloc(&self, buffer: vk::Buffer, allocation: Allocation);

    /// Destroy a buffer view.
    ///
    /// # Safety
    /// The GPU must have finished with the view.
    unsafe fn destroy_buffer_view(&self, view: vk::BufferView);

    /// Destroy an image.
    ///
    /// # Safety
    /// The GPU must have finished with the image.
    unsafe fn destroy_image(&self, image: vk::Image);

    /// Destroy an image and release its allocation.
    ///
    /// # Safety
    /// The GPU must have finished with the image.
    unsafe fn destroy_image_with_alloc(&self, image: vk::Image, allocation: Allocation);

    /// Destroy an image view.
    ///
    /// # Safety
    /// The GPU must have finished with the view.
    unsafe fn destroy_image_view(&self, view: vk::ImageView);

    /// Destroy a sampler.
    ///
    /// # Safety
    /// The GPU must have finished with the sampler.
    unsafe fn destroy_sampler(&self, sampler: vk::Sampler);

    /// Destroy a pipeline.
    ///
    /// # Safety
    /// The GPU must have finished with the pipeline.
    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Destroy a pipeline cache.
    ///
    /// # Safety
    /// No pipeline creation may be using the cache.
    unsafe fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);

    /// Destroy a render pass.
    ///
    /// # Safety
    /// The GPU must have finished with the render pass.
    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    /// Destroy a framebuffer.
    ///
    /// # Safety
    /// The GPU must have finished with the framebuffer.
    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    /// Destroy a pipeline layout.
    ///
    /// # Safety
    /// No pipeline still referencing the layout may be pending.
    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    /// Destroy a descriptor set layout.
    ///
    /// # Safety
    /// No pool or pipeline layout referencing it may remain.
    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Destroy a descriptor pool and every set allocated from it.
    ///
    /// # Safety
    /// The GPU must have finished with all sets from the pool.
    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Destroy a query pool.
    ///
    /// # Safety
    /// No pending commands may reference the pool.
    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool);
}

/// Read-only device facts handed to the pipeline at attach time.
///
/// These only annotate logging and destroy paths; the scheduling contract
/// does not depend on them.
#[derive(Debug, Clone)]
pub struct DeviceCaps {
    /// Device name for logs.
    pub device_name: String,
    /// Whether dedicated allocations are preferred for large targets.
    pub dedicated_allocation: bool,
    /// Whether synchronization2 is available.
    pub sync2: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            device_name: "unknown".to_string(),
            dedicated_allocation: false,
            sync2: false,
        }
    }
}

impl DeviceCaps {
    /// Get a human-readable summary for the attach log line.
    pub fn summary(&self) -> String {
        format!(
            "{} (dedicated allocation: {}, sync2: {})",
            self.device_name, self.dedicated_allocation, self.sync2,
        )
    }
}
