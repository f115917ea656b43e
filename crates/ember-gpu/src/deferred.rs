//! Deferred resource destruction for multi-frame-in-flight rendering.
//!
//! When several frames are in flight, GPU resources cannot be destroyed the
//! moment the application is done with them: an earlier frame may still be
//! executing commands that reference them. A [`DeleteList`] collects doomed
//! handles per category; the frame pipeline executes each frame's list only
//! after that frame's fence has signaled.

use ash::vk;
use gpu_allocator::vulkan::Allocation;

use crate::device::DeviceOps;

/// Deferred deletion callback. Runs before any queued handle is destroyed.
pub type DeleteCallback = Box<dyn FnOnce(&dyn DeviceOps) + Send>;

/// Pending deletions, grouped by resource category.
///
/// Enqueueing never touches the device. Execution destroys categories in a
/// fixed order so referencing objects die before the objects they reference:
/// pools and pipelines before layouts, views before their buffers and images,
/// buffers and images before raw memory.
#[derive(Default)]
pub struct DeleteList {
    callbacks: Vec<DeleteCallback>,
    command_pools: Vec<vk::CommandPool>,
    descriptor_pools: Vec<vk::DescriptorPool>,
    pipelines: Vec<vk::Pipeline>,
    pipeline_caches: Vec<vk::PipelineCache>,
    framebuffers: Vec<vk::Framebuffer>,
    render_passes: Vec<vk::RenderPass>,
    buffer_views: Vec<vk::BufferView>,
    image_views: Vec<vk::ImageView>,
    samplers: Vec<vk::Sampler>,
    buffers: Vec<vk::Buffer>,
    buffers_with_alloc: Vec<(vk::Buffer, Allocation)>,
    images: Vec<vk::Image>,
    images_with_alloc: Vec<(vk::Image, Allocation)>,
    pipeline_layouts: Vec<vk::PipelineLayout>,
    descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    query_pools: Vec<vk::QueryPool>,
    memory: Vec<vk::DeviceMemory>,
}

impl DeleteList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a callback. Callbacks run first during execution, so they may
    /// themselves destroy objects that are not individually queued.
    pub fn defer_callback(&mut self, callback: impl FnOnce(&dyn DeviceOps) + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// Queue a command pool. Null handles are ignored.
    pub fn defer_command_pool(&mut self, pool: vk::CommandPool) {
        if pool == vk::CommandPool::null() {
            return;
        }
        debug_assert!(
            !self.command_pools.contains(&pool),
            "command pool queued for deletion twice"
        );
        self.command_pools.push(pool);
    }

    /// Queue a descriptor pool. Null handles are ignored.
    pub fn defer_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        if pool == vk::DescriptorPool::null() {
            return;
        }
        debug_assert!(
            !self.descriptor_pools.contains(&pool),
            "descriptor pool queued for deletion twice"
        );
        self.descriptor_pools.push(pool);
    }

    /// Queue a pipeline. Null handles are ignored.
    pub fn defer_pipeline(&mut self, pipeline: vk::Pipeline) {
        if pipeline == vk::Pipeline::null() {
            return;
        }
        debug_assert!(
            !self.pipelines.contains(&pipeline),
            "pipeline queued for deletion twice"
        );
        self.pipelines.push(pipeline);
    }

    /// Queue a pipeline cache. Null handles are ignored.
    pub fn defer_pipeline_cache(&mut self, cache: vk::PipelineCache) {
        if cache == vk::PipelineCache::null() {
            return;
        }
        debug_assert!(
            !self.pipeline_caches.contains(&cache),
            "pipeline cache queued for deletion twice"
        );
        self.pipeline_caches.push(cache);
    }

    /// Queue a framebuffer. Null handles are ignored.
    pub fn defer_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        if framebuffer == vk::Framebuffer::null() {
            return;
        }
        debug_assert!(
            !self.framebuffers.contains(&framebuffer),
            "framebuffer queued for deletion twice"
        );
        self.framebuffers.push(framebuffer);
    }

    /// Queue a render pass. Null handles are ignored.
    pub fn defer_render_pass(&mut self, render_pass: vk::RenderPass) {
        if render_pass == vk::RenderPass::null() {
            return;
        }
        debug_assert!(
            !self.render_passes.contains(&render_pass),
            "render pass queued for deletion twice"
        );
        self.render_passes.push(render_pass);
    }

    /// Queue a buffer view. Null handles are ignored.
    pub fn defer_buffer_view(&mut self, view: vk::BufferView) {
        if view == vk::BufferView::null() {
            return;
        }
        debug_assert!(
            !self.buffer_views.contains(&view),
            "buffer view queued for deletion twice"
        );
        self.buffer_views.push(view);
    }

    /// Queue an image view. Null handles are ignored.
    pub fn defer_image_view(&mut self, view: vk::ImageView) {
        if view == vk::ImageView::null() {
            return;
        }
        debug_assert!(
            !self.image_views.contains(&view),
            "image view queued for deletion twice"
        );
        self.image_views.push(view);
    }

    /// Queue a sampler. Null handles are ignored.
    pub fn defer_sampler(&mut self, sampler: vk::Sampler) {
        if sampler == vk::Sampler::null() {
            return;
        }
        debug_assert!(
            !self.samplers.contains(&sampler),
            "sampler queued for deletion twice"
        );
        self.samplers.push(sampler);
    }

    /// Queue a buffer. Null handles are ignored.
    pub fn defer_buffer(&mut self, buffer: vk::Buffer) {
        if buffer == vk::Buffer::null() {
            return;
        }
        debug_assert!(
            !self.buffers.contains(&buffer),
            "buffer queued for deletion twice"
        );
        self.buffers.push(buffer);
    }

    /// Queue a buffer together with its allocation.
    pub fn defer_buffer_with_alloc(&mut self, buffer: vk::Buffer, allocation: Allocation) {
        debug_assert!(
            self.buffers_with_alloc.iter().all(|(b, _)| *b != buffer),
            "buffer queued for deletion twice"
        );
        self.buffers_with_alloc.push((buffer, allocation));
    }

    /// Queue an image. Null handles are ignored.
    pub fn defer_image(&mut self, image: vk::Image) {
        if image == vk::Image::null() {
            return;
        }
        debug_assert!(
            !self.images.contains(&image),
            "image queued for deletion twice"
        );
        self.images.push(image);
    }

    /// Queue an image together with its allocation.
    pub fn defer_image_with_alloc(&mut self, image: vk::Image, allocation: Allocation) {
        debug_assert!(
            self.images_with_alloc.iter().all(|(i, _)| *i != image),
            "image queued for deletion twice"
        );
        self.images_with_alloc.push((image, allocation));
    }

    /// Queue a pipeline layout. Null handles are ignored.
    pub fn defer_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        if layout == vk::PipelineLayout::null() {
            return;
        }
        debug_assert!(
            !self.pipeline_layouts.contains(&layout),
            "pipeline layout queued for deletion twice"
        );
        self.pipeline_layouts.push(layout);
    }

    /// Queue a descriptor set layout. Null handles are ignored.
    pub fn defer_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        if layout == vk::DescriptorSetLayout::null() {
            return;
        }
        debug_assert!(
            !self.descriptor_set_layouts.contains(&layout),
            "descriptor set layout queued for deletion twice"
        );
        self.descriptor_set_layouts.push(layout);
    }

    /// Queue a query pool. Null handles are ignored.
    pub fn defer_query_pool(&mut self, pool: vk::QueryPool) {
        if pool == vk::QueryPool::null() {
            return;
        }
        debug_assert!(
            !self.query_pools.contains(&pool),
            "query pool queued for deletion twice"
        );
        self.query_pools.push(pool);
    }

    /// Queue raw device memory. Null handles are ignored.
    pub fn defer_memory(&mut self, memory: vk::DeviceMemory) {
        if memory == vk::DeviceMemory::null() {
            return;
        }
        debug_assert!(
            !self.memory.contains(&memory),
            "device memory queued for deletion twice"
        );
        self.memory.push(memory);
    }

    /// Move all entries from `other` into this list, which must be empty.
    ///
    /// Used at frame boundaries to hand the accumulated pending list to the
    /// frame's own deleter. The emptiness requirement is structural: a
    /// non-empty destination means the ring protocol skipped an execution.
    pub fn take_from(&mut self, other: &mut DeleteList) {
        assert!(
            self.is_empty(),
            "delete list must be empty before taking another"
        );
        std::mem::swap(self, other);
    }

    /// Append everything from `other` onto this list.
    ///
    /// Unlike [`take_from`](Self::take_from), this has no emptiness
    /// requirement; it merges deletions shipped from the recording side into
    /// the submission side's pending list.
    pub fn absorb(&mut self, mut other: DeleteList) {
        self.callbacks.append(&mut other.callbacks);
        self.command_pools.append(&mut other.command_pools);
        self.descriptor_pools.append(&mut other.descriptor_pools);
        self.pipelines.append(&mut other.pipelines);
        self.pipeline_caches.append(&mut other.pipeline_caches);
        self.framebuffers.append(&mut other.framebuffers);
        self.render_passes.append(&mut other.render_passes);
        self.buffer_views.append(&mut other.buffer_views);
        self.image_views.append(&mut other.image_views);
        self.samplers.append(&mut other.samplers);
        self.buffers.append(&mut other.buffers);
        self.buffers_with_alloc.append(&mut other.buffers_with_alloc);
        self.images.append(&mut other.images);
        self.images_with_alloc.append(&mut other.images_with_alloc);
        self.pipeline_layouts.append(&mut other.pipeline_layouts);
        self.descriptor_set_layouts
            .append(&mut other.descriptor_set_layouts);
        self.query_pools.append(&mut other.query_pools);
        self.memory.append(&mut other.memory);
    }

    /// Destroy every queued entry and empty the list. Returns how many
    /// entries were destroyed.
    ///
    /// Idempotent once empty.
    ///
    /// # Safety
    /// The GPU must have finished with every queued object. In the frame
    /// pipeline that is established by waiting the owning slot's fence.
    pub unsafe fn execute_all(&mut self, device: &dyn DeviceOps) -> usize {
        let mut count = 0;

        for callback in self.callbacks.drain(..) {
            callback(device);
            count += 1;
        }
        for pool in self.command_pools.drain(..) {
            unsafe { device.destroy_command_pool(pool) };
            count += 1;
        }
        for pool in self.descriptor_pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool) };
            count += 1;
        }
        for pipeline in self.pipelines.drain(..) {
            unsafe { device.destroy_pipeline(pipeline) };
            count += 1;
        }
        for cache in self.pipeline_caches.drain(..) {
            unsafe { device.destroy_pipeline_cache(cache) };
            count += 1;
        }
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { device.destroy_framebuffer(framebuffer) };
            count += 1;
        }
        for render_pass in self.render_passes.drain(..) {
            unsafe { device.destroy_render_pass(render_pass) };
            count += 1;
        }
        for view in self.buffer_views.drain(..) {
            unsafe { device.destroy_buffer_view(view) };
            count += 1;
        }
        for view in self.image_views.drain(..) {
            unsafe { device.destroy_image_view(view) };
            count += 1;
        }
        for sampler in self.samplers.drain(..) {
            unsafe { device.destroy_sampler(sampler) };
            count += 1;
        }
        for buffer in self.buffers.drain(..) {
            unsafe { device.destroy_buffer(buffer) };
            count += 1;
        }
        for (buffer, allocation) in self.buffers_with_alloc.drain(..) {
            unsafe { device.destroy_buffer_with_alloc(buffer, allocation) };
            count += 1;
        }
        for image in self.images.drain(..) {
            unsafe { device.destroy_image(image) };
            count += 1;
        }
        for (image, allocation) in self.images_with_alloc.drain(..) {
            unsafe { device.destroy_image_with_alloc(image, allocation) };
            count += 1;
        }
        for layout in self.pipeline_layouts.drain(..) {
            unsafe { device.destroy_pipeline_layout(layout) };
            count += 1;
        }
        for layout in self.descriptor_set_layouts.drain(..) {
            unsafe { device.destroy_descriptor_set_layout(layout) };
            count += 1;
        }
        for pool in self.query_pools.drain(..) {
            unsafe { device.destroy_query_pool(pool) };
            count += 1;
        }
        for memory in self.memory.drain(..) {
            unsafe { device.free_memory(memory) };
            count += 1;
        }

        count
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending_count() == 0
    }

    /// Get the number of queued entries across all categories.
    pub fn pending_count(&self) -> usize {
        self.callbacks.len()
            + self.command_pools.len()
            + self.descriptor_pools.len()
            + self.pipelines.len()
            + self.pipeline_caches.len()
            + self.framebuffers.len()
            + self.render_passes.len()
            + self.buffer_views.len()
            + self.image_views.len()
            + self.samplers.len()
            + self.buffers.len()
            + self.buffers_with_alloc.len()
            + self.images.len()
            + self.images_with_alloc.len()
            + self.pipeline_layouts.len()
            + self.descriptor_set_layouts.len()
            + self.query_pools.len()
            + self.memory.len()
    }
}

impl Drop for DeleteList {
    fn drop(&mut self) {
        if !self.is_empty() {
            tracing::warn!(
                pending = self.pending_count(),
                "delete list dropped with entries still queued"
            );
        }
    }
}
