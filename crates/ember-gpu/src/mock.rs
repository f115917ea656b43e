//! Logging doubles for tests.
//!
//! [`MockDevice`] mints fake handles and appends one line per call to an
//! ordered event log; sinks made through it share that log, so a test can
//! assert cross-object ordering (fence waits versus destroys, init versus
//! main buffer recording) with plain string matching. [`MockSink`] also
//! models the logical attachment contents so clear-merge rewrites can be
//! checked for equivalence rather than just call shape.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ash::vk::{self, Handle};
use gpu_allocator::vulkan::Allocation;
use parking_lot::Mutex;

use crate::device::DeviceOps;
use crate::error::{GpuError, Result};
use crate::runner::CommandSink;
use crate::stream::{BlitStep, ClearValues, CopyStep, LoadAction, ReadbackStep, RenderTarget};

type EventLog = Arc<Mutex<Vec<String>>>;

/// Index of the first event containing `needle`.
pub(crate) fn index_of(events: &[String], needle: &str) -> Option<usize> {
    events.iter().position(|event| event.contains(needle))
}

/// How many events contain `needle`.
pub(crate) fn count_of(events: &[String], needle: &str) -> usize {
    events.iter().filter(|event| event.contains(needle)).count()
}

/// Device double. Handles are minted from a counter; creations are silent,
/// everything observable is logged.
pub(crate) struct MockDevice {
    log: EventLog,
    next_handle: AtomicU64,
    fail_submit: AtomicBool,
    fail_all: AtomicBool,
    timeout_wait: AtomicBool,
    idle_delay: Mutex<Duration>,
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            next_handle: AtomicU64::new(1),
            fail_submit: AtomicBool::new(false),
            fail_all: AtomicBool::new(false),
            timeout_wait: AtomicBool::new(false),
            idle_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Make the next submit fail with a device-lost error.
    pub(crate) fn fail_next_submit(&self) {
        self.fail_submit.store(true, Ordering::SeqCst);
    }

    /// Make every submit fail with a device-lost error.
    pub(crate) fn fail_all_submits(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    /// Make the next fence wait report a timeout.
    pub(crate) fn timeout_next_wait(&self) {
        self.timeout_wait.store(true, Ordering::SeqCst);
    }

    /// Stall every `wait_idle` call, standing in for a busy queue.
    pub(crate) fn set_wait_idle_delay(&self, delay: Duration) {
        *self.idle_delay.lock() = delay;
    }

    fn mint<T: Handle>(&self) -> T {
        T::from_raw(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn record(&self, event: String) {
        self.log.lock().push(event);
    }
}

impl DeviceOps for MockDevice {
    fn create_fence(&self, _signaled: bool) -> Result<vk::Fence> {
        Ok(self.mint())
    }

    fn wait_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<bool> {
        if self.timeout_wait.swap(false, Ordering::SeqCst) {
            self.record(format!("wait_fence {:#x} -> timeout", fence.as_raw()));
            return Ok(false);
        }
        self.record(format!("wait_fence {:#x}", fence.as_raw()));
        Ok(true)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.record(format!("reset_fence {:#x}", fence.as_raw()));
        Ok(())
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        Ok(self.mint())
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        Ok((0..count).map(|_| self.mint()).collect())
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        self.record(format!("reset_pool {:#x}", pool.as_raw()));
        Ok(())
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(format!("begin cmd={:#x}", cmd.as_raw()));
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(format!("end cmd={:#x}", cmd.as_raw()));
        Ok(())
    }

    fn make_sink(&self, cmd: vk::CommandBuffer) -> Box<dyn CommandSink + '_> {
        Box::new(MockSink::recording_into(self.log.clone(), cmd))
    }

    fn submit(&self, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> Result<()> {
        if self.fail_submit.swap(false, Ordering::SeqCst) || self.fail_all.load(Ordering::SeqCst) {
            self.record(format!(
                "submit n={} fence={:#x} -> failed",
                command_buffers.len(),
                fence.as_raw()
            ));
            return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        self.record(format!(
            "submit n={} fence={:#x}",
            command_buffers.len(),
            fence.as_raw()
        ));
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let delay = *self.idle_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.record("wait_idle".to_string());
        Ok(())
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.record(format!("destroy_fence {:#x}", fence.as_raw()));
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.record(format!("destroy_command_pool {:#x}", pool.as_raw()));
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.record(format!("free_memory {:#x}", memory.as_raw()));
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.record(format!("destroy_buffer {:#x}", buffer.as_raw()));
    }

    unsafe fn destroy_buffer_with_alloc(&self, buffer: vk::Buffer, _allocation: Allocation) {
        self.record(format!("destroy_buffer_with_alloc {:#x}", buffer.as_raw()));
    }

    unsafe fn destroy_buffer_view(&self, view: vk::BufferView) {
        self.record(format!("destroy_buffer_view {:#x}", view.as_raw()));
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.record(format!("destroy_image {:#x}", image.as_raw()));
    }

    unsafe fn destroy_image_with_alloc(&self, image: vk::Image, _allocation: Allocation) {
        self.record(format!("destroy_image_with_alloc {:#x}", image.as_raw()));
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.record(format!("destroy_image_view {:#x}", view.as_raw()));
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.record(format!("destroy_sampler {:#x}", sampler.as_raw()));
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.record(format!("destroy_pipeline {:#x}", pipeline.as_raw()));
    }

    unsafe fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        self.record(format!("destroy_pipeline_cache {:#x}", cache.as_raw()));
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.record(format!("destroy_render_pass {:#x}", render_pass.as_raw()));
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.record(format!("destroy_framebuffer {:#x}", framebuffer.as_raw()));
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.record(format!("destroy_pipeline_layout {:#x}", layout.as_raw()));
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.record(format!(
            "destroy_descriptor_set_layout {:#x}",
            layout.as_raw()
        ));
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.record(format!("destroy_descriptor_pool {:#x}", pool.as_raw()));
    }

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.record(format!("destroy_query_pool {:#x}", pool.as_raw()));
    }
}

/// Logical contents of the bound target, as clears would leave them.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct AttachmentState {
    pub(crate) color: Option<[f32; 4]>,
    pub(crate) depth: Option<f32>,
    pub(crate) stencil: Option<u32>,
}

/// Sink double. Standalone via [`MockSink::new`], or sharing a device's log
/// when made through [`MockDevice::make_sink`] (events then carry a
/// `cmd=0x…` prefix identifying the buffer).
pub(crate) struct MockSink {
    prefix: String,
    log: EventLog,
    pub(crate) attachment: AttachmentState,
}

impl MockSink {
    pub(crate) fn new() -> Self {
        Self {
            prefix: String::new(),
            log: Arc::new(Mutex::new(Vec::new())),
            attachment: AttachmentState::default(),
        }
    }

    fn recording_into(log: EventLog, cmd: vk::CommandBuffer) -> Self {
        Self {
            prefix: format!("cmd={:#x} ", cmd.as_raw()),
            log,
            attachment: AttachmentState::default(),
        }
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn record(&self, event: String) {
        self.log.lock().push(format!("{}{}", self.prefix, event));
    }
}

impl CommandSink for MockSink {
    fn begin_render_pass(
        &mut self,
        target: &RenderTarget,
        color_load: LoadAction,
        depth_load: LoadAction,
        clear: ClearValues,
    ) {
        match color_load {
            LoadAction::Clear => self.attachment.color = Some(clear.color),
            LoadAction::DontCare => self.attachment.color = None,
            LoadAction::Keep => {}
        }
        if target.depth.is_some() {
            match depth_load {
                LoadAction::Clear => {
                    self.attachment.depth = Some(clear.depth);
                    if target.has_stencil {
                        self.attachment.stencil = Some(clear.stencil);
                    }
                }
                LoadAction::DontCare => {
                    self.attachment.depth = None;
                    self.attachment.stencil = None;
                }
                LoadAction::Keep => {}
            }
        }
        self.record(format!(
            "begin_render_pass color_load={color_load:?} depth_load={depth_load:?} \
             clear_color={:?} clear_depth={} clear_stencil={}",
            clear.color, clear.depth, clear.stencil
        ));
    }

    fn end_render_pass(&mut self) {
        self.record("end_render_pass".to_string());
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.record(format!("set_viewport {}x{}", viewport.width, viewport.height));
    }

    fn set_scissor(&mut self, rect: vk::Rect2D) {
        self.record(format!(
            "set_scissor {}x{}+{}+{}",
            rect.extent.width, rect.extent.height, rect.offset.x, rect.offset.y
        ));
    }

    fn set_stencil(&mut self, write_mask: u32, compare_mask: u32, reference: u32) {
        self.record(format!(
            "set_stencil write={write_mask:#x} compare={compare_mask:#x} ref={reference}"
        ));
    }

    fn set_blend_color(&mut self, color: [f32; 4]) {
        self.record(format!("set_blend_color {color:?}"));
    }

    fn clear_attachments(
        &mut self,
        rect: vk::Rect2D,
        values: ClearValues,
        mask: vk::ImageAspectFlags,
    ) {
        if mask.contains(vk::ImageAspectFlags::COLOR) {
            self.attachment.color = Some(values.color);
        }
        if mask.contains(vk::ImageAspectFlags::DEPTH) {
            self.attachment.depth = Some(values.depth);
        }
        if mask.contains(vk::ImageAspectFlags::STENCIL) {
            self.attachment.stencil = Some(values.stencil);
        }
        self.record(format!(
            "clear_attachments color={:?} depth={} stencil={} mask={mask:?} rect={}x{}",
            values.color, values.depth, values.stencil, rect.extent.width, rect.extent.height
        ));
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.record(format!("bind_pipeline {:#x}", pipeline.as_raw()));
    }

    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        self.record(format!(
            "bind_descriptor_set layout={:#x} set={:#x}",
            layout.as_raw(),
            set.as_raw()
        ));
    }

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        self.record(format!(
            "bind_vertex_buffer {:#x} offset={offset}",
            buffer.as_raw()
        ));
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        self.record(format!(
            "bind_index_buffer {:#x} offset={offset} type={index_type:?}",
            buffer.as_raw()
        ));
    }

    fn draw(&mut self, vertex_count: u32) {
        self.record(format!("draw n={vertex_count}"));
    }

    fn draw_indexed(&mut self, index_count: u32) {
        self.record(format!("draw_indexed n={index_count}"));
    }

    fn copy_image(&mut self, step: &CopyStep) {
        self.record(format!(
            "copy_image src={:#x} dst={:#x} tag={}",
            step.src.as_raw(),
            step.dst.as_raw(),
            step.tag
        ));
    }

    fn blit_image(&mut self, step: &BlitStep) {
        self.record(format!(
            "blit_image src={:#x} dst={:#x} tag={}",
            step.src.as_raw(),
            step.dst.as_raw(),
            step.tag
        ));
    }

    fn readback_image(&mut self, step: &ReadbackStep) {
        self.record(format!(
            "readback_image src={:#x} dst={:#x} tag={}",
            step.src.as_raw(),
            step.dst.as_raw(),
            step.tag
        ));
    }
}
