//! Vulkan implementation of the device seam.
//!
//! [`VulkanDevice`] attaches to a device the bootstrap layer created; it owns
//! the allocator and the submission queue access, not the device itself.
//! [`VulkanSink`] records replayed steps into a command buffer using dynamic
//! rendering, so no render pass or framebuffer objects are involved.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;
use tracing::warn;

use crate::device::{DeviceCaps, DeviceOps};
use crate::diagnostics::Diagnostics;
use crate::error::{GpuError, Result};
use crate::runner::CommandSink;
use crate::stream::{BlitStep, ClearValues, CopyStep, LoadAction, ReadbackStep, RenderTarget};

/// Production [`DeviceOps`] over a live `ash` device.
///
/// Submission goes through a single graphics queue behind a mutex, so the
/// direct and threaded schedulers see the same queue discipline. Dropping
/// the wrapper releases the allocator's blocks; the device itself stays
/// owned by whoever created it.
pub struct VulkanDevice {
    device: Arc<ash::Device>,
    queue: Mutex<vk::Queue>,
    queue_family: u32,
    allocator: Mutex<Allocator>,
    caps: DeviceCaps,
    diagnostics: Mutex<Diagnostics>,
}

impl VulkanDevice {
    /// Wrap an existing device and its graphics queue.
    pub fn attach(
        device: Arc<ash::Device>,
        queue: vk::Queue,
        queue_family: u32,
        allocator: Allocator,
        caps: DeviceCaps,
    ) -> Self {
        tracing::info!("Attached to device: {}", caps.summary());
        Self {
            device,
            queue: Mutex::new(queue),
            queue_family,
            allocator: Mutex::new(allocator),
            caps,
            diagnostics: Mutex::new(Diagnostics::new()),
        }
    }

    /// Get the device facts recorded at attach time.
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Get access to the allocator.
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Validation-message counters for this device.
    pub fn diagnostics(&self) -> &Mutex<Diagnostics> {
        &self.diagnostics
    }
}

impl DeviceOps for VulkanDevice {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.create_fence(&create_info, None) }?;
        Ok(fence)
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }?;
        Ok(())
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        // Ring pools are reset wholesale each frame, never per buffer.
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device.create_command_pool(&create_info, None) }?;
        Ok(pool)
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        Ok(buffers)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }?;
        Ok(())
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }?;
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd) }?;
        Ok(())
    }

    fn make_sink(&self, cmd: vk::CommandBuffer) -> Box<dyn CommandSink + '_> {
        Box::new(VulkanSink::new(&*self.device, cmd))
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn submit(&self, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> Result<()> {
        let submit_info = vk::SubmitInfo::default().command_buffers(command_buffers);
        let queue = self.queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], fence) }?;
        Ok(())
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    unsafe fn destroy_buffer_with_alloc(&self, buffer: vk::Buffer, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            warn!("Failed to free buffer allocation: {e}");
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    unsafe fn destroy_buffer_view(&self, view: vk::BufferView) {
        unsafe { self.device.destroy_buffer_view(view, None) };
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    unsafe fn destroy_image_with_alloc(&self, image: vk::Image, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            warn!("Failed to free image allocation: {e}");
        }
        unsafe { self.device.destroy_image(image, None) };
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    unsafe fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        unsafe { self.device.destroy_pipeline_cache(cache, None) };
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    unsafe fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) };
    }
}

fn load_op(action: LoadAction) -> vk::AttachmentLoadOp {
    match action {
        LoadAction::Keep => vk::AttachmentLoadOp::LOAD,
        LoadAction::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadAction::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

fn rect_to_blit_offsets(rect: vk::Rect2D) -> [vk::Offset3D; 2] {
    [
        vk::Offset3D {
            x: rect.offset.x,
            y: rect.offset.y,
            z: 0,
        },
        vk::Offset3D {
            x: rect.offset.x + rect.extent.width as i32,
            y: rect.offset.y + rect.extent.height as i32,
            z: 1,
        },
    ]
}

/// Records replayed steps into a command buffer via dynamic rendering.
///
/// The buffer must be in the recording state for the sink's whole lifetime;
/// [`DeviceOps::make_sink`] hands one out under that contract.
pub struct VulkanSink<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
}

impl<'a> VulkanSink<'a> {
    pub fn new(device: &'a ash::Device, cmd: vk::CommandBuffer) -> Self {
        Self { device, cmd }
    }
}

impl CommandSink for VulkanSink<'_> {
    fn begin_render_pass(
        &mut self,
        target: &RenderTarget,
        color_load: LoadAction,
        depth_load: LoadAction,
        clear: ClearValues,
    ) {
        let color_attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(target.color)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(load_op(color_load))
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear.color,
                },
            })];
        let depth_attachment;

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: target.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);

        if let Some(depth_view) = target.depth {
            depth_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(depth_view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(load_op(depth_load))
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: clear.depth,
                        stencil: clear.stencil,
                    },
                });
            rendering_info = rendering_info.depth_attachment(&depth_attachment);
            if target.has_stencil {
                rendering_info = rendering_info.stencil_attachment(&depth_attachment);
            }
        }

        unsafe { self.device.cmd_begin_rendering(self.cmd, &rendering_info) };
    }

    fn end_render_pass(&mut self) {
        unsafe { self.device.cmd_end_rendering(self.cmd) };
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(self.cmd, 0, &[viewport]) };
    }

    fn set_scissor(&mut self, rect: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(self.cmd, 0, &[rect]) };
    }

    fn set_stencil(&mut self, write_mask: u32, compare_mask: u32, reference: u32) {
        let faces = vk::StencilFaceFlags::FRONT_AND_BACK;
        unsafe {
            self.device
                .cmd_set_stencil_write_mask(self.cmd, faces, write_mask);
            self.device
                .cmd_set_stencil_compare_mask(self.cmd, faces, compare_mask);
            self.device
                .cmd_set_stencil_reference(self.cmd, faces, reference);
        }
    }

    fn set_blend_color(&mut self, color: [f32; 4]) {
        unsafe { self.device.cmd_set_blend_constants(self.cmd, &color) };
    }

    fn clear_attachments(
        &mut self,
        rect: vk::Rect2D,
        values: ClearValues,
        mask: vk::ImageAspectFlags,
    ) {
        let mut attachments = Vec::with_capacity(2);
        if mask.contains(vk::ImageAspectFlags::COLOR) {
            attachments.push(vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: values.color,
                    },
                },
            });
        }
        let depth_stencil =
            mask & (vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL);
        if !depth_stencil.is_empty() {
            attachments.push(vk::ClearAttachment {
                aspect_mask: depth_stencil,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: values.depth,
                        stencil: values.stencil,
                    },
                },
            });
        }

        let clear_rect = vk::ClearRect {
            rect,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.device
                .cmd_clear_attachments(self.cmd, &attachments, &[clear_rect]);
        }
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
    }

    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            );
        }
    }

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.cmd, 0, &[buffer], &[offset]);
        }
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.cmd, buffer, offset, index_type);
        }
    }

    fn draw(&mut self, vertex_count: u32) {
        unsafe { self.device.cmd_draw(self.cmd, vertex_count, 1, 0, 0) };
    }

    fn draw_indexed(&mut self, index_count: u32) {
        unsafe { self.device.cmd_draw_indexed(self.cmd, index_count, 1, 0, 0, 0) };
    }

    fn copy_image(&mut self, step: &CopyStep) {
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: step.aspect,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageCopy {
            src_subresource: subresource,
            src_offset: vk::Offset3D {
                x: step.src_offset.x,
                y: step.src_offset.y,
                z: 0,
            },
            dst_subresource: subresource,
            dst_offset: vk::Offset3D {
                x: step.dst_offset.x,
                y: step.dst_offset.y,
                z: 0,
            },
            extent: vk::Extent3D {
                width: step.size.width,
                height: step.size.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_image(
                self.cmd,
                step.src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                step.dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn blit_image(&mut self, step: &BlitStep) {
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: step.aspect,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: subresource,
            src_offsets: rect_to_blit_offsets(step.src_rect),
            dst_subresource: subresource,
            dst_offsets: rect_to_blit_offsets(step.dst_rect),
        };
        unsafe {
            self.device.cmd_blit_image(
                self.cmd,
                step.src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                step.dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                step.filter,
            );
        }
    }

    fn readback_image(&mut self, step: &ReadbackStep) {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: step.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D {
                x: step.src_rect.offset.x,
                y: step.src_rect.offset.y,
                z: 0,
            },
            image_extent: vk::Extent3D {
                width: step.src_rect.extent.width,
                height: step.src_rect.extent.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                self.cmd,
                step.src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                step.dst,
                &[region],
            );
        }
    }
}
