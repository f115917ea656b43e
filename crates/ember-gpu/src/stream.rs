//! Recorded command stream.
//!
//! Drawing work is buffered as plain data: a sequence of [`Step`]s, where a
//! render step carries an ordered list of [`RenderCommand`]s. Nothing here
//! touches the device; the stream is replayed against a command buffer later,
//! on whichever thread performs submission.

use ash::vk;

/// How an attachment's existing contents are treated when a render step begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadAction {
    /// Preserve the current contents.
    Keep,
    /// Clear to the step's clear values.
    Clear,
    /// Contents are undefined on entry.
    DontCare,
}

/// Clear values for every aspect a target can have.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0; 4],
            depth: 1.0,
            stencil: 0,
        }
    }
}

/// Attachment set a render step draws into.
///
/// Plain handles only; the views must stay valid until the step has been
/// replayed and its frame's fence has signaled.
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget {
    /// Color attachment view.
    pub color: vk::ImageView,
    /// Combined depth/stencil attachment view, if any.
    pub depth: Option<vk::ImageView>,
    /// Whether the depth attachment's format carries a stencil aspect.
    pub has_stencil: bool,
    /// Attachment dimensions.
    pub extent: vk::Extent2D,
}

impl RenderTarget {
    /// Aspects this target actually has.
    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        let mut mask = vk::ImageAspectFlags::COLOR;
        if self.depth.is_some() {
            mask |= vk::ImageAspectFlags::DEPTH;
            if self.has_stencil {
                mask |= vk::ImageAspectFlags::STENCIL;
            }
        }
        mask
    }
}

/// A non-indexed draw with everything it needs to be replayed later.
#[derive(Debug, Clone, Copy)]
pub struct DrawCall {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub vertex_buffer: vk::Buffer,
    pub vertex_offset: u64,
    pub vertex_count: u32,
}

/// An indexed draw with everything it needs to be replayed later.
#[derive(Debug, Clone, Copy)]
pub struct IndexedDrawCall {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub vertex_buffer: vk::Buffer,
    pub vertex_offset: u64,
    pub index_buffer: vk::Buffer,
    pub index_offset: u64,
    pub index_type: vk::IndexType,
    pub index_count: u32,
}

/// One recorded command inside a render step.
///
/// Commands are pure data. State commands persist until overridden within
/// their step; the replay never resets state between commands.
#[derive(Debug, Clone, Copy)]
pub enum RenderCommand {
    SetViewport {
        viewport: vk::Viewport,
    },
    SetScissor {
        rect: vk::Rect2D,
    },
    SetStencil {
        write_mask: u32,
        compare_mask: u32,
        reference: u32,
    },
    SetBlendColor {
        color: [f32; 4],
    },
    /// Clear the given aspects of the whole target.
    Clear {
        values: ClearValues,
        mask: vk::ImageAspectFlags,
    },
    Draw(DrawCall),
    DrawIndexed(IndexedDrawCall),
}

impl RenderCommand {
    fn is_draw(&self) -> bool {
        matches!(self, Self::Draw(_) | Self::DrawIndexed(_))
    }
}

/// Parameters for opening a render step.
#[derive(Debug, Clone, Copy)]
pub struct RenderPassDesc {
    pub target: RenderTarget,
    pub color_load: LoadAction,
    pub depth_load: LoadAction,
    pub clear: ClearValues,
    /// Debug label carried through logs.
    pub tag: &'static str,
}

/// A render step: one pass over a target plus its recorded commands.
#[derive(Debug)]
pub struct RenderStep {
    pub target: RenderTarget,
    pub color_load: LoadAction,
    /// Covers the combined depth/stencil aspect.
    pub depth_load: LoadAction,
    pub clear: ClearValues,
    pub commands: Vec<RenderCommand>,
    /// Number of draw commands recorded, for diagnostics.
    pub draw_count: u32,
    pub tag: &'static str,
}

/// An image-to-image copy.
///
/// The recording side must have arranged for `src` to be in
/// `TRANSFER_SRC_OPTIMAL` and `dst` in `TRANSFER_DST_OPTIMAL` by the time the
/// step is replayed.
#[derive(Debug, Clone, Copy)]
pub struct CopyStep {
    pub src: vk::Image,
    pub dst: vk::Image,
    pub src_offset: vk::Offset2D,
    pub dst_offset: vk::Offset2D,
    pub size: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,
    pub tag: &'static str,
}

/// A scaled image-to-image blit. Same layout expectations as [`CopyStep`].
#[derive(Debug, Clone, Copy)]
pub struct BlitStep {
    pub src: vk::Image,
    pub dst: vk::Image,
    pub src_rect: vk::Rect2D,
    pub dst_rect: vk::Rect2D,
    pub filter: vk::Filter,
    pub aspect: vk::ImageAspectFlags,
    pub tag: &'static str,
}

/// An image-to-buffer readback.
///
/// Completion is observed through the frame's fence; the buffer contents are
/// valid once that fence has signaled.
#[derive(Debug, Clone, Copy)]
pub struct ReadbackStep {
    pub src: vk::Image,
    pub src_rect: vk::Rect2D,
    pub aspect: vk::ImageAspectFlags,
    pub dst: vk::Buffer,
    pub tag: &'static str,
}

/// One unit of recorded work.
#[derive(Debug)]
pub enum Step {
    Render(RenderStep),
    Copy(CopyStep),
    Blit(BlitStep),
    Readback(ReadbackStep),
}

/// Ordered queue of steps under construction on the recording side.
///
/// Exactly one render step may be open at a time; commands are only legal
/// while one is. Copy, blit, and readback steps are pushed whole and never
/// open.
#[derive(Default)]
pub struct StepQueue {
    steps: Vec<Step>,
    open: bool,
}

impl StepQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a render step. All commands until [`close`](Self::close) belong to it.
    pub fn open_render(&mut self, desc: RenderPassDesc) {
        debug_assert!(!self.open, "render step opened while another is open");
        self.steps.push(Step::Render(RenderStep {
            target: desc.target,
            color_load: desc.color_load,
            depth_load: desc.depth_load,
            clear: desc.clear,
            commands: Vec::new(),
            draw_count: 0,
            tag: desc.tag,
        }));
        self.open = true;
    }

    /// Append a command to the open render step.
    pub fn append(&mut self, cmd: RenderCommand) {
        debug_assert!(self.open, "command appended with no open render step");
        if let Some(Step::Render(step)) = self.steps.last_mut() {
            if cmd.is_draw() {
                step.draw_count += 1;
            }
            step.commands.push(cmd);
        }
    }

    /// Close the open render step.
    pub fn close(&mut self) {
        debug_assert!(self.open, "close called with no open render step");
        self.open = false;
    }

    /// Push a copy step. No render step may be open.
    pub fn push_copy(&mut self, step: CopyStep) {
        debug_assert!(!self.open, "copy step pushed inside an open render step");
        self.steps.push(Step::Copy(step));
    }

    /// Push a blit step. No render step may be open.
    pub fn push_blit(&mut self, step: BlitStep) {
        debug_assert!(!self.open, "blit step pushed inside an open render step");
        self.steps.push(Step::Blit(step));
    }

    /// Push a readback step. No render step may be open.
    pub fn push_readback(&mut self, step: ReadbackStep) {
        debug_assert!(!self.open, "readback step pushed inside an open render step");
        self.steps.push(Step::Readback(step));
    }

    /// Take the accumulated steps, leaving the queue empty and reusable.
    ///
    /// This is the handoff primitive: ownership of the steps moves to the
    /// caller. A still-open render step at this point is a recording bug.
    pub fn take_steps(&mut self) -> Vec<Step> {
        assert!(!self.open, "steps taken while a render step is still open");
        std::mem::take(&mut self.steps)
    }

    /// Whether a render step is currently open.
    pub fn has_open_step(&self) -> bool {
        self.open
    }

    /// Number of steps recorded so far.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no steps have been recorded.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn test_target() -> RenderTarget {
        RenderTarget {
            color: vk::ImageView::from_raw(0x10),
            depth: None,
            has_stencil: false,
            extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
        }
    }

    fn clear_desc(color: [f32; 4]) -> RenderPassDesc {
        RenderPassDesc {
            target: test_target(),
            color_load: LoadAction::Clear,
            depth_load: LoadAction::DontCare,
            clear: ClearValues {
                color,
                ..ClearValues::default()
            },
            tag: "test",
        }
    }

    fn test_draw() -> DrawCall {
        DrawCall {
            pipeline: vk::Pipeline::from_raw(0x20),
            layout: vk::PipelineLayout::from_raw(0x21),
            descriptor_set: vk::DescriptorSet::from_raw(0x22),
            vertex_buffer: vk::Buffer::from_raw(0x23),
            vertex_offset: 0,
            vertex_count: 3,
        }
    }

    fn test_draw_indexed() -> IndexedDrawCall {
        IndexedDrawCall {
            pipeline: vk::Pipeline::from_raw(0x20),
            layout: vk::PipelineLayout::from_raw(0x21),
            descriptor_set: vk::DescriptorSet::from_raw(0x22),
            vertex_buffer: vk::Buffer::from_raw(0x23),
            vertex_offset: 0,
            index_buffer: vk::Buffer::from_raw(0x24),
            index_offset: 0,
            index_type: vk::IndexType::UINT16,
            index_count: 6,
        }
    }

    #[test]
    fn commands_append_in_order() {
        let mut queue = StepQueue::new();
        let black = [0.0, 0.0, 0.0, 1.0];

        queue.open_render(clear_desc(black));
        queue.append(RenderCommand::SetViewport {
            viewport: vk::Viewport::default(),
        });
        queue.append(RenderCommand::Draw(test_draw()));
        queue.append(RenderCommand::Clear {
            values: ClearValues {
                color: [1.0, 0.0, 0.0, 1.0],
                ..ClearValues::default()
            },
            mask: vk::ImageAspectFlags::COLOR,
        });
        queue.append(RenderCommand::DrawIndexed(test_draw_indexed()));
        queue.close();

        let steps = queue.take_steps();
        assert_eq!(steps.len(), 1);

        let Step::Render(step) = &steps[0] else {
            panic!("expected a render step");
        };
        assert_eq!(step.color_load, LoadAction::Clear);
        assert_eq!(step.clear.color, black);
        assert_eq!(step.draw_count, 2);
        assert_eq!(step.commands.len(), 4);
        assert!(matches!(step.commands[0], RenderCommand::SetViewport { .. }));
        assert!(matches!(step.commands[1], RenderCommand::Draw(_)));
        assert!(matches!(step.commands[2], RenderCommand::Clear { .. }));
        assert!(matches!(step.commands[3], RenderCommand::DrawIndexed(_)));
    }

    #[test]
    #[should_panic(expected = "no open render step")]
    fn append_without_open_step_panics() {
        let mut queue = StepQueue::new();
        queue.append(RenderCommand::SetBlendColor { color: [1.0; 4] });
    }

    #[test]
    #[should_panic(expected = "still open")]
    fn take_with_open_step_panics() {
        let mut queue = StepQueue::new();
        queue.open_render(clear_desc([0.0; 4]));
        let _ = queue.take_steps();
    }

    #[test]
    fn copy_steps_need_no_open() {
        let mut queue = StepQueue::new();
        queue.push_copy(CopyStep {
            src: vk::Image::from_raw(0x30),
            dst: vk::Image::from_raw(0x31),
            src_offset: vk::Offset2D::default(),
            dst_offset: vk::Offset2D::default(),
            size: vk::Extent2D {
                width: 16,
                height: 16,
            },
            aspect: vk::ImageAspectFlags::COLOR,
            tag: "upload",
        });

        let steps = queue.take_steps();
        assert_eq!(steps.len(), 1);
        assert!(matches!(steps[0], Step::Copy(_)));
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_is_reusable_after_take() {
        let mut queue = StepQueue::new();
        queue.open_render(clear_desc([0.0; 4]));
        queue.close();
        assert_eq!(queue.take_steps().len(), 1);

        queue.open_render(clear_desc([1.0; 4]));
        queue.close();
        let steps = queue.take_steps();
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn target_aspect_mask_follows_attachments() {
        let color_only = test_target();
        assert_eq!(color_only.aspect_mask(), vk::ImageAspectFlags::COLOR);

        let with_depth = RenderTarget {
            depth: Some(vk::ImageView::from_raw(0x11)),
            has_stencil: true,
            ..test_target()
        };
        assert_eq!(
            with_depth.aspect_mask(),
            vk::ImageAspectFlags::COLOR
                | vk::ImageAspectFlags::DEPTH
                | vk::ImageAspectFlags::STENCIL
        );
    }
}
