//! Step replay.
//!
//! [`run_steps`] translates a recorded step sequence into real command-buffer
//! calls through a [`CommandSink`]. Replay preserves step order and, within a
//! render step, command order. The only rewrite performed is the leading
//! clear merge, which folds a full-target clear into the pass load actions.

use ash::vk;

use crate::stream::{
    BlitStep, ClearValues, CopyStep, LoadAction, ReadbackStep, RenderCommand, RenderStep,
    RenderTarget, Step,
};

/// Receiver for replayed commands.
///
/// The production implementation records into a Vulkan command buffer; tests
/// substitute a logging double.
pub trait CommandSink {
    fn begin_render_pass(
        &mut self,
        target: &RenderTarget,
        color_load: LoadAction,
        depth_load: LoadAction,
        clear: ClearValues,
    );
    fn end_render_pass(&mut self);
    fn set_viewport(&mut self, viewport: vk::Viewport);
    fn set_scissor(&mut self, rect: vk::Rect2D);
    fn set_stencil(&mut self, write_mask: u32, compare_mask: u32, reference: u32);
    fn set_blend_color(&mut self, color: [f32; 4]);
    fn clear_attachments(
        &mut self,
        rect: vk::Rect2D,
        values: ClearValues,
        mask: vk::ImageAspectFlags,
    );
    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);
    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, set: vk::DescriptorSet);
    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64);
    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType);
    fn draw(&mut self, vertex_count: u32);
    fn draw_indexed(&mut self, index_count: u32);
    fn copy_image(&mut self, step: &CopyStep);
    fn blit_image(&mut self, step: &BlitStep);
    fn readback_image(&mut self, step: &ReadbackStep);
}

/// Counters from one replay, for trace logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Steps replayed.
    pub steps: usize,
    /// Draw commands issued.
    pub draws: u32,
    /// Leading clears folded into pass load actions.
    pub clears_merged: u32,
}

impl RunStats {
    /// Fold another replay's counters into this one.
    pub fn merge(&mut self, other: RunStats) {
        self.steps += other.steps;
        self.draws += other.draws;
        self.clears_merged += other.clears_merged;
    }
}

/// Replay recorded steps onto a sink, consuming them.
///
/// Every step begins and ends its own pass or transfer; an empty render step
/// still opens and closes its pass so attachment layout behavior stays
/// defined. Draws bind their full state every time.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn run_steps(sink: &mut dyn CommandSink, steps: Vec<Step>) -> RunStats {
    let mut stats = RunStats {
        steps: steps.len(),
        ..RunStats::default()
    };

    for step in steps {
        match step {
            Step::Render(mut step) => {
                if merge_leading_clear(&mut step) {
                    stats.clears_merged += 1;
                }
                stats.draws += step.draw_count;
                run_render_step(sink, &step);
            }
            Step::Copy(step) => sink.copy_image(&step),
            Step::Blit(step) => sink.blit_image(&step),
            Step::Readback(step) => sink.readback_image(&step),
        }
    }

    tracing::trace!(
        steps = stats.steps,
        draws = stats.draws,
        clears_merged = stats.clears_merged,
        "replayed step stream"
    );
    stats
}

/// Fold a leading full-target clear into the step's load actions.
///
/// Only the first command is considered, and only when its mask covers every
/// aspect the target has. Partial clears and clears appearing later in the
/// step stay explicit `clear_attachments` calls.
fn merge_leading_clear(step: &mut RenderStep) -> bool {
    let Some(RenderCommand::Clear { values, mask }) = step.commands.first().copied() else {
        return false;
    };
    if !mask.contains(step.target.aspect_mask()) {
        return false;
    }

    step.color_load = LoadAction::Clear;
    step.clear.color = values.color;
    if step.target.depth.is_some() {
        step.depth_load = LoadAction::Clear;
        step.clear.depth = values.depth;
        step.clear.stencil = values.stencil;
    }
    step.commands.remove(0);
    true
}

fn run_render_step(sink: &mut dyn CommandSink, step: &RenderStep) {
    sink.begin_render_pass(&step.target, step.color_load, step.depth_load, step.clear);

    let full_rect = vk::Rect2D {
        offset: vk::Offset2D::default(),
        extent: step.target.extent,
    };

    for cmd in &step.commands {
        match *cmd {
            RenderCommand::SetViewport { viewport } => sink.set_viewport(viewport),
            RenderCommand::SetScissor { rect } => sink.set_scissor(rect),
            RenderCommand::SetStencil {
                write_mask,
                compare_mask,
                reference,
            } => sink.set_stencil(write_mask, compare_mask, reference),
            RenderCommand::SetBlendColor { color } => sink.set_blend_color(color),
            RenderCommand::Clear { values, mask } => {
                sink.clear_attachments(full_rect, values, mask);
            }
            RenderCommand::Draw(call) => {
                sink.bind_pipeline(call.pipeline);
                sink.bind_descriptor_set(call.layout, call.descriptor_set);
                sink.bind_vertex_buffer(call.vertex_buffer, call.vertex_offset);
                sink.draw(call.vertex_count);
            }
            RenderCommand::DrawIndexed(call) => {
                sink.bind_pipeline(call.pipeline);
                sink.bind_descriptor_set(call.layout, call.descriptor_set);
                sink.bind_vertex_buffer(call.vertex_buffer, call.vertex_offset);
                sink.bind_index_buffer(call.index_buffer, call.index_offset, call.index_type);
                sink.draw_indexed(call.index_count);
            }
        }
    }

    sink.end_render_pass();
}
