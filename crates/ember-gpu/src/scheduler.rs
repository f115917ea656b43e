//! Recording-to-submission handoff.
//!
//! A [`RenderScheduler`] collects steps and deferred deletions on the
//! recording thread. `flush` hands the finished frame off as a [`FrameWork`]
//! value: in direct mode it is replayed and submitted inline, in threaded
//! mode it moves over a bounded channel to the "gpu-submit" thread. Nothing
//! is shared between the two sides while a frame is in transit.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ash::vk;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use tracing::{debug, error, trace};

use crate::deferred::DeleteList;
use crate::device::DeviceOps;
use crate::error::{GpuError, Result};
use crate::frame::{FramePipeline, PipelineConfig, MAX_INFLIGHT_FRAMES};
use crate::runner::{run_steps, RunStats};
use crate::stream::{
    BlitStep, ClearValues, CopyStep, DrawCall, IndexedDrawCall, ReadbackStep, RenderCommand,
    RenderPassDesc, Step, StepQueue,
};

/// One flushed frame's worth of work, moved to the submission side whole.
pub struct FrameWork {
    /// Steps to replay, in recording order.
    pub steps: Vec<Step>,
    /// Deletions recorded alongside the steps; they ride the same frame.
    pub deletes: DeleteList,
}

impl std::fmt::Debug for FrameWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWork")
            .field("steps", &self.steps.len())
            .field("deletes", &self.deletes.pending_count())
            .finish()
    }
}

/// Request sent to the submission worker thread.
#[derive(Debug)]
enum SubmitRequest {
    /// Replay and submit one frame.
    Submit(FrameWork),
    /// Signal the worker thread to shut down.
    Shutdown,
}

/// Replays and submits flushed frames. Owns the frame ring.
struct SubmitWorker {
    device: Arc<dyn DeviceOps>,
    pipeline: FramePipeline,
}

impl SubmitWorker {
    /// Run one frame through the ring: reclaim, record, submit.
    ///
    /// Leading copy steps are recorded into the frame's init buffer so they
    /// are submitted ahead of everything else; the remaining steps go into
    /// the main buffer. The main buffer is always submitted, even empty,
    /// because the slot fence must signal for the ring to advance.
    fn submit_frame(&mut self, work: FrameWork) -> Result<()> {
        let ctx = self.pipeline.begin_frame()?;
        self.pipeline.pending_deletes().absorb(work.deletes);

        let mut steps = work.steps;
        let leading = steps
            .iter()
            .take_while(|step| matches!(step, Step::Copy(_)))
            .count();
        let main_steps = steps.split_off(leading);
        let init_steps = steps;

        let mut stats = RunStats::default();
        let mut submitted = Vec::with_capacity(2);

        if !init_steps.is_empty() {
            self.device.begin_commands(ctx.init_cmd)?;
            {
                let mut sink = self.device.make_sink(ctx.init_cmd);
                stats.merge(run_steps(sink.as_mut(), init_steps));
            }
            self.device.end_commands(ctx.init_cmd)?;
            submitted.push(ctx.init_cmd);
        }

        self.device.begin_commands(ctx.main_cmd)?;
        {
            let mut sink = self.device.make_sink(ctx.main_cmd);
            stats.merge(run_steps(sink.as_mut(), main_steps));
        }
        self.device.end_commands(ctx.main_cmd)?;
        submitted.push(ctx.main_cmd);

        self.device.submit(&submitted, ctx.fence)?;
        self.pipeline.end_frame();

        debug!(
            frame = ctx.frame_index,
            steps = stats.steps,
            draws = stats.draws,
            "frame submitted"
        );
        Ok(())
    }

    /// Log a submission failure and put the ring back into a usable state.
    fn handle_failure(&mut self, err: &GpuError) {
        error!("Frame submission failed: {err}");
        if let Err(recover_err) = self.pipeline.recover_after_loss() {
            error!("Recovery after submission failure failed: {recover_err}");
        }
    }
}

/// Handle to the background submission thread.
struct WorkerHandle {
    work_tx: Sender<SubmitRequest>,
    error_rx: Receiver<GpuError>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the submission thread, moving the worker onto it.
    fn spawn(worker: SubmitWorker) -> Self {
        let (work_tx, work_rx) = channel::bounded::<SubmitRequest>(MAX_INFLIGHT_FRAMES);
        let (error_tx, error_rx) = channel::bounded::<GpuError>(MAX_INFLIGHT_FRAMES);

        let thread = thread::Builder::new()
            .name("gpu-submit".to_string())
            .spawn(move || {
                Self::worker_loop(worker, work_rx, error_tx);
            })
            .expect("Failed to spawn gpu submit thread");

        Self {
            work_tx,
            error_rx,
            thread: Some(thread),
        }
    }

    /// Main worker loop - blocks waiting for frames and submits them.
    fn worker_loop(
        mut worker: SubmitWorker,
        work_rx: Receiver<SubmitRequest>,
        error_tx: Sender<GpuError>,
    ) {
        loop {
            match work_rx.recv() {
                Ok(SubmitRequest::Submit(work)) => {
                    if let Err(err) = worker.submit_frame(work) {
                        worker.handle_failure(&err);
                        // Blocking send - reports are drained by flush and
                        // by shutdown, so this backpressures instead of
                        // dropping failures.
                        if error_tx.send(err).is_err() {
                            // Receiver dropped, exit loop
                            break;
                        }
                    }
                }
                Ok(SubmitRequest::Shutdown) | Err(_) => {
                    break;
                }
            }
        }

        if let Err(err) = worker.pipeline.shutdown() {
            error!("Frame pipeline shutdown failed: {err}");
        }
    }

    /// Shutdown the worker thread and wait for it to finish.
    ///
    /// Returns the last failure report still queued, if any.
    fn shutdown(&mut self) -> Option<GpuError> {
        let mut last_error = None;

        // The worker parks in its report send once that channel fills;
        // drain reports while delivering the request and until the thread
        // exits, or join would wait on a send that cannot complete.
        let mut request = SubmitRequest::Shutdown;
        loop {
            match self.work_tx.try_send(request) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => break,
                Err(TrySendError::Full(returned)) => {
                    request = returned;
                    if let Ok(err) = self.error_rx.recv_timeout(Duration::from_millis(10)) {
                        last_error = Some(err);
                    }
                }
            }
        }
        while let Ok(err) = self.error_rx.recv() {
            last_error = Some(err);
        }

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        last_error
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

enum Backend {
    /// Frames are replayed and submitted inside `flush`.
    Direct(Box<SubmitWorker>),
    /// Frames move to the "gpu-submit" thread.
    Threaded(WorkerHandle),
}

/// Recording front end plus its submission backend.
///
/// Exactly one thread records; `flush` is the only point where work changes
/// hands. Recording never blocks on GPU completion.
pub struct RenderScheduler {
    queue: StepQueue,
    deletes: DeleteList,
    backend: Backend,
}

impl RenderScheduler {
    /// Create a scheduler that submits inline on the calling thread.
    pub fn new(device: Arc<dyn DeviceOps>, config: &PipelineConfig) -> Result<Self> {
        let pipeline = FramePipeline::new(device.clone(), config)?;
        Ok(Self {
            queue: StepQueue::new(),
            deletes: DeleteList::new(),
            backend: Backend::Direct(Box::new(SubmitWorker { device, pipeline })),
        })
    }

    /// Create a scheduler whose frames are submitted on a background thread.
    ///
    /// `flush` then only moves the frame onto the channel; fence waits and
    /// replay happen off the recording thread.
    pub fn new_threaded(device: Arc<dyn DeviceOps>, config: &PipelineConfig) -> Result<Self> {
        let pipeline = FramePipeline::new(device.clone(), config)?;
        let handle = WorkerHandle::spawn(SubmitWorker { device, pipeline });
        Ok(Self {
            queue: StepQueue::new(),
            deletes: DeleteList::new(),
            backend: Backend::Threaded(handle),
        })
    }

    /// Check if this scheduler submits on a background thread.
    pub fn is_threaded(&self) -> bool {
        matches!(self.backend, Backend::Threaded(_))
    }

    /// Open a render step; commands recorded next belong to it.
    pub fn open_render(&mut self, desc: RenderPassDesc) {
        self.queue.open_render(desc);
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.queue.append(RenderCommand::SetViewport { viewport });
    }

    pub fn set_scissor(&mut self, rect: vk::Rect2D) {
        self.queue.append(RenderCommand::SetScissor { rect });
    }

    pub fn set_stencil(&mut self, write_mask: u32, compare_mask: u32, reference: u32) {
        self.queue.append(RenderCommand::SetStencil {
            write_mask,
            compare_mask,
            reference,
        });
    }

    pub fn set_blend_color(&mut self, color: [f32; 4]) {
        self.queue.append(RenderCommand::SetBlendColor { color });
    }

    /// Clear the given aspects of the open step's whole target.
    pub fn clear(&mut self, values: ClearValues, mask: vk::ImageAspectFlags) {
        self.queue.append(RenderCommand::Clear { values, mask });
    }

    pub fn draw(&mut self, call: DrawCall) {
        self.queue.append(RenderCommand::Draw(call));
    }

    pub fn draw_indexed(&mut self, call: IndexedDrawCall) {
        self.queue.append(RenderCommand::DrawIndexed(call));
    }

    /// Close the open render step.
    pub fn close_step(&mut self) {
        self.queue.close();
    }

    pub fn copy(&mut self, step: CopyStep) {
        self.queue.push_copy(step);
    }

    pub fn blit(&mut self, step: BlitStep) {
        self.queue.push_blit(step);
    }

    pub fn readback(&mut self, step: ReadbackStep) {
        self.queue.push_readback(step);
    }

    /// Deletions to defer until the frame being recorded is provably done.
    /// They ship with the next `flush`.
    pub fn delete_list(&mut self) -> &mut DeleteList {
        &mut self.deletes
    }

    /// Number of steps recorded and not yet flushed.
    pub fn queued_steps(&self) -> usize {
        self.queue.len()
    }

    /// Hand the recorded frame to the submission side.
    ///
    /// Returns the scheduler to an empty recording state. In threaded mode a
    /// returned error belongs to an earlier frame; the current frame is
    /// already queued.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush(&mut self) -> Result<()> {
        let work = FrameWork {
            steps: self.queue.take_steps(),
            deletes: std::mem::take(&mut self.deletes),
        };
        trace!(steps = work.steps.len(), "flushing recorded frame");

        match &mut self.backend {
            Backend::Direct(worker) => {
                if let Err(err) = worker.submit_frame(work) {
                    worker.handle_failure(&err);
                    return Err(err);
                }
                Ok(())
            }
            Backend::Threaded(handle) => {
                handle
                    .work_tx
                    .send(SubmitRequest::Submit(work))
                    .map_err(|_| {
                        GpuError::InvalidState("submission worker is gone".to_string())
                    })?;
                // Surface failures from frames submitted earlier.
                if let Ok(err) = handle.error_rx.try_recv() {
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    /// Stop submitting and tear down the frame ring.
    ///
    /// In threaded mode this joins the worker; the last unprocessed failure
    /// report is returned. Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Direct(worker) => worker.pipeline.shutdown(),
            Backend::Threaded(handle) => match handle.shutdown() {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }
}

impl Drop for RenderScheduler {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("Render scheduler shutdown failed: {err}");
        }
    }
}
