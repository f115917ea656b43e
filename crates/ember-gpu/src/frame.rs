//! Frame-in-flight ring.
//!
//! A [`FramePipeline`] owns a small ring of slots, one per frame that may be
//! in flight. Each slot carries a fence, a command pool with two command
//! buffers, and a [`DeleteList`]. Beginning a frame waits the slot's fence,
//! which proves the GPU finished the slot's previous use, then reclaims the
//! slot's deferred deletions and recycles its pool.

use std::sync::Arc;

use ash::vk;
use tracing::{error, info, trace, warn};

use crate::deferred::DeleteList;
use crate::device::DeviceOps;
use crate::error::{GpuError, Result};

/// Upper bound on frames in flight. All slots are allocated at creation.
pub const MAX_INFLIGHT_FRAMES: usize = 4;

/// Default ring depth.
pub const DEFAULT_INFLIGHT_FRAMES: usize = 3;

/// Frame pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Active ring depth, `1..=MAX_INFLIGHT_FRAMES`.
    pub inflight_frames: usize,
    /// How long a slot fence may stay unsignaled before the device is
    /// declared lost.
    pub fence_timeout_ns: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inflight_frames: DEFAULT_INFLIGHT_FRAMES,
            fence_timeout_ns: 5_000_000_000,
        }
    }
}

/// Per-slot resources.
struct FrameSlot {
    fence: vk::Fence,
    command_pool: vk::CommandPool,
    init_cmd: vk::CommandBuffer,
    main_cmd: vk::CommandBuffer,
    deleter: DeleteList,
}

/// Handles for recording into the frame begun by [`FramePipeline::begin_frame`].
///
/// `init_cmd` is submitted ahead of `main_cmd`; pre-pass uploads go there.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Ring slot index this frame occupies.
    pub slot: usize,
    /// Monotonic frame number, starting at 1.
    pub frame_index: u64,
    /// Fence to signal when submitting this frame's work.
    pub fence: vk::Fence,
    /// Command buffer for work that must run before the main buffer.
    pub init_cmd: vk::CommandBuffer,
    /// Main command buffer.
    pub main_cmd: vk::CommandBuffer,
}

/// Ring of frame slots plus the not-yet-assigned pending deletions.
///
/// Invariant: when `begin_frame` returns for slot `i`, all GPU work submitted
/// with slot `i`'s fence has completed; the fence wait enforces this even if
/// a caller runs deeper than the configured ring depth.
pub struct FramePipeline {
    device: Arc<dyn DeviceOps>,
    slots: Vec<FrameSlot>,
    inflight: usize,
    current: usize,
    frame_counter: u64,
    /// Deletions not yet assigned to a slot; folded in at `end_frame`.
    pending: DeleteList,
    fence_timeout_ns: u64,
    recording: bool,
    shut_down: bool,
}

impl FramePipeline {
    /// Create the ring. Every slot is allocated up front so reconfiguring the
    /// depth later never allocates.
    pub fn new(device: Arc<dyn DeviceOps>, config: &PipelineConfig) -> Result<Self> {
        if !(1..=MAX_INFLIGHT_FRAMES).contains(&config.inflight_frames) {
            return Err(GpuError::InvalidState(format!(
                "inflight frame count {} out of range 1..={MAX_INFLIGHT_FRAMES}",
                config.inflight_frames
            )));
        }

        let mut slots = Vec::with_capacity(MAX_INFLIGHT_FRAMES);
        for _ in 0..MAX_INFLIGHT_FRAMES {
            let fence = device.create_fence(true)?;
            let command_pool = device.create_command_pool()?;
            let cmds = device.allocate_command_buffers(command_pool, 2)?;
            slots.push(FrameSlot {
                fence,
                command_pool,
                init_cmd: cmds[0],
                main_cmd: cmds[1],
                deleter: DeleteList::new(),
            });
        }

        info!(inflight = config.inflight_frames, "frame pipeline ready");

        Ok(Self {
            device,
            slots,
            inflight: config.inflight_frames,
            current: 0,
            frame_counter: 0,
            pending: DeleteList::new(),
            fence_timeout_ns: config.fence_timeout_ns,
            recording: false,
            shut_down: false,
        })
    }

    /// Begin the next frame: wait the slot fence, reclaim the slot's deferred
    /// deletions, and recycle its command pool.
    ///
    /// A fence that stays unsignaled past the configured timeout escalates to
    /// [`GpuError::DeviceLost`]; the caller should run
    /// [`recover_after_loss`](Self::recover_after_loss) before continuing.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&mut self) -> Result<FrameContext> {
        debug_assert!(!self.recording, "begin_frame called while a frame is already open");
        if self.shut_down {
            return Err(GpuError::InvalidState(
                "frame pipeline already shut down".to_string(),
            ));
        }

        let slot_index = self.current;
        let fence = self.slots[slot_index].fence;

        if !self.device.wait_fence(fence, self.fence_timeout_ns)? {
            return Err(GpuError::DeviceLost(format!(
                "slot {slot_index} fence not signaled after {} ns",
                self.fence_timeout_ns
            )));
        }
        self.device.reset_fence(fence)?;

        let slot = &mut self.slots[slot_index];
        // The fence wait above is what makes this reclaim safe.
        let reclaimed = unsafe { slot.deleter.execute_all(self.device.as_ref()) };
        if reclaimed > 0 {
            trace!(slot = slot_index, reclaimed, "reclaimed deferred resources");
        }
        self.device.reset_command_pool(slot.command_pool)?;

        self.frame_counter += 1;
        self.recording = true;

        Ok(FrameContext {
            slot: slot_index,
            frame_index: self.frame_counter,
            fence,
            init_cmd: slot.init_cmd,
            main_cmd: slot.main_cmd,
        })
    }

    /// End the current frame: hand the pending deletions to the slot and
    /// advance the ring.
    ///
    /// Call after submitting the frame's command buffers with the slot fence.
    pub fn end_frame(&mut self) {
        debug_assert!(self.recording, "end_frame called without begin_frame");
        let slot = &mut self.slots[self.current];
        slot.deleter.take_from(&mut self.pending);
        self.current = (self.current + 1) % self.inflight;
        self.recording = false;
    }

    /// Deletions that will ride along with the current (or next) frame.
    pub fn pending_deletes(&mut self) -> &mut DeleteList {
        &mut self.pending
    }

    /// Change the active ring depth.
    ///
    /// Rejects out-of-range values with no effect. The caller must ensure no
    /// frames are in flight, typically by waiting the device idle first.
    pub fn set_inflight_frames(&mut self, inflight: usize) -> Result<()> {
        debug_assert!(!self.recording, "ring depth changed while a frame is open");
        if !(1..=MAX_INFLIGHT_FRAMES).contains(&inflight) {
            return Err(GpuError::InvalidState(format!(
                "inflight frame count {inflight} out of range 1..={MAX_INFLIGHT_FRAMES}"
            )));
        }
        self.inflight = inflight;
        if self.current >= inflight {
            self.current = 0;
        }
        info!(inflight, "frames in flight reconfigured");
        Ok(())
    }

    /// Recover after a device loss or fence timeout.
    ///
    /// Waits the device idle, reclaims every slot's deletions plus the
    /// pending list, replaces the slot fences, and restarts the ring at
    /// slot 0. The frames that were in flight are abandoned.
    pub fn recover_after_loss(&mut self) -> Result<()> {
        warn!("recovering frame pipeline after device loss");
        self.device.wait_idle()?;

        let mut reclaimed = unsafe { self.pending.execute_all(self.device.as_ref()) };
        for slot in &mut self.slots {
            reclaimed += unsafe { slot.deleter.execute_all(self.device.as_ref()) };
            // A fence reset by an aborted begin_frame would never signal
            // again; replace them all so the ring can restart.
            unsafe { self.device.destroy_fence(slot.fence) };
            slot.fence = self.device.create_fence(true)?;
            self.device.reset_command_pool(slot.command_pool)?;
        }

        self.current = 0;
        self.recording = false;
        info!(reclaimed, "frame pipeline recovered");
        Ok(())
    }

    /// Wait the device idle, execute every remaining deletion, and destroy
    /// the slot objects. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.device.wait_idle()?;

        let mut reclaimed = unsafe { self.pending.execute_all(self.device.as_ref()) };
        for slot in &mut self.slots {
            self.pending.take_from(&mut slot.deleter);
            reclaimed += unsafe { self.pending.execute_all(self.device.as_ref()) };
            unsafe {
                self.device.destroy_fence(slot.fence);
                self.device.destroy_command_pool(slot.command_pool);
            }
        }

        self.shut_down = true;
        info!(reclaimed, "frame pipeline shut down");
        Ok(())
    }

    /// Get the device this pipeline runs on.
    pub fn device(&self) -> &Arc<dyn DeviceOps> {
        &self.device
    }

    /// Get the active ring depth.
    pub fn inflight_frames(&self) -> usize {
        self.inflight
    }

    /// Get the slot the next `begin_frame` will use.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Get the number of frames begun so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_counter
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        if !self.shut_down {
            warn!("frame pipeline dropped without shutdown");
            if let Err(e) = self.shutdown() {
                error!(error = %e, "frame pipeline teardown failed");
            }
        }
    }
}
