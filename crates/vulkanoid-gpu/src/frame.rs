//! Frames in flight.
//!
//! A [`FrameRing`] owns N slots, each with its own command buffer, completion fence,
//! semaphore pair and [`DeletionQueue`]. Logical frame `i` always uses slot `i % N`,
//! and acquiring a slot waits on the fence of the frame that used it last, so the CPU
//! never runs more than N frames ahead of the GPU. That wait is the only throttle.
//!
//! A slot cycles through [`SlotState`]:
//!
//! ```text
//! Idle -> WaitingOnFence -> Recording -> Submitted -> Presented -> WaitingOnFence -> ...
//! ```

use crate::backend::{CommandContext, GpuBackend, SubmitDesc};
use crate::deletion::DeletionQueue;
use crate::error::{self, GpuError, Result};
use crate::present::{PresentOutcome, Presenter};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

/// Where a slot is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never acquired.
    Idle,
    /// Blocked on the fence of the slot's previous submission.
    WaitingOnFence,
    Recording,
    Submitted,
    Presented,
}

struct FrameSlot {
    context: CommandContext,
    fence: vk::Fence,
    acquired: vk::Semaphore,
    render_complete: vk::Semaphore,
    deletion: DeletionQueue,
    state: SlotState,
}

/// A slot handed out by [`FrameRing::acquire_next`], ready for recording.
#[derive(Debug)]
pub struct AcquiredFrame {
    pub slot: usize,
    pub frame_number: u64,
    pub command_buffer: vk::CommandBuffer,
    /// Signaled by the presentation engine once the target image is available.
    pub acquired: vk::Semaphore,
    /// Signaled by the submission for presentation to wait on.
    pub render_complete: vk::Semaphore,
}

/// Fixed ring of frame slots.
pub struct FrameRing<B: GpuBackend> {
    backend: Arc<B>,
    slots: Vec<FrameSlot>,
    frame_number: u64,
    fence_timeout: Duration,
    recording: Option<usize>,
}

impl<B: GpuBackend> FrameRing<B> {
    /// Create `frames_in_flight` slots.
    ///
    /// Fences start signaled so the first acquisition of each slot does not block.
    pub fn new(backend: Arc<B>, frames_in_flight: usize, fence_timeout: Duration) -> Result<Self> {
        if frames_in_flight == 0 {
            return error::precondition(GpuError::InvalidState(
                "frame ring needs at least one slot".to_string(),
            ));
        }

        let mut ring = Self {
            backend,
            slots: Vec::with_capacity(frames_in_flight),
            frame_number: 0,
            fence_timeout,
            recording: None,
        };

        for index in 0..frames_in_flight {
            // On failure, the slots built so far are released by `destroy`.
            match ring.create_slot(index) {
                Ok(slot) => ring.slots.push(slot),
                Err(err) => {
                    if let Err(cleanup) = ring.destroy() {
                        tracing::error!("frame ring cleanup after failed creation: {cleanup}");
                    }
                    return Err(err);
                }
            }
        }

        tracing::info!(frames_in_flight, "frame ring created");
        Ok(ring)
    }

    fn create_slot(&self, index: usize) -> Result<FrameSlot> {
        let context = self
            .backend
            .create_command_context(&format!("frame slot {index}"))?;
        let fence = match self.backend.create_fence(true) {
            Ok(fence) => fence,
            Err(err) => {
                self.backend.destroy_command_context(context);
                return Err(err);
            }
        };
        let semaphores = self
            .backend
            .create_semaphore()
            .and_then(|acquired| match self.backend.create_semaphore() {
                Ok(render_complete) => Ok((acquired, render_complete)),
                Err(err) => {
                    self.backend.destroy_semaphore(acquired);
                    Err(err)
                }
            });
        let (acquired, render_complete) = match semaphores {
            Ok(pair) => pair,
            Err(err) => {
                self.backend.destroy_fence(fence);
                self.backend.destroy_command_context(context);
                return Err(err);
            }
        };

        Ok(FrameSlot {
            context,
            fence,
            acquired,
            render_complete,
            deletion: DeletionQueue::new(),
            state: SlotState::Idle,
        })
    }

    /// Acquire the slot for the next logical frame and begin recording into it.
    ///
    /// Blocks until that slot's previous submission has completed, then flushes the
    /// slot's deletion queue. A frame acquired but never submitted is abandoned: its
    /// fence was not reset, so acquiring again proceeds without waiting, and teardown it
    /// deferred moves to the last submitted frame.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn acquire_next(&mut self) -> Result<AcquiredFrame> {
        if let Some(slot) = self.recording.take() {
            tracing::debug!(slot, frame = self.frame_number, "abandoning unsubmitted frame");
            self.hand_over_deferrals(slot);
        }

        let index = self.current_slot();
        let timeout = self.fence_timeout;
        let backend = Arc::clone(&self.backend);
        let slot = &mut self.slots[index];

        slot.state = SlotState::WaitingOnFence;
        backend
            .wait_for_fence(slot.fence, timeout)
            .map_err(|err| match err {
                GpuError::FenceTimeout { timeout, .. } => GpuError::FenceTimeout {
                    operation: "frame acquire",
                    timeout,
                },
                other => other,
            })?;

        // The fence proves every earlier submission on the queue has finished.
        slot.deletion.flush();

        backend.reset_command_buffer(slot.context.command_buffer)?;
        backend.begin_command_buffer(slot.context.command_buffer)?;
        slot.state = SlotState::Recording;
        self.recording = Some(index);

        tracing::trace!(slot = index, frame = self.frame_number, "frame acquired");

        Ok(AcquiredFrame {
            slot: index,
            frame_number: self.frame_number,
            command_buffer: slot.context.command_buffer,
            acquired: slot.acquired,
            render_complete: slot.render_complete,
        })
    }

    /// End recording and submit the frame.
    ///
    /// The submission waits on `acquired` before color output and signals both
    /// `render_complete` and the slot fence. The fence is reset here rather than at
    /// acquisition.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&mut self, frame: &AcquiredFrame) -> Result<()> {
        self.check_recording(frame)?;

        let command_buffer = self.slots[frame.slot].context.command_buffer;
        self.backend.end_command_buffer(command_buffer)?;
        self.submit_slot(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
    }

    /// Throw away what was recorded for `frame` and submit commands that only move
    /// `image` into `PRESENT_SRC_KHR`.
    ///
    /// The submission waits on `acquired` and signals `render_complete` and the slot
    /// fence like [`submit`](Self::submit), so the image can still be presented and
    /// teardown deferred while recording stays behind a fence.
    pub fn submit_discarded(&mut self, frame: &AcquiredFrame, image: vk::Image) -> Result<()> {
        self.check_recording(frame)?;

        let command_buffer = self.slots[frame.slot].context.command_buffer;
        self.backend.reset_command_buffer(command_buffer)?;
        self.backend.begin_command_buffer(command_buffer)?;
        self.backend.record_present_transition(command_buffer, image);
        self.backend.end_command_buffer(command_buffer)?;

        tracing::debug!(slot = frame.slot, frame = frame.frame_number, "frame discarded");
        self.submit_slot(frame, vk::PipelineStageFlags2::ALL_COMMANDS)
    }

    fn check_recording(&self, frame: &AcquiredFrame) -> Result<()> {
        if self.recording != Some(frame.slot) || frame.frame_number != self.frame_number {
            return error::precondition(GpuError::InvalidState(format!(
                "frame {} is not the frame being recorded",
                frame.frame_number
            )));
        }
        Ok(())
    }

    fn submit_slot(
        &mut self,
        frame: &AcquiredFrame,
        wait_stage: vk::PipelineStageFlags2,
    ) -> Result<()> {
        let slot = &mut self.slots[frame.slot];
        self.backend.reset_fence(slot.fence)?;

        let wait = [(slot.acquired, wait_stage)];
        let signal = [slot.render_complete];
        self.backend.submit(&SubmitDesc {
            command_buffer: slot.context.command_buffer,
            wait: &wait,
            signal: &signal,
            fence: slot.fence,
        })?;

        slot.state = SlotState::Submitted;
        self.recording = None;
        self.frame_number += 1;

        tracing::trace!(slot = frame.slot, frame = frame.frame_number, "frame submitted");
        Ok(())
    }

    /// Move teardown deferred by an abandoned frame behind the last submitted frame.
    ///
    /// The abandoned slot's fence only covers that slot's previous submission, which
    /// may be older than the frame submitted just before.
    fn hand_over_deferrals(&mut self, abandoned: usize) {
        // Nothing submitted yet, so nothing on the GPU can hold these resources.
        if self.frame_number == 0 {
            return;
        }
        let target = self.slot_for(self.frame_number - 1);
        if target == abandoned {
            return;
        }

        let mut pending = DeletionQueue::new();
        pending.append(&mut self.slots[abandoned].deletion);
        if !pending.is_empty() {
            tracing::debug!(
                from = abandoned,
                to = target,
                count = pending.len(),
                "moving teardown of abandoned frame"
            );
        }
        self.slots[target].deletion.append(&mut pending);
    }

    /// Present the image rendered by a submitted frame.
    ///
    /// Out-of-date and suboptimal surfaces come back as
    /// [`PresentOutcome::NeedsRecreate`].
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present<P: Presenter + ?Sized>(
        &mut self,
        frame: &AcquiredFrame,
        presenter: &mut P,
        image_index: u32,
    ) -> Result<PresentOutcome> {
        let slot = &mut self.slots[frame.slot];
        if slot.state != SlotState::Submitted {
            return error::precondition(GpuError::InvalidState(format!(
                "frame {} presented before submission",
                frame.frame_number
            )));
        }

        let outcome = match presenter.present(image_index, &[frame.render_complete]) {
            Ok(outcome) => outcome,
            Err(GpuError::SurfaceOutOfDate) => PresentOutcome::NeedsRecreate,
            Err(err) => return Err(err),
        };
        slot.state = SlotState::Presented;
        Ok(outcome)
    }

    /// Register teardown that must wait until the GPU is done with the current frame.
    ///
    /// While a frame is recording the action joins that slot's queue. Between frames it
    /// joins the queue of the last submitted frame, which is the newest work that could
    /// still reference the resource.
    pub fn defer<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.current_queue_mut().push(action);
    }

    /// The queue [`defer`](Self::defer) pushes into.
    pub fn current_queue_mut(&mut self) -> &mut DeletionQueue {
        let index = self.deferral_slot();
        &mut self.slots[index].deletion
    }

    fn deferral_slot(&self) -> usize {
        match self.recording {
            Some(slot) => slot,
            None if self.frame_number == 0 => 0,
            None => self.slot_for(self.frame_number - 1),
        }
    }

    fn slot_for(&self, frame_number: u64) -> usize {
        // Slot count is a `usize`, so the remainder always fits.
        (frame_number % self.slots.len() as u64) as usize
    }

    /// Slot used by the frame being recorded, or by the next one to be acquired.
    pub fn current_slot(&self) -> usize {
        self.slot_for(self.frame_number)
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|slot| slot.state)
    }

    /// Number of pending teardown actions in a slot.
    pub fn pending_deletions(&self, slot: usize) -> usize {
        self.slots.get(slot).map_or(0, |slot| slot.deletion.len())
    }

    /// Completion fence of a slot.
    pub fn fence(&self, slot: usize) -> Option<vk::Fence> {
        self.slots.get(slot).map(|slot| slot.fence)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Number of frames submitted so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Whether a frame is between acquisition and submission.
    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Wait for the device, flush every slot's queue and destroy the slots.
    pub fn destroy(mut self) -> Result<()> {
        self.backend.wait_idle()?;

        for slot in &mut self.slots {
            slot.deletion.flush();
        }
        for slot in self.slots.drain(..) {
            self.backend.destroy_semaphore(slot.render_complete);
            self.backend.destroy_semaphore(slot.acquired);
            self.backend.destroy_fence(slot.fence);
            self.backend.destroy_command_context(slot.context);
        }

        tracing::info!(frames = self.frame_number, "frame ring destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockCall, MockPresenter};
    use ash::vk::Handle;
    use parking_lot::Mutex;

    fn ring(frames: usize) -> (Arc<MockBackend>, FrameRing<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let ring = FrameRing::new(Arc::clone(&backend), frames, Duration::from_millis(10))
            .expect("ring");
        (backend, ring)
    }

    fn log_action(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl FnOnce() + Send {
        let log = Arc::clone(log);
        move || log.lock().push(name)
    }

    #[test]
    fn first_n_acquisitions_do_not_block() {
        let (_backend, mut ring) = ring(3);

        for expected in 0..3 {
            let frame = ring.acquire_next().expect("acquire");
            assert_eq!(frame.slot, expected);
            ring.submit(&frame).expect("submit");
        }
        assert_eq!(ring.frame_number(), 3);
    }

    #[test]
    fn acquisition_past_the_ring_waits_on_the_oldest_fence() {
        let (backend, mut ring) = ring(2);

        for _ in 0..2 {
            let frame = ring.acquire_next().expect("acquire");
            ring.submit(&frame).expect("submit");
        }

        let err = ring.acquire_next().expect_err("third acquisition must block");
        assert!(matches!(
            err,
            GpuError::FenceTimeout {
                operation: "frame acquire",
                ..
            }
        ));
        assert_eq!(ring.slot_state(0), Some(SlotState::WaitingOnFence));

        // Completing the newer fence does not release the older slot.
        backend.complete_fence(ring.fence(1).expect("fence"));
        assert!(ring.acquire_next().is_err());

        backend.complete_fence(ring.fence(0).expect("fence"));
        let frame = ring.acquire_next().expect("slot 0 is free again");
        assert_eq!(frame.slot, 0);
        assert_eq!(frame.frame_number, 2);
    }

    #[test]
    fn reacquired_slot_flushes_its_queue_newest_first() {
        let (backend, mut ring) = ring(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let frame0 = ring.acquire_next().expect("acquire");
        ring.defer(log_action(&log, "buffer"));
        ring.defer(log_action(&log, "memory"));
        ring.defer(log_action(&log, "view"));
        ring.submit(&frame0).expect("submit");
        assert_eq!(ring.pending_deletions(0), 3);

        let frame1 = ring.acquire_next().expect("acquire");
        ring.submit(&frame1).expect("submit");

        assert!(ring.acquire_next().is_err());
        assert!(log.lock().is_empty(), "nothing may be freed before F0 signals");

        backend.complete_fence(ring.fence(0).expect("fence"));
        let frame2 = ring.acquire_next().expect("acquire");
        assert_eq!(frame2.slot, 0);
        assert_eq!(*log.lock(), ["view", "memory", "buffer"]);
        assert_eq!(ring.pending_deletions(0), 0);
    }

    #[test]
    fn submission_orders_semaphores_and_resets_fence_late() {
        let (backend, mut ring) = ring(2);
        let frame = ring.acquire_next().expect("acquire");

        let after_acquire = backend.take_calls();
        assert!(!after_acquire
            .iter()
            .any(|call| matches!(call, MockCall::ResetFence(_))));

        ring.submit(&frame).expect("submit");
        let calls = backend.take_calls();
        let fence = ring.fence(frame.slot).expect("fence");
        assert_eq!(
            calls,
            vec![
                MockCall::EndCommandBuffer(frame.command_buffer),
                MockCall::ResetFence(fence),
                MockCall::Submit {
                    command_buffer: frame.command_buffer,
                    wait: vec![frame.acquired],
                    signal: vec![frame.render_complete],
                    fence,
                },
            ]
        );
    }

    #[test]
    fn abandoned_frame_does_not_deadlock() {
        let (_backend, mut ring) = ring(2);

        let abandoned = ring.acquire_next().expect("acquire");
        let retry = ring.acquire_next().expect("fence was never reset");
        assert_eq!(retry.slot, abandoned.slot);
        assert_eq!(retry.frame_number, abandoned.frame_number);
        ring.submit(&retry).expect("submit");
    }

    #[test]
    fn abandoned_frame_teardown_waits_for_the_frame_before_it() {
        let (backend, mut ring) = ring(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let frame0 = ring.acquire_next().expect("acquire");
        ring.submit(&frame0).expect("submit");

        let abandoned = ring.acquire_next().expect("acquire");
        assert_eq!(abandoned.slot, 1);
        ring.defer(log_action(&log, "texture"));

        let retry = ring.acquire_next().expect("slot 1 fence is still signaled");
        assert_eq!(retry.slot, 1);
        assert!(
            log.lock().is_empty(),
            "frame 0 is still in flight and may read the texture"
        );
        assert_eq!(ring.pending_deletions(0), 1);
        assert_eq!(ring.pending_deletions(1), 0);
        ring.submit(&retry).expect("submit");

        backend.complete_fence(ring.fence(0).expect("fence"));
        assert_eq!(ring.acquire_next().expect("acquire").slot, 0);
        assert_eq!(*log.lock(), ["texture"]);
    }

    #[test]
    fn single_slot_abandoned_frame_flushes_on_retry() {
        let (backend, mut ring) = ring(1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let frame = ring.acquire_next().expect("acquire");
        ring.submit(&frame).expect("submit");
        backend.complete_all();

        ring.acquire_next().expect("acquire");
        ring.defer(log_action(&log, "staging"));
        // The only slot's fence covers the previous frame.
        ring.acquire_next().expect("retry");
        assert_eq!(*log.lock(), ["staging"]);
    }

    #[test]
    fn discarded_frame_still_signals_semaphores_and_fence() {
        let (backend, mut ring) = ring(2);
        let frame = ring.acquire_next().expect("acquire");
        let fence = ring.fence(frame.slot).expect("fence");
        let image = vk::Image::from_raw(0x77);
        backend.take_calls();

        ring.submit_discarded(&frame, image).expect("submit");
        let cmd = frame.command_buffer;
        assert_eq!(
            backend.take_calls(),
            vec![
                MockCall::ResetCommandBuffer(cmd),
                MockCall::BeginCommandBuffer(cmd),
                MockCall::PresentTransition {
                    command_buffer: cmd,
                    image
                },
                MockCall::EndCommandBuffer(cmd),
                MockCall::ResetFence(fence),
                MockCall::Submit {
                    command_buffer: cmd,
                    wait: vec![frame.acquired],
                    signal: vec![frame.render_complete],
                    fence,
                },
            ]
        );
        assert_eq!(ring.frame_number(), 1);
        assert_eq!(ring.slot_state(frame.slot), Some(SlotState::Submitted));
        assert!(!ring.is_recording());
    }

    #[test]
    fn present_reports_recreate_on_out_of_date() {
        let (_backend, mut ring) = ring(2);
        let mut presenter = MockPresenter::new(3);

        let frame = ring.acquire_next().expect("acquire");
        ring.submit(&frame).expect("submit");
        assert_eq!(
            ring.present(&frame, &mut presenter, 0).expect("present"),
            PresentOutcome::Presented
        );
        assert_eq!(ring.slot_state(frame.slot), Some(SlotState::Presented));
        assert_eq!(presenter.presented(), [(0, vec![frame.render_complete])]);

        presenter.set_out_of_date(true);
        let frame = ring.acquire_next().expect("acquire");
        ring.submit(&frame).expect("submit");
        assert_eq!(
            ring.present(&frame, &mut presenter, 1).expect("present"),
            PresentOutcome::NeedsRecreate
        );
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "precondition violated"))]
    fn stale_frame_cannot_be_submitted_twice() {
        let (_backend, mut ring) = ring(2);
        let frame = ring.acquire_next().expect("acquire");
        ring.submit(&frame).expect("submit");

        let err = ring.submit(&frame).expect_err("second submit");
        assert!(matches!(err, GpuError::InvalidState(_)));
    }

    #[test]
    fn between_frames_deferral_follows_last_submission() {
        let (backend, mut ring) = ring(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let frame = ring.acquire_next().expect("acquire");
        ring.submit(&frame).expect("submit");

        // Frame 0 may still read the resource; slot 1's fence says nothing about it.
        ring.defer(log_action(&log, "texture"));
        assert_eq!(ring.pending_deletions(0), 1);

        let frame = ring.acquire_next().expect("acquire");
        assert_eq!(frame.slot, 1);
        assert!(log.lock().is_empty());
        ring.submit(&frame).expect("submit");

        backend.complete_all();
        ring.acquire_next().expect("acquire");
        assert_eq!(*log.lock(), ["texture"]);
    }

    #[test]
    fn single_slot_ring_serializes_frames() {
        let (backend, mut ring) = ring(1);

        let frame = ring.acquire_next().expect("acquire");
        ring.submit(&frame).expect("submit");
        assert!(ring.acquire_next().is_err());

        backend.complete_all();
        assert_eq!(ring.acquire_next().expect("acquire").slot, 0);
    }

    #[test]
    fn destroy_flushes_and_releases_everything() {
        let (backend, mut ring) = ring(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let frame = ring.acquire_next().expect("acquire");
        ring.defer(log_action(&log, "pending"));
        ring.submit(&frame).expect("submit");

        ring.destroy().expect("destroy");
        assert_eq!(*log.lock(), ["pending"]);
        assert_eq!(backend.live_objects(), 0);
    }
}
