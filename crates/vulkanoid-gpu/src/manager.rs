//! Orchestration of the frame ring, bindless table and immediate submitter.

use crate::backend::{BindlessLayoutDesc, GpuBackend, ResourceBinding};
use crate::bindless::{BindlessHandle, BindlessTable};
use crate::deletion::DeletionQueue;
use crate::error::{self, GpuError, Result};
use crate::frame::{AcquiredFrame, FrameRing};
use crate::immediate::ImmediateSubmitter;
use crate::present::{PresentOutcome, Presenter};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

/// Resource manager configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceManagerConfig {
    /// Number of frame slots; the CPU never runs further ahead of the GPU than this.
    pub frames_in_flight: usize,
    /// Longest wait for a frame slot's fence before the GPU is considered hung.
    pub frame_fence_timeout: Duration,
    /// Longest wait for an immediate submission.
    pub immediate_fence_timeout: Duration,
    /// Longest wait for the presentation engine to hand out an image.
    pub image_acquire_timeout: Duration,
    pub bindless: BindlessLayoutDesc,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            frame_fence_timeout: Duration::from_secs(1),
            immediate_fence_timeout: Duration::from_secs(100),
            image_acquire_timeout: Duration::from_secs(1),
            bindless: BindlessLayoutDesc::default(),
        }
    }
}

impl ResourceManagerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_frame_fence_timeout(mut self, timeout: Duration) -> Self {
        self.frame_fence_timeout = timeout;
        self
    }

    pub fn with_immediate_fence_timeout(mut self, timeout: Duration) -> Self {
        self.immediate_fence_timeout = timeout;
        self
    }

    pub fn with_image_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.image_acquire_timeout = timeout;
        self
    }

    pub fn with_bindless_capacity(mut self, capacity: u32) -> Self {
        self.bindless.capacity = capacity;
        self
    }

    pub fn with_bindless_layout(mut self, layout: BindlessLayoutDesc) -> Self {
        self.bindless = layout;
        self
    }

    /// Reject configurations no ring or table can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(GpuError::InvalidState(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.bindless.capacity == 0 {
            return Err(GpuError::InvalidState(
                "bindless capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A frame between [`ResourceManager::begin_frame`] and [`ResourceManager::end_frame`].
#[derive(Debug)]
pub struct ActiveFrame {
    pub frame: AcquiredFrame,
    /// Swapchain image to render into.
    pub image_index: u32,
    /// The presentation engine reported the swapchain as suboptimal.
    pub suboptimal: bool,
}

impl ActiveFrame {
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.frame.command_buffer
    }
}

/// Owner of every per-frame and session-long GPU lifecycle object.
pub struct ResourceManager<B: GpuBackend> {
    backend: Arc<B>,
    config: ResourceManagerConfig,
    global: DeletionQueue,
    ring: FrameRing<B>,
    bindless: BindlessTable<B>,
    immediate: ImmediateSubmitter<B>,
}

impl<B: GpuBackend> ResourceManager<B> {
    /// Build the bindless table, immediate submitter and frame ring.
    pub fn new(backend: Arc<B>, config: ResourceManagerConfig) -> Result<Self> {
        config.validate()?;

        let mut global = DeletionQueue::new();
        match Self::build(&backend, &config, &mut global) {
            Ok((bindless, immediate, ring)) => {
                tracing::info!(
                    frames_in_flight = config.frames_in_flight,
                    bindless_capacity = config.bindless.capacity,
                    "resource manager ready"
                );
                Ok(Self {
                    backend,
                    config,
                    global,
                    ring,
                    bindless,
                    immediate,
                })
            }
            Err(err) => {
                // Nothing has been submitted yet, so partial setup is safe to undo.
                global.flush();
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn build(
        backend: &Arc<B>,
        config: &ResourceManagerConfig,
        global: &mut DeletionQueue,
    ) -> Result<(BindlessTable<B>, ImmediateSubmitter<B>, FrameRing<B>)> {
        let mut bindless = BindlessTable::create_layout(Arc::clone(backend), config.bindless, global)?;
        bindless.allocate(config.bindless.capacity, global)?;

        let immediate =
            ImmediateSubmitter::new(Arc::clone(backend), config.immediate_fence_timeout, global)?;

        let ring = FrameRing::new(
            Arc::clone(backend),
            config.frames_in_flight,
            config.frame_fence_timeout,
        )?;

        Ok((bindless, immediate, ring))
    }

    /// Acquire a frame slot and a swapchain image to render into.
    ///
    /// Fails with [`GpuError::SurfaceOutOfDate`] when the swapchain must be recreated;
    /// the acquired slot is then abandoned and reused by the next call.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame<P: Presenter + ?Sized>(&mut self, presenter: &mut P) -> Result<ActiveFrame> {
        self.bindless.ensure_ready()?;

        let frame = self.ring.acquire_next()?;
        let image =
            presenter.acquire_next_image(frame.acquired, self.config.image_acquire_timeout)?;

        Ok(ActiveFrame {
            frame,
            image_index: image.index,
            suboptimal: image.suboptimal,
        })
    }

    /// Submit the frame's commands and present its image.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_frame<P: Presenter + ?Sized>(
        &mut self,
        active: ActiveFrame,
        presenter: &mut P,
    ) -> Result<PresentOutcome> {
        self.ring.submit(&active.frame)?;
        let outcome = self
            .ring
            .present(&active.frame, presenter, active.image_index)?;

        if active.suboptimal {
            Ok(PresentOutcome::NeedsRecreate)
        } else {
            Ok(outcome)
        }
    }

    /// Give up on a frame whose recording failed, without leaking its image.
    ///
    /// The recorded commands are dropped, and the acquired image is presented with
    /// undefined contents behind a submission that consumes the acquisition semaphore.
    /// Teardown deferred while recording then waits on that submission's fence.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn abandon_frame<P: Presenter + ?Sized>(
        &mut self,
        active: ActiveFrame,
        presenter: &mut P,
    ) -> Result<PresentOutcome> {
        let Some(image) = presenter.image(active.image_index) else {
            return error::precondition(GpuError::InvalidState(format!(
                "swapchain image {} does not exist",
                active.image_index
            )));
        };

        self.ring.submit_discarded(&active.frame, image)?;
        let outcome = self
            .ring
            .present(&active.frame, presenter, active.image_index)?;

        if active.suboptimal {
            Ok(PresentOutcome::NeedsRecreate)
        } else {
            Ok(outcome)
        }
    }

    /// Record and run `record` synchronously on the dedicated immediate context.
    pub fn immediate_submit<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        self.immediate.run_synchronously(record)
    }

    /// Populate bindless handle 0.
    pub fn set_fallback(&mut self, binding: ResourceBinding) -> Result<()> {
        self.bindless.set_fallback(binding)
    }

    /// Register one resource in the bindless table.
    pub fn register_resource(&mut self, binding: ResourceBinding) -> Result<BindlessHandle> {
        self.bindless.register(binding)
    }

    /// Register several resources with one descriptor update.
    pub fn register_resources(
        &mut self,
        bindings: &[ResourceBinding],
    ) -> Result<Vec<BindlessHandle>> {
        self.bindless.register_batch(bindings)
    }

    /// Point a live handle at a different resource.
    pub fn update_resource(&mut self, handle: BindlessHandle, binding: ResourceBinding) -> Result<()> {
        self.bindless.update(handle, binding)
    }

    /// Retire `handle`; `teardown` runs once the current frame is known to be finished.
    pub fn retire_resource<F>(&mut self, handle: BindlessHandle, teardown: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.bindless
            .retire(handle, self.ring.current_queue_mut(), teardown)
    }

    /// Defer teardown until the current frame's fence has signaled.
    pub fn defer_frame<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.ring.defer(action);
    }

    /// Defer teardown until shutdown.
    pub fn defer_global<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.global.push(action);
    }

    /// Defer a fallible teardown until shutdown; a failure there aborts.
    pub fn defer_global_fallible<F>(&mut self, label: &'static str, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.global.push_fallible(label, action);
    }

    /// The session-long deletion queue.
    pub fn global_queue_mut(&mut self) -> &mut DeletionQueue {
        &mut self.global
    }

    /// Layout for building pipeline layouts that read the bindless table.
    pub fn bindless_layout(&self) -> vk::DescriptorSetLayout {
        self.bindless.layout()
    }

    /// Descriptor set to bind for draws that read the bindless table.
    pub fn bindless_set(&self) -> Option<vk::DescriptorSet> {
        self.bindless.set()
    }

    pub fn bindless(&self) -> &BindlessTable<B> {
        &self.bindless
    }

    pub fn ring(&self) -> &FrameRing<B> {
        &self.ring
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &ResourceManagerConfig {
        &self.config
    }

    /// Slot of the frame being recorded, or of the next one.
    pub fn current_slot(&self) -> usize {
        self.ring.current_slot()
    }

    /// Wait for the device and release everything, per-frame queues first.
    pub fn shutdown(self) -> Result<()> {
        let Self {
            backend,
            mut global,
            ring,
            ..
        } = self;

        backend.wait_idle()?;
        let frames = ring.frame_number();
        ring.destroy()?;
        global.flush();

        tracing::info!(frames, "resource manager shut down");
        Ok(())
    }
}

/// Abort on `result` if it carries a fatal error; pass anything else through.
pub fn abort_on_fatal<T>(operation: &str, result: Result<T>) -> Result<T> {
    match result {
        Err(err) if err.is_fatal() => error::fatal(operation, &err),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockCall, MockPresenter};
    use ash::vk::Handle;
    use parking_lot::Mutex;

    fn image(raw: u64) -> ResourceBinding {
        ResourceBinding::sampled_image(vk::ImageView::from_raw(raw), vk::Sampler::from_raw(1))
    }

    fn manager(config: ResourceManagerConfig) -> (Arc<MockBackend>, ResourceManager<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let mut manager = ResourceManager::new(Arc::clone(&backend), config).expect("manager");
        manager.set_fallback(image(1)).expect("fallback");
        (backend, manager)
    }

    fn push_log(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl FnOnce() + Send {
        let log = Arc::clone(log);
        move || log.lock().push(name)
    }

    #[test]
    fn default_config() {
        let config = ResourceManagerConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.bindless.capacity, 1024);
        assert_eq!(config.immediate_fence_timeout, Duration::from_secs(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_empty_ring_and_table() {
        assert!(ResourceManagerConfig::new()
            .with_frames_in_flight(0)
            .validate()
            .is_err());
        assert!(ResourceManagerConfig::new()
            .with_bindless_capacity(0)
            .validate()
            .is_err());
    }

    #[test]
    fn frame_resources_are_freed_only_after_their_fence() {
        let (backend, mut manager) = manager(ResourceManagerConfig::default());
        let mut presenter = MockPresenter::new(3);
        let log = Arc::new(Mutex::new(Vec::new()));

        let frame = manager.begin_frame(&mut presenter).expect("frame 0");
        assert_eq!(frame.frame.slot, 0);
        manager.defer_frame(push_log(&log, "buffer"));
        manager.defer_frame(push_log(&log, "memory"));
        manager.defer_frame(push_log(&log, "view"));
        let f0 = manager.ring().fence(0).expect("fence");
        assert_eq!(
            manager.end_frame(frame, &mut presenter).expect("present"),
            PresentOutcome::Presented
        );

        let frame = manager.begin_frame(&mut presenter).expect("frame 1");
        assert_eq!(frame.frame.slot, 1);
        manager.end_frame(frame, &mut presenter).expect("present");

        let err = manager
            .begin_frame(&mut presenter)
            .expect_err("slot 0 is still in flight");
        assert!(err.is_fatal());
        assert!(log.lock().is_empty());

        backend.complete_fence(f0);
        let frame = manager.begin_frame(&mut presenter).expect("frame 2");
        assert_eq!(frame.frame.slot, 0);
        assert_eq!(*log.lock(), ["view", "memory", "buffer"]);
        manager.end_frame(frame, &mut presenter).expect("present");

        manager.shutdown().expect("shutdown");
    }

    #[test]
    fn out_of_date_surface_abandons_the_frame() {
        let (_backend, mut manager) = manager(ResourceManagerConfig::default());
        let mut presenter = MockPresenter::new(2);

        presenter.set_out_of_date(true);
        let err = manager.begin_frame(&mut presenter).expect_err("out of date");
        assert!(matches!(err, GpuError::SurfaceOutOfDate));
        assert!(err.is_recoverable());

        presenter.resize(800, 600);
        let frame = manager.begin_frame(&mut presenter).expect("after recreate");
        assert_eq!(frame.frame.frame_number, 0);
        manager.end_frame(frame, &mut presenter).expect("present");
        assert_eq!(manager.ring().frame_number(), 1);

        manager.shutdown().expect("shutdown");
    }

    #[test]
    fn retired_resource_waits_for_its_frame() {
        let (backend, mut manager) = manager(ResourceManagerConfig::default());
        let mut presenter = MockPresenter::new(3);
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = manager.register_resource(image(5)).expect("register");

        let frame = manager.begin_frame(&mut presenter).expect("frame 0");
        manager
            .retire_resource(handle, push_log(&log, "texture"))
            .expect("retire");
        manager.end_frame(frame, &mut presenter).expect("present");
        assert_eq!(manager.bindless().resolve(handle), None);

        let frame = manager.begin_frame(&mut presenter).expect("frame 1");
        manager.end_frame(frame, &mut presenter).expect("present");
        assert!(log.lock().is_empty());

        backend.complete_all();
        let frame = manager.begin_frame(&mut presenter).expect("frame 2");
        assert_eq!(*log.lock(), ["texture"]);
        manager.end_frame(frame, &mut presenter).expect("present");

        let next = manager.register_resource(image(6)).expect("register");
        assert!(next > handle);

        manager.shutdown().expect("shutdown");
    }

    #[test]
    fn abandoned_frame_hands_back_its_image_and_semaphore() {
        let (backend, mut manager) = manager(ResourceManagerConfig::default());
        let mut presenter = MockPresenter::on(Arc::clone(&backend), 2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let frame = manager.begin_frame(&mut presenter).expect("frame 0");
        manager.end_frame(frame, &mut presenter).expect("present");

        let frame = manager.begin_frame(&mut presenter).expect("frame 1");
        let acquired = frame.frame.acquired;
        let command_buffer = frame.command_buffer();
        assert!(backend.is_semaphore_signaled(acquired));
        manager.defer_frame(push_log(&log, "texture"));
        backend.take_calls();

        assert_eq!(
            manager.abandon_frame(frame, &mut presenter).expect("abandon"),
            PresentOutcome::Presented
        );
        assert!(!backend.is_semaphore_signaled(acquired));
        assert_eq!(presenter.held_images(), 0);
        assert_eq!(manager.ring().frame_number(), 2);
        assert!(backend.calls().contains(&MockCall::PresentTransition {
            command_buffer,
            image: presenter.image(1).expect("image"),
        }));
        assert!(log.lock().is_empty());

        // Each slot comes around again without its semaphore still signaled.
        for _ in 0..3 {
            backend.complete_all();
            let frame = manager.begin_frame(&mut presenter).expect("frame");
            manager.end_frame(frame, &mut presenter).expect("present");
        }
        assert_eq!(*log.lock(), ["texture"]);

        manager.shutdown().expect("shutdown");
    }

    #[test]
    #[should_panic(expected = "already signaled")]
    fn dropped_frame_leaves_its_semaphore_signaled() {
        let config = ResourceManagerConfig::default().with_frames_in_flight(1);
        let (backend, mut manager) = manager(config);
        let mut presenter = MockPresenter::on(Arc::clone(&backend), 3);

        let frame = manager.begin_frame(&mut presenter).expect("frame 0");
        drop(frame);
        let _ = manager.begin_frame(&mut presenter);
    }

    #[test]
    fn capacity_exhaustion_is_recoverable() {
        let config = ResourceManagerConfig::default().with_bindless_capacity(3);
        let (_backend, mut manager) = manager(config);

        manager
            .register_resources(&[image(2), image(3)])
            .expect("fits");
        let err = manager.register_resource(image(4)).expect_err("full");
        assert!(err.is_recoverable());

        let mut presenter = MockPresenter::new(2);
        let frame = manager.begin_frame(&mut presenter).expect("still renders");
        manager.end_frame(frame, &mut presenter).expect("present");

        manager.shutdown().expect("shutdown");
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "precondition violated"))]
    fn drawing_requires_a_fallback() {
        let backend = Arc::new(MockBackend::new());
        let mut manager =
            ResourceManager::new(backend, ResourceManagerConfig::default()).expect("manager");
        let mut presenter = MockPresenter::new(2);

        let err = manager.begin_frame(&mut presenter).expect_err("no fallback");
        assert!(matches!(err, GpuError::SentinelUnset));
        assert!(presenter.acquired().is_empty());
    }

    #[test]
    fn shutdown_releases_in_reverse_creation_order() {
        let (backend, mut manager) = manager(ResourceManagerConfig::default());
        let mut presenter = MockPresenter::new(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        manager.defer_global(push_log(&log, "sampler"));
        let frame = manager.begin_frame(&mut presenter).expect("frame");
        manager.defer_frame(push_log(&log, "staging"));
        manager.end_frame(frame, &mut presenter).expect("present");

        let layout = manager.bindless_layout();
        let set = manager.bindless_set().expect("set");
        let pool = manager.bindless().pool().expect("pool");
        backend.take_calls();

        manager.shutdown().expect("shutdown");

        assert_eq!(*log.lock(), ["staging", "sampler"]);
        let calls = backend.calls();
        assert_eq!(calls.first(), Some(&MockCall::WaitIdle));
        let position = |wanted: &MockCall| calls.iter().position(|call| call == wanted);
        let set_at = position(&MockCall::FreeSet(set)).expect("set freed");
        let pool_at = position(&MockCall::DestroyPool(pool)).expect("pool destroyed");
        let layout_at = position(&MockCall::DestroyLayout(layout)).expect("layout destroyed");
        assert!(set_at < pool_at && pool_at < layout_at);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn immediate_submit_blocks_until_complete() {
        let backend = Arc::new(MockBackend::auto_completing());
        let manager =
            ResourceManager::new(Arc::clone(&backend), ResourceManagerConfig::default())
                .expect("manager");

        let before = backend.submit_count();
        manager.immediate_submit(|_| {}).expect("upload");
        assert_eq!(backend.submit_count(), before + 1);

        manager.shutdown().expect("shutdown");
    }
}
