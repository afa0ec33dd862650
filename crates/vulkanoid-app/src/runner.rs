//! Application runner and event loop.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use raw_window_handle::HasDisplayHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vulkanoid_gpu::{
    abort_on_fatal, ActiveFrame, GpuBackend, GpuContextBuilder, GpuError, PresentOutcome,
    Presenter, ResourceManager, ResourceManagerConfig,
};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::VulkanoidApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Resource manager settings: frames in flight, timeouts, bindless layout.
    pub resources: ResourceManagerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Vulkanoid".to_string(),
            width: 1280,
            height: 720,
            vsync: false,
            validation: cfg!(debug_assertions),
            resources: ResourceManagerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.resources = self.resources.with_frames_in_flight(frames);
        self
    }

    pub fn with_bindless_capacity(mut self, capacity: u32) -> Self {
        self.resources = self.resources.with_bindless_capacity(capacity);
        self
    }
}

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,vulkanoid_app=trace,vulkanoid_gpu=trace,vulkanoid_viewer=trace")
        });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

/// Run a VulkanoidApp with the given configuration.
///
/// Initializes logging, creates the window and GPU context, and runs the event loop
/// until the application exits. Fatal GPU errors abort the process.
pub fn run_app<A: VulkanoidApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();
    config.resources.validate()?;

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
    };

    event_loop.run_app(&mut runner)?;
    Ok(())
}

/// Outcome of one pass through the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameStatus {
    Presented,
    /// The swapchain must be recreated before the next frame.
    NeedsRecreate,
}

/// Acquire, record, submit and present one frame.
///
/// An out-of-date surface on acquisition abandons the frame and asks for recreation.
/// A failed `record` discards the recorded commands but still submits and presents, so
/// the frame's image, semaphores and deferred teardown are handed back as usual.
pub(crate) fn drive_frame<B, P, F>(
    resources: &mut ResourceManager<B>,
    presenter: &mut P,
    record: F,
) -> anyhow::Result<FrameStatus>
where
    B: GpuBackend,
    P: Presenter,
    F: FnOnce(&mut ResourceManager<B>, &P, &ActiveFrame) -> anyhow::Result<()>,
{
    let active = match abort_on_fatal("begin frame", resources.begin_frame(presenter)) {
        Ok(active) => active,
        Err(GpuError::SurfaceOutOfDate) => return Ok(FrameStatus::NeedsRecreate),
        Err(err) => return Err(err.into()),
    };

    if let Err(err) = record(resources, presenter, &active) {
        warn!(frame = active.frame.frame_number, "frame abandoned: {err}");
        abort_on_fatal("abandon frame", resources.abandon_frame(active, presenter))?;
        return Err(err);
    }

    match abort_on_fatal("end frame", resources.end_frame(active, presenter))? {
        PresentOutcome::Presented => Ok(FrameStatus::Presented),
        PresentOutcome::NeedsRecreate => Ok(FrameStatus::NeedsRecreate),
    }
}

/// Internal application runner that implements winit's ApplicationHandler.
struct AppRunner<A: VulkanoidApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
}

/// Internal application state.
struct AppState<A: VulkanoidApp> {
    ctx: AppContext,
    app: A,
    started: Instant,
}

impl<A: VulkanoidApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e}");
                    }
                    state.ctx.window.request_redraw();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.handle_resize(size.width, size.height) {
                        error!("Resize error: {e}");
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: VulkanoidApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .display(event_loop.display_handle()?.as_raw())
            .build()?;

        info!("GPU: {}", gpu.capabilities().summary());

        // SAFETY: the window is kept alive by the context it is stored in
        let mut ctx = unsafe {
            AppContext::new(
                window,
                Arc::new(gpu),
                self.config.vsync,
                self.config.resources,
            )?
        };

        let app = A::init(&mut ctx)?;

        Ok(AppState {
            ctx,
            app,
            started: Instant::now(),
        })
    }
}

impl<A: VulkanoidApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();
        let dt = frame_start
            .duration_since(self.ctx.last_frame_time)
            .as_secs_f32();
        self.ctx.last_frame_time = frame_start;

        self.app.update(&mut self.ctx, dt);

        let AppContext {
            gpu,
            resources,
            presenter,
            ..
        } = &mut self.ctx;
        let app = &mut self.app;

        let status = drive_frame(resources, presenter, |resources, presenter, active| {
            let index = active.image_index as usize;
            let image = presenter
                .images()
                .get(index)
                .copied()
                .ok_or_else(|| anyhow!("swapchain image {index} does not exist"))?;
            let view = presenter
                .image_views()
                .get(index)
                .copied()
                .ok_or_else(|| anyhow!("swapchain view {index} does not exist"))?;

            let mut frame =
                FrameContext::new(active, image, view, presenter.extent(), dt, resources);
            app.render(gpu.as_ref(), &mut frame)
        })?;

        match status {
            FrameStatus::Presented => self.ctx.frame_count += 1,
            FrameStatus::NeedsRecreate => {
                let size = self.ctx.window.inner_size();
                self.handle_resize(size.width, size.height)?;
            }
        }

        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        // Minimized; keep the old swapchain until there is something to draw into.
        if width == 0 || height == 0 {
            return Ok(());
        }

        abort_on_fatal(
            "swapchain recreation",
            self.ctx.presenter.recreate(width, height),
        )?;
        self.app.on_resize(&mut self.ctx, width, height)?;

        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    fn cleanup(self) {
        let Self {
            mut ctx,
            app,
            started,
            ..
        } = self;

        let seconds = started.elapsed().as_secs_f64();
        if ctx.frame_count > 0 && seconds > 0.0 {
            info!(
                frames = ctx.frame_count,
                avg_fps = format_args!("{:.1}", ctx.frame_count as f64 / seconds),
                "frame statistics"
            );
        }

        info!("Starting cleanup...");
        app.cleanup(&mut ctx);
        ctx.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use ash::vk::Handle;
    use std::sync::atomic::{AtomicBool, Ordering};
    use vulkanoid_gpu::mock::{MockBackend, MockPresenter};
    use vulkanoid_gpu::ResourceBinding;

    fn resources(frames: usize) -> ResourceManager<MockBackend> {
        resources_on(&Arc::new(MockBackend::auto_completing()), frames, 16)
    }

    fn resources_on(
        backend: &Arc<MockBackend>,
        frames: usize,
        capacity: u32,
    ) -> ResourceManager<MockBackend> {
        let config = ResourceManagerConfig::default()
            .with_frames_in_flight(frames)
            .with_bindless_capacity(capacity);
        let mut resources = ResourceManager::new(Arc::clone(backend), config).expect("manager");
        resources
            .set_fallback(ResourceBinding::sampled_image(
                vk::ImageView::from_raw(1),
                vk::Sampler::from_raw(2),
            ))
            .expect("fallback");
        resources
    }

    #[test]
    fn frames_are_presented_in_order() {
        let mut resources = resources(2);
        let mut presenter = MockPresenter::new(3);

        for _ in 0..4 {
            let status = drive_frame(&mut resources, &mut presenter, |_, _, _| Ok(()))
                .expect("frame");
            assert_eq!(status, FrameStatus::Presented);
        }

        let images: Vec<u32> = presenter.presented().iter().map(|(i, _)| *i).collect();
        assert_eq!(images, [0, 1, 2, 0]);
        assert_eq!(resources.ring().frame_number(), 4);
        resources.shutdown().expect("shutdown");
    }

    #[test]
    fn out_of_date_surface_requests_recreation() {
        let mut resources = resources(2);
        let mut presenter = MockPresenter::new(2);

        presenter.set_out_of_date(true);
        let status =
            drive_frame(&mut resources, &mut presenter, |_, _, _| Ok(())).expect("frame");
        assert_eq!(status, FrameStatus::NeedsRecreate);
        assert!(presenter.presented().is_empty());

        presenter.resize(640, 480);
        let status =
            drive_frame(&mut resources, &mut presenter, |_, _, _| Ok(())).expect("frame");
        assert_eq!(status, FrameStatus::Presented);
        resources.shutdown().expect("shutdown");
    }

    #[test]
    fn failed_recording_still_releases_the_frame() {
        let backend = Arc::new(MockBackend::auto_completing());
        let mut resources = resources_on(&backend, 2, 16);
        let mut presenter = MockPresenter::on(Arc::clone(&backend), 2);

        let err = drive_frame(&mut resources, &mut presenter, |_, _, _| {
            Err(anyhow!("shader missing"))
        })
        .expect_err("record failed");
        assert_eq!(err.to_string(), "shader missing");
        assert_eq!(resources.ring().frame_number(), 1);
        assert_eq!(presenter.held_images(), 0);

        for expected in 1..4 {
            let status = drive_frame(&mut resources, &mut presenter, |_, _, active| {
                assert_eq!(active.frame.frame_number, expected);
                Ok(())
            })
            .expect("frame");
            assert_eq!(status, FrameStatus::Presented);
        }
        resources.shutdown().expect("shutdown");
    }

    #[test]
    fn full_bindless_table_does_not_stall_the_loop() {
        let backend = Arc::new(MockBackend::auto_completing());
        let mut resources = resources_on(&backend, 2, 2);
        let mut presenter = MockPresenter::on(Arc::clone(&backend), 3);

        let mut registered = 0;
        for frame in 0..5u64 {
            let result = drive_frame(&mut resources, &mut presenter, |resources, _, _| {
                resources.register_resource(ResourceBinding::sampled_image(
                    vk::ImageView::from_raw(100 + frame),
                    vk::Sampler::from_raw(2),
                ))?;
                Ok(())
            });
            if result.is_ok() {
                registered += 1;
            }
        }

        assert_eq!(registered, 1);
        assert_eq!(resources.ring().frame_number(), 5);
        assert_eq!(presenter.presented().len(), 5);
        resources.shutdown().expect("shutdown");
    }

    #[test]
    fn teardown_deferred_while_recording_waits_for_slot_reuse() {
        let mut resources = resources(2);
        let mut presenter = MockPresenter::new(3);
        let freed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&freed);
        drive_frame(&mut resources, &mut presenter, move |resources, _, _| {
            resources.defer_frame(move || flag.store(true, Ordering::SeqCst));
            Ok(())
        })
        .expect("frame 0");
        drive_frame(&mut resources, &mut presenter, |_, _, _| Ok(())).expect("frame 1");
        assert!(!freed.load(Ordering::SeqCst));

        drive_frame(&mut resources, &mut presenter, |_, _, active| {
            assert_eq!(active.frame.slot, 0);
            Ok(())
        })
        .expect("frame 2");
        assert!(freed.load(Ordering::SeqCst));
        resources.shutdown().expect("shutdown");
    }
}
