//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use vulkanoid_gpu::{
    GpuContext, Presenter, ResourceManager, ResourceManagerConfig, SurfaceContext,
    SwapchainPresenter,
};
use winit::window::Window;

/// Application context shared across all app methods.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// GPU context with device and queues.
    pub gpu: Arc<GpuContext>,
    /// Frame ring, bindless table and deletion queues.
    pub resources: ResourceManager<GpuContext>,
    /// Swapchain for the window surface.
    pub presenter: SwapchainPresenter,
    /// Total frames presented.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    /// Create the surface, swapchain and resource manager.
    ///
    /// # Safety
    /// The window must have valid handles and outlive the context.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: Arc<GpuContext>,
        vsync: bool,
        resources: ResourceManagerConfig,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            gpu.capabilities()
                .supports_bindless_capacity(resources.bindless.capacity),
            "device cannot hold {} bindless descriptors",
            resources.bindless.capacity
        );

        // SAFETY: caller guarantees the window outlives the surface
        let surface = unsafe { SurfaceContext::from_window(gpu.as_ref(), window.as_ref())? };

        let size = window.inner_size();
        let presenter = SwapchainPresenter::new(
            Arc::clone(&gpu),
            surface,
            size.width.max(1),
            size.height.max(1),
            vsync,
        )?;

        tracing::info!(
            width = presenter.extent().width,
            height = presenter.extent().height,
            images = presenter.images().len(),
            "swapchain created"
        );

        let resources = match ResourceManager::new(Arc::clone(&gpu), resources) {
            Ok(resources) => resources,
            Err(err) => {
                presenter.destroy();
                return Err(err.into());
            }
        };

        Ok(Self {
            window,
            gpu,
            resources,
            presenter,
            frame_count: 0,
            last_frame_time: Instant::now(),
        })
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.presenter.extent()
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Get the number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.resources.ring().frames_in_flight()
    }

    /// Release everything in dependency order.
    pub(crate) fn shutdown(self) {
        let Self {
            gpu,
            resources,
            presenter,
            frame_count,
            ..
        } = self;

        if let Err(err) = resources.shutdown() {
            vulkanoid_gpu::error::fatal("resource manager shutdown", &err);
        }
        presenter.destroy();

        tracing::info!(frames = frame_count, "cleanup complete");
        drop(gpu);
    }
}
