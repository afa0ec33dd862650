//! `VulkanoidApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use vulkanoid_gpu::GpuContext;
use winit::event::WindowEvent;

/// Trait for Vulkanoid applications.
///
/// The framework creates the window, GPU context, swapchain and
/// [`ResourceManager`](vulkanoid_gpu::ResourceManager), then drives the frame loop.
pub trait VulkanoidApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the GPU context and window have been created. This is the
    /// place to upload textures and populate the bindless fallback at handle 0;
    /// drawing before the fallback exists is a usage error.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state. `dt` is in seconds.
    ///
    /// Runs between frames, so this is where blocking uploads and bindless
    /// registration belong. Teardown deferred here waits for the last submitted frame.
    #[allow(unused_variables)]
    fn update(&mut self, ctx: &mut AppContext, dt: f32) {}

    /// Record the frame into `frame.command_buffer`.
    ///
    /// The framework acquires the swapchain image, submits and presents. The app must
    /// leave the swapchain image in `PRESENT_SRC_KHR` layout.
    fn render(&mut self, gpu: &GpuContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()>;

    /// Handle window resize, after the swapchain has been recreated.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events. Return `true` to stop further processing.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Register teardown for app-owned GPU objects.
    ///
    /// Called once before shutdown. Push into the global queue through
    /// `ctx.resources`; it is flushed after the device has gone idle.
    #[allow(unused_variables)]
    fn cleanup(self, ctx: &mut AppContext) {}
}
