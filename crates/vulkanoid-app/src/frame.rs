//! Per-frame context for rendering.

use ash::vk;
use vulkanoid_gpu::{ActiveFrame, ResourceManager};

/// Context for the frame being recorded.
pub struct FrameContext<'a> {
    /// Command buffer for recording rendering commands.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    /// The swapchain image for this frame.
    pub swapchain_image: vk::Image,
    pub swapchain_view: vk::ImageView,
    pub extent: vk::Extent2D,
    /// Frame slot, for indexing per-slot resources such as uniform buffers.
    pub slot: usize,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number.
    pub frame_number: u64,
    /// Resource manager, for deferring teardown and updating the bindless table.
    pub resources: &'a mut ResourceManager<vulkanoid_gpu::GpuContext>,
}

impl<'a> FrameContext<'a> {
    pub(crate) fn new(
        active: &ActiveFrame,
        swapchain_image: vk::Image,
        swapchain_view: vk::ImageView,
        extent: vk::Extent2D,
        dt: f32,
        resources: &'a mut ResourceManager<vulkanoid_gpu::GpuContext>,
    ) -> Self {
        Self {
            command_buffer: active.command_buffer(),
            image_index: active.image_index,
            swapchain_image,
            swapchain_view,
            extent,
            slot: active.frame.slot,
            dt,
            frame_number: active.frame.frame_number,
            resources,
        }
    }

    /// Defer teardown until the GPU has finished this frame.
    pub fn defer<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.resources.defer_frame(action);
    }
}
