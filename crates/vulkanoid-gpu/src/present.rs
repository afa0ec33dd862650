//! The presentation seam consumed by the frame loop.

use crate::error::Result;
use ash::vk;
use std::time::Duration;

/// An image handed out by the presentation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The image is usable but the swapchain no longer matches the surface exactly.
    pub suboptimal: bool,
}

/// Result of presenting a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// The swapchain is suboptimal or out of date and should be recreated.
    NeedsRecreate,
}

/// Swapchain operations the frame loop needs.
///
/// `acquire_next_image` must map an out-of-date surface to
/// [`GpuError::SurfaceOutOfDate`](crate::GpuError::SurfaceOutOfDate); `present` reports
/// it as [`PresentOutcome::NeedsRecreate`] instead, since the frame was already submitted.
pub trait Presenter {
    /// Acquire the next image, signaling `signal` once it is available.
    fn acquire_next_image(&mut self, signal: vk::Semaphore, timeout: Duration)
        -> Result<AcquiredImage>;

    /// Queue `image_index` for display once every semaphore in `wait` has signaled.
    fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> Result<PresentOutcome>;

    /// The swapchain image behind `index`.
    fn image(&self, index: u32) -> Option<vk::Image>;

    fn extent(&self) -> vk::Extent2D;

    fn format(&self) -> vk::Format;
}
