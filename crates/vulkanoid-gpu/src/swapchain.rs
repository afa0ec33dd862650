//! Swapchain management.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::present::{AcquiredImage, PresentOutcome, Presenter};
use crate::surface::{SurfaceContext, SwapchainConfig};
use crate::sync::timeout_nanos;
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain as described by `config`.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        config: &SwapchainConfig,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(config.image_count)
            .image_format(config.format.format)
            .image_color_space(config.format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(config.transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let swapchain = swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let mut this = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            format: config.format.format,
            extent: config.extent,
        };
        if let Err(err) = this.create_views(device, swapchain_loader) {
            this.destroy(device, swapchain_loader);
            return Err(err);
        }

        tracing::debug!(
            width = config.extent.width,
            height = config.extent.height,
            images = this.images.len(),
            present_mode = ?config.present_mode,
            "created swapchain"
        );
        Ok(this)
    }

    unsafe fn create_views(
        &mut self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) -> Result<()> {
        self.images = swapchain_loader.get_swapchain_images(self.swapchain)?;
        self.image_views.reserve(self.images.len());

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            self.image_views
                .push(device.create_image_view(&view_info, None)?);
        }
        Ok(())
    }

    /// Destroy the swapchain.
    ///
    /// # Safety
    /// All handles must be valid and swapchain must not be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        swapchain_loader.destroy_swapchain(self.swapchain, None);
    }
}

/// [`Presenter`] over a window surface.
pub struct SwapchainPresenter {
    gpu: Arc<GpuContext>,
    surface: SurfaceContext,
    swapchain: Swapchain,
    vsync: bool,
}

impl SwapchainPresenter {
    /// Create a swapchain for `surface`.
    pub fn new(
        gpu: Arc<GpuContext>,
        surface: SurfaceContext,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self> {
        let swapchain = unsafe { surface.create_swapchain(&gpu, width, height, vsync, None)? };
        Ok(Self {
            gpu,
            surface,
            swapchain,
            vsync,
        })
    }

    /// Rebuild the swapchain for a new window size.
    ///
    /// Waits for the device to go idle, so no in-flight frame still uses the old images.
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<()> {
        crate::backend::GpuBackend::wait_idle(self.gpu.as_ref())?;

        let swapchain = unsafe {
            self.surface.create_swapchain(
                &self.gpu,
                width,
                height,
                self.vsync,
                Some(self.swapchain.swapchain),
            )?
        };
        let old = std::mem::replace(&mut self.swapchain, swapchain);
        unsafe { old.destroy(self.gpu.device(), &self.surface.swapchain_loader) };

        tracing::info!(width, height, "swapchain recreated");
        Ok(())
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.swapchain.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.swapchain.image_views
    }

    /// Destroy the swapchain and the surface.
    ///
    /// The device must be idle.
    pub fn destroy(self) {
        unsafe {
            self.swapchain
                .destroy(self.gpu.device(), &self.surface.swapchain_loader);
            self.surface.destroy();
        }
    }
}

impl Presenter for SwapchainPresenter {
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn acquire_next_image(
        &mut self,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> Result<AcquiredImage> {
        let result = unsafe {
            self.surface.swapchain_loader.acquire_next_image(
                self.swapchain.swapchain,
                timeout_nanos(timeout),
                signal,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            // No image was acquired and `signal` stays unsignaled.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SurfaceOutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(GpuError::FenceTimeout {
                operation: "acquire_next_image",
                timeout,
            }),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = self.gpu.with_queue(|queue| unsafe {
            self.surface
                .swapchain_loader
                .queue_present(queue, &present_info)
        });

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::NeedsRecreate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    fn image(&self, index: u32) -> Option<vk::Image> {
        self.swapchain.images.get(index as usize).copied()
    }

    fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    fn format(&self) -> vk::Format {
        self.swapchain.format
    }
}

/// One more image than the minimum, clamped to the maximum when there is one.
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".to_string()))
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}
