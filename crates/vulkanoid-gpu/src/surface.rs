//! Window surfaces and the swapchain parameters derived from them.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::{calculate_extent, image_count, select_present_mode, select_surface_format, Swapchain};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Vulkan surface and the extension loaders that operate on it.
pub struct SurfaceContext {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    pub swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    /// Create a surface for `window` and check the graphics queue can present to it.
    ///
    /// # Safety
    /// The window must outlive the surface.
    pub unsafe fn from_window<W>(gpu: &GpuContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("display handle: {e}")))?
            .as_raw();
        let window = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("window handle: {e}")))?
            .as_raw();

        let surface = ash_window::create_surface(gpu.entry(), gpu.instance(), display, window, None)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        let surface_loader = ash::khr::surface::Instance::new(gpu.entry(), gpu.instance());

        let presentable = surface_loader.get_physical_device_surface_support(
            gpu.physical_device(),
            gpu.graphics_queue_family(),
            surface,
        );
        if !matches!(presentable, Ok(true)) {
            surface_loader.destroy_surface(surface, None);
            return Err(GpuError::SurfaceCreation(
                "graphics queue cannot present to this surface".to_string(),
            ));
        }

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader: ash::khr::swapchain::Device::new(gpu.instance(), gpu.device()),
        })
    }

    /// Query what the surface supports on the context's physical device.
    pub fn capabilities(&self, gpu: &GpuContext) -> Result<SurfaceCapabilities> {
        let physical = gpu.physical_device();
        unsafe {
            Ok(SurfaceCapabilities {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(physical, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(physical, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(physical, self.surface)?,
            })
        }
    }

    /// Create a swapchain for this surface, retiring `old_swapchain` if given.
    ///
    /// # Safety
    /// The GPU context must be valid.
    pub unsafe fn create_swapchain(
        &self,
        gpu: &GpuContext,
        width: u32,
        height: u32,
        vsync: bool,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Swapchain> {
        let config = self.capabilities(gpu)?.swapchain_config(width, height, vsync)?;
        Swapchain::new(
            gpu.device(),
            &self.swapchain_loader,
            self.surface,
            &config,
            old_swapchain,
        )
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// The surface must not be in use.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}

/// Surface capabilities query result.
#[derive(Debug, Clone, Default)]
pub struct SurfaceCapabilities {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Everything needed to create a swapchain, chosen from [`SurfaceCapabilities`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

impl SurfaceCapabilities {
    /// Pick format, present mode, extent and image count for a `width` x `height` window.
    pub fn swapchain_config(&self, width: u32, height: u32, vsync: bool) -> Result<SwapchainConfig> {
        let extent = calculate_extent(&self.capabilities, width, height);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::SwapchainCreation(format!(
                "surface extent {}x{} is empty",
                extent.width, extent.height
            )));
        }

        Ok(SwapchainConfig {
            format: select_surface_format(&self.formats)?,
            present_mode: select_present_mode(&self.present_modes, vsync),
            extent,
            image_count: image_count(&self.capabilities),
            transform: self.capabilities.current_transform,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> SurfaceCapabilities {
        SurfaceCapabilities {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    #[test]
    fn config_follows_the_surface() {
        let config = surface().swapchain_config(1280, 720, false).expect("config");
        assert_eq!(config.extent, vk::Extent2D { width: 800, height: 600 });
        assert_eq!(config.image_count, 3);
        assert_eq!(config.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.format.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn minimized_surface_has_no_config() {
        let mut caps = surface();
        caps.capabilities.current_extent = vk::Extent2D { width: 0, height: 0 };
        assert!(caps.swapchain_config(1280, 720, true).is_err());
    }
}
