//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Descriptor indexing features the bindless table relies on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct DescriptorIndexingSupport {
    pub runtime_descriptor_array: bool,
    pub partially_bound: bool,
    pub variable_descriptor_count: bool,
    pub update_unused_while_pending: bool,
    pub sampled_image_update_after_bind: bool,
    pub non_uniform_sampled_image_indexing: bool,
}

impl DescriptorIndexingSupport {
    fn from_features(features: &vk::PhysicalDeviceVulkan12Features<'_>) -> Self {
        Self {
            runtime_descriptor_array: features.runtime_descriptor_array == vk::TRUE,
            partially_bound: features.descriptor_binding_partially_bound == vk::TRUE,
            variable_descriptor_count: features.descriptor_binding_variable_descriptor_count
                == vk::TRUE,
            update_unused_while_pending: features.descriptor_binding_update_unused_while_pending
                == vk::TRUE,
            sampled_image_update_after_bind: features
                .descriptor_binding_sampled_image_update_after_bind
                == vk::TRUE,
            non_uniform_sampled_image_indexing: features
                .shader_sampled_image_array_non_uniform_indexing
                == vk::TRUE,
        }
    }

    /// Whether every feature needed for bindless sampled images is present.
    pub fn is_complete(&self) -> bool {
        self.runtime_descriptor_array
            && self.partially_bound
            && self.variable_descriptor_count
            && self.update_unused_while_pending
            && self.sampled_image_update_after_bind
            && self.non_uniform_sampled_image_indexing
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Dynamic rendering support (VK 1.3 core)
    pub supports_dynamic_rendering: bool,
    /// Synchronization2 support (VK 1.3 core)
    pub supports_synchronization2: bool,

    pub descriptor_indexing: DescriptorIndexingSupport,
    /// Per-stage limit on update-after-bind sampled images.
    pub max_update_after_bind_sampled_images: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut indexing_properties = vk::PhysicalDeviceDescriptorIndexingProperties::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut indexing_properties);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;

        let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
        let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_1_3)
            .push_next(&mut vulkan_1_2);
        instance.get_physical_device_features2(physical_device, &mut features2);

        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor,
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            supports_dynamic_rendering: vulkan_1_3.dynamic_rendering == vk::TRUE,
            supports_synchronization2: vulkan_1_3.synchronization2 == vk::TRUE,

            descriptor_indexing: DescriptorIndexingSupport::from_features(&vulkan_1_2),
            max_update_after_bind_sampled_images: indexing_properties
                .max_per_stage_descriptor_update_after_bind_sampled_images,

            device_local_memory_mb,
            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }

        if !self.supports_dynamic_rendering || !self.supports_synchronization2 {
            return false;
        }

        self.descriptor_indexing.is_complete()
            && self
                .available_extensions
                .contains(ash::khr::swapchain::NAME.to_str().unwrap_or_default())
    }

    /// Whether a bindless table of `capacity` sampled images fits the device limits.
    pub fn supports_bindless_capacity(&self, capacity: u32) -> bool {
        capacity <= self.max_update_after_bind_sampled_images
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}
