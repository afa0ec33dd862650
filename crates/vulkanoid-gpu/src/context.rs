//! GPU context management.

use crate::backend::{
    BindlessDescriptorKind, BindlessLayoutDesc, CommandContext, DescriptorWrite, GpuBackend,
    SubmitDesc,
};
use crate::capabilities::GpuCapabilities;
use crate::command::{self, CommandPool};
use crate::descriptors::{self, DescriptorPool, DescriptorSetLayoutBuilder};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::{GpuAllocator, SharedAllocator};
use crate::sync;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::ffi::CStr;
use std::sync::Arc;
use std::time::Duration;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: SharedAllocator,

    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,
    // vkQueueSubmit and vkQueuePresentKHR need external synchronization on the queue.
    queue_lock: Mutex<()>,
}

impl GpuContext {
    /// Get the loaded Vulkan entry points.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared device handle, for teardown closures that outlive a borrow.
    pub fn device_arc(&self) -> &Arc<ash::Device> {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }

    /// Run `f` with exclusive access to the graphics queue.
    pub fn with_queue<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let _guard = self.queue_lock.lock();
        f(self.graphics_queue)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl GpuBackend for GpuContext {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        unsafe { sync::create_fence(&self.device, signaled) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()> {
        unsafe { sync::wait_for_fence(&self.device, fence, timeout) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { sync::reset_fence(&self.device, fence) }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe { sync::create_semaphore(&self.device) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_context(&self, name: &str) -> Result<CommandContext> {
        unsafe {
            let pool = CommandPool::new(
                &self.device,
                self.graphics_queue_family,
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?;
            let command_buffer =
                match pool.allocate_command_buffer(&self.device, vk::CommandBufferLevel::PRIMARY) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        pool.destroy(&self.device);
                        return Err(e);
                    }
                };
            tracing::debug!(name, "created command context");
            Ok(CommandContext {
                pool: pool.handle(),
                command_buffer,
            })
        }
    }

    fn destroy_command_context(&self, context: CommandContext) {
        unsafe { self.device.destroy_command_pool(context.pool, None) };
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe {
            command::begin_command_buffer(
                &self.device,
                command_buffer,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        unsafe { command::end_command_buffer(&self.device, command_buffer) }
    }

    fn record_present_transition(&self, command_buffer: vk::CommandBuffer, image: vk::Image) {
        unsafe {
            command::transition_image(
                &self.device,
                command_buffer,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        }
    }

    fn submit(&self, desc: &SubmitDesc<'_>) -> Result<()> {
        self.with_queue(|queue| unsafe { command::submit_command_buffer(&self.device, queue, desc) })
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn wait_idle(&self) -> Result<()> {
        let _guard = self.queue_lock.lock();
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    fn create_bindless_layout(&self, desc: &BindlessLayoutDesc) -> Result<vk::DescriptorSetLayout> {
        unsafe {
            DescriptorSetLayoutBuilder::new()
                .bindless(
                    desc.binding,
                    desc.kind.descriptor_type(),
                    desc.capacity,
                    desc.stages,
                )
                .build(&self.device)
        }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_bindless_pool(
        &self,
        desc: &BindlessLayoutDesc,
        capacity: u32,
    ) -> Result<vk::DescriptorPool> {
        let pool =
            unsafe { DescriptorPool::bindless(&self.device, desc.kind.descriptor_type(), capacity) }?;
        Ok(pool.handle())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_bindless_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        capacity: u32,
    ) -> Result<vk::DescriptorSet> {
        unsafe { descriptors::allocate_variable_set(&self.device, pool, layout, capacity) }
    }

    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()> {
        unsafe { self.device.free_descriptor_sets(pool, &[set])? };
        Ok(())
    }

    fn write_descriptors(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        kind: BindlessDescriptorKind,
        writes: &[DescriptorWrite],
    ) {
        unsafe { descriptors::write_bindless(&self.device, set, binding, kind, writes) };
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    display: Option<RawDisplayHandle>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Vulkanoid".to_string(),
            enable_validation: cfg!(debug_assertions),
            display: None,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Enable the surface extensions needed to present to `display`.
    pub fn display(mut self, display: RawDisplayHandle) -> Self {
        self.display = Some(display);
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.enable_validation,
                self.display,
            )
        }?;

        let physical_device = unsafe { select_physical_device(&instance) }?;

        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        if !capabilities.meets_requirements() {
            tracing::error!("GPU does not meet requirements: {}", capabilities.summary());
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let graphics_queue_family =
            unsafe { find_graphics_queue_family(&instance, physical_device) }?;

        let (device, graphics_queue) =
            unsafe { create_device(&instance, physical_device, graphics_queue_family)? };

        let device = Arc::new(device);

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Arc::new(Mutex::new(allocator)),
            graphics_queue_family,
            graphics_queue,
            queue_lock: Mutex::new(()),
        })
    }
}

/// Find the first queue family with graphics support.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    queue_families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .and_then(|i| u32::try_from(i).ok())
        .ok_or(GpuError::NoSuitableDevice)
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Create the logical device and retrieve the graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extensions = required_device_extensions();
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    // Descriptor indexing backs the bindless table
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_variable_descriptor_count(true)
        .descriptor_binding_update_unused_while_pending(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_image_update_after_bind(true)
        .descriptor_binding_storage_buffer_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(vk::PhysicalDeviceFeatures::default())
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

    Ok((device, graphics_queue))
}
