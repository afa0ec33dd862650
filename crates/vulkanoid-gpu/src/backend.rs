//! The device seam used by the frame ring, bindless table and immediate submitter.
//!
//! Every GPU interaction of the lifecycle core goes through [`GpuBackend`]. The Vulkan
//! implementation lives on [`GpuContext`](crate::GpuContext); a scripted implementation
//! for tests lives in [`mock`](crate::mock).
//!
//! Handles are raw `ash::vk` handles. They are plain `Copy` integers, so teardown
//! closures capture them by value and stay valid independent of the call that made them.

use crate::error::Result;
use ash::vk;
use std::time::Duration;

/// One command pool with one primary command buffer allocated from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContext {
    pub pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
}

/// Parameters of a single queue submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitDesc<'a> {
    /// Commands to execute, or null to only wait and signal.
    pub command_buffer: vk::CommandBuffer,
    /// Semaphores the GPU waits on, with the stage that must not start before them.
    pub wait: &'a [(vk::Semaphore, vk::PipelineStageFlags2)],
    /// Semaphores signaled once the commands complete.
    pub signal: &'a [vk::Semaphore],
    /// Fence signaled once the commands complete, or null.
    pub fence: vk::Fence,
}

/// Descriptor kind held by a bindless table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindlessDescriptorKind {
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    StorageBuffer,
    UniformBuffer,
}

impl BindlessDescriptorKind {
    /// The Vulkan descriptor type for this kind.
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        }
    }

    /// Whether descriptors of this kind reference images.
    pub fn is_image(self) -> bool {
        matches!(
            self,
            Self::CombinedImageSampler | Self::SampledImage | Self::StorageImage
        )
    }

    pub(crate) fn name(self) -> &'static str {
        if self.is_image() {
            "image"
        } else {
            "buffer"
        }
    }
}

/// Shape of a bindless descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindlessLayoutDesc {
    /// Binding index inside the set.
    pub binding: u32,
    /// Maximum number of descriptors the layout supports.
    pub capacity: u32,
    pub kind: BindlessDescriptorKind,
    pub stages: vk::ShaderStageFlags,
}

impl Default for BindlessLayoutDesc {
    fn default() -> Self {
        Self {
            binding: 1,
            capacity: 1024,
            kind: BindlessDescriptorKind::CombinedImageSampler,
            stages: vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// What a bindless slot points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceBinding {
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
}

impl ResourceBinding {
    /// A sampled image in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn sampled_image(view: vk::ImageView, sampler: vk::Sampler) -> Self {
        Self::Image {
            view,
            sampler,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// A whole buffer.
    pub fn whole_buffer(buffer: vk::Buffer) -> Self {
        Self::Buffer {
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Image { .. } => "image",
            Self::Buffer { .. } => "buffer",
        }
    }

    pub(crate) fn matches(&self, kind: BindlessDescriptorKind) -> bool {
        matches!(self, Self::Image { .. }) == kind.is_image()
    }
}

/// One element to write into a descriptor array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    /// Array element inside the binding.
    pub index: u32,
    pub binding: ResourceBinding,
}

/// Device operations needed by the frame lifecycle core.
///
/// Implementations must accept only handles they created themselves. Destroy calls
/// must only be issued once the GPU has finished with the object; callers uphold this
/// through fence waits or [`wait_idle`](Self::wait_idle).
pub trait GpuBackend: Send + Sync + 'static {
    /// Create a fence, optionally already signaled.
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    /// Block until `fence` signals or `timeout` elapses.
    ///
    /// A timeout is reported as [`GpuError::FenceTimeout`](crate::GpuError::FenceTimeout).
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()>;

    /// Return `fence` to the unsignaled state.
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn create_semaphore(&self) -> Result<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Create a resettable command pool with one primary command buffer.
    fn create_command_context(&self, name: &str) -> Result<CommandContext>;

    /// Destroy the pool and, with it, its command buffer.
    fn destroy_command_context(&self, context: CommandContext);

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    /// Begin recording a one-time-submit command buffer.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    /// Record a transition of a swapchain image from `UNDEFINED` to `PRESENT_SRC_KHR`,
    /// discarding its contents.
    fn record_present_transition(&self, command_buffer: vk::CommandBuffer, image: vk::Image);

    /// Submit recorded work to the graphics queue.
    fn submit(&self, desc: &SubmitDesc<'_>) -> Result<()>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> Result<()>;

    /// Create a partially bound, update-after-bind, variable-count layout.
    fn create_bindless_layout(&self, desc: &BindlessLayoutDesc) -> Result<vk::DescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Create an update-after-bind pool able to back one set of `capacity` descriptors.
    fn create_bindless_pool(
        &self,
        desc: &BindlessLayoutDesc,
        capacity: u32,
    ) -> Result<vk::DescriptorPool>;

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocate one set whose variable-count binding holds `capacity` descriptors.
    fn allocate_bindless_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        capacity: u32,
    ) -> Result<vk::DescriptorSet>;

    /// Return a set to its pool.
    fn free_descriptor_set(&self, pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()>;

    /// Write descriptors into array elements of `binding` in a single update call.
    fn write_descriptors(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        kind: BindlessDescriptorKind,
        writes: &[DescriptorWrite],
    );
}
