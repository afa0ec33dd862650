//! Descriptor set management.

use crate::backend::{BindlessDescriptorKind, DescriptorWrite, ResourceBinding};
use crate::error::{GpuError, Result};
use ash::vk;

/// Binding flags applied to every bindless array binding.
pub fn bindless_binding_flags() -> vk::DescriptorBindingFlags {
    vk::DescriptorBindingFlags::PARTIALLY_BOUND
        | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
        | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
        | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
}

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
    binding_flags: Vec<vk::DescriptorBindingFlags>,
    flags: vk::DescriptorSetLayoutCreateFlags,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            binding_flags: Vec::new(),
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self.binding_flags.push(vk::DescriptorBindingFlags::empty());
        self
    }

    /// Add a partially bound, update-after-bind array of up to `capacity` descriptors.
    ///
    /// The variable-count flag is only legal on the highest binding number, so this
    /// should be the last binding added.
    pub fn bindless(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        capacity: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self = self.binding(binding, descriptor_type, capacity, stage_flags);
        if let Some(flags) = self.binding_flags.last_mut() {
            *flags = bindless_binding_flags();
        }
        self.flags |= vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL;
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Layout creation flags accumulated so far.
    pub fn create_flags(&self) -> vk::DescriptorSetLayoutCreateFlags {
        self.flags
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&self.binding_flags);

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&self.bindings)
            .flags(self.flags)
            .push_next(&mut flags_info);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(flags);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    /// Create a pool able to back one bindless set of `capacity` descriptors.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn bindless(
        device: &ash::Device,
        descriptor_type: vk::DescriptorType,
        capacity: u32,
    ) -> Result<Self> {
        let sizes = [vk::DescriptorPoolSize {
            ty: descriptor_type,
            descriptor_count: capacity,
        }];
        Self::new(
            device,
            1,
            &sizes,
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND
                | vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
        )
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

/// Allocate one set from `pool` whose variable-count binding holds `count` descriptors.
///
/// # Safety
/// The device, pool and layout must be valid.
pub unsafe fn allocate_variable_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    count: u32,
) -> Result<vk::DescriptorSet> {
    let counts = [count];
    let mut variable_info =
        vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts)
        .push_next(&mut variable_info);

    let sets = device.allocate_descriptor_sets(&alloc_info)?;
    sets.into_iter()
        .next()
        .ok_or_else(|| GpuError::InvalidState("driver returned no descriptor set".to_string()))
}

/// Write bindless array elements in one `vkUpdateDescriptorSets` call.
///
/// # Safety
/// Device, set and every referenced view, sampler and buffer must be valid.
pub unsafe fn write_bindless(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    kind: BindlessDescriptorKind,
    writes: &[DescriptorWrite],
) {
    if writes.is_empty() {
        return;
    }

    // Info arrays are filled completely before any write borrows from them.
    let image_infos: Vec<vk::DescriptorImageInfo> = writes
        .iter()
        .map(|write| match write.binding {
            ResourceBinding::Image {
                view,
                sampler,
                layout,
            } => vk::DescriptorImageInfo::default()
                .image_view(view)
                .sampler(sampler)
                .image_layout(layout),
            ResourceBinding::Buffer { .. } => vk::DescriptorImageInfo::default(),
        })
        .collect();
    let buffer_infos: Vec<vk::DescriptorBufferInfo> = writes
        .iter()
        .map(|write| match write.binding {
            ResourceBinding::Buffer {
                buffer,
                offset,
                range,
            } => vk::DescriptorBufferInfo::default()
                .buffer(buffer)
                .offset(offset)
                .range(range),
            ResourceBinding::Image { .. } => vk::DescriptorBufferInfo::default(),
        })
        .collect();

    let descriptor_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .enumerate()
        .map(|(i, write)| {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(dst_set)
                .dst_binding(binding)
                .dst_array_element(write.index)
                .descriptor_type(kind.descriptor_type());
            if kind.is_image() {
                base.image_info(std::slice::from_ref(&image_infos[i]))
            } else {
                base.buffer_info(std::slice::from_ref(&buffer_infos[i]))
            }
        })
        .collect();

    device.update_descriptor_sets(&descriptor_writes, &[]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindless_binding_sets_update_after_bind_pool() {
        let builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .bindless(
                1,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                1024,
                vk::ShaderStageFlags::FRAGMENT,
            );

        assert_eq!(
            builder.create_flags(),
            vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL
        );
        assert_eq!(builder.binding_flags[0], vk::DescriptorBindingFlags::empty());
        assert_eq!(builder.binding_flags[1], bindless_binding_flags());
        assert_eq!(builder.bindings[1].descriptor_count, 1024);
    }

    #[test]
    fn bindless_flags_include_partial_binding() {
        let flags = bindless_binding_flags();
        assert!(flags.contains(vk::DescriptorBindingFlags::PARTIALLY_BOUND));
        assert!(flags.contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT));
    }
}
