//! Sampled texture uploads through the immediate submitter.

use crate::command::transition_image;
use crate::context::GpuContext;
use crate::deletion::DeletionQueue;
use crate::error::{GpuError, Result};
use crate::manager::ResourceManager;
use crate::memory::GpuImage;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Byte length of a tightly packed RGBA8 image.
pub fn rgba8_byte_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(GpuError::InvalidState(format!(
            "texture extent {width}x{height} is empty"
        )));
    }
    usize::try_from(u64::from(width) * u64::from(height) * 4)
        .map_err(|_| GpuError::InvalidState(format!("texture {width}x{height} is too large")))
}

/// Upload RGBA8 pixels into a device-local, shader-readable sRGB image.
///
/// Blocks until the copy has completed. The staging buffer is freed before returning.
pub fn upload_rgba8(
    ctx: &GpuContext,
    manager: &ResourceManager<GpuContext>,
    pixels: &[u8],
    width: u32,
    height: u32,
    name: &str,
) -> Result<GpuImage> {
    let expected = rgba8_byte_len(width, height)?;
    if pixels.len() != expected {
        return Err(GpuError::InvalidState(format!(
            "texture {name} has {} bytes, expected {expected}",
            pixels.len()
        )));
    }

    let allocator = ctx.allocator();
    let mut staging = allocator.lock().create_buffer(
        expected as u64,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        &format!("{name} staging"),
    )?;

    let extent = vk::Extent3D {
        width,
        height,
        depth: 1,
    };
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk::Format::R8G8B8A8_SRGB)
        .extent(extent)
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let result = staging.write_bytes(0, pixels).and_then(|()| {
        let image = allocator
            .lock()
            .create_image(&image_info, MemoryLocation::GpuOnly, name)?;
        let device = ctx.device();
        let copied = manager.immediate_submit(|cmd| unsafe {
            transition_image(
                device,
                cmd,
                image.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            let region = vk::BufferImageCopy::default()
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .image_extent(extent);
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            transition_image(
                device,
                cmd,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        });
        match copied {
            Ok(()) => Ok(image),
            Err(err) => {
                let mut image = image;
                allocator.lock().free_image(&mut image)?;
                Err(err)
            }
        }
    });

    // The immediate submit has either completed or never reached the queue.
    allocator.lock().free_buffer(&mut staging)?;

    if result.is_ok() {
        tracing::debug!(name, width, height, "texture uploaded");
    }
    result
}

/// Create a linear, repeating sampler and register its destruction in `queue`.
pub fn create_sampler(ctx: &GpuContext, queue: &mut DeletionQueue) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(vk::LOD_CLAMP_NONE);

    let sampler = unsafe { ctx.device().create_sampler(&info, None)? };

    let device = Arc::clone(ctx.device_arc());
    queue.push(move || unsafe { device.destroy_sampler(sampler, None) });
    Ok(sampler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba8_length_is_four_bytes_per_texel() {
        assert_eq!(rgba8_byte_len(4, 4).expect("len"), 64);
        assert_eq!(rgba8_byte_len(1, 1).expect("len"), 4);
    }

    #[test]
    fn empty_extent_is_rejected() {
        assert!(rgba8_byte_len(0, 16).is_err());
        assert!(rgba8_byte_len(16, 0).is_err());
    }
}
