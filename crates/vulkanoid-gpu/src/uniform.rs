//! Per-frame uniform buffers.

use crate::backend::ResourceBinding;
use crate::deletion::DeletionQueue;
use crate::error::{GpuError, Result};
use crate::memory::{defer_free_buffer, GpuBuffer, SharedAllocator};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use std::marker::PhantomData;

/// One persistently mapped uniform buffer per frame slot.
///
/// Writing slot `i` while frame `i` is recording is safe: the previous user of that
/// buffer is the frame that last held the slot, and the ring has already waited on it.
pub struct FrameUniforms<T: Pod> {
    buffers: Vec<GpuBuffer>,
    _marker: PhantomData<T>,
}

fn uniform_size<T: Pod>() -> Result<u64> {
    match std::mem::size_of::<T>() {
        0 => Err(GpuError::InvalidState(
            "uniform type has no size".to_string(),
        )),
        size => Ok(size as u64),
    }
}

impl<T: Pod> FrameUniforms<T> {
    /// Allocate `frames_in_flight` host-visible buffers sized for `T`.
    pub fn new(allocator: &SharedAllocator, frames_in_flight: usize, name: &str) -> Result<Self> {
        let size = uniform_size::<T>()?;
        let mut buffers = Vec::with_capacity(frames_in_flight);

        for slot in 0..frames_in_flight {
            let created = allocator.lock().create_buffer(
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("{name} [{slot}]"),
            );
            match created {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    // Never submitted, so these can go right away.
                    let mut allocator = allocator.lock();
                    for mut buffer in buffers {
                        allocator.free_buffer(&mut buffer)?;
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self {
            buffers,
            _marker: PhantomData,
        })
    }

    /// Overwrite the buffer for `slot`.
    pub fn write(&mut self, slot: usize, value: &T) -> Result<()> {
        self.buffers
            .get_mut(slot)
            .ok_or_else(|| GpuError::InvalidState(format!("no uniform buffer for slot {slot}")))?
            .write(std::slice::from_ref(value))
    }

    /// Descriptor binding for the buffer of `slot`.
    pub fn binding(&self, slot: usize) -> Option<ResourceBinding> {
        self.buffer(slot).map(ResourceBinding::whole_buffer)
    }

    pub fn buffer(&self, slot: usize) -> Option<vk::Buffer> {
        self.buffers.get(slot).map(|buffer| buffer.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Hand every buffer to `queue` for release.
    pub fn defer_destroy(self, queue: &mut DeletionQueue, allocator: &SharedAllocator) {
        for buffer in self.buffers {
            defer_free_buffer(queue, allocator, buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct Globals {
        tint: [f32; 4],
        time: f32,
        _pad: [f32; 3],
    }

    #[test]
    fn size_follows_the_uniform_type() {
        assert_eq!(uniform_size::<Globals>().expect("sized"), 32);
        assert!(uniform_size::<()>().is_err());
    }
}
