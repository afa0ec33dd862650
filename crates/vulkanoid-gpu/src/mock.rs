//! Scripted [`GpuBackend`] for exercising the lifecycle core without a GPU.
//!
//! The mock never executes anything. Submitted fences stay unsignaled until the test
//! completes them (or `auto_complete` is enabled), which makes it possible to observe
//! exactly when the CPU would block on the GPU.
//!
//! Binary semaphores are signaled by submissions and acquisitions and consumed by waits.
//! Once a [`MockPresenter`] is attached with [`MockPresenter::on`], signaling a
//! semaphore twice or waiting on one nothing signaled panics.

use crate::backend::{
    BindlessDescriptorKind, BindlessLayoutDesc, CommandContext, DescriptorWrite, GpuBackend,
    ResourceBinding, SubmitDesc,
};
use crate::error::{GpuError, Result};
use crate::present::{AcquiredImage, PresentOutcome, Presenter};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// A backend call, in the order it was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateFence { fence: vk::Fence, signaled: bool },
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateCommandContext { name: String, context: CommandContext },
    DestroyCommandContext(CommandContext),
    ResetCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    PresentTransition {
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
    },
    Submit {
        command_buffer: vk::CommandBuffer,
        wait: Vec<vk::Semaphore>,
        signal: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    WaitIdle,
    CreateLayout { layout: vk::DescriptorSetLayout, capacity: u32 },
    DestroyLayout(vk::DescriptorSetLayout),
    CreatePool { pool: vk::DescriptorPool, capacity: u32 },
    DestroyPool(vk::DescriptorPool),
    AllocateSet { set: vk::DescriptorSet, capacity: u32 },
    FreeSet(vk::DescriptorSet),
    WriteDescriptors { set: vk::DescriptorSet, binding: u32, indices: Vec<u32> },
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    calls: Vec<MockCall>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    track_semaphores: bool,
    live: HashSet<u64>,
    descriptors: HashMap<(u64, u32, u32), ResourceBinding>,
    auto_complete: bool,
    fail_next_submit: bool,
}

impl MockState {
    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        self.next_handle
    }

    fn release(&mut self, raw: u64) {
        if !self.live.remove(&raw) {
            panic!("mock backend: double destroy or foreign handle {raw:#x}");
        }
    }

    fn signal(&mut self, semaphore: vk::Semaphore) {
        let strict = self.track_semaphores;
        if let Some(signaled) = self.semaphores.get_mut(&semaphore.as_raw()) {
            if strict && *signaled {
                panic!(
                    "mock backend: semaphore {:#x} already signaled",
                    semaphore.as_raw()
                );
            }
            *signaled = true;
        }
    }

    fn consume(&mut self, semaphore: vk::Semaphore) {
        let strict = self.track_semaphores;
        if let Some(signaled) = self.semaphores.get_mut(&semaphore.as_raw()) {
            if strict && !*signaled {
                panic!(
                    "mock backend: wait on semaphore {:#x} that nothing signals",
                    semaphore.as_raw()
                );
            }
            *signaled = false;
        }
    }
}

/// In-memory device recording every call.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    /// A device whose GPU never finishes work unless told to.
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose GPU finishes every submission instantly.
    pub fn auto_completing() -> Self {
        let backend = Self::default();
        backend.state.lock().auto_complete = true;
        backend
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Drain the call log.
    pub fn take_calls(&self) -> Vec<MockCall> {
        std::mem::take(&mut self.state.lock().calls)
    }

    /// Whether the fence is currently signaled.
    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .unwrap_or(false)
    }

    /// Whether the binary semaphore is signaled, or has a signal pending.
    pub fn is_semaphore_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.state
            .lock()
            .semaphores
            .get(&semaphore.as_raw())
            .copied()
            .unwrap_or(false)
    }

    /// Signal `semaphore` from outside the queue, as image acquisition does.
    pub fn signal_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().signal(semaphore);
    }

    /// Consume the signals of `semaphores`, as presentation does.
    pub fn wait_semaphores(&self, semaphores: &[vk::Semaphore]) {
        let mut state = self.state.lock();
        for &semaphore in semaphores {
            state.consume(semaphore);
        }
    }

    /// Simulate the GPU finishing the work guarded by `fence`.
    pub fn complete_fence(&self, fence: vk::Fence) {
        if let Some(signaled) = self.state.lock().fences.get_mut(&fence.as_raw()) {
            *signaled = true;
        }
    }

    /// Simulate the GPU draining every queue.
    pub fn complete_all(&self) {
        for signaled in self.state.lock().fences.values_mut() {
            *signaled = true;
        }
    }

    /// Make the next submission fail as if the device had been lost.
    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next_submit = true;
    }

    /// Number of objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    /// The descriptor last written at `index` of `binding` in `set`.
    pub fn descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        index: u32,
    ) -> Option<ResourceBinding> {
        self.state
            .lock()
            .descriptors
            .get(&(set.as_raw(), binding, index))
            .copied()
    }

    /// Number of submissions issued.
    pub fn submit_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, MockCall::Submit { .. }))
            .count()
    }
}

impl GpuBackend for MockBackend {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.allocate();
        state.fences.insert(raw, signaled);
        let fence = vk::Fence::from_raw(raw);
        state.calls.push(MockCall::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.release(fence.as_raw());
        state.fences.remove(&fence.as_raw());
        state.calls.push(MockCall::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::WaitFence(fence));
        match state.fences.get(&fence.as_raw()) {
            Some(true) => Ok(()),
            Some(false) => Err(GpuError::FenceTimeout {
                operation: "wait_for_fence",
                timeout,
            }),
            None => Err(GpuError::InvalidState(format!(
                "unknown fence {:#x}",
                fence.as_raw()
            ))),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::ResetFence(fence));
        let signaled = state
            .fences
            .get_mut(&fence.as_raw())
            .ok_or_else(|| GpuError::InvalidState("reset of unknown fence".to_string()))?;
        *signaled = false;
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(state.allocate());
        state.semaphores.insert(semaphore.as_raw(), false);
        state.calls.push(MockCall::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.release(semaphore.as_raw());
        state.semaphores.remove(&semaphore.as_raw());
        state.calls.push(MockCall::DestroySemaphore(semaphore));
    }

    fn create_command_context(&self, name: &str) -> Result<CommandContext> {
        let mut state = self.state.lock();
        let pool = vk::CommandPool::from_raw(state.allocate());
        // The buffer is owned by the pool and is not tracked separately.
        state.next_handle += 1;
        let command_buffer = vk::CommandBuffer::from_raw(state.next_handle);
        let context = CommandContext {
            pool,
            command_buffer,
        };
        state.calls.push(MockCall::CreateCommandContext {
            name: name.to_string(),
            context,
        });
        Ok(context)
    }

    fn destroy_command_context(&self, context: CommandContext) {
        let mut state = self.state.lock();
        state.release(context.pool.as_raw());
        state.calls.push(MockCall::DestroyCommandContext(context));
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.state
            .lock()
            .calls
            .push(MockCall::ResetCommandBuffer(command_buffer));
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.state
            .lock()
            .calls
            .push(MockCall::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        self.state
            .lock()
            .calls
            .push(MockCall::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn record_present_transition(&self, command_buffer: vk::CommandBuffer, image: vk::Image) {
        self.state.lock().calls.push(MockCall::PresentTransition {
            command_buffer,
            image,
        });
    }

    fn submit(&self, desc: &SubmitDesc<'_>) -> Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(GpuError::Submission(vk::Result::ERROR_DEVICE_LOST));
        }

        state.calls.push(MockCall::Submit {
            command_buffer: desc.command_buffer,
            wait: desc.wait.iter().map(|(semaphore, _)| *semaphore).collect(),
            signal: desc.signal.to_vec(),
            fence: desc.fence,
        });
        for &(semaphore, _) in desc.wait {
            state.consume(semaphore);
        }
        for &semaphore in desc.signal {
            state.signal(semaphore);
        }

        if desc.fence != vk::Fence::null() {
            let auto_complete = state.auto_complete;
            if let Some(signaled) = state.fences.get_mut(&desc.fence.as_raw()) {
                *signaled = auto_complete;
            }
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::WaitIdle);
        for signaled in state.fences.values_mut() {
            *signaled = true;
        }
        Ok(())
    }

    fn create_bindless_layout(&self, desc: &BindlessLayoutDesc) -> Result<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let layout = vk::DescriptorSetLayout::from_raw(state.allocate());
        state.calls.push(MockCall::CreateLayout {
            layout,
            capacity: desc.capacity,
        });
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut state = self.state.lock();
        state.release(layout.as_raw());
        state.calls.push(MockCall::DestroyLayout(layout));
    }

    fn create_bindless_pool(
        &self,
        _desc: &BindlessLayoutDesc,
        capacity: u32,
    ) -> Result<vk::DescriptorPool> {
        let mut state = self.state.lock();
        let pool = vk::DescriptorPool::from_raw(state.allocate());
        state.calls.push(MockCall::CreatePool { pool, capacity });
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state.release(pool.as_raw());
        state.calls.push(MockCall::DestroyPool(pool));
    }

    fn allocate_bindless_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
        capacity: u32,
    ) -> Result<vk::DescriptorSet> {
        let mut state = self.state.lock();
        let set = vk::DescriptorSet::from_raw(state.allocate());
        state.calls.push(MockCall::AllocateSet { set, capacity });
        Ok(set)
    }

    fn free_descriptor_set(&self, _pool: vk::DescriptorPool, set: vk::DescriptorSet) -> Result<()> {
        let mut state = self.state.lock();
        state.release(set.as_raw());
        state.calls.push(MockCall::FreeSet(set));
        Ok(())
    }

    fn write_descriptors(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        _kind: BindlessDescriptorKind,
        writes: &[DescriptorWrite],
    ) {
        let mut state = self.state.lock();
        for write in writes {
            state
                .descriptors
                .insert((set.as_raw(), binding, write.index), write.binding);
        }
        state.calls.push(MockCall::WriteDescriptors {
            set,
            binding,
            indices: writes.iter().map(|w| w.index).collect(),
        });
    }
}

/// Scripted [`Presenter`] cycling through a fixed number of images.
///
/// Images stay held from acquisition until they are presented. Once every image is
/// held, acquisition times out like a presentation engine with nothing left to give.
pub struct MockPresenter {
    backend: Option<Arc<MockBackend>>,
    image_count: u32,
    next_image: u32,
    out_of_date: bool,
    extent: vk::Extent2D,
    held: Vec<u32>,
    acquired: Vec<vk::Semaphore>,
    presented: Vec<(u32, Vec<vk::Semaphore>)>,
}

impl MockPresenter {
    pub fn new(image_count: u32) -> Self {
        Self {
            backend: None,
            image_count,
            next_image: 0,
            out_of_date: false,
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            held: Vec::new(),
            acquired: Vec::new(),
            presented: Vec::new(),
        }
    }

    /// A presenter that signals and consumes semaphores on `backend`, which from then
    /// on rejects misuse of binary semaphores.
    pub fn on(backend: Arc<MockBackend>, image_count: u32) -> Self {
        backend.state.lock().track_semaphores = true;
        Self {
            backend: Some(backend),
            ..Self::new(image_count)
        }
    }

    /// Number of images acquired and not yet presented.
    pub fn held_images(&self) -> usize {
        self.held.len()
    }

    /// Make the surface report out-of-date until cleared.
    pub fn set_out_of_date(&mut self, out_of_date: bool) {
        self.out_of_date = out_of_date;
    }

    /// Simulate swapchain recreation at a new size.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
        self.out_of_date = false;
        self.next_image = 0;
        self.held.clear();
    }

    /// Semaphores passed to each successful acquisition.
    pub fn acquired(&self) -> &[vk::Semaphore] {
        &self.acquired
    }

    /// Image index and wait semaphores of every present call.
    pub fn presented(&self) -> &[(u32, Vec<vk::Semaphore>)] {
        &self.presented
    }
}

impl Presenter for MockPresenter {
    fn acquire_next_image(
        &mut self,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> Result<AcquiredImage> {
        if self.out_of_date {
            return Err(GpuError::SurfaceOutOfDate);
        }
        if self.held.len() >= self.image_count as usize {
            return Err(GpuError::FenceTimeout {
                operation: "acquire_next_image",
                timeout,
            });
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count.max(1);
        self.held.push(index);
        self.acquired.push(signal);
        if let Some(backend) = &self.backend {
            backend.signal_semaphore(signal);
        }
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> Result<PresentOutcome> {
        if let Some(backend) = &self.backend {
            backend.wait_semaphores(wait);
        }
        if let Some(position) = self.held.iter().position(|&held| held == image_index) {
            self.held.remove(position);
        }
        self.presented.push((image_index, wait.to_vec()));
        if self.out_of_date {
            Ok(PresentOutcome::NeedsRecreate)
        } else {
            Ok(PresentOutcome::Presented)
        }
    }

    fn image(&self, index: u32) -> Option<vk::Image> {
        (index < self.image_count).then(|| vk::Image::from_raw(0x1_0000 + u64::from(index)))
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        vk::Format::B8G8R8A8_SRGB
    }
}
