//! Bindless descriptor table.
//!
//! One descriptor set holds a large, partially bound array of resources. Shaders index
//! it with a [`BindlessHandle`] baked into push constants or uniform data, so a handle
//! must keep meaning the same resource for as long as any recorded command buffer could
//! read it. Handles are therefore assigned from a monotonic counter and never reused
//! within one table.
//!
//! Handle 0 is the fallback: it must hold a valid resource before anything is drawn,
//! since shaders use it for "no texture".

use crate::backend::{
    BindlessDescriptorKind, BindlessLayoutDesc, DescriptorWrite, GpuBackend, ResourceBinding,
};
use crate::deletion::DeletionQueue;
use crate::error::{self, GpuError, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

/// Index of a resource in a [`BindlessTable`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct BindlessHandle(u32);

impl BindlessHandle {
    /// The fallback resource.
    pub const FALLBACK: Self = Self(0);

    /// Array element inside the bindless binding.
    pub const fn index(self) -> u32 {
        self.0
    }

    pub const fn is_fallback(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for BindlessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// Assigned but not yet written; only handle 0 is ever in this state.
    Empty,
    Live(ResourceBinding),
    Retired,
}

struct Allocation {
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    capacity: u32,
}

/// Fixed-capacity table of shader-visible resources.
pub struct BindlessTable<B: GpuBackend> {
    backend: Arc<B>,
    desc: BindlessLayoutDesc,
    layout: vk::DescriptorSetLayout,
    allocation: Option<Allocation>,
    /// Indexed by handle. Never shrinks.
    entries: Vec<Entry>,
}

impl<B: GpuBackend> BindlessTable<B> {
    /// Create the descriptor set layout and register its destruction in `global`.
    pub fn create_layout(
        backend: Arc<B>,
        desc: BindlessLayoutDesc,
        global: &mut DeletionQueue,
    ) -> Result<Self> {
        if desc.capacity == 0 {
            return error::precondition(GpuError::InvalidState(
                "bindless layout capacity must be at least 1".to_string(),
            ));
        }

        let layout = backend.create_bindless_layout(&desc)?;
        let teardown_backend = Arc::clone(&backend);
        global.push(move || teardown_backend.destroy_descriptor_set_layout(layout));

        tracing::debug!(
            binding = desc.binding,
            capacity = desc.capacity,
            kind = ?desc.kind,
            "bindless layout created"
        );

        Ok(Self {
            backend,
            desc,
            layout,
            allocation: None,
            entries: vec![Entry::Empty],
        })
    }

    /// Create the pool and the set sized for `capacity`.
    ///
    /// Teardown is registered as destroy-pool then free-set, so flushing `global`
    /// frees the set before the pool, and both before the layout.
    pub fn allocate(&mut self, capacity: u32, global: &mut DeletionQueue) -> Result<()> {
        if self.allocation.is_some() {
            return error::precondition(GpuError::InvalidState(
                "bindless table already allocated".to_string(),
            ));
        }
        if capacity == 0 || capacity > self.desc.capacity {
            return error::precondition(GpuError::InvalidState(format!(
                "bindless capacity {capacity} outside 1..={}",
                self.desc.capacity
            )));
        }

        let pool = self.backend.create_bindless_pool(&self.desc, capacity)?;
        let backend = Arc::clone(&self.backend);
        global.push(move || backend.destroy_descriptor_pool(pool));

        let set = self
            .backend
            .allocate_bindless_set(pool, self.layout, capacity)?;
        let backend = Arc::clone(&self.backend);
        global.push_fallible("free bindless set", move || {
            backend.free_descriptor_set(pool, set)
        });

        self.allocation = Some(Allocation {
            pool,
            set,
            capacity,
        });
        tracing::info!(capacity, "bindless table allocated");
        Ok(())
    }

    fn allocated(&self) -> Result<&Allocation> {
        match &self.allocation {
            Some(allocation) => Ok(allocation),
            None => error::precondition(GpuError::BindlessNotAllocated),
        }
    }

    fn check_kind(&self, binding: &ResourceBinding) -> Result<()> {
        if binding.matches(self.desc.kind) {
            Ok(())
        } else {
            error::precondition(GpuError::BindingKindMismatch {
                expected: self.desc.kind.name(),
                actual: binding.name(),
            })
        }
    }

    fn write(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.backend
            .write_descriptors(set, self.desc.binding, self.desc.kind, writes);
    }

    /// Populate handle 0. Replaces any previous fallback.
    pub fn set_fallback(&mut self, binding: ResourceBinding) -> Result<()> {
        let set = self.allocated()?.set;
        self.check_kind(&binding)?;

        self.write(
            set,
            &[DescriptorWrite {
                index: BindlessHandle::FALLBACK.index(),
                binding,
            }],
        );
        self.entries[0] = Entry::Live(binding);
        tracing::debug!("bindless fallback populated");
        Ok(())
    }

    /// Assign the next handle to `binding` and write it into the set.
    pub fn register(&mut self, binding: ResourceBinding) -> Result<BindlessHandle> {
        let mut handles = self.register_batch(std::slice::from_ref(&binding))?;
        handles
            .pop()
            .ok_or_else(|| GpuError::InvalidState("empty registration result".to_string()))
    }

    /// Assign consecutive handles to `bindings` and write them with one update call.
    ///
    /// Either every binding is registered or none is.
    pub fn register_batch(&mut self, bindings: &[ResourceBinding]) -> Result<Vec<BindlessHandle>> {
        let allocation = self.allocated()?;
        let (set, capacity) = (allocation.set, allocation.capacity);
        for binding in bindings {
            self.check_kind(binding)?;
        }

        let requested = u32::try_from(bindings.len()).unwrap_or(u32::MAX);
        let first = self.next_index();
        if first
            .checked_add(requested)
            .map_or(true, |end| end > capacity)
        {
            tracing::warn!(capacity, requested, assigned = first, "bindless table full");
            return Err(GpuError::BindlessCapacityExceeded {
                capacity,
                requested,
            });
        }
        if bindings.is_empty() {
            return Ok(Vec::new());
        }

        let writes: Vec<DescriptorWrite> = bindings
            .iter()
            .zip(first..)
            .map(|(&binding, index)| DescriptorWrite { index, binding })
            .collect();
        self.write(set, &writes);

        self.entries
            .extend(bindings.iter().map(|&binding| Entry::Live(binding)));
        tracing::debug!(first, count = requested, "bindless handles registered");

        Ok(writes
            .iter()
            .map(|write| BindlessHandle(write.index))
            .collect())
    }

    /// Rewrite a live slot in place.
    ///
    /// In-flight work must not read `handle` while it is being replaced.
    pub fn update(&mut self, handle: BindlessHandle, binding: ResourceBinding) -> Result<()> {
        let set = self.allocated()?.set;
        self.check_kind(&binding)?;
        let entry = self.live_entry_mut(handle)?;
        *entry = Entry::Live(binding);

        self.write(
            set,
            &[DescriptorWrite {
                index: handle.index(),
                binding,
            }],
        );
        Ok(())
    }

    /// Retire `handle` and schedule its resource's teardown in `queue`.
    ///
    /// The handle value is never assigned again. Pass the per-frame queue of the last
    /// frame that used the resource so the teardown waits for that frame's fence.
    pub fn retire<F>(
        &mut self,
        handle: BindlessHandle,
        queue: &mut DeletionQueue,
        teardown: F,
    ) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if handle.is_fallback() {
            return error::precondition(GpuError::InvalidState(
                "the fallback handle cannot be retired".to_string(),
            ));
        }
        let entry = self.live_entry_mut(handle)?;
        *entry = Entry::Retired;
        queue.push(teardown);
        tracing::debug!(%handle, "bindless handle retired");
        Ok(())
    }

    fn live_entry_mut(&mut self, handle: BindlessHandle) -> Result<&mut Entry> {
        match self.entries.get_mut(handle.index() as usize) {
            Some(entry @ Entry::Live(_)) => Ok(entry),
            _ => error::precondition(GpuError::UnknownHandle(handle.index())),
        }
    }

    fn next_index(&self) -> u32 {
        u32::try_from(self.entries.len()).unwrap_or(u32::MAX)
    }

    /// The binding behind a live handle.
    pub fn resolve(&self, handle: BindlessHandle) -> Option<ResourceBinding> {
        match self.entries.get(handle.index() as usize) {
            Some(Entry::Live(binding)) => Some(*binding),
            _ => None,
        }
    }

    /// Fail unless handle 0 holds a fallback resource.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            error::precondition(GpuError::SentinelUnset)
        }
    }

    /// Whether draws may reference the table.
    pub fn is_ready(&self) -> bool {
        matches!(self.entries[0], Entry::Live(_))
    }

    /// Layout for pipeline layout construction.
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The descriptor set, once allocated.
    pub fn set(&self) -> Option<vk::DescriptorSet> {
        self.allocation.as_ref().map(|a| a.set)
    }

    /// The pool backing the set, once allocated.
    pub fn pool(&self) -> Option<vk::DescriptorPool> {
        self.allocation.as_ref().map(|a| a.pool)
    }

    /// Binding index of the array inside the set.
    pub fn binding(&self) -> u32 {
        self.desc.binding
    }

    pub fn kind(&self) -> BindlessDescriptorKind {
        self.desc.kind
    }

    /// Allocated capacity, or the layout capacity before allocation.
    pub fn capacity(&self) -> u32 {
        self.allocation
            .as_ref()
            .map_or(self.desc.capacity, |a| a.capacity)
    }

    /// Number of handles assigned so far, including the fallback.
    pub fn len(&self) -> u32 {
        self.next_index()
    }

    /// Number of handles that currently resolve.
    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, Entry::Live(_)))
            .count()
    }
}

impl<B: GpuBackend> std::fmt::Debug for BindlessTable<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindlessTable")
            .field("binding", &self.desc.binding)
            .field("capacity", &self.capacity())
            .field("assigned", &self.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;
    use crate::mock::{MockBackend, MockCall};
    use ash::vk::Handle;

    fn image(raw: u64) -> ResourceBinding {
        ResourceBinding::sampled_image(vk::ImageView::from_raw(raw), vk::Sampler::from_raw(1))
    }

    fn table(capacity: u32) -> (Arc<MockBackend>, BindlessTable<MockBackend>, DeletionQueue) {
        let backend = Arc::new(MockBackend::new());
        let mut global = DeletionQueue::new();
        let desc = BindlessLayoutDesc {
            capacity,
            ..BindlessLayoutDesc::default()
        };
        let mut table =
            BindlessTable::create_layout(Arc::clone(&backend), desc, &mut global).expect("layout");
        table.allocate(capacity, &mut global).expect("allocate");
        (backend, table, global)
    }

    #[test]
    fn handles_start_after_fallback_and_increase() {
        let (_backend, mut table, mut global) = table(16);
        table.set_fallback(image(100)).expect("fallback");

        let handles: Vec<u32> = (0..5)
            .map(|i| table.register(image(200 + i)).expect("register").index())
            .collect();
        assert_eq!(handles, [1, 2, 3, 4, 5]);
        assert_eq!(table.resolve(BindlessHandle(3)), Some(image(202)));
        assert_eq!(table.resolve(BindlessHandle::FALLBACK), Some(image(100)));

        global.flush();
    }

    #[test]
    fn retired_handles_are_never_reassigned() {
        let (_backend, mut table, mut global) = table(16);
        let a = table.register(image(1)).expect("register");
        let b = table.register(image(2)).expect("register");

        let mut frame_queue = DeletionQueue::new();
        table.retire(a, &mut frame_queue, || {}).expect("retire");
        frame_queue.flush();

        let c = table.register(image(3)).expect("register");
        assert!(c > b);
        assert_eq!(table.resolve(a), None);
        assert_eq!(table.live_count(), 2);

        global.flush();
    }

    #[test]
    fn batch_is_all_or_nothing_at_capacity() {
        let (backend, mut table, mut global) = table(4);
        table.set_fallback(image(1)).expect("fallback");
        table
            .register_batch(&[image(2), image(3)])
            .expect("fits");
        backend.take_calls();

        let err = table
            .register_batch(&[image(4), image(5)])
            .expect_err("one slot left");
        assert!(matches!(
            err,
            GpuError::BindlessCapacityExceeded {
                capacity: 4,
                requested: 2
            }
        ));
        assert_eq!(err.severity(), Severity::Recoverable);
        assert_eq!(table.len(), 3);
        assert!(backend.calls().is_empty(), "rejected batch must not write");

        let last = table.register(image(4)).expect("last slot");
        assert_eq!(last.index(), 3);
        assert!(table.register(image(5)).is_err());

        global.flush();
    }

    #[test]
    fn batch_registration_issues_one_update() {
        let (backend, mut table, mut global) = table(64);
        backend.take_calls();

        let bindings: Vec<_> = (10..20).map(image).collect();
        let handles = table.register_batch(&bindings).expect("batch");
        assert_eq!(handles.first().map(|h| h.index()), Some(1));
        assert_eq!(handles.last().map(|h| h.index()), Some(10));

        let set = table.set().expect("allocated");
        assert_eq!(
            backend.calls(),
            vec![MockCall::WriteDescriptors {
                set,
                binding: 1,
                indices: (1..=10).collect(),
            }]
        );
        assert_eq!(backend.descriptor(set, 1, 10), Some(image(19)));

        global.flush();
    }

    #[test]
    fn update_rewrites_a_live_slot() {
        let (backend, mut table, mut global) = table(8);
        let handle = table.register(image(1)).expect("register");
        table.update(handle, image(2)).expect("update");

        let set = table.set().expect("allocated");
        assert_eq!(table.resolve(handle), Some(image(2)));
        assert_eq!(backend.descriptor(set, 1, handle.index()), Some(image(2)));

        global.flush();
    }

    #[test]
    fn teardown_frees_set_then_pool_then_layout() {
        let (backend, table, mut global) = table(8);
        let (layout, pool, set) = (
            table.layout(),
            table.pool().expect("pool"),
            table.set().expect("set"),
        );
        backend.take_calls();

        global.flush();
        assert_eq!(
            backend.calls(),
            vec![
                MockCall::FreeSet(set),
                MockCall::DestroyPool(pool),
                MockCall::DestroyLayout(layout),
            ]
        );
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn sentinel_is_ready_once_populated() {
        let (_backend, mut table, mut global) = table(8);
        assert!(!table.is_ready());
        table.set_fallback(image(9)).expect("fallback");
        assert!(table.is_ready());
        assert!(table.ensure_ready().is_ok());
        global.flush();
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "precondition violated"))]
    fn unpopulated_sentinel_is_reported() {
        let (_backend, table, mut global) = table(8);
        let err = table.ensure_ready().expect_err("no fallback");
        assert!(matches!(err, GpuError::SentinelUnset));
        global.flush();
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "precondition violated"))]
    fn registration_requires_allocation() {
        let backend = Arc::new(MockBackend::new());
        let mut global = DeletionQueue::new();
        let mut table =
            BindlessTable::create_layout(backend, BindlessLayoutDesc::default(), &mut global)
                .expect("layout");

        let err = table.register(image(1)).expect_err("not allocated");
        assert!(matches!(err, GpuError::BindlessNotAllocated));
        global.flush();
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "precondition violated"))]
    fn buffer_rejected_by_image_table() {
        let (_backend, mut table, mut global) = table(8);
        let err = table
            .register(ResourceBinding::whole_buffer(vk::Buffer::from_raw(7)))
            .expect_err("kind mismatch");
        assert!(matches!(
            err,
            GpuError::BindingKindMismatch {
                expected: "image",
                actual: "buffer"
            }
        ));
        global.flush();
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "precondition violated"))]
    fn second_allocation_is_rejected() {
        let (_backend, mut table, mut global) = table(8);
        let err = table.allocate(8, &mut global).expect_err("already allocated");
        assert!(matches!(err, GpuError::InvalidState(_)));
        global.flush();
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "precondition violated"))]
    fn fallback_cannot_be_retired() {
        let (_backend, mut table, mut global) = table(8);
        table.set_fallback(image(100)).expect("fallback");
        let mut frame = DeletionQueue::new();

        let err = table
            .retire(BindlessHandle::FALLBACK, &mut frame, || {})
            .expect_err("fallback is permanent");
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert!(frame.is_empty());
        assert!(table.is_ready());
        global.flush();
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "precondition violated"))]
    fn handle_cannot_be_retired_twice() {
        let (_backend, mut table, mut global) = table(8);
        let handle = table.register(image(5)).expect("register");
        let mut frame = DeletionQueue::new();
        table.retire(handle, &mut frame, || {}).expect("retire");

        let err = table
            .retire(handle, &mut frame, || {})
            .expect_err("already retired");
        assert!(matches!(err, GpuError::UnknownHandle(index) if index == handle.index()));
        assert_eq!(frame.len(), 1);
        frame.flush();
        global.flush();
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "precondition violated"))]
    fn retired_handle_cannot_be_updated() {
        let (backend, mut table, mut global) = table(8);
        let handle = table.register(image(5)).expect("register");
        let mut frame = DeletionQueue::new();
        table.retire(handle, &mut frame, || {}).expect("retire");
        let set = table.set().expect("set");

        let err = table.update(handle, image(6)).expect_err("retired");
        assert!(matches!(err, GpuError::UnknownHandle(_)));
        assert_eq!(backend.descriptor(set, table.binding(), handle.index()), Some(image(5)));
        assert_eq!(table.resolve(handle), None);
        frame.flush();
        global.flush();
    }

    #[test]
    fn handle_is_plain_data() {
        let handles = [BindlessHandle(7), BindlessHandle::FALLBACK];
        let raw: &[u32] = bytemuck::cast_slice(&handles);
        assert_eq!(raw, [7, 0]);
        assert_eq!(BindlessHandle::default(), BindlessHandle::FALLBACK);
    }
}
