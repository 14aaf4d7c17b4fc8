//! Buffers carried inside data port values.
//!
//! A [`Buffer<E>`] is only a descriptor: allocation identity, length and the
//! owning node. The elements live in the producing node's output cell in the
//! render graph and are reached through a `RenderContext`. Resizing is a
//! structural operation requested from the simulation world and applied
//! during world alignment.

use super::data::PortData;
use super::id::{AllocationId, NodeHandle};
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Element types storable in a buffer.
pub trait BufferElement: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> BufferElement for T {}

/// Runtime identity of a buffer element type plus its allocator.
#[derive(Clone, Copy)]
pub struct ElementType {
    id: TypeId,
    name: &'static str,
    allocate: fn(usize) -> Box<dyn BufferStorage>,
}

impl ElementType {
    pub fn of<E: BufferElement>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
            allocate: |len| Box::new(vec![E::default(); len]),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<E: 'static>(&self) -> bool {
        self.id == TypeId::of::<E>()
    }
}

impl PartialEq for ElementType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ElementType {}

impl fmt::Debug for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElementType({})", self.name)
    }
}

/// Descriptor of one buffer field: which allocation, how long, who owns it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDescription {
    allocation: Option<AllocationId>,
    len: usize,
    owner: NodeHandle,
    element: ElementType,
}

impl BufferDescription {
    pub(crate) fn empty(element: ElementType) -> Self {
        Self {
            allocation: None,
            len: 0,
            owner: NodeHandle::INVALID,
            element,
        }
    }

    /// `None` while unsized or after resizing to zero.
    pub fn allocation(&self) -> Option<AllocationId> {
        self.allocation
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn owner(&self) -> NodeHandle {
        self.owner
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub(crate) fn set_owner(&mut self, owner: NodeHandle) {
        self.owner = owner;
    }

    pub(crate) fn assign(&mut self, allocation: Option<&AllocatedBuffer>) {
        match allocation {
            Some(buffer) => {
                self.allocation = Some(buffer.id);
                self.len = buffer.storage.len();
            }
            None => {
                self.allocation = None;
                self.len = 0;
            }
        }
    }
}

/// Typed buffer descriptor embedded in a data port value.
pub struct Buffer<E> {
    description: BufferDescription,
    _marker: PhantomData<fn() -> E>,
}

impl<E: BufferElement> Buffer<E> {
    pub fn len(&self) -> usize {
        self.description.len
    }

    pub fn is_empty(&self) -> bool {
        self.description.len == 0
    }

    pub fn allocation(&self) -> Option<AllocationId> {
        self.description.allocation
    }

    pub fn owner(&self) -> NodeHandle {
        self.description.owner
    }

    pub fn description(&self) -> &BufferDescription {
        &self.description
    }

    /// Mutable access for [`PortData`] implementations of aggregate values.
    /// The render graph re-stamps descriptors after every kernel run, so
    /// edits made through this reference never reach other nodes.
    pub fn description_mut(&mut self) -> &mut BufferDescription {
        &mut self.description
    }
}

impl<E: BufferElement> Default for Buffer<E> {
    fn default() -> Self {
        Self {
            description: BufferDescription::empty(ElementType::of::<E>()),
            _marker: PhantomData,
        }
    }
}

impl<E> Clone for Buffer<E> {
    fn clone(&self) -> Self {
        Self {
            description: self.description.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E> fmt::Debug for Buffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("element", &self.description.element.name)
            .field("allocation", &self.description.allocation)
            .field("len", &self.description.len)
            .field("owner", &self.description.owner)
            .finish()
    }
}

impl<E: BufferElement> PortData for Buffer<E> {
    const BUFFER_FIELDS: usize = 1;

    fn buffer_field(&self, field: usize) -> Option<&BufferDescription> {
        (field == 0).then_some(&self.description)
    }

    fn buffer_field_mut(&mut self, field: usize) -> Option<&mut BufferDescription> {
        (field == 0).then_some(&mut self.description)
    }
}

/// Type-erased element storage.
pub trait BufferStorage: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn len(&self) -> usize;
    fn clone_storage(&self) -> Box<dyn BufferStorage>;
}

impl<E: BufferElement> BufferStorage for Vec<E> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn clone_storage(&self) -> Box<dyn BufferStorage> {
        Box::new(self.clone())
    }
}

static NEXT_ALLOCATION: AtomicU64 = AtomicU64::new(1);

/// Storage of one live allocation, owned by an output cell.
pub(crate) struct AllocatedBuffer {
    pub(crate) id: AllocationId,
    pub(crate) storage: Box<dyn BufferStorage>,
}

impl AllocatedBuffer {
    /// Zeroed storage under a fresh identity; `None` for zero length.
    pub(crate) fn allocate(element: ElementType, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Self {
            id: AllocationId(NEXT_ALLOCATION.fetch_add(1, Ordering::Relaxed)),
            storage: (element.allocate)(len),
        })
    }

    pub(crate) fn slice<E: 'static>(&self) -> Option<&[E]> {
        self.storage
            .as_any()
            .downcast_ref::<Vec<E>>()
            .map(|v| v.as_slice())
    }

    pub(crate) fn slice_mut<E: 'static>(&mut self) -> Option<&mut [E]> {
        self.storage
            .as_any_mut()
            .downcast_mut::<Vec<E>>()
            .map(|v| v.as_mut_slice())
    }
}

impl Clone for AllocatedBuffer {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            storage: self.storage.clone_storage(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_buffer_is_unsized() {
        let buffer = Buffer::<f32>::default();
        assert!(buffer.is_empty());
        assert_eq!(buffer.allocation(), None);
        assert!(!buffer.owner().is_valid());
        assert!(buffer.description().element().is::<f32>());
    }

    #[test]
    fn test_allocation_ids_are_unique() {
        let element = ElementType::of::<u32>();
        let a = AllocatedBuffer::allocate(element, 4).unwrap();
        let b = AllocatedBuffer::allocate(element, 4).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.slice::<u32>().unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_zero_length_allocation_is_none() {
        assert!(AllocatedBuffer::allocate(ElementType::of::<u8>(), 0).is_none());
    }

    #[test]
    fn test_descriptor_assign() {
        let element = ElementType::of::<f64>();
        let allocated = AllocatedBuffer::allocate(element, 15).unwrap();
        let mut desc = BufferDescription::empty(element);
        desc.assign(Some(&allocated));
        assert_eq!(desc.len(), 15);
        assert_eq!(desc.allocation(), Some(allocated.id));
        desc.assign(None);
        assert_eq!(desc.len(), 0);
        assert_eq!(desc.allocation(), None);
    }

    #[test]
    fn test_wrong_element_slice_is_none() {
        let allocated = AllocatedBuffer::allocate(ElementType::of::<f32>(), 2).unwrap();
        assert!(allocated.slice::<u64>().is_none());
    }
}
