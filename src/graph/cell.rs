//! Storage cells of the render graph.
//!
//! Every data output owns one [`PortCell`] behind an `Arc<RwLock<_>>`. Data
//! inputs never copy: they bind to the producer's cell, to the feedback latch
//! of the edge, to a value they own, or to the shared blank cell of their
//! type. Resizing swaps storage inside a cell, so existing bindings stay
//! valid.

use super::buffer::AllocatedBuffer;
use super::data::{DataValue, ValueType};
use super::id::{AllocationId, NodeHandle, OutputPortId};
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

pub(crate) type SharedCell = Arc<RwLock<PortCell>>;

/// A data value plus storage for each of its buffer fields.
pub(crate) struct PortCell {
    pub(crate) value: Box<dyn DataValue>,
    pub(crate) buffers: Vec<Option<AllocatedBuffer>>,
    pub(crate) owner: NodeHandle,
}

impl PortCell {
    /// Default value with every buffer descriptor owned by `owner`.
    pub(crate) fn new(ty: &ValueType, owner: NodeHandle) -> Self {
        let mut cell = Self {
            value: ty.make_default(),
            buffers: (0..ty.buffer_fields()).map(|_| None).collect(),
            owner,
        };
        cell.restamp();
        cell
    }

    pub(crate) fn owned(value: Box<dyn DataValue>) -> Self {
        Self {
            value,
            buffers: Vec::new(),
            owner: NodeHandle::INVALID,
        }
    }

    /// Write the authoritative allocation state back into the value.
    pub(crate) fn restamp(&mut self) {
        for (field, buffer) in self.buffers.iter().enumerate() {
            if let Some(desc) = self.value.buffer_field_mut(field) {
                desc.assign(buffer.as_ref());
                desc.set_owner(self.owner);
            }
        }
    }

    pub(crate) fn find_allocation(&self, id: AllocationId) -> Option<&AllocatedBuffer> {
        self.buffers.iter().flatten().find(|buffer| buffer.id == id)
    }
}

impl Clone for PortCell {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone_value(),
            buffers: self.buffers.clone(),
            owner: self.owner,
        }
    }
}

/// Where a data input slot reads from.
#[derive(Clone)]
pub(crate) enum InputBinding {
    /// Shared immutable default of the port type
    Blank(Arc<PortCell>),
    /// Value set directly or retained across a disconnect
    Owned(Arc<PortCell>),
    /// Alias of the producer's output cell
    Connected {
        cell: SharedCell,
        source: NodeHandle,
        port: OutputPortId,
    },
    /// Alias of the latch cell of a feedback edge
    Feedback {
        cell: SharedCell,
        source: NodeHandle,
        port: OutputPortId,
    },
}

impl InputBinding {
    pub(crate) fn read(&self) -> SlotGuard<'_> {
        match self {
            InputBinding::Blank(cell) | InputBinding::Owned(cell) => SlotGuard::Shared(cell),
            InputBinding::Connected { cell, .. } | InputBinding::Feedback { cell, .. } => {
                SlotGuard::Locked(cell.read())
            }
        }
    }

    /// Copy of whatever the slot currently observes.
    pub(crate) fn snapshot(&self) -> PortCell {
        (*self.read()).clone()
    }

    pub(crate) fn is_aliased(&self) -> bool {
        matches!(
            self,
            InputBinding::Connected { .. } | InputBinding::Feedback { .. }
        )
    }
}

/// Read access to one input slot for the duration of a kernel run.
pub(crate) enum SlotGuard<'a> {
    Shared(&'a PortCell),
    Locked(RwLockReadGuard<'a, PortCell>),
}

impl Deref for SlotGuard<'_> {
    type Target = PortCell;

    fn deref(&self) -> &PortCell {
        match self {
            SlotGuard::Shared(cell) => cell,
            SlotGuard::Locked(guard) => guard,
        }
    }
}

/// Blank cells, one per value type, shared by every unbound input.
#[derive(Default)]
pub(crate) struct BlankCells {
    cells: HashMap<std::any::TypeId, Arc<PortCell>>,
}

impl BlankCells {
    pub(crate) fn get(&mut self, ty: &ValueType) -> Arc<PortCell> {
        self.cells
            .entry(ty.tag().id())
            .or_insert_with(|| Arc::new(PortCell::new(ty, NodeHandle::INVALID)))
            .clone()
    }
}
