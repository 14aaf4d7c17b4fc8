//! Readback handles for data outputs.
//!
//! A [`GraphValue`] names one data output of one node. Reading it joins any
//! outstanding render work and copies the value out of the render graph, so
//! results are always those of the most recently completed cycle.

use super::buffer::{Buffer, BufferElement};
use super::data::{PortData, TypeTag};
use super::id::{NodeHandle, OutputPortId};
use super::node_set::NodeSet;
use super::port::DataOutput;
use crate::error::{GraphError, GraphResult};
use std::fmt;
use std::marker::PhantomData;

/// Typed readback handle returned by [`NodeSet::request_readback`].
pub struct GraphValue<T> {
    slot: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for GraphValue<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GraphValue<T> {}

impl<T> fmt::Debug for GraphValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GraphValue<{}>({}:{})",
            std::any::type_name::<T>(),
            self.slot,
            self.generation
        )
    }
}

#[derive(Clone, Copy, Debug)]
enum Entry {
    Active { node: NodeHandle, port: OutputPortId },
    /// The node went away; reads fail until the handle is released.
    Invalidated,
}

#[derive(Debug)]
struct TableSlot {
    generation: u32,
    entry: Option<Entry>,
}

/// Storage behind every outstanding [`GraphValue`].
#[derive(Debug, Default)]
pub(crate) struct GraphValueTable {
    slots: Vec<TableSlot>,
    free: Vec<u32>,
}

impl GraphValueTable {
    fn insert(&mut self, node: NodeHandle, port: OutputPortId) -> (u32, u32) {
        let entry = Some(Entry::Active { node, port });
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = entry;
                (index, slot.generation)
            }
            None => {
                self.slots.push(TableSlot { generation: 1, entry });
                ((self.slots.len() - 1) as u32, 1)
            }
        }
    }

    fn entry<T>(&self, value: &GraphValue<T>) -> GraphResult<Entry> {
        self.slots
            .get(value.slot as usize)
            .filter(|slot| slot.generation == value.generation)
            .and_then(|slot| slot.entry)
            .ok_or_else(|| GraphError::invalid(format!("{:?} has been released", value)))
    }

    fn target<T>(&self, value: &GraphValue<T>) -> GraphResult<(NodeHandle, OutputPortId)> {
        match self.entry(value)? {
            Entry::Active { node, port } => Ok((node, port)),
            Entry::Invalidated => Err(GraphError::invalid(format!(
                "{:?} refers to a destroyed node",
                value
            ))),
        }
    }

    fn release<T>(&mut self, value: &GraphValue<T>) -> GraphResult<()> {
        self.entry(value)?;
        let slot = &mut self.slots[value.slot as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(value.slot);
        Ok(())
    }

    pub(crate) fn invalidate_node(&mut self, node: NodeHandle) {
        for slot in &mut self.slots {
            if matches!(slot.entry, Some(Entry::Active { node: n, .. }) if n == node) {
                slot.entry = Some(Entry::Invalidated);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }
}

impl NodeSet {
    /// Create a readback handle for a data output. Forwarded outputs resolve
    /// to the node that actually produces the value.
    pub fn request_readback<T: PortData>(
        &mut self,
        handle: NodeHandle,
        port: DataOutput<T>,
    ) -> GraphResult<GraphValue<T>> {
        let (node, output) = self.resolve_output(handle, port.port())?;
        let descriptor = self.live(node)?.description.output(output)?;
        if !descriptor.is_data() {
            return Err(GraphError::invalid(format!(
                "Cannot read back '{}' of {}: not a data output",
                descriptor.name, node
            )));
        }
        if descriptor.payload != TypeTag::of::<T>() {
            return Err(GraphError::TypeMismatch {
                expected: descriptor.payload.name(),
                found: std::any::type_name::<T>(),
            });
        }
        let (slot, generation) = self.values.insert(node, output);
        Ok(GraphValue {
            slot,
            generation,
            _marker: PhantomData,
        })
    }

    /// Value of the output as of the last completed cycle.
    pub fn read_value<T: PortData>(&mut self, value: &GraphValue<T>) -> GraphResult<T> {
        let (node, port) = self.values.target(value)?;
        self.sync()?;
        self.render.read_output::<T>(node, port)
    }

    /// Contents of a buffer output as of the last completed cycle.
    pub fn read_buffer<E: BufferElement>(&mut self, value: &GraphValue<Buffer<E>>) -> GraphResult<Vec<E>> {
        let (node, port) = self.values.target(value)?;
        self.sync()?;
        self.render.read_buffer::<E>(node, port, 0)
    }

    pub fn release_readback<T>(&mut self, value: GraphValue<T>) -> GraphResult<()> {
        self.values.release(&value)
    }

    /// Number of unreleased readback handles.
    pub fn readback_count(&self) -> usize {
        self.values.len()
    }
}
