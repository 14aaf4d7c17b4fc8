//! Node definitions and the contexts their hooks run in.
//!
//! A definition is the simulation-side state of one node. The type itself
//! describes the node's ports (`describe`), and each instance receives the
//! lifecycle hooks below. Definitions that declare data ports also provide a
//! [`Kernel`] which is moved into the render graph and runs once per cycle.

use super::buffer::{Buffer, BufferElement};
use super::data::{PortData, TypeTag};
use super::id::{InputPortArrayId, NodeHandle};
use super::kernel::Kernel;
use super::node_set::NodeSet;
use super::port::{Capability, DataOutput, InputPort, MessageOutput, NodeDescription, OutputPort};
use crate::error::{GraphError, GraphResult};
use std::any::Any;

/// Upcast helper so definitions can be recovered from `dyn NodeDefinition`.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Simulation-side behaviour of a node type.
///
/// Only `describe` is required. `handle_message` must be implemented by
/// definitions that advertise [`Capability::MessageHandler`](super::port::Capability)
/// and `create_kernel` by those advertising `Capability::Kernel`.
pub trait NodeDefinition: AsAny + Send {
    /// Declare ports and capabilities. Called once per definition type.
    fn describe(desc: &mut NodeDescription)
    where
        Self: Sized;

    /// Display name used in logs and errors.
    fn name() -> &'static str
    where
        Self: Sized,
    {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }

    /// Called right after creation; may create sub-nodes and forward ports.
    fn init(&mut self, _ctx: &mut InitContext<'_>) -> GraphResult<()> {
        Ok(())
    }

    /// Called once per `NodeSet::update`, in node index order.
    fn update(&mut self, _ctx: &mut UpdateContext<'_>) -> GraphResult<()> {
        Ok(())
    }

    /// Receives a message addressed to one of this node's message inputs.
    fn handle_message(&mut self, ctx: &mut MessageContext<'_>, _message: &dyn Any) -> GraphResult<()> {
        Err(GraphError::MissingCapability {
            node: ctx.handle(),
            definition: ctx.definition_name(),
            capability: Capability::MessageHandler.describe(),
        })
    }

    /// Called before the node is removed from the graph.
    fn destroy(&mut self, _ctx: &mut DestroyContext<'_>) -> GraphResult<()> {
        Ok(())
    }

    /// Produces the render-side half of this node.
    fn create_kernel(&self) -> Option<Box<dyn Kernel>> {
        None
    }
}

pub(crate) fn downcast_ref<D: NodeDefinition>(node: &dyn NodeDefinition) -> Option<&D> {
    AsAny::as_any(node).downcast_ref::<D>()
}

pub(crate) fn downcast_mut<D: NodeDefinition>(node: &mut dyn NodeDefinition) -> Option<&mut D> {
    AsAny::as_any_mut(node).downcast_mut::<D>()
}

/// Context for [`NodeDefinition::init`].
pub struct InitContext<'a> {
    pub(crate) set: &'a mut NodeSet,
    pub(crate) handle: NodeHandle,
}

impl InitContext<'_> {
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    /// The owning set, for creating and wiring sub-nodes.
    pub fn set(&mut self) -> &mut NodeSet {
        self.set
    }

    /// Redirect everything addressed to `port` on this node to `to_port` on `to`.
    pub fn forward_input<P: InputPort>(&mut self, port: P, to: NodeHandle, to_port: P) -> GraphResult<()> {
        self.set.forward_input(self.handle, port.id(), to, to_port.id())
    }

    /// Redirect connections from this node's `port` to `to_port` on `to`.
    pub fn forward_output<P: OutputPort>(&mut self, port: P, to: NodeHandle, to_port: P) -> GraphResult<()> {
        self.set.forward_output(self.handle, port.id(), to, to_port.id())
    }
}

/// Context for [`NodeDefinition::update`].
pub struct UpdateContext<'a> {
    pub(crate) set: &'a mut NodeSet,
    pub(crate) handle: NodeHandle,
}

impl UpdateContext<'_> {
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    /// Index of the cycle being prepared.
    pub fn cycle(&self) -> u64 {
        self.set.cycle()
    }

    pub fn emit<M: 'static>(&mut self, port: MessageOutput<M>, message: M) -> GraphResult<()> {
        self.set
            .emit_message(self.handle, port.port(), &message, TypeTag::of::<M>())
    }

    /// Queue a value for this node's kernel, delivered before its next run.
    pub fn update_kernel_data<T: Any + Send>(&mut self, data: T) -> GraphResult<()> {
        self.set.record_kernel_data(self.handle, Box::new(data))
    }

    pub fn set_buffer_size<E: BufferElement>(
        &mut self,
        port: DataOutput<Buffer<E>>,
        size: usize,
    ) -> GraphResult<()> {
        self.set.set_buffer_size(self.handle, port, size)
    }
}

/// Context for [`NodeDefinition::handle_message`].
pub struct MessageContext<'a> {
    pub(crate) set: &'a mut NodeSet,
    pub(crate) handle: NodeHandle,
    pub(crate) port: InputPortArrayId,
    pub(crate) definition: &'static str,
}

impl MessageContext<'_> {
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    /// The input the message arrived on, including its array slot.
    pub fn port(&self) -> InputPortArrayId {
        self.port
    }

    pub fn arrived_on<P: InputPort>(&self, port: P) -> bool {
        self.port.port == port.id()
    }

    pub(crate) fn definition_name(&self) -> &'static str {
        self.definition
    }

    pub fn emit<M: 'static>(&mut self, port: MessageOutput<M>, message: M) -> GraphResult<()> {
        self.set
            .emit_message(self.handle, port.port(), &message, TypeTag::of::<M>())
    }

    pub fn update_kernel_data<T: Any + Send>(&mut self, data: T) -> GraphResult<()> {
        self.set.record_kernel_data(self.handle, Box::new(data))
    }

    pub fn set_buffer_size<E: BufferElement>(
        &mut self,
        port: DataOutput<Buffer<E>>,
        size: usize,
    ) -> GraphResult<()> {
        self.set.set_buffer_size(self.handle, port, size)
    }

    pub fn set_sub_buffer_size<T: PortData>(
        &mut self,
        port: DataOutput<T>,
        field: usize,
        size: usize,
    ) -> GraphResult<()> {
        self.set.set_sub_buffer_size(self.handle, port, field, size)
    }

    pub fn set_port_array_size<P: InputPort>(&mut self, port: P, size: u16) -> GraphResult<()> {
        self.set.set_port_array_size(self.handle, port, size)
    }
}

/// Context for [`NodeDefinition::destroy`].
pub struct DestroyContext<'a> {
    pub(crate) set: &'a mut NodeSet,
    pub(crate) handle: NodeHandle,
}

impl DestroyContext<'_> {
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    /// Destroy a sub-node created during `init`.
    pub fn destroy(&mut self, node: NodeHandle) -> GraphResult<()> {
        self.set.destroy(node)
    }
}

/// Helpers shared by forwarding code paths.
pub(crate) fn forwarded_port_mismatch(
    kind: &str,
    from: NodeHandle,
    to: NodeHandle,
    reason: impl std::fmt::Display,
) -> GraphError {
    GraphError::invalid(format!(
        "Cannot forward {} from {} to {}: {}",
        kind, from, to, reason
    ))
}
