//! Node graph engine.
//!
//! The graph has two halves. The simulation world ([`NodeSet`]) owns node
//! definitions, topology and message routing, and runs entirely on the
//! caller's thread. The render world mirrors the data-carrying part of the
//! graph as kernels bound to shared port cells, and executes them each cycle
//! according to the selected [`RenderExecutionModel`].
//!
//! All structural changes made to the simulation world between two updates
//! are recorded in a diff, which the render graph applies in order at the
//! start of the next update.

pub mod buffer;
pub(crate) mod cell;
mod connections;
pub mod data;
pub mod definition;
pub(crate) mod diff;
pub mod graph_value;
pub mod id;
pub mod kernel;
mod messaging;
pub mod node_set;
pub mod port;
pub(crate) mod render;
pub mod scheduler;
pub mod topology;
pub(crate) mod traversal;

pub use buffer::{Buffer, BufferDescription, BufferElement, ElementType};
pub use data::{PortData, TypeTag, ValueType};
pub use definition::{AsAny, DestroyContext, InitContext, MessageContext, NodeDefinition, UpdateContext};
pub use graph_value::GraphValue;
pub use id::{AllocationId, ConnectionId, InputPortArrayId, InputPortId, NodeHandle, OutputPortId};
pub use kernel::{InputArray, InputView, Kernel, OutputView, RenderContext};
pub use node_set::NodeSet;
pub use port::{
    Capability, DataInput, DataInputArray, DataOutput, DomainInput, DomainOutput, InputPort,
    MessageInput, MessageInputArray, MessageOutput, NodeDescription, OutputPort, PortCategory,
    PortDescriptor, PortDirection,
};
pub use render::{BufferInfo, InputSource};
pub use scheduler::{DependencyToken, RenderExecutionModel};
pub use topology::{Connection, ConnectionKind, TopologyVersion};
pub use traversal::TraversalStats;
