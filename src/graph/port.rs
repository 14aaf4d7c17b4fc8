//! Port declarations.
//!
//! Definitions declare their ports as typed constants and register them in a
//! [`NodeDescription`]. The typed handles carry the payload type at compile
//! time; the description keeps the runtime [`PortDescriptor`] used for
//! validation by the simulation world and for allocation by the render graph.
//!
//! ```ignore
//! struct Gain;
//! impl Gain {
//!     const INPUT: DataInput<f32> = DataInput::new(0);
//!     const FACTOR: MessageInput<f32> = MessageInput::new(1);
//!     const OUTPUT: DataOutput<f32> = DataOutput::new(0);
//! }
//!
//! fn describe(desc: &mut NodeDescription) {
//!     desc.data_input(Gain::INPUT, "input")
//!         .message_input(Gain::FACTOR, "factor")
//!         .data_output(Gain::OUTPUT, "output");
//! }
//! ```

use super::data::{PortData, TypeTag, ValueType};
use super::id::{InputPortId, OutputPortId};
use crate::error::{GraphError, GraphResult};
use std::fmt;
use std::marker::PhantomData;

/// Category of a port and of the connections between ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortCategory {
    /// Discrete payloads delivered immediately in the simulation world
    Message,
    /// Per-cycle values produced and consumed by kernels
    Data,
    /// Typed links owned by an external domain; carried but not interpreted
    Domain,
}

/// Direction of a port relative to its node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Runtime description of one declared port.
#[derive(Clone, Debug)]
pub struct PortDescriptor {
    pub name: &'static str,
    pub category: PortCategory,
    pub direction: PortDirection,
    pub payload: TypeTag,
    pub is_array: bool,
    pub(crate) value_type: Option<ValueType>,
}

impl PortDescriptor {
    pub fn value_type(&self) -> Option<&ValueType> {
        self.value_type.as_ref()
    }

    pub fn has_buffers(&self) -> bool {
        self.value_type.is_some_and(|ty| ty.has_buffers())
    }

    pub fn is_data(&self) -> bool {
        self.category == PortCategory::Data
    }

    pub fn is_message(&self) -> bool {
        self.category == PortCategory::Message
    }
}

/// Typed input port handles.
pub trait InputPort: Copy {
    type Payload: 'static;
    const CATEGORY: PortCategory;
    const ARRAY: bool;

    fn id(self) -> InputPortId;
}

/// Typed output port handles.
pub trait OutputPort: Copy {
    type Payload: 'static;
    const CATEGORY: PortCategory;

    fn id(self) -> OutputPortId;
}

macro_rules! typed_port {
    ($(#[$doc:meta])* $name:ident, $id:ident, $category:ident) => {
        $(#[$doc])*
        pub struct $name<T> {
            id: $id,
            _marker: PhantomData<fn() -> T>,
        }

        impl<T> $name<T> {
            pub const fn new(index: u16) -> Self {
                Self {
                    id: $id(index),
                    _marker: PhantomData,
                }
            }

            pub fn port(self) -> $id {
                self.id
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> Copy for $name<T> {}

        impl<T> PartialEq for $name<T> {
            fn eq(&self, other: &Self) -> bool {
                self.id == other.id
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}<{}>({:?})", stringify!($name), std::any::type_name::<T>(), self.id)
            }
        }
    };
}

macro_rules! typed_input {
    ($(#[$doc:meta])* $name:ident, $category:ident, $array:expr) => {
        typed_port!($(#[$doc])* $name, InputPortId, $category);

        impl<T: 'static> InputPort for $name<T> {
            type Payload = T;
            const CATEGORY: PortCategory = PortCategory::$category;
            const ARRAY: bool = $array;

            fn id(self) -> InputPortId {
                self.id
            }
        }
    };
}

macro_rules! typed_output {
    ($(#[$doc:meta])* $name:ident, $category:ident) => {
        typed_port!($(#[$doc])* $name, OutputPortId, $category);

        impl<T: 'static> OutputPort for $name<T> {
            type Payload = T;
            const CATEGORY: PortCategory = PortCategory::$category;

            fn id(self) -> OutputPortId {
                self.id
            }
        }
    };
}

typed_input!(
    /// Message input; requires the node to handle messages.
    MessageInput, Message, false
);
typed_input!(
    /// Array of message inputs, sized per node.
    MessageInputArray, Message, true
);
typed_output!(
    /// Message output.
    MessageOutput, Message
);
typed_input!(
    /// Data input read by the node's kernel.
    DataInput, Data, false
);
typed_input!(
    /// Array of data inputs, sized per node.
    DataInputArray, Data, true
);
typed_output!(
    /// Data output written by the node's kernel.
    DataOutput, Data
);
typed_input!(DomainInput, Domain, false);
typed_output!(DomainOutput, Domain);

/// Capabilities a definition advertises beyond its port list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Implements `NodeDefinition::handle_message`
    MessageHandler,
    /// Implements `NodeDefinition::create_kernel`
    Kernel,
}

impl Capability {
    pub fn describe(self) -> &'static str {
        match self {
            Capability::MessageHandler => "a message handler",
            Capability::Kernel => "a kernel",
        }
    }
}

/// Ports and capabilities of a node definition.
#[derive(Clone, Debug)]
pub struct NodeDescription {
    name: &'static str,
    inputs: Vec<PortDescriptor>,
    outputs: Vec<PortDescriptor>,
    capabilities: Vec<Capability>,
    problems: Vec<String>,
}

impl NodeDescription {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            inputs: Vec::new(),
            outputs: Vec::new(),
            capabilities: Vec::new(),
            problems: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn message_input<M: 'static>(&mut self, port: MessageInput<M>, name: &'static str) -> &mut Self {
        self.push_input(port.port(), name, PortCategory::Message, TypeTag::of::<M>(), false, None)
    }

    pub fn message_input_array<M: 'static>(
        &mut self,
        port: MessageInputArray<M>,
        name: &'static str,
    ) -> &mut Self {
        self.push_input(port.port(), name, PortCategory::Message, TypeTag::of::<M>(), true, None)
    }

    pub fn message_output<M: 'static>(&mut self, port: MessageOutput<M>, name: &'static str) -> &mut Self {
        self.push_output(port.port(), name, PortCategory::Message, TypeTag::of::<M>(), None)
    }

    pub fn data_input<T: PortData>(&mut self, port: DataInput<T>, name: &'static str) -> &mut Self {
        let ty = ValueType::of::<T>();
        self.push_input(port.port(), name, PortCategory::Data, ty.tag(), false, Some(ty))
    }

    pub fn data_input_array<T: PortData>(
        &mut self,
        port: DataInputArray<T>,
        name: &'static str,
    ) -> &mut Self {
        let ty = ValueType::of::<T>();
        self.push_input(port.port(), name, PortCategory::Data, ty.tag(), true, Some(ty))
    }

    pub fn data_output<T: PortData>(&mut self, port: DataOutput<T>, name: &'static str) -> &mut Self {
        let ty = ValueType::of::<T>();
        self.push_output(port.port(), name, PortCategory::Data, ty.tag(), Some(ty))
    }

    pub fn domain_input<D: 'static>(&mut self, port: DomainInput<D>, name: &'static str) -> &mut Self {
        self.push_input(port.port(), name, PortCategory::Domain, TypeTag::of::<D>(), false, None)
    }

    pub fn domain_output<D: 'static>(&mut self, port: DomainOutput<D>, name: &'static str) -> &mut Self {
        self.push_output(port.port(), name, PortCategory::Domain, TypeTag::of::<D>(), None)
    }

    /// Advertise a capability; connections and messages check for it.
    pub fn capability(&mut self, capability: Capability) -> &mut Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn inputs(&self) -> &[PortDescriptor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortDescriptor] {
        &self.outputs
    }

    pub fn input(&self, port: InputPortId) -> GraphResult<&PortDescriptor> {
        self.inputs
            .get(port.index())
            .ok_or_else(|| GraphError::IndexOutOfRange {
                what: format!("inputs of {}", self.name),
                index: port.index(),
                size: self.inputs.len(),
            })
    }

    pub fn output(&self, port: OutputPortId) -> GraphResult<&PortDescriptor> {
        self.outputs
            .get(port.index())
            .ok_or_else(|| GraphError::IndexOutOfRange {
                what: format!("outputs of {}", self.name),
                index: port.index(),
                size: self.outputs.len(),
            })
    }

    pub fn has_data_ports(&self) -> bool {
        self.inputs.iter().chain(&self.outputs).any(PortDescriptor::is_data)
    }

    /// Reports declaration problems collected while building.
    pub(crate) fn validate(&self) -> GraphResult<()> {
        let mut problems = self.problems.clone();
        for (list, kind) in [(&self.inputs, "input"), (&self.outputs, "output")] {
            for (i, port) in list.iter().enumerate() {
                if list[..i].iter().any(|other| other.name == port.name) {
                    problems.push(format!("duplicate {} port name '{}'", kind, port.name));
                }
            }
        }
        if self.has_data_ports() && !self.has_capability(Capability::Kernel) {
            problems.push("data ports declared without a kernel".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(GraphError::InvalidDefinition {
                definition: self.name,
                message: problems.join("; "),
            })
        }
    }

    fn push_input(
        &mut self,
        id: InputPortId,
        name: &'static str,
        category: PortCategory,
        payload: TypeTag,
        is_array: bool,
        value_type: Option<ValueType>,
    ) -> &mut Self {
        if id.index() != self.inputs.len() {
            self.problems.push(format!(
                "input '{}' declared with index {} but is input #{}",
                name,
                id.index(),
                self.inputs.len()
            ));
        }
        self.inputs.push(PortDescriptor {
            name,
            category,
            direction: PortDirection::Input,
            payload,
            is_array,
            value_type,
        });
        self
    }

    fn push_output(
        &mut self,
        id: OutputPortId,
        name: &'static str,
        category: PortCategory,
        payload: TypeTag,
        value_type: Option<ValueType>,
    ) -> &mut Self {
        if id.index() != self.outputs.len() {
            self.problems.push(format!(
                "output '{}' declared with index {} but is output #{}",
                name,
                id.index(),
                self.outputs.len()
            ));
        }
        self.outputs.push(PortDescriptor {
            name,
            category,
            direction: PortDirection::Output,
            payload,
            is_array: false,
            value_type,
        });
        self
    }
}
