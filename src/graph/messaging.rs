//! Message delivery, direct data assignment and resize requests.

use super::buffer::{Buffer, BufferElement};
use super::data::{DataValue, PortData, TypeTag};
use super::definition::MessageContext;
use super::diff::DiffCommand;
use super::id::{InputPortArrayId, NodeHandle, OutputPortId};
use super::node_set::NodeSet;
use super::port::{Capability, DataInput, DataInputArray, DataOutput, MessageInput, MessageInputArray, PortCategory};
use super::topology::Connection;
use crate::error::{GraphError, GraphResult};
use std::any::Any;

impl NodeSet {
    /// Deliver `message` to a message input, invoking the node's handler
    /// immediately.
    pub fn send_message<M: 'static>(&mut self, handle: NodeHandle, port: MessageInput<M>, message: M) -> GraphResult<()> {
        self.deliver(
            handle,
            InputPortArrayId::scalar(port.port()),
            &message,
            TypeTag::of::<M>(),
        )
    }

    pub fn send_message_indexed<M: 'static>(
        &mut self,
        handle: NodeHandle,
        port: MessageInputArray<M>,
        index: u16,
        message: M,
    ) -> GraphResult<()> {
        self.deliver(
            handle,
            InputPortArrayId::slot(port.port(), index),
            &message,
            TypeTag::of::<M>(),
        )
    }

    /// Give an unconnected data input its own value, visible from the next
    /// cycle until replaced or superseded by a connection.
    pub fn set_data<T: PortData>(&mut self, handle: NodeHandle, port: DataInput<T>, value: T) -> GraphResult<()> {
        self.assign_data(
            handle,
            InputPortArrayId::scalar(port.port()),
            Box::new(value),
            TypeTag::of::<T>(),
        )
    }

    pub fn set_data_indexed<T: PortData>(
        &mut self,
        handle: NodeHandle,
        port: DataInputArray<T>,
        index: u16,
        value: T,
    ) -> GraphResult<()> {
        self.assign_data(
            handle,
            InputPortArrayId::slot(port.port(), index),
            Box::new(value),
            TypeTag::of::<T>(),
        )
    }

    /// Request a new length for a buffer output. Applied at the next update
    /// with freshly allocated, default-initialised storage.
    pub fn set_buffer_size<E: BufferElement>(
        &mut self,
        handle: NodeHandle,
        port: DataOutput<Buffer<E>>,
        size: usize,
    ) -> GraphResult<()> {
        self.set_sub_buffer_size(handle, port, 0, size)
    }

    /// Resize buffer `field` of an aggregate data output.
    pub fn set_sub_buffer_size<T: PortData>(
        &mut self,
        handle: NodeHandle,
        port: DataOutput<T>,
        field: usize,
        size: usize,
    ) -> GraphResult<()> {
        let (handle, output) = self.resolve_output(handle, port.port())?;
        let descriptor = self.live(handle)?.description.output(output)?;
        if !descriptor.is_data() {
            return Err(GraphError::invalid(format!(
                "Cannot resize '{}' of {}: not a data output",
                descriptor.name, handle
            )));
        }
        if descriptor.payload != TypeTag::of::<T>() {
            return Err(GraphError::TypeMismatch {
                expected: descriptor.payload.name(),
                found: std::any::type_name::<T>(),
            });
        }
        if field >= T::BUFFER_FIELDS {
            return Err(GraphError::IndexOutOfRange {
                what: format!("buffer fields of {}", std::any::type_name::<T>()),
                index: field,
                size: T::BUFFER_FIELDS,
            });
        }

        self.version.signal_changed();
        self.diff.push(DiffCommand::ResizeBuffer {
            handle,
            port: output,
            field,
            size,
        });
        Ok(())
    }

    pub(crate) fn deliver(
        &mut self,
        handle: NodeHandle,
        port: InputPortArrayId,
        message: &dyn Any,
        tag: TypeTag,
    ) -> GraphResult<()> {
        let (handle, resolved) = self.resolve_input(handle, port.port)?;
        let port = InputPortArrayId {
            port: resolved,
            index: port.index,
        };
        let description = self.live(handle)?.description.clone();
        let descriptor = description.input(port.port)?;
        if !descriptor.is_message() {
            return Err(GraphError::invalid(format!(
                "Cannot send a message to non-message input '{}' of {}",
                descriptor.name, handle
            )));
        }
        if descriptor.payload != tag {
            return Err(GraphError::TypeMismatch {
                expected: descriptor.payload.name(),
                found: tag.name(),
            });
        }
        self.check_slot(handle, descriptor, port)?;
        if !description.has_capability(Capability::MessageHandler) {
            return Err(GraphError::MissingCapability {
                node: handle,
                definition: description.name(),
                capability: Capability::MessageHandler.describe(),
            });
        }

        let definition = description.name();
        self.with_definition(handle, |node, set| {
            let mut ctx = MessageContext {
                set,
                handle,
                port,
                definition,
            };
            node.handle_message(&mut ctx, message)
        })
    }

    /// Multicast from a message output in connection order.
    pub(crate) fn emit_message(
        &mut self,
        handle: NodeHandle,
        port: OutputPortId,
        message: &dyn Any,
        tag: TypeTag,
    ) -> GraphResult<()> {
        if !self.exists(handle) {
            return Err(GraphError::invalid(format!(
                "Cannot emit a message from destroyed node {}",
                handle
            )));
        }
        let live = self.live(handle)?;
        let descriptor = live.description.output(port)?;
        if !descriptor.is_message() {
            return Err(GraphError::invalid(format!(
                "Cannot emit through non-message output '{}' of {}",
                descriptor.name, handle
            )));
        }
        if descriptor.payload != tag {
            return Err(GraphError::TypeMismatch {
                expected: descriptor.payload.name(),
                found: tag.name(),
            });
        }
        let forwarded = live.forwarded_outputs.contains_key(&port);

        let targets: Vec<Connection> = self
            .topology
            .connections_from(handle, port)
            .filter(|c| c.category == PortCategory::Message)
            .copied()
            .collect();
        if targets.is_empty() {
            if forwarded {
                return Err(GraphError::invalid(
                    "Cannot emit a message through a previously forwarded port",
                ));
            }
            tracing::trace!("Message from {}.{:?} dropped: no connections", handle, port);
            return Ok(());
        }

        for connection in targets {
            let destination = connection.destination;
            let description = self.live(destination)?.description.clone();
            let input = description.input(connection.destination_port.port)?;
            if input.is_data() {
                let value = input
                    .value_type()
                    .and_then(|ty| ty.value_from_any(message))
                    .ok_or(GraphError::TypeMismatch {
                        expected: input.payload.name(),
                        found: tag.name(),
                    })?;
                self.diff.push(DiffCommand::MessageToData {
                    handle: destination,
                    port: connection.destination_port,
                    value,
                });
            } else {
                let definition = description.name();
                self.with_definition(destination, |node, set| {
                    let mut ctx = MessageContext {
                        set,
                        handle: destination,
                        port: connection.destination_port,
                        definition,
                    };
                    node.handle_message(&mut ctx, message)
                })?;
            }
        }
        Ok(())
    }

    /// Queue a value for a node's kernel.
    pub(crate) fn record_kernel_data(&mut self, handle: NodeHandle, data: Box<dyn Any + Send>) -> GraphResult<()> {
        let description = &self.live(handle)?.description;
        if !description.has_capability(Capability::Kernel) {
            return Err(GraphError::MissingCapability {
                node: handle,
                definition: description.name(),
                capability: Capability::Kernel.describe(),
            });
        }
        self.diff.push(DiffCommand::KernelData { handle, data });
        Ok(())
    }

    fn assign_data(
        &mut self,
        handle: NodeHandle,
        port: InputPortArrayId,
        value: Box<dyn DataValue>,
        tag: TypeTag,
    ) -> GraphResult<()> {
        let (handle, resolved) = self.resolve_input(handle, port.port)?;
        let port = InputPortArrayId {
            port: resolved,
            index: port.index,
        };
        let descriptor = self.live(handle)?.description.input(port.port)?;
        if !descriptor.is_data() {
            return Err(GraphError::invalid(format!(
                "Cannot set data on non-data input '{}' of {}",
                descriptor.name, handle
            )));
        }
        if descriptor.payload != tag {
            return Err(GraphError::TypeMismatch {
                expected: descriptor.payload.name(),
                found: tag.name(),
            });
        }
        if descriptor.has_buffers() {
            return Err(GraphError::invalid(format!(
                "Cannot set data on '{}' of {}: the port includes buffers",
                descriptor.name, handle
            )));
        }
        self.check_slot(handle, descriptor, port)?;
        if self.topology.connections_to(handle, port).next().is_some() {
            return Err(GraphError::invalid(format!(
                "Cannot set data on '{}' of {}: the input is connected",
                descriptor.name, handle
            )));
        }

        self.diff.push(DiffCommand::MessageToData {
            handle,
            port,
            value,
        });
        Ok(())
    }
}
