//! Connecting, disconnecting and forwarding ports.
//!
//! Allowed connections by category:
//!
//! | output  | input   | delivery                                   |
//! |---------|---------|--------------------------------------------|
//! | Message | Message | `handle_message` on the destination        |
//! | Message | Data    | value owned by the input, from next cycle  |
//! | Data    | Data    | zero-copy alias, or latched when feedback  |
//! | Domain  | Domain  | recorded only                              |
//!
//! A data input takes at most one connection. Message inputs accept any
//! number of incoming connections.

use super::definition::forwarded_port_mismatch;
use super::diff::DiffCommand;
use super::id::{InputPortArrayId, InputPortId, NodeHandle, OutputPortId};
use super::node_set::NodeSet;
use super::port::{Capability, InputPort, OutputPort, PortCategory, PortDescriptor};
use super::topology::{Connection, ConnectionKind};
use crate::error::{GraphError, GraphResult};

impl NodeSet {
    /// Connect `output` of `source` to the scalar `input` of `destination`.
    pub fn connect<O, I>(&mut self, source: NodeHandle, output: O, destination: NodeHandle, input: I) -> GraphResult<()>
    where
        O: OutputPort,
        I: InputPort<Payload = O::Payload>,
    {
        self.connect_with(source, output, destination, input, ConnectionKind::Normal)
    }

    pub fn connect_with<O, I>(
        &mut self,
        source: NodeHandle,
        output: O,
        destination: NodeHandle,
        input: I,
        kind: ConnectionKind,
    ) -> GraphResult<()>
    where
        O: OutputPort,
        I: InputPort<Payload = O::Payload>,
    {
        self.connect_untyped(
            source,
            output.id(),
            destination,
            InputPortArrayId::scalar(input.id()),
            kind,
        )
    }

    /// Connect to slot `index` of a port array.
    pub fn connect_indexed<O, I>(
        &mut self,
        source: NodeHandle,
        output: O,
        destination: NodeHandle,
        input: I,
        index: u16,
    ) -> GraphResult<()>
    where
        O: OutputPort,
        I: InputPort<Payload = O::Payload>,
    {
        self.connect_untyped(
            source,
            output.id(),
            destination,
            InputPortArrayId::slot(input.id(), index),
            ConnectionKind::Normal,
        )
    }

    /// Connect by port ids; types are checked at runtime.
    pub fn connect_untyped(
        &mut self,
        source: NodeHandle,
        output: OutputPortId,
        destination: NodeHandle,
        input: InputPortArrayId,
        kind: ConnectionKind,
    ) -> GraphResult<()> {
        let connection = self.validate_connection(source, output, destination, input, kind)?;

        if self.topology.find(&connection).is_some() {
            return Err(GraphError::invalid(format!(
                "{:?} of {} is already connected to {:?} of {}",
                connection.source_port,
                connection.source,
                connection.destination_port,
                connection.destination
            )));
        }
        let destination_is_data = self
            .live(connection.destination)?
            .description
            .input(connection.destination_port.port)?
            .is_data();
        if destination_is_data
            && self
                .topology
                .connections_to(connection.destination, connection.destination_port)
                .next()
                .is_some()
        {
            return Err(GraphError::invalid(format!(
                "Data input {:?} of {} already has a connection",
                connection.destination_port, connection.destination
            )));
        }
        if connection.is_normal_data()
            && self
                .topology
                .would_create_cycle(connection.source, connection.destination)
        {
            return Err(GraphError::CycleDetected {
                from: connection.source,
                to: connection.destination,
            });
        }

        self.topology.insert(connection);
        self.version.signal_changed();
        tracing::debug!(
            kind = ?connection.kind,
            category = ?connection.category,
            "Connected {}.{:?} -> {}.{:?}",
            connection.source,
            connection.source_port,
            connection.destination,
            connection.destination_port
        );
        Ok(())
    }

    pub fn disconnect<O, I>(&mut self, source: NodeHandle, output: O, destination: NodeHandle, input: I) -> GraphResult<()>
    where
        O: OutputPort,
        I: InputPort<Payload = O::Payload>,
    {
        self.disconnect_untyped(
            source,
            output.id(),
            destination,
            InputPortArrayId::scalar(input.id()),
        )
    }

    pub fn disconnect_indexed<O, I>(
        &mut self,
        source: NodeHandle,
        output: O,
        destination: NodeHandle,
        input: I,
        index: u16,
    ) -> GraphResult<()>
    where
        O: OutputPort,
        I: InputPort<Payload = O::Payload>,
    {
        self.disconnect_untyped(
            source,
            output.id(),
            destination,
            InputPortArrayId::slot(input.id(), index),
        )
    }

    pub fn disconnect_untyped(
        &mut self,
        source: NodeHandle,
        output: OutputPortId,
        destination: NodeHandle,
        input: InputPortArrayId,
    ) -> GraphResult<()> {
        self.remove_connection(source, output, destination, input)
            .map(|_| ())
    }

    /// Disconnect a data edge, keeping the last value the input observed.
    ///
    /// Rejected for ports whose payload contains buffers, before anything is
    /// disconnected.
    pub fn disconnect_and_retain<O, I>(
        &mut self,
        source: NodeHandle,
        output: O,
        destination: NodeHandle,
        input: I,
    ) -> GraphResult<()>
    where
        O: OutputPort,
        I: InputPort<Payload = O::Payload>,
    {
        self.disconnect_and_retain_untyped(
            source,
            output.id(),
            destination,
            InputPortArrayId::scalar(input.id()),
        )
    }

    pub fn disconnect_and_retain_indexed<O, I>(
        &mut self,
        source: NodeHandle,
        output: O,
        destination: NodeHandle,
        input: I,
        index: u16,
    ) -> GraphResult<()>
    where
        O: OutputPort,
        I: InputPort<Payload = O::Payload>,
    {
        self.disconnect_and_retain_untyped(
            source,
            output.id(),
            destination,
            InputPortArrayId::slot(input.id(), index),
        )
    }

    pub fn disconnect_and_retain_untyped(
        &mut self,
        source: NodeHandle,
        output: OutputPortId,
        destination: NodeHandle,
        input: InputPortArrayId,
    ) -> GraphResult<()> {
        let (destination, port) = self.resolve_input(destination, input.port)?;
        let input = InputPortArrayId {
            port,
            index: input.index,
        };
        let descriptor = self.live(destination)?.description.input(port)?;
        if !descriptor.is_data() {
            return Err(GraphError::invalid(format!(
                "Only data inputs can retain a value; '{}' of {} is a {:?} input",
                descriptor.name, destination, descriptor.category
            )));
        }
        if descriptor.has_buffers() {
            return Err(GraphError::invalid(format!(
                "Cannot retain data on '{}' of {}: the port includes buffers",
                descriptor.name, destination
            )));
        }

        let removed = self.remove_connection(source, output, destination, input)?;
        if removed.category == PortCategory::Data {
            self.diff.push(DiffCommand::RetainData {
                handle: destination,
                port: input,
            });
        }
        Ok(())
    }

    /// Size of a port array as seen by the simulation world.
    pub fn port_array_size<P: InputPort>(&self, handle: NodeHandle, port: P) -> GraphResult<u16> {
        let (handle, port) = self.resolve_input(handle, port.id())?;
        let descriptor = self.live(handle)?.description.input(port)?;
        if !descriptor.is_array {
            return Err(GraphError::invalid(format!(
                "'{}' of {} is not a port array",
                descriptor.name, handle
            )));
        }
        Ok(self.array_size(handle, port))
    }

    /// Resize a port array. Shrinking below a connected slot is rejected.
    pub fn set_port_array_size<P: InputPort>(&mut self, handle: NodeHandle, port: P, size: u16) -> GraphResult<()> {
        let (handle, port) = self.resolve_input(handle, port.id())?;
        let descriptor = self.live(handle)?.description.input(port)?;
        if !descriptor.is_array {
            return Err(GraphError::invalid(format!(
                "Cannot resize '{}' of {}: not a port array",
                descriptor.name, handle
            )));
        }
        let is_data = descriptor.is_data();
        let name = descriptor.name;

        if let Some(connected) = self
            .topology
            .inputs_of(handle)
            .filter(|c| c.destination_port.port == port)
            .filter_map(|c| c.destination_port.index)
            .find(|index| *index >= size)
        {
            return Err(GraphError::invalid(format!(
                "Cannot shrink port array '{}' of {} to {}: slot {} is connected",
                name, handle, size, connected
            )));
        }

        self.live_mut(handle)?.array_sizes.insert(port, size);
        self.version.signal_changed();
        if is_data {
            self.diff.push(DiffCommand::ResizePortArray { handle, port, size });
        }
        tracing::debug!("Port array '{}' of {} resized to {}", name, handle, size);
        Ok(())
    }

    pub(crate) fn array_size(&self, handle: NodeHandle, port: InputPortId) -> u16 {
        self.live(handle)
            .ok()
            .and_then(|live| live.array_sizes.get(&port).copied())
            .unwrap_or(0)
    }

    /// Array-ness and bounds of an addressed input slot.
    pub(crate) fn check_slot(
        &self,
        handle: NodeHandle,
        descriptor: &PortDescriptor,
        port: InputPortArrayId,
    ) -> GraphResult<()> {
        match (descriptor.is_array, port.index) {
            (true, None) => Err(GraphError::invalid(format!(
                "'{}' of {} is a port array; an index is required",
                descriptor.name, handle
            ))),
            (false, Some(_)) => Err(GraphError::invalid(format!(
                "'{}' of {} is not a port array; an index can only be given for port arrays",
                descriptor.name, handle
            ))),
            (true, Some(index)) => {
                let size = self.array_size(handle, port.port);
                if index >= size {
                    Err(GraphError::IndexOutOfRange {
                        what: format!("port array '{}' of {}", descriptor.name, handle),
                        index: index as usize,
                        size: size as usize,
                    })
                } else {
                    Ok(())
                }
            }
            (false, None) => Ok(()),
        }
    }

    pub(crate) fn forward_input(
        &mut self,
        from: NodeHandle,
        port: InputPortId,
        to: NodeHandle,
        to_port: InputPortId,
    ) -> GraphResult<()> {
        if from == to {
            return Err(forwarded_port_mismatch("input", from, to, "a node cannot forward to itself"));
        }
        let origin = self.live(from)?.description.input(port)?;
        let target = self.live(to)?.description.input(to_port)?;
        Self::check_forward_compatible("input", from, to, origin, target)?;
        if self.topology.inputs_of(from).any(|c| c.destination_port.port == port) {
            return Err(forwarded_port_mismatch(
                "input",
                from,
                to,
                format!("'{}' already has connections", origin.name),
            ));
        }

        let live = self.live_mut(from)?;
        if live.forwarded_inputs.contains_key(&port) {
            return Err(forwarded_port_mismatch("input", from, to, "port is already forwarded"));
        }
        live.forwarded_inputs.insert(port, (to, to_port));
        tracing::debug!("Forwarded {}.{:?} -> {}.{:?}", from, port, to, to_port);
        Ok(())
    }

    pub(crate) fn forward_output(
        &mut self,
        from: NodeHandle,
        port: OutputPortId,
        to: NodeHandle,
        to_port: OutputPortId,
    ) -> GraphResult<()> {
        if from == to {
            return Err(forwarded_port_mismatch("output", from, to, "a node cannot forward to itself"));
        }
        let origin = self.live(from)?.description.output(port)?;
        let target = self.live(to)?.description.output(to_port)?;
        Self::check_forward_compatible("output", from, to, origin, target)?;
        if self.topology.outputs_of(from).any(|c| c.source_port == port) {
            return Err(forwarded_port_mismatch(
                "output",
                from,
                to,
                format!("'{}' already has connections", origin.name),
            ));
        }

        let live = self.live_mut(from)?;
        if live.forwarded_outputs.contains_key(&port) {
            return Err(forwarded_port_mismatch("output", from, to, "port is already forwarded"));
        }
        live.forwarded_outputs.insert(port, (to, to_port));
        tracing::debug!("Forwarded {}.{:?} -> {}.{:?}", from, port, to, to_port);
        Ok(())
    }

    fn check_forward_compatible(
        kind: &str,
        from: NodeHandle,
        to: NodeHandle,
        origin: &PortDescriptor,
        target: &PortDescriptor,
    ) -> GraphResult<()> {
        if origin.category != target.category
            || origin.payload != target.payload
            || origin.is_array != target.is_array
        {
            return Err(forwarded_port_mismatch(
                kind,
                from,
                to,
                format!("'{}' and '{}' are declared differently", origin.name, target.name),
            ));
        }
        Ok(())
    }

    /// Follow input forwarding to the port that actually receives.
    pub(crate) fn resolve_input(&self, handle: NodeHandle, port: InputPortId) -> GraphResult<(NodeHandle, InputPortId)> {
        let (mut handle, mut port) = (handle, port);
        for _ in 0..=self.nodes.len() {
            match self.live(handle)?.forwarded_inputs.get(&port) {
                Some(&(to, to_port)) => {
                    handle = to;
                    port = to_port;
                }
                None => return Ok((handle, port)),
            }
        }
        Err(GraphError::invalid(format!(
            "Forwarding loop while resolving {:?} of {}",
            port, handle
        )))
    }

    /// Follow output forwarding to the port that actually produces.
    pub(crate) fn resolve_output(
        &self,
        handle: NodeHandle,
        port: OutputPortId,
    ) -> GraphResult<(NodeHandle, OutputPortId)> {
        let (mut handle, mut port) = (handle, port);
        for _ in 0..=self.nodes.len() {
            match self.live(handle)?.forwarded_outputs.get(&port) {
                Some(&(to, to_port)) => {
                    handle = to;
                    port = to_port;
                }
                None => return Ok((handle, port)),
            }
        }
        Err(GraphError::invalid(format!(
            "Forwarding loop while resolving {:?} of {}",
            port, handle
        )))
    }

    fn validate_connection(
        &self,
        source: NodeHandle,
        output: OutputPortId,
        destination: NodeHandle,
        input: InputPortArrayId,
        kind: ConnectionKind,
    ) -> GraphResult<Connection> {
        let (source, output) = self.resolve_output(source, output)?;
        let (destination, port) = self.resolve_input(destination, input.port)?;
        let input = InputPortArrayId {
            port,
            index: input.index,
        };

        let source_desc = &self.live(source)?.description;
        let destination_desc = &self.live(destination)?.description;
        let out = source_desc.output(output)?;
        let inp = destination_desc.input(port)?;

        self.check_slot(destination, inp, input)?;

        let category = match (out.category, inp.category) {
            (PortCategory::Message, PortCategory::Message | PortCategory::Data) => PortCategory::Message,
            (PortCategory::Data, PortCategory::Data) => PortCategory::Data,
            (PortCategory::Domain, PortCategory::Domain) => PortCategory::Domain,
            (from, to) => {
                return Err(GraphError::invalid(format!(
                    "Cannot connect {:?} output '{}' to {:?} input '{}'",
                    from, out.name, to, inp.name
                )))
            }
        };
        if out.payload != inp.payload {
            return Err(GraphError::TypeMismatch {
                expected: inp.payload.name(),
                found: out.payload.name(),
            });
        }
        if kind == ConnectionKind::Feedback && category != PortCategory::Data {
            return Err(GraphError::invalid(
                "Feedback connections are only supported between data ports",
            ));
        }
        if category == PortCategory::Message && inp.is_data() && inp.has_buffers() {
            return Err(GraphError::invalid(format!(
                "Cannot deliver messages to data input '{}' of {}: the port includes buffers",
                inp.name, destination
            )));
        }
        if inp.is_message() && !destination_desc.has_capability(Capability::MessageHandler) {
            return Err(GraphError::MissingCapability {
                node: destination,
                definition: destination_desc.name(),
                capability: Capability::MessageHandler.describe(),
            });
        }

        Ok(Connection {
            source,
            source_port: output,
            destination,
            destination_port: input,
            category,
            kind,
        })
    }

    fn remove_connection(
        &mut self,
        source: NodeHandle,
        output: OutputPortId,
        destination: NodeHandle,
        input: InputPortArrayId,
    ) -> GraphResult<Connection> {
        let (source, output) = self.resolve_output(source, output)?;
        let (destination, port) = self.resolve_input(destination, input.port)?;
        let probe = Connection {
            source,
            source_port: output,
            destination,
            destination_port: InputPortArrayId {
                port,
                index: input.index,
            },
            category: PortCategory::Data,
            kind: ConnectionKind::Normal,
        };
        let removed = self
            .topology
            .find(&probe)
            .and_then(|id| self.topology.remove(id))
            .ok_or_else(|| {
                GraphError::invalid(format!(
                    "{:?} of {} is not connected to {:?} of {}",
                    output, source, probe.destination_port, destination
                ))
            })?;
        self.version.signal_changed();
        tracing::debug!(
            "Disconnected {}.{:?} -> {}.{:?}",
            removed.source,
            removed.source_port,
            removed.destination,
            removed.destination_port
        );
        Ok(removed)
    }
}
