//! Connection storage and structural versioning.
//!
//! The database keeps a slot table of connections plus per-node adjacency
//! lists for inputs and outputs. Adjacency lists preserve insertion order,
//! which is the order messages are multicast in.

use super::id::{ConnectionId, InputPortArrayId, NodeHandle, OutputPortId};
use super::port::PortCategory;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How a data connection participates in ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Producer runs before consumer within a cycle
    #[default]
    Normal,
    /// Consumer reads the producer's value from the end of the previous cycle
    Feedback,
}

/// A directed edge from an output port to an input port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connection {
    pub source: NodeHandle,
    pub source_port: OutputPortId,
    pub destination: NodeHandle,
    pub destination_port: InputPortArrayId,
    pub category: PortCategory,
    pub kind: ConnectionKind,
}

impl Connection {
    /// Data edge that constrains ordering within a cycle.
    pub fn is_normal_data(&self) -> bool {
        self.category == PortCategory::Data && self.kind == ConnectionKind::Normal
    }

    fn same_endpoints(&self, other: &Connection) -> bool {
        self.source == other.source
            && self.source_port == other.source_port
            && self.destination == other.destination
            && self.destination_port == other.destination_port
    }
}

#[derive(Default, Clone)]
struct NodeLinks {
    inputs: Vec<ConnectionId>,
    outputs: Vec<ConnectionId>,
}

/// All live connections of a `NodeSet`.
#[derive(Default)]
pub(crate) struct TopologyDatabase {
    connections: Vec<Option<Connection>>,
    free: Vec<ConnectionId>,
    links: Vec<NodeLinks>,
    count: usize,
}

impl TopologyDatabase {
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn insert(&mut self, connection: Connection) -> ConnectionId {
        let id = match self.free.pop() {
            Some(id) => {
                self.connections[id.index()] = Some(connection);
                id
            }
            None => {
                self.connections.push(Some(connection));
                ConnectionId((self.connections.len() - 1) as u32)
            }
        };
        self.links_mut(connection.source).outputs.push(id);
        self.links_mut(connection.destination).inputs.push(id);
        self.count += 1;
        id
    }

    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.get_mut(id.index())?.take()?;
        if let Some(links) = self.links.get_mut(connection.source.index()) {
            links.outputs.retain(|c| *c != id);
        }
        if let Some(links) = self.links.get_mut(connection.destination.index()) {
            links.inputs.retain(|c| *c != id);
        }
        self.free.push(id);
        self.count -= 1;
        Some(connection)
    }

    /// Exact match on endpoints, any category or kind.
    pub(crate) fn find(&self, connection: &Connection) -> Option<ConnectionId> {
        self.links
            .get(connection.source.index())?
            .outputs
            .iter()
            .copied()
            .find(|id| self.get(*id).is_some_and(|c| c.same_endpoints(connection)))
    }

    /// Connections arriving at a node, in insertion order.
    pub(crate) fn inputs_of(&self, node: NodeHandle) -> impl Iterator<Item = &Connection> + '_ {
        self.links
            .get(node.index())
            .map(|l| l.inputs.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.get(*id))
            .filter(move |c| c.destination == node)
    }

    /// Connections leaving a node, in insertion order.
    pub(crate) fn outputs_of(&self, node: NodeHandle) -> impl Iterator<Item = &Connection> + '_ {
        self.links
            .get(node.index())
            .map(|l| l.outputs.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.get(*id))
            .filter(move |c| c.source == node)
    }

    pub(crate) fn connections_to(
        &self,
        node: NodeHandle,
        port: InputPortArrayId,
    ) -> impl Iterator<Item = &Connection> + '_ {
        self.inputs_of(node)
            .filter(move |c| c.destination_port == port)
    }

    pub(crate) fn connections_from(
        &self,
        node: NodeHandle,
        port: OutputPortId,
    ) -> impl Iterator<Item = &Connection> + '_ {
        self.outputs_of(node).filter(move |c| c.source_port == port)
    }

    /// Remove every connection touching `node`, returning them.
    pub(crate) fn disconnect_all(&mut self, node: NodeHandle) -> Vec<Connection> {
        let Some(links) = self.links.get(node.index()) else {
            return Vec::new();
        };
        let mut ids: Vec<ConnectionId> = links.inputs.iter().chain(&links.outputs).copied().collect();
        ids.sort_by_key(|id| id.0);
        ids.dedup();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Whether adding a normal data edge `from -> to` would close a cycle.
    pub(crate) fn would_create_cycle(&self, from: NodeHandle, to: NodeHandle) -> bool {
        if from == to {
            return true;
        }
        let mut visited = HashSet::new();
        let mut stack = vec![to];
        while let Some(node) = stack.pop() {
            if node == from {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            stack.extend(
                self.outputs_of(node)
                    .filter(|c| c.is_normal_data())
                    .map(|c| c.destination),
            );
        }
        false
    }

    fn links_mut(&mut self, node: NodeHandle) -> &mut NodeLinks {
        let index = node.index();
        if self.links.len() <= index {
            self.links.resize_with(index + 1, NodeLinks::default);
        }
        &mut self.links[index]
    }
}

/// Counter bumped on every structural mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopologyVersion(u64);

impl TopologyVersion {
    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn signal_changed(&mut self) {
        self.0 += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::id::InputPortId;

    fn data(from: NodeHandle, to: NodeHandle) -> Connection {
        Connection {
            source: from,
            source_port: OutputPortId(0),
            destination: to,
            destination_port: InputPortId(0).into(),
            category: PortCategory::Data,
            kind: ConnectionKind::Normal,
        }
    }

    #[test]
    fn test_insert_and_remove() {
        let a = NodeHandle::new(0, 1);
        let b = NodeHandle::new(1, 1);
        let mut db = TopologyDatabase::default();
        let id = db.insert(data(a, b));
        assert_eq!(db.len(), 1);
        assert_eq!(db.find(&data(a, b)), Some(id));
        assert_eq!(db.outputs_of(a).count(), 1);
        assert_eq!(db.inputs_of(b).count(), 1);
        assert_eq!(db.remove(id), Some(data(a, b)));
        assert_eq!(db.len(), 0);
        assert_eq!(db.find(&data(a, b)), None);
    }

    #[test]
    fn test_free_slots_are_reused() {
        let a = NodeHandle::new(0, 1);
        let b = NodeHandle::new(1, 1);
        let mut db = TopologyDatabase::default();
        let first = db.insert(data(a, b));
        db.remove(first);
        let second = db.insert(data(b, a));
        assert_eq!(first, second);
    }

    #[test]
    fn test_cycle_detection() {
        let a = NodeHandle::new(0, 1);
        let b = NodeHandle::new(1, 1);
        let c = NodeHandle::new(2, 1);
        let mut db = TopologyDatabase::default();
        db.insert(data(a, b));
        db.insert(data(b, c));
        assert!(db.would_create_cycle(c, a));
        assert!(db.would_create_cycle(a, a));
        assert!(!db.would_create_cycle(a, c));
    }

    #[test]
    fn test_feedback_edges_do_not_count_as_cycles() {
        let a = NodeHandle::new(0, 1);
        let b = NodeHandle::new(1, 1);
        let mut db = TopologyDatabase::default();
        db.insert(Connection {
            kind: ConnectionKind::Feedback,
            ..data(b, a)
        });
        assert!(!db.would_create_cycle(a, b));
    }

    #[test]
    fn test_disconnect_all() {
        let a = NodeHandle::new(0, 1);
        let b = NodeHandle::new(1, 1);
        let c = NodeHandle::new(2, 1);
        let mut db = TopologyDatabase::default();
        db.insert(data(a, b));
        db.insert(data(b, c));
        db.insert(data(a, c));
        let removed = db.disconnect_all(b);
        assert_eq!(removed.len(), 2);
        assert_eq!(db.len(), 1);
        assert_eq!(db.inputs_of(c).count(), 1);
    }

    #[test]
    fn test_version_signal() {
        let mut version = TopologyVersion::default();
        version.signal_changed();
        version.signal_changed();
        assert_eq!(version.get(), 2);
    }
}
