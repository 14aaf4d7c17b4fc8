//! Identity types for the graph system.
//!
//! Node handles pair a slot index with a generation so a handle outlived by
//! its node is never confused with the slot's next occupant. Port ids are
//! plain indices into a node's declared input or output list.

use std::fmt;

/// Addresses a node in a `NodeSet`: slot index plus generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

impl NodeHandle {
    pub const INVALID: NodeHandle = NodeHandle {
        index: u32::MAX,
        generation: 0,
    };

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl Default for NodeHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "NodeHandle(INVALID)")
        } else {
            write!(f, "NodeHandle({}:{})", self.index, self.generation)
        }
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Index into a node's declared input ports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InputPortId(pub u16);

impl InputPortId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for InputPortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "In({})", self.0)
    }
}

/// Index into a node's declared output ports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct OutputPortId(pub u16);

impl OutputPortId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for OutputPortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Out({})", self.0)
    }
}

/// An input port, optionally narrowed to one slot of a port array.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputPortArrayId {
    pub port: InputPortId,
    pub index: Option<u16>,
}

impl InputPortArrayId {
    pub fn scalar(port: InputPortId) -> Self {
        Self { port, index: None }
    }

    pub fn slot(port: InputPortId, index: u16) -> Self {
        Self {
            port,
            index: Some(index),
        }
    }

    pub fn is_array(self) -> bool {
        self.index.is_some()
    }
}

impl From<InputPortId> for InputPortArrayId {
    fn from(port: InputPortId) -> Self {
        Self::scalar(port)
    }
}

impl fmt::Debug for InputPortArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "In({}[{}])", self.port.0, i),
            None => write!(f, "In({})", self.port.0),
        }
    }
}

/// Index into the connection table of a `TopologyDatabase`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub const INVALID: ConnectionId = ConnectionId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "ConnectionId(INVALID)")
        } else {
            write!(f, "ConnectionId({})", self.0)
        }
    }
}

/// Unique identity of one buffer allocation. Never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct AllocationId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_handle() {
        let handle = NodeHandle::new(42, 3);
        assert!(handle.is_valid());
        assert_eq!(handle.index(), 42);
        assert_eq!(handle.generation(), 3);
        assert!(!NodeHandle::INVALID.is_valid());
        assert_eq!(NodeHandle::default(), NodeHandle::INVALID);
    }

    #[test]
    fn test_node_handle_generation_distinguishes_reuse() {
        let old = NodeHandle::new(5, 1);
        let reused = NodeHandle::new(5, 2);
        assert_ne!(old, reused);
        assert_eq!(old.index(), reused.index());
    }

    #[test]
    fn test_port_array_id() {
        let scalar: InputPortArrayId = InputPortId(2).into();
        assert!(!scalar.is_array());
        let slot = InputPortArrayId::slot(InputPortId(2), 1);
        assert!(slot.is_array());
        assert_ne!(scalar, slot);
        assert_eq!(format!("{:?}", slot), "In(2[1])");
    }

    #[test]
    fn test_connection_id() {
        let id = ConnectionId(5);
        assert!(id.is_valid());
        assert!(!ConnectionId::INVALID.is_valid());
    }
}
