//! The per-cycle log of structural changes.
//!
//! Every mutation of the simulation world that the render graph must mirror
//! is appended here in emission order. The render graph replays the list
//! once during alignment and the list is then dropped.

use super::data::DataValue;
use super::id::{InputPortArrayId, InputPortId, NodeHandle, OutputPortId};
use super::kernel::Kernel;
use super::port::NodeDescription;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub(crate) enum DiffCommand {
    Create {
        handle: NodeHandle,
        description: Arc<NodeDescription>,
        kernel: Option<Box<dyn Kernel>>,
    },
    Destroy {
        handle: NodeHandle,
    },
    ResizeBuffer {
        handle: NodeHandle,
        port: OutputPortId,
        field: usize,
        size: usize,
    },
    ResizePortArray {
        handle: NodeHandle,
        port: InputPortId,
        size: u16,
    },
    MessageToData {
        handle: NodeHandle,
        port: InputPortArrayId,
        value: Box<dyn DataValue>,
    },
    RetainData {
        handle: NodeHandle,
        port: InputPortArrayId,
    },
    KernelData {
        handle: NodeHandle,
        data: Box<dyn Any + Send>,
    },
}

impl DiffCommand {
    pub(crate) fn handle(&self) -> NodeHandle {
        match self {
            DiffCommand::Create { handle, .. }
            | DiffCommand::Destroy { handle }
            | DiffCommand::ResizeBuffer { handle, .. }
            | DiffCommand::ResizePortArray { handle, .. }
            | DiffCommand::MessageToData { handle, .. }
            | DiffCommand::RetainData { handle, .. }
            | DiffCommand::KernelData { handle, .. } => *handle,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            DiffCommand::Create { .. } => "Create",
            DiffCommand::Destroy { .. } => "Destroy",
            DiffCommand::ResizeBuffer { .. } => "ResizeBuffer",
            DiffCommand::ResizePortArray { .. } => "ResizePortArray",
            DiffCommand::MessageToData { .. } => "MessageToData",
            DiffCommand::RetainData { .. } => "RetainData",
            DiffCommand::KernelData { .. } => "KernelData",
        }
    }
}

impl fmt::Debug for DiffCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.handle())
    }
}

/// Ordered command list accumulated since the last update.
#[derive(Default)]
pub(crate) struct GraphDiff {
    commands: Vec<DiffCommand>,
}

impl GraphDiff {
    pub(crate) fn push(&mut self, command: DiffCommand) {
        tracing::trace!(command = ?command, "diff");
        self.commands.push(command);
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn into_commands(self) -> Vec<DiffCommand> {
        self.commands
    }
}

impl fmt::Debug for GraphDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.commands).finish()
    }
}
