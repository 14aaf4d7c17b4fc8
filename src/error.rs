//! Error handling for flowgraph-rs
//!
//! This module defines the error taxonomy shared by the simulation world,
//! the render graph and the scheduler, together with a Result alias.
//!
//! Usage and capability errors are raised synchronously at the call site and
//! leave the graph untouched. Kernel faults and desync faults tear the render
//! world down and surface at the next call that joins render work.

use crate::graph::id::NodeHandle;
use thiserror::Error;

/// Main error type for graph operations
#[derive(Error, Debug)]
pub enum GraphError {
    /// A node handle is default, stale or refers to a destroyed node
    #[error("Invalid node handle {0}")]
    InvalidHandle(NodeHandle),

    /// The operation is not legal in the current graph state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Payload or port types disagree
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Port, array slot or buffer field index outside its declared range
    #[error("Index {index} out of range for {what} (size {size})")]
    IndexOutOfRange {
        what: String,
        index: usize,
        size: usize,
    },

    /// The destination node lacks a handler required by the operation
    #[error("Node {node} ({definition}) does not implement {capability}")]
    MissingCapability {
        node: NodeHandle,
        definition: &'static str,
        capability: &'static str,
    },

    /// A node definition declared an inconsistent port layout
    #[error("Invalid definition {definition}: {message}")]
    InvalidDefinition {
        definition: &'static str,
        message: String,
    },

    /// A normal data connection would close a cycle
    #[error("Connecting {from} -> {to} would create a cycle; use a feedback connection")]
    CycleDetected { from: NodeHandle, to: NodeHandle },

    /// A kernel returned an error or panicked during scheduled execution
    #[error("Kernel fault in node {node}: {source}")]
    KernelFault {
        node: NodeHandle,
        #[source]
        source: anyhow::Error,
    },

    /// Simulation and render worlds diverged during alignment
    #[error("Render graph desync: {0}")]
    Desync(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<GraphError>,
    },
}

impl GraphError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        GraphError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for [`GraphError::InvalidOperation`]
    pub fn invalid(message: impl Into<String>) -> Self {
        GraphError::InvalidOperation(message.into())
    }

    /// Whether this error tore the render world down.
    pub fn is_render_fault(&self) -> bool {
        match self {
            GraphError::KernelFault { .. } | GraphError::Desync(_) => true,
            GraphError::WithContext { source, .. } => source.is_render_fault(),
            _ => false,
        }
    }

    /// Strip any context wrappers.
    pub fn root(&self) -> &GraphError {
        match self {
            GraphError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for graph operations
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> GraphResult<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> GraphResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for GraphResult<T> {
    fn context(self, context: impl Into<String>) -> GraphResult<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> GraphResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
