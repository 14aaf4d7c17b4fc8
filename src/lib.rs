//! # flowgraph-rs: node-graph execution engine
//!
//! Independent computational kernels are wired into a directed graph through
//! typed ports. The graph is edited on a single-threaded simulation world and
//! mirrored, through an append-only diff, into a render graph that executes
//! kernels once per cycle under a selectable concurrency policy.
//!
//! ## Architecture
//!
//! - **Simulation world**: [`NodeSet`] owns node lifecycle, connections,
//!   message routing and port forwarding
//! - **Render graph**: kernels bound to shared port cells; connected inputs
//!   alias their producer's output storage without copying
//! - **Scheduler**: a persistent worker pool fed through crossbeam channels
//! - **Readback**: [`GraphValue`] handles copy results out after a cycle
//!
//! ## Example
//!
//! ```
//! use flowgraph_rs::graph::NodeSet;
//! use flowgraph_rs::nodes::PassThrough;
//!
//! let mut set = NodeSet::new();
//! let a = set.create::<PassThrough<f32>>()?;
//! let b = set.create::<PassThrough<f32>>()?;
//! set.connect(a, PassThrough::<f32>::OUTPUT, b, PassThrough::<f32>::INPUT)?;
//! set.set_data(a, PassThrough::<f32>::INPUT, 4.0)?;
//!
//! let out = set.request_readback(b, PassThrough::<f32>::OUTPUT)?;
//! set.update()?;
//! assert_eq!(set.read_value(&out)?, 4.0);
//! # Ok::<(), flowgraph_rs::GraphError>(())
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod nodes;

// Re-export commonly used types
pub use config::{GraphConfig, LoggingConfig, RenderConfig};
pub use error::{GraphError, GraphResult, ResultExt};
pub use graph::{
    ConnectionKind, DependencyToken, GraphValue, NodeDefinition, NodeHandle, NodeSet,
    RenderExecutionModel,
};
