//! The simulation world.
//!
//! `NodeSet` owns node lifecycle, message routing and directly assigned input
//! values. It is single threaded: every hook runs on the caller's thread in
//! node index order. Structural mutations bump the [`TopologyVersion`] and are
//! appended to the graph diff, which `update` hands to the render graph.
//!
//! Connection management lives in `connections.rs`, message and data routing
//! in `messaging.rs`, and readback handles in `graph_value.rs`; all of them
//! extend this type.

use super::definition::{self, DestroyContext, InitContext, NodeDefinition, UpdateContext};
use super::diff::{DiffCommand, GraphDiff};
use super::graph_value::GraphValueTable;
use super::id::{InputPortArrayId, InputPortId, NodeHandle, OutputPortId};
use super::port::{Capability, DataOutput, InputPort, NodeDescription};
use super::render::{BufferInfo, InputSource, RenderGraph};
use super::scheduler::{DependencyToken, RenderExecutionModel};
use super::topology::{TopologyDatabase, TopologyVersion};
use super::traversal::TraversalStats;
use super::data::PortData;
use crate::config::RenderConfig;
use crate::error::{GraphError, GraphResult, ResultExt};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct LiveNode {
    pub(crate) description: Arc<NodeDescription>,
    /// `None` while one of the node's hooks is running
    pub(crate) definition: Option<Box<dyn NodeDefinition>>,
    pub(crate) array_sizes: HashMap<InputPortId, u16>,
    pub(crate) forwarded_inputs: HashMap<InputPortId, (NodeHandle, InputPortId)>,
    pub(crate) forwarded_outputs: HashMap<OutputPortId, (NodeHandle, OutputPortId)>,
}

pub(crate) struct NodeSlot {
    generation: u32,
    live: Option<LiveNode>,
}

impl NodeSlot {
    fn holds(&self, handle: NodeHandle) -> bool {
        self.generation == handle.generation() && self.live.is_some()
    }
}

fn is_live(nodes: &[NodeSlot], handle: NodeHandle) -> bool {
    nodes.get(handle.index()).is_some_and(|slot| slot.holds(handle))
}

/// A graph of nodes and the render world mirroring it.
///
/// ```ignore
/// let mut set = NodeSet::new();
/// let a = set.create::<PassThrough<f32>>()?;
/// let b = set.create::<PassThrough<f32>>()?;
/// set.connect(a, PassThrough::<f32>::OUTPUT, b, PassThrough::<f32>::INPUT)?;
/// set.set_data(a, PassThrough::<f32>::INPUT, 4.0)?;
/// let value = set.request_readback(b, PassThrough::<f32>::OUTPUT)?;
/// set.update()?;
/// assert_eq!(set.read_value(&value)?, 4.0);
/// ```
pub struct NodeSet {
    descriptions: HashMap<TypeId, Arc<NodeDescription>>,
    pub(crate) nodes: Vec<NodeSlot>,
    free: Vec<u32>,
    pub(crate) topology: TopologyDatabase,
    pub(crate) diff: GraphDiff,
    pub(crate) version: TopologyVersion,
    model: RenderExecutionModel,
    pub(crate) render: RenderGraph,
    pub(crate) values: GraphValueTable,
    cycle: u64,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::with_config(&RenderConfig::default())
    }

    pub fn with_config(config: &RenderConfig) -> Self {
        let worker_threads = config.resolved_worker_threads();
        tracing::debug!(
            model = ?config.execution_model,
            worker_threads,
            "Creating node set"
        );
        Self {
            descriptions: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            topology: TopologyDatabase::default(),
            diff: GraphDiff::default(),
            version: TopologyVersion::default(),
            model: config.execution_model,
            render: RenderGraph::new(worker_threads),
            values: GraphValueTable::default(),
            cycle: 0,
        }
    }

    /// Instantiate a node of definition `D`.
    ///
    /// The definition's description is registered on first use. The node
    /// exists immediately; it is mirrored into the render world at the next
    /// `update` if it has a kernel. If `init` fails the node is removed
    /// again and the error returned.
    pub fn create<D: NodeDefinition + Default>(&mut self) -> GraphResult<NodeHandle> {
        let description = self.register::<D>()?;
        let definition: Box<dyn NodeDefinition> = Box::new(D::default());
        let kernel = definition.create_kernel();
        let declares_kernel = description.has_capability(Capability::Kernel);
        if kernel.is_some() != declares_kernel {
            let message = if declares_kernel {
                "declares a kernel but create_kernel returned None"
            } else {
                "create_kernel returned a kernel that the description does not declare"
            };
            return Err(GraphError::InvalidDefinition {
                definition: description.name(),
                message: message.to_string(),
            });
        }

        let handle = self.allocate(LiveNode {
            description: description.clone(),
            definition: Some(definition),
            array_sizes: HashMap::new(),
            forwarded_inputs: HashMap::new(),
            forwarded_outputs: HashMap::new(),
        });
        self.version.signal_changed();
        self.diff.push(DiffCommand::Create {
            handle,
            description: description.clone(),
            kernel,
        });
        tracing::debug!("Created {} ({})", handle, description.name());

        let init = self.with_definition(handle, |definition, set| {
            definition.init(&mut InitContext { set, handle })
        });
        if let Err(err) = init {
            if self.exists(handle) {
                self.release(handle);
            }
            return Err(err.with_context(format!("init of {} ({})", handle, description.name())));
        }
        Ok(handle)
    }

    /// Destroy a node, removing every connection touching it.
    ///
    /// The node's `destroy` hook runs first. The node is removed even if the
    /// hook fails; the hook's error is returned afterwards.
    pub fn destroy(&mut self, handle: NodeHandle) -> GraphResult<()> {
        if self.live(handle)?.definition.is_none() {
            return Err(self.busy(handle));
        }
        let hooked = self.with_definition(handle, |definition, set| {
            definition.destroy(&mut DestroyContext { set, handle })
        });
        if self.exists(handle) {
            self.release(handle);
        }
        hooked
    }

    pub fn exists(&self, handle: NodeHandle) -> bool {
        is_live(&self.nodes, handle)
    }

    pub fn description(&self, handle: NodeHandle) -> GraphResult<&NodeDescription> {
        Ok(&self.live(handle)?.description)
    }

    /// Typed access to a node's simulation state.
    pub fn node_data<D: NodeDefinition>(&self, handle: NodeHandle) -> GraphResult<&D> {
        let live = self.live(handle)?;
        let node = live.definition.as_deref().ok_or_else(|| self.busy(handle))?;
        definition::downcast_ref::<D>(node).ok_or(GraphError::TypeMismatch {
            expected: std::any::type_name::<D>(),
            found: live.description.name(),
        })
    }

    pub fn node_data_mut<D: NodeDefinition>(&mut self, handle: NodeHandle) -> GraphResult<&mut D> {
        if self.live(handle)?.definition.is_none() {
            return Err(self.busy(handle));
        }
        let live = self.live_mut(handle)?;
        let found = live.description.name();
        let node = live
            .definition
            .as_deref_mut()
            .ok_or(GraphError::InvalidHandle(handle))?;
        definition::downcast_mut::<D>(node).ok_or(GraphError::TypeMismatch {
            expected: std::any::type_name::<D>(),
            found,
        })
    }

    /// Advance one cycle with no external dependency.
    pub fn update(&mut self) -> GraphResult<()> {
        self.update_with_dependency(DependencyToken::completed())
            .map(|_| ())
    }

    /// Advance one cycle.
    ///
    /// Joins the previous cycle, runs every live node's `update` hook in
    /// index order, then aligns the render world and schedules its kernels.
    /// Kernels do not start before `dependency` completes. The returned token completes when this
    /// cycle's render work has finished.
    pub fn update_with_dependency(&mut self, dependency: DependencyToken) -> GraphResult<DependencyToken> {
        self.sync()?;
        let handles: Vec<NodeHandle> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.live.is_some())
            .map(|(index, slot)| NodeHandle::new(index as u32, slot.generation))
            .collect();
        for handle in handles {
            if !self.exists(handle) {
                continue;
            }
            self.with_definition(handle, |definition, set| {
                definition.update(&mut UpdateContext { set, handle })
            })
            .with_context(|| format!("update of {}", handle))?;
        }

        let diff = std::mem::take(&mut self.diff);
        let cycle = self.cycle;
        self.cycle += 1;
        let nodes = &self.nodes;
        self.render.copy_worlds(
            diff,
            &self.topology,
            |handle| is_live(nodes, handle),
            self.version,
            self.model,
            dependency,
            cycle,
        )
    }

    /// Wait for the render work of the last cycle.
    pub fn sync(&mut self) -> GraphResult<()> {
        self.render.sync()
    }

    /// Whether the last cycle's render work has finished.
    pub fn is_idle(&self) -> bool {
        self.render.is_idle()
    }

    pub fn execution_model(&self) -> RenderExecutionModel {
        self.model
    }

    pub fn set_execution_model(&mut self, model: RenderExecutionModel) {
        if self.model != model {
            tracing::info!("Render execution model {:?} -> {:?}", self.model, model);
            self.model = model;
            self.version.signal_changed();
        }
    }

    /// Number of cycles started so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn topology_version(&self) -> TopologyVersion {
        self.version
    }

    pub fn connection_count(&self) -> usize {
        self.topology.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.live.is_some()).count()
    }

    pub fn render_node_count(&mut self) -> GraphResult<usize> {
        self.sync()?;
        Ok(self.render.node_count())
    }

    /// Statistics of the last traversal recomputation.
    pub fn traversal_stats(&self) -> TraversalStats {
        self.render.stats().clone()
    }

    /// What a data input slot of a mirrored node reads from.
    pub fn input_source(&mut self, handle: NodeHandle, port: InputPortArrayId) -> GraphResult<InputSource> {
        let (handle, resolved) = self.resolve_input(handle, port.port)?;
        self.sync()?;
        self.render.input_source(
            handle,
            InputPortArrayId {
                port: resolved,
                index: port.index,
            },
        )
    }

    pub fn input_source_of<P: InputPort>(&mut self, handle: NodeHandle, port: P) -> GraphResult<InputSource> {
        self.input_source(handle, InputPortArrayId::scalar(port.id()))
    }

    /// Whether a consumer slot aliases the producer's output storage.
    pub fn aliases(
        &mut self,
        consumer: NodeHandle,
        port: InputPortArrayId,
        producer: NodeHandle,
        output: OutputPortId,
    ) -> GraphResult<bool> {
        let (consumer, resolved) = self.resolve_input(consumer, port.port)?;
        let (producer, output) = self.resolve_output(producer, output)?;
        self.sync()?;
        self.render.aliases(
            consumer,
            InputPortArrayId {
                port: resolved,
                index: port.index,
            },
            producer,
            output,
        )
    }

    /// Allocation state of buffer `field` of a data output.
    pub fn output_buffer_info<T: PortData>(
        &mut self,
        handle: NodeHandle,
        port: DataOutput<T>,
        field: usize,
    ) -> GraphResult<BufferInfo> {
        let (handle, output) = self.resolve_output(handle, port.port())?;
        self.sync()?;
        self.render.buffer_info(handle, output, field)
    }

    pub(crate) fn live(&self, handle: NodeHandle) -> GraphResult<&LiveNode> {
        self.nodes
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.live.as_ref())
            .ok_or(GraphError::InvalidHandle(handle))
    }

    pub(crate) fn live_mut(&mut self, handle: NodeHandle) -> GraphResult<&mut LiveNode> {
        self.nodes
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.live.as_mut())
            .ok_or(GraphError::InvalidHandle(handle))
    }

    /// Run a hook with the node's definition checked out of its slot.
    pub(crate) fn with_definition<R>(
        &mut self,
        handle: NodeHandle,
        hook: impl FnOnce(&mut dyn NodeDefinition, &mut NodeSet) -> GraphResult<R>,
    ) -> GraphResult<R> {
        let Some(mut definition) = self.live_mut(handle)?.definition.take() else {
            return Err(self.busy(handle));
        };
        let result = hook(&mut *definition, self);
        if let Ok(live) = self.live_mut(handle) {
            live.definition = Some(definition);
        }
        result
    }

    fn busy(&self, handle: NodeHandle) -> GraphError {
        let name = self.live(handle).map_or("<destroyed>", |live| live.description.name());
        GraphError::invalid(format!(
            "{} ({}) is already running a hook; re-entrant calls are not supported",
            handle, name
        ))
    }

    fn register<D: NodeDefinition>(&mut self) -> GraphResult<Arc<NodeDescription>> {
        if let Some(description) = self.descriptions.get(&TypeId::of::<D>()) {
            return Ok(description.clone());
        }
        let mut description = NodeDescription::new(D::name());
        D::describe(&mut description);
        description.validate()?;
        tracing::debug!(
            inputs = description.inputs().len(),
            outputs = description.outputs().len(),
            "Registered node definition {}",
            description.name()
        );
        let description = Arc::new(description);
        self.descriptions.insert(TypeId::of::<D>(), description.clone());
        Ok(description)
    }

    fn allocate(&mut self, live: LiveNode) -> NodeHandle {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.nodes[index as usize];
                slot.live = Some(live);
                NodeHandle::new(index, slot.generation)
            }
            None => {
                self.nodes.push(NodeSlot {
                    generation: 1,
                    live: Some(live),
                });
                NodeHandle::new((self.nodes.len() - 1) as u32, 1)
            }
        }
    }

    /// Remove a live node without running its hooks.
    fn release(&mut self, handle: NodeHandle) {
        let removed = self.topology.disconnect_all(handle);
        self.values.invalidate_node(handle);
        if let Some(slot) = self.nodes.get_mut(handle.index()) {
            slot.live = None;
            slot.generation = slot.generation.wrapping_add(1).max(1);
            self.free.push(handle.index() as u32);
        }
        self.version.signal_changed();
        self.diff.push(DiffCommand::Destroy { handle });
        tracing::debug!("Destroyed {} ({} connections removed)", handle, removed.len());
    }
}

impl Default for NodeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSet")
            .field("nodes", &self.node_count())
            .field("connections", &self.topology.len())
            .field("version", &self.version)
            .field("model", &self.model)
            .field("cycle", &self.cycle)
            .field("pending_commands", &self.diff.len())
            .finish()
    }
}
