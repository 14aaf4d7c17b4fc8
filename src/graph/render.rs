//! The render graph: the compiled mirror of every kernel-bearing node.
//!
//! The previous cycle's work is joined by [`RenderGraph::sync`] before the
//! simulation hooks run. Each cycle `copy_worlds` then runs the same pipeline:
//!
//! 1. copy producer outputs into feedback latches
//! 2. align with the simulation world by replaying the diff
//! 3. recompute the traversal cache and repatch inputs if the topology
//!    version changed
//! 4. hand the traversal to the scheduler
//!
//! Any failure tears the render world down. Nodes that were mirrored at that
//! point are retired: commands addressed to them are ignored and consumers
//! reading from them fall back to blank values until they are recreated.
//! A fault surfaced by `sync` leaves the pending diff untouched, so nodes
//! created after the faulting cycle started are mirrored by the next
//! `copy_worlds`. A failure inside `copy_worlds` drops its diff, and the
//! nodes it would have created are retired with the rest.

use super::buffer::{AllocatedBuffer, BufferDescription, BufferElement};
use super::cell::{BlankCells, InputBinding, PortCell, SharedCell};
use super::data::{DataValue, PortData, ValueType};
use super::diff::{DiffCommand, GraphDiff};
use super::id::{AllocationId, InputPortArrayId, InputPortId, NodeHandle, OutputPortId};
use super::kernel::{InputSlots, Kernel, KernelNode, RenderInput, RenderOutput};
use super::port::{NodeDescription, PortCategory};
use super::scheduler::{
    DependencyToken, RenderExecutionModel, RenderFence, SharedKernel, TaskGraph, WorkerPool,
};
use super::topology::{ConnectionKind, TopologyDatabase, TopologyVersion};
use super::traversal::{TraversalCache, TraversalCompiler, TraversalStats};
use crate::error::{GraphError, GraphResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// What a data input slot currently reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputSource {
    /// The shared default value of the port type
    Blank,
    /// A value set directly, delivered by a message or retained
    Owned,
    Connected {
        source: NodeHandle,
        port: OutputPortId,
    },
    /// Previous-cycle value of the producer
    Feedback {
        source: NodeHandle,
        port: OutputPortId,
    },
}

impl InputSource {
    fn of(binding: &InputBinding) -> Self {
        match binding {
            InputBinding::Blank(_) => InputSource::Blank,
            InputBinding::Owned(_) => InputSource::Owned,
            InputBinding::Connected { source, port, .. } => InputSource::Connected {
                source: *source,
                port: *port,
            },
            InputBinding::Feedback { source, port, .. } => InputSource::Feedback {
                source: *source,
                port: *port,
            },
        }
    }
}

/// Allocation state of one buffer field of a data output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    pub allocation: Option<AllocationId>,
    pub len: usize,
    pub owner: NodeHandle,
}

impl From<&BufferDescription> for BufferInfo {
    fn from(desc: &BufferDescription) -> Self {
        Self {
            allocation: desc.allocation(),
            len: desc.len(),
            owner: desc.owner(),
        }
    }
}

struct RenderNode {
    handle: NodeHandle,
    kernel: SharedKernel,
    outputs: Vec<Option<SharedCell>>,
}

struct FeedbackLatch {
    producer: SharedCell,
    latch: SharedCell,
}

/// Input-side commands, applied in emission order after buffer resizes.
enum InputUpdate {
    Resize {
        handle: NodeHandle,
        port: InputPortId,
        size: u16,
    },
    Set {
        handle: NodeHandle,
        port: InputPortArrayId,
        value: Box<dyn DataValue>,
    },
    Retain {
        handle: NodeHandle,
        port: InputPortArrayId,
    },
}

pub(crate) struct RenderGraph {
    nodes: Vec<Option<RenderNode>>,
    retired: HashSet<NodeHandle>,
    blanks: BlankCells,
    latches: HashMap<(NodeHandle, OutputPortId), FeedbackLatch>,
    cache: TraversalCache,
    last_version: Option<TopologyVersion>,
    worker_threads: usize,
    pool: Option<WorkerPool>,
    pending: Option<RenderFence>,
}

impl RenderGraph {
    pub(crate) fn new(worker_threads: usize) -> Self {
        Self {
            nodes: Vec::new(),
            retired: HashSet::new(),
            blanks: BlankCells::default(),
            latches: HashMap::new(),
            cache: TraversalCache::default(),
            last_version: None,
            worker_threads,
            pool: None,
            pending: None,
        }
    }

    /// Bring the render world in line with the simulation world and start
    /// this cycle's kernels. The previous cycle must already be joined.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn copy_worlds(
        &mut self,
        diff: GraphDiff,
        topology: &TopologyDatabase,
        exists: impl Fn(NodeHandle) -> bool,
        version: TopologyVersion,
        model: RenderExecutionModel,
        dependency: DependencyToken,
        cycle: u64,
    ) -> GraphResult<DependencyToken> {
        let commands = diff.into_commands();
        let created: Vec<NodeHandle> = commands
            .iter()
            .filter_map(|command| match command {
                DiffCommand::Create {
                    handle,
                    kernel: Some(_),
                    ..
                } => Some(*handle),
                _ => None,
            })
            .collect();

        tracing::debug!(cycle, commands = commands.len(), ?model, "Aligning render graph");
        self.latch_feedback();
        let result = self
            .align(commands, &exists)
            .and_then(|()| self.patch(topology, version))
            .and_then(|()| self.schedule(model, dependency, cycle));

        result.map_err(|err| {
            self.teardown(&err);
            self.retire_unmirrored(&created, &exists);
            err
        })
    }

    /// Wait for outstanding kernels, surfacing a fault raised by them.
    pub(crate) fn sync(&mut self) -> GraphResult<()> {
        let Some(fence) = self.pending.take() else {
            return Ok(());
        };
        fence.join().map_err(|err| {
            self.teardown(&err);
            err
        })
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.as_ref().map_or(true, RenderFence::is_complete)
    }

    fn latch_feedback(&mut self) {
        for latch in self.latches.values() {
            let snapshot = latch.producer.read().clone();
            *latch.latch.write() = snapshot;
        }
    }

    fn align(
        &mut self,
        commands: Vec<DiffCommand>,
        exists: &impl Fn(NodeHandle) -> bool,
    ) -> GraphResult<()> {
        let mut buffer_sizes: HashMap<(NodeHandle, OutputPortId, usize), usize> = HashMap::new();
        let mut input_updates = Vec::new();

        for command in commands {
            let handle = command.handle();
            if let DiffCommand::Destroy { handle } = command {
                self.destroy_node(handle);
                continue;
            }
            if !exists(handle) || self.retired.contains(&handle) {
                tracing::trace!(?command, "Skipping command for a node that is not mirrored");
                continue;
            }
            match command {
                DiffCommand::Create {
                    handle,
                    description,
                    kernel,
                } => {
                    if let Some(kernel) = kernel {
                        self.create_node(handle, &description, kernel)?;
                    }
                }
                DiffCommand::ResizeBuffer {
                    handle,
                    port,
                    field,
                    size,
                } => {
                    buffer_sizes.insert((handle, port, field), size);
                }
                DiffCommand::ResizePortArray { handle, port, size } => {
                    input_updates.push(InputUpdate::Resize { handle, port, size })
                }
                DiffCommand::MessageToData {
                    handle,
                    port,
                    value,
                } => input_updates.push(InputUpdate::Set {
                    handle,
                    port,
                    value,
                }),
                DiffCommand::RetainData { handle, port } => {
                    input_updates.push(InputUpdate::Retain { handle, port })
                }
                DiffCommand::KernelData { handle, data } => {
                    let kernel = self.node(handle)?.kernel.clone();
                    let mut node = kernel.lock();
                    node.kernel
                        .apply_data(data)
                        .map_err(|source| GraphError::KernelFault {
                            node: handle,
                            source,
                        })?;
                }
                DiffCommand::Destroy { .. } => {}
            }
        }

        for ((handle, port, field), size) in buffer_sizes {
            self.resize_buffer(handle, port, field, size)?;
        }
        for update in input_updates {
            self.apply_input_update(update)?;
        }
        Ok(())
    }

    fn create_node(
        &mut self,
        handle: NodeHandle,
        description: &NodeDescription,
        kernel: Box<dyn Kernel>,
    ) -> GraphResult<()> {
        let index = handle.index();
        if let Some(Some(existing)) = self.nodes.get(index) {
            return Err(GraphError::Desync(format!(
                "{} created while its render slot still holds {}",
                handle, existing.handle
            )));
        }

        let mut inputs = Vec::with_capacity(description.inputs().len());
        for port in description.inputs() {
            let input = port.value_type().map(|ty| RenderInput {
                value_type: *ty,
                slots: if port.is_array {
                    InputSlots::Array(Vec::new())
                } else {
                    InputSlots::Scalar(InputBinding::Blank(self.blanks.get(ty)))
                },
            });
            inputs.push(input);
        }
        let outputs: Vec<Option<RenderOutput>> = description
            .outputs()
            .iter()
            .map(|port| {
                port.value_type().map(|ty| RenderOutput {
                    value_type: *ty,
                    cell: Arc::new(RwLock::new(PortCell::new(ty, handle))),
                })
            })
            .collect();
        let cells = outputs
            .iter()
            .map(|output| output.as_ref().map(|o| o.cell.clone()))
            .collect();

        if self.nodes.len() <= index {
            self.nodes.resize_with(index + 1, || None);
        }
        self.nodes[index] = Some(RenderNode {
            handle,
            kernel: Arc::new(Mutex::new(KernelNode {
                handle,
                name: description.name(),
                kernel,
                inputs,
                outputs,
            })),
            outputs: cells,
        });
        tracing::debug!("Mirrored {} ({})", handle, description.name());
        Ok(())
    }

    fn destroy_node(&mut self, handle: NodeHandle) {
        let slot = self.nodes.get_mut(handle.index());
        match slot {
            Some(slot) if slot.as_ref().is_some_and(|n| n.handle == handle) => {
                *slot = None;
                self.latches.retain(|(source, _), _| *source != handle);
                tracing::debug!("Dropped render node {}", handle);
            }
            _ => {
                self.retired.remove(&handle);
            }
        }
    }

    fn resize_buffer(
        &mut self,
        handle: NodeHandle,
        port: OutputPortId,
        field: usize,
        size: usize,
    ) -> GraphResult<()> {
        let cell = self.output_cell(handle, port)?;
        let mut cell = cell.write();
        let element = cell
            .value
            .buffer_field(field)
            .map(BufferDescription::element)
            .ok_or_else(|| {
                GraphError::Desync(format!("{:?} of {} has no buffer field {}", port, handle, field))
            })?;
        let slot = cell.buffers.get_mut(field).ok_or_else(|| {
            GraphError::Desync(format!("{:?} of {} has no storage for field {}", port, handle, field))
        })?;
        *slot = AllocatedBuffer::allocate(element, size);
        cell.restamp();
        tracing::debug!("Resized buffer {:?}.{} of {} to {} elements", port, field, handle, size);
        Ok(())
    }

    fn resize_port_array(&mut self, handle: NodeHandle, port: InputPortId, size: u16) -> GraphResult<()> {
        let kernel = self.node(handle)?.kernel.clone();
        let mut node = kernel.lock();
        let input = node
            .inputs
            .get_mut(port.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| GraphError::Desync(format!("{:?} is not a data input of {}", port, handle)))?;
        let blank = self.blanks.get(&input.value_type);
        match &mut input.slots {
            InputSlots::Array(slots) => {
                slots.resize_with(size as usize, || InputBinding::Blank(blank.clone()));
                Ok(())
            }
            InputSlots::Scalar(_) => Err(GraphError::Desync(format!(
                "{:?} of {} is not a port array",
                port, handle
            ))),
        }
    }

    fn apply_input_update(&mut self, update: InputUpdate) -> GraphResult<()> {
        let (handle, port) = match &update {
            InputUpdate::Resize { handle, port, size } => {
                return self.resize_port_array(*handle, *port, *size);
            }
            InputUpdate::Set { handle, port, .. } | InputUpdate::Retain { handle, port } => {
                (*handle, *port)
            }
        };
        let kernel = self.node(handle)?.kernel.clone();
        let mut node = kernel.lock();
        let Some(slot) = node
            .inputs
            .get_mut(port.port.index())
            .and_then(Option::as_mut)
            .and_then(|input| input.slot_mut(port.index))
        else {
            tracing::debug!("Dropping input update for {:?} of {}: slot no longer exists", port, handle);
            return Ok(());
        };

        match update {
            InputUpdate::Set { value, .. } => {
                *slot = InputBinding::Owned(Arc::new(PortCell::owned(value)));
            }
            InputUpdate::Retain { .. } => {
                if slot.is_aliased() {
                    let snapshot = slot.snapshot();
                    *slot = InputBinding::Owned(Arc::new(snapshot));
                }
            }
            InputUpdate::Resize { .. } => {}
        }
        Ok(())
    }

    fn patch(&mut self, topology: &TopologyDatabase, version: TopologyVersion) -> GraphResult<()> {
        if self.last_version == Some(version) {
            return Ok(());
        }

        let handles: Vec<NodeHandle> = self.nodes.iter().flatten().map(|n| n.handle).collect();
        self.cache = TraversalCompiler::compile(&handles, topology)?;

        let mut used_latches = HashSet::new();
        for handle in &handles {
            self.patch_node(*handle, topology, &mut used_latches)?;
        }
        self.latches.retain(|key, _| used_latches.contains(key));
        self.last_version = Some(version);

        let stats = &self.cache.stats;
        tracing::info!(
            version = version.get(),
            nodes = stats.nodes,
            islands = stats.islands,
            "Render topology recomputed in {}us",
            stats.compile_time_us
        );
        Ok(())
    }

    fn patch_node(
        &mut self,
        handle: NodeHandle,
        topology: &TopologyDatabase,
        used_latches: &mut HashSet<(NodeHandle, OutputPortId)>,
    ) -> GraphResult<()> {
        let kernel = self.node(handle)?.kernel.clone();
        let mut node = kernel.lock();
        for (index, input) in node.inputs.iter_mut().enumerate() {
            let Some(input) = input else {
                continue;
            };
            let port = InputPortId(index as u16);
            let ty = input.value_type;
            match &mut input.slots {
                InputSlots::Scalar(binding) => {
                    let id = InputPortArrayId::scalar(port);
                    self.patch_slot(handle, id, &ty, binding, topology, used_latches)?;
                }
                InputSlots::Array(bindings) => {
                    for (i, binding) in bindings.iter_mut().enumerate() {
                        let id = InputPortArrayId::slot(port, i as u16);
                        self.patch_slot(handle, id, &ty, binding, topology, used_latches)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn patch_slot(
        &mut self,
        handle: NodeHandle,
        port: InputPortArrayId,
        ty: &ValueType,
        binding: &mut InputBinding,
        topology: &TopologyDatabase,
        used_latches: &mut HashSet<(NodeHandle, OutputPortId)>,
    ) -> GraphResult<()> {
        let connection = topology
            .connections_to(handle, port)
            .find(|c| c.category == PortCategory::Data)
            .copied();
        let Some(connection) = connection else {
            if binding.is_aliased() {
                *binding = InputBinding::Blank(self.blanks.get(ty));
            }
            return Ok(());
        };

        let (source, source_port) = (connection.source, connection.source_port);
        if self.retired.contains(&source) {
            *binding = InputBinding::Blank(self.blanks.get(ty));
            return Ok(());
        }
        let producer = self.output_cell(source, source_port)?;

        *binding = match connection.kind {
            ConnectionKind::Normal => InputBinding::Connected {
                cell: producer,
                source,
                port: source_port,
            },
            ConnectionKind::Feedback => {
                let key = (source, source_port);
                used_latches.insert(key);
                let latch = self.latches.entry(key).or_insert_with(|| FeedbackLatch {
                    latch: Arc::new(RwLock::new(producer.read().clone())),
                    producer: producer.clone(),
                });
                InputBinding::Feedback {
                    cell: latch.latch.clone(),
                    source,
                    port: source_port,
                }
            }
        };
        Ok(())
    }

    fn schedule(
        &mut self,
        model: RenderExecutionModel,
        dependency: DependencyToken,
        cycle: u64,
    ) -> GraphResult<DependencyToken> {
        let kernels = self
            .cache
            .order
            .iter()
            .map(|handle| self.node(*handle).map(|n| n.kernel.clone()))
            .collect::<GraphResult<Vec<_>>>()?;
        let graph = TaskGraph::partition(&self.cache, kernels, model);

        if model.runs_inline() {
            dependency.wait();
            graph.run_inline(cycle)?;
            return Ok(DependencyToken::completed());
        }

        let pool = match self.pool.take() {
            Some(pool) => pool,
            None => WorkerPool::new(self.worker_threads)?,
        };
        let fence = pool.submit(graph, dependency, cycle);
        self.pool = Some(pool);
        let token = fence.token();
        self.pending = Some(fence);
        Ok(token)
    }

    fn teardown(&mut self, reason: &GraphError) {
        let mirrored = self.nodes.iter().flatten().count();
        tracing::error!(error = %reason, nodes = mirrored, "Tearing down render graph");
        for node in self.nodes.drain(..).flatten() {
            self.retired.insert(node.handle);
        }
        self.latches.clear();
        self.cache = TraversalCache::default();
        self.last_version = None;
        self.pending = None;
    }

    /// Nodes created in a dropped diff never reach the render world.
    fn retire_unmirrored(&mut self, created: &[NodeHandle], exists: &impl Fn(NodeHandle) -> bool) {
        for handle in created {
            if exists(*handle) && self.mirrored(*handle).is_none() {
                self.retired.insert(*handle);
            }
        }
        self.retired.retain(|handle| exists(*handle));
    }

    fn mirrored(&self, handle: NodeHandle) -> Option<&RenderNode> {
        self.nodes
            .get(handle.index())
            .and_then(Option::as_ref)
            .filter(|node| node.handle == handle)
    }

    fn node(&self, handle: NodeHandle) -> GraphResult<&RenderNode> {
        self.mirrored(handle)
            .ok_or_else(|| GraphError::Desync(format!("{} has no render node", handle)))
    }

    fn output_cell(&self, handle: NodeHandle, port: OutputPortId) -> GraphResult<SharedCell> {
        self.node(handle)?
            .outputs
            .get(port.index())
            .and_then(Option::clone)
            .ok_or_else(|| GraphError::Desync(format!("{:?} is not a data output of {}", port, handle)))
    }

    fn readable(&self, handle: NodeHandle) -> GraphResult<&RenderNode> {
        if self.retired.contains(&handle) {
            return Err(GraphError::invalid(format!(
                "The render node of {} was torn down by an earlier fault; recreate the node",
                handle
            )));
        }
        self.mirrored(handle).ok_or_else(|| {
            GraphError::invalid(format!(
                "{} has no render node; it needs a kernel and at least one update",
                handle
            ))
        })
    }

    fn readable_cell(&self, handle: NodeHandle, port: OutputPortId) -> GraphResult<SharedCell> {
        self.readable(handle)?
            .outputs
            .get(port.index())
            .and_then(Option::clone)
            .ok_or_else(|| GraphError::invalid(format!("{:?} is not a data output of {}", port, handle)))
    }

    pub(crate) fn read_output<T: PortData>(&self, handle: NodeHandle, port: OutputPortId) -> GraphResult<T> {
        let cell = self.readable_cell(handle, port)?;
        let cell = cell.read();
        cell.value
            .as_any()
            .downcast_ref::<T>()
            .cloned()
            .ok_or(GraphError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found: "value of another type",
            })
    }

    pub(crate) fn read_buffer<E: BufferElement>(
        &self,
        handle: NodeHandle,
        port: OutputPortId,
        field: usize,
    ) -> GraphResult<Vec<E>> {
        let cell = self.readable_cell(handle, port)?;
        let cell = cell.read();
        match cell.buffers.get(field) {
            None => Err(GraphError::IndexOutOfRange {
                what: format!("buffer fields of {:?}", port),
                index: field,
                size: cell.buffers.len(),
            }),
            Some(None) => Ok(Vec::new()),
            Some(Some(buffer)) => buffer
                .slice::<E>()
                .map(<[E]>::to_vec)
                .ok_or(GraphError::TypeMismatch {
                    expected: std::any::type_name::<E>(),
                    found: "buffer of another element type",
                }),
        }
    }

    pub(crate) fn buffer_info(
        &self,
        handle: NodeHandle,
        port: OutputPortId,
        field: usize,
    ) -> GraphResult<BufferInfo> {
        let cell = self.readable_cell(handle, port)?;
        let cell = cell.read();
        cell.value
            .buffer_field(field)
            .map(BufferInfo::from)
            .ok_or_else(|| GraphError::IndexOutOfRange {
                what: format!("buffer fields of {:?}", port),
                index: field,
                size: cell.buffers.len(),
            })
    }

    pub(crate) fn input_source(&self, handle: NodeHandle, port: InputPortArrayId) -> GraphResult<InputSource> {
        let node = self.readable(handle)?.kernel.lock();
        node.inputs
            .get(port.port.index())
            .and_then(Option::as_ref)
            .and_then(|input| input.slot(port.index))
            .map(InputSource::of)
            .ok_or_else(|| GraphError::invalid(format!("{:?} is not a data input slot of {}", port, handle)))
    }

    /// Whether the consumer slot reads the producer's output storage directly.
    pub(crate) fn aliases(
        &self,
        consumer: NodeHandle,
        port: InputPortArrayId,
        producer: NodeHandle,
        output: OutputPortId,
    ) -> GraphResult<bool> {
        let cell = self.readable_cell(producer, output)?;
        let node = self.readable(consumer)?.kernel.lock();
        let binding = node
            .inputs
            .get(port.port.index())
            .and_then(Option::as_ref)
            .and_then(|input| input.slot(port.index))
            .ok_or_else(|| {
                GraphError::invalid(format!("{:?} is not a data input slot of {}", port, consumer))
            })?;
        Ok(match binding {
            InputBinding::Connected { cell: aliased, .. } => Arc::ptr_eq(aliased, &cell),
            _ => false,
        })
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub(crate) fn stats(&self) -> &TraversalStats {
        &self.cache.stats
    }

    #[cfg(test)]
    pub(crate) fn last_version(&self) -> Option<TopologyVersion> {
        self.last_version
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        if let Some(fence) = self.pending.take() {
            if let Err(err) = fence.join() {
                tracing::warn!("Render work faulted during shutdown: {}", err);
            }
        }
    }
}
