//! Kernel scheduling.
//!
//! All execution models share one dependency-respecting task scheduler and
//! differ only in how the traversal cache is partitioned into tasks:
//!
//! - **Synchronous**: one task holding every island in order, run inline on
//!   the calling thread
//! - **SingleThreaded**: the same single task, run on the worker pool
//! - **MaximallyParallel**: one task per node; a task waits for the tasks of
//!   its direct normal data producers
//! - **Islands**: one task per island, no dependencies between tasks
//!
//! Background work is joined through a [`RenderFence`] at the start of the
//! next cycle, on `NodeSet::sync` or before any readback.

use super::kernel::KernelNode;
use super::traversal::TraversalCache;
use crate::error::{GraphError, GraphResult};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How kernels of the render graph are executed each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderExecutionModel {
    /// Every node is its own task; independent branches run concurrently
    #[default]
    MaximallyParallel,
    /// The whole graph as one background task, in traversal order.
    ///
    /// Kernels run off the calling thread, so a fault is reported at the next
    /// join (`update`, `sync` or a readback) rather than by the `update` that
    /// scheduled it.
    SingleThreaded,
    /// Every kernel in traversal order on the calling thread. A fault is
    /// returned by the `update` that ran it.
    Synchronous,
    /// Each island is one background task
    Islands,
}

impl RenderExecutionModel {
    pub fn runs_inline(self) -> bool {
        self == RenderExecutionModel::Synchronous
    }
}

struct TokenState {
    complete: Mutex<bool>,
    signal: Condvar,
}

/// Completion signal exchanged with external schedulers.
///
/// `NodeSet::update_with_dependency` waits for the token it is given before
/// kernels read any data, and returns a token completed once the cycle's
/// render work has finished.
#[derive(Clone)]
pub struct DependencyToken {
    state: Arc<TokenState>,
}

impl DependencyToken {
    /// A token that has not completed yet.
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                complete: Mutex::new(false),
                signal: Condvar::new(),
            }),
        }
    }

    /// A token that is already complete.
    pub fn completed() -> Self {
        let token = Self::new();
        token.complete();
        token
    }

    pub fn complete(&self) {
        let mut complete = self.state.complete.lock();
        *complete = true;
        self.state.signal.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        *self.state.complete.lock()
    }

    pub fn wait(&self) {
        let mut complete = self.state.complete.lock();
        while !*complete {
            self.state.signal.wait(&mut complete);
        }
    }

    /// Returns whether the token completed within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut complete = self.state.complete.lock();
        if !*complete {
            self.state.signal.wait_for(&mut complete, timeout);
        }
        *complete
    }
}

impl Default for DependencyToken {
    fn default() -> Self {
        Self::completed()
    }
}

impl std::fmt::Debug for DependencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyToken")
            .field("complete", &self.is_complete())
            .finish()
    }
}

pub(crate) type SharedKernel = Arc<Mutex<KernelNode>>;

/// A schedulable unit: kernels run in order, after all dependencies.
pub(crate) struct Task {
    pub(crate) nodes: Vec<SharedKernel>,
    pub(crate) dependents: Vec<usize>,
    pub(crate) dependencies: usize,
}

pub(crate) struct TaskGraph {
    pub(crate) tasks: Vec<Task>,
}

impl TaskGraph {
    /// Partition the traversal order into tasks for `model`.
    ///
    /// `kernels` holds the render node of each entry of `cache.order`.
    pub(crate) fn partition(
        cache: &TraversalCache,
        kernels: Vec<SharedKernel>,
        model: RenderExecutionModel,
    ) -> Self {
        let tasks = match model {
            RenderExecutionModel::Synchronous | RenderExecutionModel::SingleThreaded => {
                if kernels.is_empty() {
                    Vec::new()
                } else {
                    vec![Task {
                        nodes: kernels,
                        dependents: Vec::new(),
                        dependencies: 0,
                    }]
                }
            }
            RenderExecutionModel::Islands => cache
                .islands
                .iter()
                .map(|range| Task {
                    nodes: kernels[range.clone()].to_vec(),
                    dependents: Vec::new(),
                    dependencies: 0,
                })
                .collect(),
            RenderExecutionModel::MaximallyParallel => {
                let mut tasks: Vec<Task> = kernels
                    .into_iter()
                    .zip(&cache.parents)
                    .map(|(node, parents)| Task {
                        nodes: vec![node],
                        dependents: Vec::new(),
                        dependencies: parents.len(),
                    })
                    .collect();
                for (child, parents) in cache.parents.iter().enumerate() {
                    for &parent in parents {
                        tasks[parent].dependents.push(child);
                    }
                }
                tasks
            }
        };
        Self { tasks }
    }

    /// Run every task on the calling thread, stopping at the first fault.
    pub(crate) fn run_inline(&self, cycle: u64) -> GraphResult<()> {
        for task in &self.tasks {
            for node in &task.nodes {
                node.lock().execute(cycle)?;
            }
        }
        Ok(())
    }
}

/// Shared state of one cycle's background execution.
pub(crate) struct RenderJob {
    tasks: Vec<Task>,
    pending: Vec<AtomicUsize>,
    remaining: AtomicUsize,
    faulted: AtomicBool,
    fault: Mutex<Option<GraphError>>,
    gate: DependencyToken,
    done: DependencyToken,
    queue: Sender<WorkerMessage>,
    cycle: u64,
}

impl RenderJob {
    fn run_task(self: &Arc<Self>, index: usize) {
        self.gate.wait();

        if !self.faulted.load(Ordering::Acquire) {
            for node in &self.tasks[index].nodes {
                if let Err(err) = node.lock().execute(self.cycle) {
                    self.record_fault(err);
                    break;
                }
            }
        }

        for &dependent in &self.tasks[index].dependents {
            if self.pending[dependent].fetch_sub(1, Ordering::AcqRel) == 1 {
                self.enqueue(dependent);
            }
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.complete();
        }
    }

    fn enqueue(self: &Arc<Self>, index: usize) {
        if let Err(err) = self.queue.send(WorkerMessage::Run(self.clone(), index)) {
            // Pool is shutting down; finish the work here so the fence completes.
            if let WorkerMessage::Run(job, index) = err.into_inner() {
                job.run_task(index);
            }
        }
    }

    fn record_fault(&self, err: GraphError) {
        self.faulted.store(true, Ordering::Release);
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(err);
        } else {
            tracing::debug!(error = %err, "Additional kernel fault in faulted cycle");
        }
    }
}

/// Join handle for one cycle of background execution.
pub(crate) struct RenderFence {
    job: Arc<RenderJob>,
}

impl RenderFence {
    pub(crate) fn token(&self) -> DependencyToken {
        self.job.done.clone()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.job.done.is_complete()
    }

    /// Block until all tasks finished and return the first fault, if any.
    pub(crate) fn join(self) -> GraphResult<()> {
        self.job.done.wait();
        match self.job.fault.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

enum WorkerMessage {
    Run(Arc<RenderJob>, usize),
    Shutdown,
}

/// Persistent threads executing render tasks.
pub(crate) struct WorkerPool {
    sender: Sender<WorkerMessage>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize) -> GraphResult<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver: Receiver<WorkerMessage> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("flowgraph-worker-{}", i))
                .spawn(move || Self::worker_loop(receiver))?;
            workers.push(handle);
        }
        tracing::debug!("Started render worker pool with {} threads", threads);
        Ok(Self { sender, workers })
    }

    #[cfg(test)]
    pub(crate) fn threads(&self) -> usize {
        self.workers.len()
    }

    fn worker_loop(receiver: Receiver<WorkerMessage>) {
        while let Ok(message) = receiver.recv() {
            match message {
                WorkerMessage::Run(job, index) => job.run_task(index),
                WorkerMessage::Shutdown => break,
            }
        }
    }

    /// Start executing `graph` in the background.
    pub(crate) fn submit(&self, graph: TaskGraph, gate: DependencyToken, cycle: u64) -> RenderFence {
        let pending = graph
            .tasks
            .iter()
            .map(|t| AtomicUsize::new(t.dependencies))
            .collect();
        let roots: Vec<usize> = graph
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.dependencies == 0)
            .map(|(i, _)| i)
            .collect();
        let job = Arc::new(RenderJob {
            remaining: AtomicUsize::new(graph.tasks.len()),
            tasks: graph.tasks,
            pending,
            faulted: AtomicBool::new(false),
            fault: Mutex::new(None),
            gate,
            done: DependencyToken::new(),
            queue: self.sender.clone(),
            cycle,
        });

        if job.tasks.is_empty() {
            job.done.complete();
        }
        for root in roots {
            job.enqueue(root);
        }
        RenderFence { job }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(WorkerMessage::Shutdown);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Render worker thread panicked");
            }
        }
    }
}
