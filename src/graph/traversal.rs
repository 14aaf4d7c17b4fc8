//! Traversal cache: execution order derived from the topology.
//!
//! Nodes are partitioned into islands (weakly connected components over
//! normal data connections). Each island gets a topological order in which a
//! producer always precedes its consumers; ties break on node index so the
//! order is deterministic. Feedback connections do not constrain the order.

use super::id::NodeHandle;
use super::topology::{ConnectionKind, TopologyDatabase};
use super::port::PortCategory;
use crate::error::{GraphError, GraphResult};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::ops::Range;

/// Statistics about the last traversal computation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraversalStats {
    /// Kernel nodes in the render graph
    pub nodes: usize,
    /// Number of islands
    pub islands: usize,
    /// Normal data connections between kernel nodes
    pub normal_edges: usize,
    /// Feedback data connections between kernel nodes
    pub feedback_edges: usize,
    /// Time taken to compute (microseconds)
    pub compile_time_us: u64,
}

/// Execution order for one topology version.
#[derive(Debug, Clone, Default)]
pub(crate) struct TraversalCache {
    /// Nodes grouped by island, each island topologically sorted
    pub(crate) order: Vec<NodeHandle>,
    /// Ranges of `order` forming islands
    pub(crate) islands: Vec<Range<usize>>,
    /// Positions in `order` of each node's normal data producers
    pub(crate) parents: Vec<Vec<usize>>,
    pub(crate) stats: TraversalStats,
}

pub(crate) struct TraversalCompiler;

impl TraversalCompiler {
    /// Compute the cache for the given kernel nodes.
    pub(crate) fn compile(nodes: &[NodeHandle], topology: &TopologyDatabase) -> GraphResult<TraversalCache> {
        let start_time = std::time::Instant::now();

        let mut sorted = nodes.to_vec();
        sorted.sort_by_key(|h| h.index());
        let local: HashMap<NodeHandle, usize> =
            sorted.iter().enumerate().map(|(i, h)| (*h, i)).collect();

        let n = sorted.len();
        let mut forward = vec![Vec::new(); n];
        let mut backward = vec![Vec::new(); n];
        let mut normal_edges = 0;
        let mut feedback_edges = 0;

        for (from, handle) in sorted.iter().enumerate() {
            for connection in topology.outputs_of(*handle) {
                if connection.category != PortCategory::Data {
                    continue;
                }
                let Some(&to) = local.get(&connection.destination) else {
                    continue;
                };
                match connection.kind {
                    ConnectionKind::Normal => {
                        normal_edges += 1;
                        forward[from].push(to);
                        backward[to].push(from);
                    }
                    ConnectionKind::Feedback => feedback_edges += 1,
                }
            }
        }

        let components = Self::islands(&forward, &backward);

        let mut order = Vec::with_capacity(n);
        let mut islands = Vec::with_capacity(components.len());
        for component in &components {
            let begin = order.len();
            Self::sort_island(component, &forward, &backward, &mut order).map_err(|()| {
                GraphError::Desync(format!(
                    "cycle among normal data connections of {:?}",
                    component.iter().map(|i| sorted[*i]).collect::<Vec<_>>()
                ))
            })?;
            islands.push(begin..order.len());
        }

        let mut position = vec![0; n];
        for (pos, local_index) in order.iter().enumerate() {
            position[*local_index] = pos;
        }
        let parents = order
            .iter()
            .map(|local_index| backward[*local_index].iter().map(|p| position[*p]).collect())
            .collect();
        let order = order.into_iter().map(|i| sorted[i]).collect();

        let stats = TraversalStats {
            nodes: n,
            islands: islands.len(),
            normal_edges,
            feedback_edges,
            compile_time_us: start_time.elapsed().as_micros() as u64,
        };

        Ok(TraversalCache {
            order,
            islands,
            parents,
            stats,
        })
    }

    /// Weakly connected components, each sorted, ordered by smallest member.
    fn islands(forward: &[Vec<usize>], backward: &[Vec<usize>]) -> Vec<Vec<usize>> {
        let n = forward.len();
        let mut seen = vec![false; n];
        let mut components = Vec::new();

        for root in 0..n {
            if seen[root] {
                continue;
            }
            seen[root] = true;
            let mut component = vec![root];
            let mut stack = vec![root];
            while let Some(node) = stack.pop() {
                for &next in forward[node].iter().chain(&backward[node]) {
                    if !seen[next] {
                        seen[next] = true;
                        component.push(next);
                        stack.push(next);
                    }
                }
            }
            component.sort_unstable();
            components.push(component);
        }

        components
    }

    /// Kahn's algorithm restricted to one island, smallest index first.
    fn sort_island(
        component: &[usize],
        forward: &[Vec<usize>],
        backward: &[Vec<usize>],
        order: &mut Vec<usize>,
    ) -> Result<(), ()> {
        let mut in_degree: HashMap<usize, usize> =
            component.iter().map(|i| (*i, backward[*i].len())).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = component
            .iter()
            .filter(|i| in_degree[*i] == 0)
            .map(|i| Reverse(*i))
            .collect();

        let mut emitted = 0;
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            emitted += 1;
            for &next in &forward[node] {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(next));
                    }
                }
            }
        }

        if emitted == component.len() {
            Ok(())
        } else {
            Err(())
        }
    }
}
