//! Hardware queue to NUMA node to connection assignment.

use std::collections::BTreeMap;

use crate::io::{self, BlockRequest, SubmitError};
use crate::ConnectionHandle;

/// Where one hardware queue lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: usize,
    /// Online NUMA node id.
    pub node: usize,
    /// Index of the session connection serving the queue; always equal to `queue`.
    pub connection: usize,
}

/// Fixed for a device's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAssignment {
    bindings: Vec<QueueBinding>,
}

impl QueueAssignment {
    /// Spread `nr_hw_queues` over `online_nodes` (ascending ids) as evenly as possible.
    ///
    /// The first `nr_hw_queues % nodes` nodes get one queue more than the rest, and
    /// consecutive queues share a node.
    pub fn compute(nr_hw_queues: usize, online_nodes: &[usize]) -> Self {
        let fallback = [0];
        let nodes = if online_nodes.is_empty() {
            &fallback[..]
        } else {
            online_nodes
        };
        let bindings = (0..nr_hw_queues)
            .map(|queue| QueueBinding {
                queue,
                node: nodes[relative_node(queue, nr_hw_queues, nodes.len())],
                connection: queue,
            })
            .collect();
        QueueAssignment { bindings }
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    pub fn node_of(&self, queue: usize) -> Option<usize> {
        self.bindings.get(queue).map(|b| b.node)
    }

    pub fn queues_per_node(&self) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for binding in &self.bindings {
            *counts.entry(binding.node).or_insert(0) += 1;
        }
        counts
    }
}

/// Index into the online node list for `queue`.
fn relative_node(queue: usize, nr_hw_queues: usize, nr_nodes: usize) -> usize {
    let base = nr_hw_queues / nr_nodes;
    let extra = nr_hw_queues % nr_nodes;
    let big = base + 1;
    if queue < extra * big {
        queue / big
    } else {
        // base > 0 here, otherwise every queue falls in the first range
        extra + (queue - extra * big) / base
    }
}

/// One hardware queue of a device, bound to a single connection.
#[derive(Debug, Clone)]
pub struct HwQueue {
    binding: QueueBinding,
    connection: ConnectionHandle,
    fd: i32,
}

impl HwQueue {
    pub(crate) fn new(binding: QueueBinding, connection: ConnectionHandle, fd: i32) -> Self {
        HwQueue {
            binding,
            connection,
            fd,
        }
    }

    pub fn index(&self) -> usize {
        self.binding.queue
    }

    pub fn node(&self) -> usize {
        self.binding.node
    }

    pub fn binding(&self) -> QueueBinding {
        self.binding
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn queue_depth(&self) -> u32 {
        self.connection.queue_depth()
    }

    /// Submit without blocking. On `Ok` the request's completion runs exactly once, on
    /// the connection's reactor thread or, for requests that need no command, right here.
    pub fn submit(&self, request: BlockRequest) -> Result<(), SubmitError> {
        io::submit(&self.connection, self.fd, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_queue_lands_on_exactly_one_online_node_evenly() {
        let node_sets: [&[usize]; 5] = [&[0], &[0, 1], &[0, 2, 3], &[1, 3, 5, 7], &[0, 1, 2, 3, 4, 5, 6]];
        for nodes in node_sets {
            for m in 0..=70 {
                let a = QueueAssignment::compute(m, nodes);
                assert_eq!(a.bindings().len(), m);
                for (q, b) in a.bindings().iter().enumerate() {
                    assert_eq!(b.queue, q);
                    assert_eq!(b.connection, q);
                    assert!(nodes.contains(&b.node), "queue {q} on offline node {}", b.node);
                }
                let counts = a.queues_per_node();
                let shares: Vec<usize> = nodes
                    .iter()
                    .map(|n| counts.get(n).copied().unwrap_or(0))
                    .collect();
                assert_eq!(shares.iter().sum::<usize>(), m);
                let max = shares.iter().copied().max().unwrap();
                let min = shares.iter().copied().min().unwrap();
                assert!(max - min <= 1, "m={m} nodes={nodes:?} shares={shares:?}");
                // larger shares go to lower node ids
                assert!(shares.windows(2).all(|w| w[0] >= w[1]), "{shares:?}");
            }
        }
    }

    #[test]
    fn first_nodes_take_the_remainder() {
        let a = QueueAssignment::compute(10, &[0, 1, 2, 3]);
        let nodes: Vec<usize> = a.bindings().iter().map(|b| b.node).collect();
        assert_eq!(nodes, vec![0, 0, 0, 1, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn offline_nodes_are_skipped() {
        let a = QueueAssignment::compute(4, &[0, 2]);
        assert_eq!(a.node_of(0), Some(0));
        assert_eq!(a.node_of(1), Some(0));
        assert_eq!(a.node_of(2), Some(2));
        assert_eq!(a.node_of(3), Some(2));
        assert_eq!(a.node_of(4), None);
    }

    #[test]
    fn fewer_queues_than_nodes() {
        let a = QueueAssignment::compute(2, &[0, 1, 2, 3]);
        assert_eq!(a.node_of(0), Some(0));
        assert_eq!(a.node_of(1), Some(1));
    }

    #[test]
    fn no_online_nodes_means_node_zero() {
        let a = QueueAssignment::compute(3, &[]);
        assert!(a.bindings().iter().all(|b| b.node == 0));
    }
}
