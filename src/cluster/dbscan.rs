//! DBSCAN over the coupling graph (spec §4.7).
//!
//! Distance between two files is `1 - weighted_jaccard`; neighborhoods
//! are restricted to nodes already connected by a coupling edge, so this
//! never materializes a dense N×N distance matrix the way
//! `hierarchical` does — coupling graphs are sparse by construction
//! (Top-K projection already caps fan-out per file), and density-based
//! clustering is exactly the case where exploiting that sparsity matters
//! most.

use std::collections::{HashSet, VecDeque};

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::core::EntityId;
use crate::error::Result;

use super::{ClusterAlgorithm, CouplingGraph};

pub struct Dbscan {
    pub eps: f64,
    pub min_samples: usize,
}

impl Dbscan {
    fn neighbors(&self, graph: &CouplingGraph, node: NodeIndex) -> Vec<NodeIndex> {
        graph
            .graph
            .edges(node)
            .filter_map(|e| {
                let dist = 1.0 - *e.weight();
                if dist <= self.eps {
                    Some(if e.source() == node { e.target() } else { e.source() })
                } else {
                    None
                }
            })
            .collect()
    }
}

impl ClusterAlgorithm for Dbscan {
    fn cluster(&self, graph: &CouplingGraph) -> Result<Vec<Vec<EntityId>>> {
        let g = &graph.graph;
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut assigned: HashSet<NodeIndex> = HashSet::new();
        let mut clusters: Vec<Vec<EntityId>> = Vec::new();

        for start in g.node_indices() {
            if visited.contains(&start) {
                continue;
            }
            visited.insert(start);

            let start_neighbors = self.neighbors(graph, start);
            if start_neighbors.len() + 1 < self.min_samples {
                // Not a core point yet; may still be picked up as a
                // border point of some other cluster later.
                continue;
            }

            let mut cluster = Vec::new();
            let mut queue: VecDeque<NodeIndex> = VecDeque::new();
            queue.push_back(start);
            let mut in_queue: HashSet<NodeIndex> = HashSet::from([start]);

            while let Some(node) = queue.pop_front() {
                in_queue.remove(&node);
                if !assigned.contains(&node) {
                    cluster.push(g[node]);
                    assigned.insert(node);
                }
                visited.insert(node);

                let node_neighbors = self.neighbors(graph, node);
                if node_neighbors.len() + 1 >= self.min_samples {
                    for neighbor in node_neighbors {
                        if !assigned.contains(&neighbor) && !in_queue.contains(&neighbor) {
                            queue.push_back(neighbor);
                            in_queue.insert(neighbor);
                        }
                    }
                }
            }

            if cluster.len() >= self.min_samples {
                clusters.push(cluster);
            }
        }

        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EdgeRow;

    fn edge(src: i64, dst: i64, w: f64) -> EdgeRow {
        EdgeRow {
            src: EntityId(src),
            dst: EntityId(dst),
            pair_count: 1,
            weighted_pair_count: w,
            jaccard: w,
            weighted_jaccard: w,
            p_dst_given_src: w,
            p_src_given_dst: w,
        }
    }

    #[test]
    fn dense_clique_forms_one_cluster() {
        let edges = vec![edge(1, 2, 0.9), edge(1, 3, 0.9), edge(2, 3, 0.9)];
        let graph = CouplingGraph::build(&edges, 0.0);
        let clusters = Dbscan { eps: 0.2, min_samples: 3 }.cluster(&graph).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
    }

    #[test]
    fn sparse_pair_below_min_samples_is_noise() {
        let edges = vec![edge(1, 2, 0.9)];
        let graph = CouplingGraph::build(&edges, 0.0);
        let clusters = Dbscan { eps: 0.2, min_samples: 3 }.cluster(&graph).unwrap();
        assert!(clusters.is_empty());
    }

    #[test]
    fn far_apart_nodes_are_not_merged() {
        let edges = vec![edge(1, 2, 0.05)];
        let graph = CouplingGraph::build(&edges, 0.0);
        let clusters = Dbscan { eps: 0.5, min_samples: 2 }.cluster(&graph).unwrap();
        assert!(clusters.is_empty());
    }
}
