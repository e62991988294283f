//! Louvain modularity maximization (spec §4.7).
//!
//! Implements the classic local-moving phase (repeated sweeps until no
//! node's move improves modularity, or `max_iterations` is hit) without
//! the full multi-level coarsen/recurse/expand cycle — single-level
//! Louvain, not hierarchical Louvain. That's a deliberate scope
//! trade-off: cluster boundaries aren't required to be deterministic or
//! reproducible run-to-run (an explicit non-goal), so the extra fidelity
//! hierarchical aggregation buys isn't worth the added complexity here.

use std::collections::HashMap;

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::core::EntityId;
use crate::error::Result;

use super::{ClusterAlgorithm, CouplingGraph};

pub struct Louvain {
    pub resolution: f64,
    pub max_iterations: u32,
}

impl ClusterAlgorithm for Louvain {
    fn cluster(&self, graph: &CouplingGraph) -> Result<Vec<Vec<EntityId>>> {
        let g = &graph.graph;
        if g.node_count() == 0 {
            return Ok(Vec::new());
        }

        let total_weight: f64 = g.edge_weights().sum();
        if total_weight <= 0.0 {
            // No edges: every node is its own singleton community.
            return Ok(g.node_indices().map(|idx| vec![g[idx]]).collect());
        }
        let two_m = 2.0 * total_weight;

        let mut community: HashMap<NodeIndex, usize> =
            g.node_indices().enumerate().map(|(i, idx)| (idx, i)).collect();

        let mut degree: HashMap<NodeIndex, f64> = HashMap::new();
        for idx in g.node_indices() {
            degree.insert(idx, g.edges(idx).map(|e| *e.weight()).sum());
        }

        let mut community_degree: HashMap<usize, f64> = HashMap::new();
        for (&idx, &c) in &community {
            *community_degree.entry(c).or_insert(0.0) += degree[&idx];
        }

        for _ in 0..self.max_iterations {
            let mut moved_any = false;

            for idx in g.node_indices() {
                let current_c = community[&idx];
                let node_degree = degree[&idx];

                let mut weight_to_community: HashMap<usize, f64> = HashMap::new();
                for edge in g.edges(idx) {
                    let neighbor = if edge.source() == idx { edge.target() } else { edge.source() };
                    if neighbor == idx {
                        continue;
                    }
                    *weight_to_community.entry(community[&neighbor]).or_insert(0.0) += *edge.weight();
                }

                *community_degree.get_mut(&current_c).unwrap() -= node_degree;

                let mut candidates: Vec<usize> = weight_to_community.keys().copied().collect();
                if !candidates.contains(&current_c) {
                    candidates.push(current_c);
                }

                let mut best_c = current_c;
                let mut best_gain = f64::NEG_INFINITY;
                for c in candidates {
                    let k_i_in = weight_to_community.get(&c).copied().unwrap_or(0.0);
                    let sigma_tot = community_degree.get(&c).copied().unwrap_or(0.0);
                    let gain = k_i_in - self.resolution * sigma_tot * node_degree / two_m;
                    if gain > best_gain {
                        best_gain = gain;
                        best_c = c;
                    }
                }

                *community_degree.entry(best_c).or_insert(0.0) += node_degree;
                if best_c != current_c {
                    community.insert(idx, best_c);
                    moved_any = true;
                }
            }

            if !moved_any {
                break;
            }
        }

        let mut clusters: HashMap<usize, Vec<EntityId>> = HashMap::new();
        for (idx, c) in community {
            clusters.entry(c).or_default().push(g[idx]);
        }

        Ok(clusters.into_values().collect())
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
    fn two_tight_cliques_loosely_linked_form_two_communities() {
        let edges = vec![
            edge(1, 2, 0.9),
            edge(1, 3, 0.9),
            edge(2, 3, 0.9),
            edge(4, 5, 0.9),
            edge(4, 6, 0.9),
            edge(5, 6, 0.9),
            edge(3, 4, 0.01),
        ];
        let graph = CouplingGraph::build(&edges, 0.0);
        let clusters = Louvain { resolution: 1.0, max_iterations: 50 }.cluster(&graph).unwrap();

        assert_eq!(clusters.len(), 2);
        for cluster in &clusters {
            assert_eq!(cluster.len(), 3);
        }
    }

    #[test]
    fn no_edges_yields_all_singletons() {
        let edges: Vec<EdgeRow> = Vec::new();
        let graph = CouplingGraph::build(&edges, 0.0);
        let clusters = Louvain { resolution: 1.0, max_iterations: 10 }.cluster(&graph).unwrap();
        assert!(clusters.is_empty());
    }
}
