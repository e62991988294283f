//! Clusterer (spec §4.7): projects the coupling graph through
//! `petgraph`, runs one of three community-detection algorithms over it,
//! and compares cluster snapshots across runs.
//!
//! Grounded on `codegraph-ir`'s manifest for `petgraph` as the graph
//! primitive of choice in this pack, and on the teacher's general
//! "build a typed graph, hand it to an algorithm module" shape (mirrored
//! here across `louvain`/`hierarchical`/`dbscan` rather than one giant
//! match arm).

pub mod dbscan;
pub mod hierarchical;
pub mod louvain;

use std::collections::{HashMap, HashSet};

use petgraph::graph::{NodeIndex, UnGraph};

use crate::config::{ClusteringConfig, HierarchicalCut, Linkage};
use crate::core::EntityId;
use crate::error::{EngineError, Result};
use crate::store::EdgeRow;

/// Above this many nodes, Ward linkage is rejected at validation time
/// (spec §4.7): its Lance-Williams update is quadratic in cluster count
/// per merge, making it the one algorithm whose cost scales badly enough
/// to refuse outright rather than just run slowly.
pub const WARD_MAX_NODES: usize = 5000;

pub struct CouplingGraph {
    pub graph: UnGraph<EntityId, f64>,
    pub index_of: HashMap<EntityId, NodeIndex>,
}

impl CouplingGraph {
    /// Build an undirected, weighted projection of the coupling graph
    /// from the persisted edge set. `min_weighted_jaccard` lets a caller
    /// tighten the graph further than `min_cooccurrence` already did at
    /// aggregation time (e.g. a request-scoped `min_weight` filter).
    pub fn build(edges: &[EdgeRow], min_weighted_jaccard: f64) -> Self {
        let mut graph = UnGraph::new_undirected();
        let mut index_of: HashMap<EntityId, NodeIndex> = HashMap::new();

        for edge in edges {
            if edge.weighted_jaccard < min_weighted_jaccard {
                continue;
            }
            let a = *index_of.entry(edge.src).or_insert_with(|| graph.add_node(edge.src));
            let b = *index_of.entry(edge.dst).or_insert_with(|| graph.add_node(edge.dst));
            graph.add_edge(a, b, edge.weighted_jaccard);
        }

        Self { graph, index_of }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}

pub trait ClusterAlgorithm {
    /// Partition the graph into clusters. Nodes absent from every
    /// returned cluster (possible for DBSCAN's noise points) are
    /// considered unclustered, not an error.
    fn cluster(&self, graph: &CouplingGraph) -> Result<Vec<Vec<EntityId>>>;
}

pub fn run_clustering(edges: &[EdgeRow], config: &ClusteringConfig) -> Result<Vec<Vec<EntityId>>> {
    let graph = CouplingGraph::build(edges, 0.0);

    match config {
        ClusteringConfig::Louvain { resolution, max_iterations } => {
            louvain::Louvain { resolution: *resolution, max_iterations: *max_iterations }.cluster(&graph)
        }
        ClusteringConfig::Hierarchical { linkage, cut } => {
            if matches!(linkage, Linkage::Ward) && graph.node_count() > WARD_MAX_NODES {
                return Err(EngineError::ClusteringInfeasible(format!(
                    "ward linkage is not supported above {WARD_MAX_NODES} nodes (graph has {})",
                    graph.node_count()
                )));
            }
            hierarchical::Hierarchical { linkage: *linkage, cut: *cut }.cluster(&graph)
        }
        ClusteringConfig::Dbscan { eps, min_samples } => {
            dbscan::Dbscan { eps: *eps, min_samples: *min_samples }.cluster(&graph)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftClass {
    Stable,
    Drifted,
    Dissolved,
    New,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClusterComparison {
    pub old_cluster_id: Option<i64>,
    pub new_cluster_id: Option<i64>,
    pub overlap_jaccard: f64,
    pub class: DriftClass,
}

/// Compare two cluster snapshots by maximum-overlap matching (spec §4.7,
/// §9): each old cluster is matched to whichever new cluster shares the
/// most members, banded by Jaccard overlap into stable (>= 0.7), drifted
/// ([0.3, 0.7)) or dissolved (< 0.3); any new cluster nobody matched is
/// reported as new. This is a greedy per-old-cluster match, not a
/// globally optimal bipartite assignment — acceptable since cluster
/// identity is explicitly not guaranteed stable across runs.
pub fn compare_snapshots(
    old: &HashMap<i64, Vec<EntityId>>,
    new: &HashMap<i64, Vec<EntityId>>,
) -> Vec<ClusterComparison> {
    const STABLE_THRESHOLD: f64 = 0.7;
    const DRIFTED_THRESHOLD: f64 = 0.3;

    let mut results = Vec::new();
    let mut matched_new: HashSet<i64> = HashSet::new();

    for (&old_id, old_members) in old {
        let old_set: HashSet<EntityId> = old_members.iter().copied().collect();
        let mut best: Option<(i64, f64)> = None;

        for (&new_id, new_members) in new {
            let new_set: HashSet<EntityId> = new_members.iter().copied().collect();
            let intersection = old_set.intersection(&new_set).count();
            let union = old_set.union(&new_set).count();
            let jaccard = if union == 0 { 0.0 } else { intersection as f64 / union as f64 };
            let is_better = match best {
                Some((best_id, b)) => jaccard > b || (jaccard == b && new_id < best_id),
                None => true,
            };
            if is_better {
                best = Some((new_id, jaccard));
            }
        }

        match best {
            Some((new_id, jaccard)) if jaccard >= DRIFTED_THRESHOLD => {
                matched_new.insert(new_id);
                let class = if jaccard >= STABLE_THRESHOLD { DriftClass::Stable } else { DriftClass::Drifted };
                results.push(ClusterComparison {
                    old_cluster_id: Some(old_id),
                    new_cluster_id: Some(new_id),
                    overlap_jaccard: jaccard,
                    class,
                });
            }
            other => {
                results.push(ClusterComparison {
                    old_cluster_id: Some(old_id),
                    new_cluster_id: None,
                    overlap_jaccard: other.map(|(_, j)| j).unwrap_or(0.0),
                    class: DriftClass::Dissolved,
                });
            }
        }
    }

    for &new_id in new.keys() {
        if !matched_new.contains(&new_id) {
            results.push(ClusterComparison {
                old_cluster_id: None,
                new_cluster_id: Some(new_id),
                overlap_jaccard: 0.0,
                class: DriftClass::New,
            });
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ward_above_node_cap_is_infeasible() {
        // A chain of WARD_MAX_NODES + 1 nodes, each edge touching a fresh
        // node id, puts the built graph one node over the cap.
        let edges: Vec<EdgeRow> = (0..WARD_MAX_NODES as i64)
            .map(|i| EdgeRow {
                src: EntityId(i),
                dst: EntityId(i + 1),
                pair_count: 1,
                weighted_pair_count: 1.0,
                jaccard: 0.5,
                weighted_jaccard: 0.5,
                p_dst_given_src: 0.5,
                p_src_given_dst: 0.5,
            })
            .collect();

        let graph = CouplingGraph::build(&edges, 0.0);
        assert!(graph.node_count() > WARD_MAX_NODES);

        let config = ClusteringConfig::Hierarchical { linkage: Linkage::Ward, cut: HierarchicalCut::NClusters(2) };
        let err = run_clustering(&edges, &config).unwrap_err();
        assert_eq!(err.code(), "CLUSTERING_INFEASIBLE");
    }

    #[test]
    fn ward_at_or_below_node_cap_is_feasible() {
        let edges: Vec<EdgeRow> = (0..10)
            .map(|i| EdgeRow {
                src: EntityId(i),
                dst: EntityId(i + 1),
                pair_count: 1,
                weighted_pair_count: 1.0,
                jaccard: 0.5,
                weighted_jaccard: 0.5,
                p_dst_given_src: 0.5,
                p_src_given_dst: 0.5,
            })
            .collect();

        let config = ClusteringConfig::Hierarchical { linkage: Linkage::Ward, cut: HierarchicalCut::NClusters(2) };
        assert!(run_clustering(&edges, &config).is_ok());
    }

    #[test]
    fn identical_snapshots_are_all_stable() {
        let mut old = HashMap::new();
        old.insert(1i64, vec![EntityId(1), EntityId(2)]);
        let mut new = HashMap::new();
        new.insert(10i64, vec![EntityId(1), EntityId(2)]);

        let result = compare_snapshots(&old, &new);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].class, DriftClass::Stable);
    }

    #[test]
    fn disjoint_clusters_are_dissolved_and_new() {
        let mut old = HashMap::new();
        old.insert(1i64, vec![EntityId(1), EntityId(2)]);
        let mut new = HashMap::new();
        new.insert(10i64, vec![EntityId(3), EntityId(4)]);

        let result = compare_snapshots(&old, &new);
        assert_eq!(result.len(), 2);
        assert!(result.iter().any(|c| c.class == DriftClass::Dissolved));
        assert!(result.iter().any(|c| c.class == DriftClass::New));
    }
}
