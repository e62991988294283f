//! Agglomerative hierarchical clustering (spec §4.7): single, complete,
//! average and Ward linkage over a dense distance matrix, using the
//! Lance-Williams update formula to merge clusters without recomputing
//! pairwise distances from scratch after each merge.
//!
//! Grounded on the teacher's `matrix.rs` dense-matrix conventions (a flat
//! `Vec<f64>` addressed by row-major index) for the distance matrix
//! representation.

use crate::config::{HierarchicalCut, Linkage};
use crate::core::EntityId;
use crate::error::Result;

use super::{ClusterAlgorithm, CouplingGraph};

pub struct Hierarchical {
    pub linkage: Linkage,
    pub cut: HierarchicalCut,
}

struct DistanceMatrix {
    n: usize,
    active: Vec<bool>,
    size: Vec<usize>,
    d: Vec<f64>,
}

impl DistanceMatrix {
    fn get(&self, i: usize, j: usize) -> f64 {
        if i == j {
            f64::INFINITY
        } else {
            self.d[i * self.n + j]
        }
    }

    fn set(&mut self, i: usize, j: usize, v: f64) {
        self.d[i * self.n + j] = v;
        self.d[j * self.n + i] = v;
    }

    /// Find the pair of active clusters with the smallest distance.
    fn closest_pair(&self) -> Option<(usize, usize, f64)> {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..self.n {
            if !self.active[i] {
                continue;
            }
            for j in (i + 1)..self.n {
                if !self.active[j] {
                    continue;
                }
                let dist = self.get(i, j);
                if best.map(|(_, _, b)| dist < b).unwrap_or(true) {
                    best = Some((i, j, dist));
                }
            }
        }
        best
    }

    /// Lance-Williams merge of clusters `a` and `b` into `a`; `b` is
    /// deactivated. Updates distances from the merged cluster to every
    /// other active cluster `k`.
    fn merge(&mut self, a: usize, b: usize, linkage: Linkage) {
        let size_a = self.size[a] as f64;
        let size_b = self.size[b] as f64;

        for k in 0..self.n {
            if !self.active[k] || k == a || k == b {
                continue;
            }
            let d_ak = self.get(a, k);
            let d_bk = self.get(b, k);
            let d_ab = self.get(a, b);
            let size_k = self.size[k] as f64;

            let new_dist = match linkage {
                Linkage::Single => d_ak.min(d_bk),
                Linkage::Complete => d_ak.max(d_bk),
                Linkage::Average => {
                    (size_a * d_ak + size_b * d_bk) / (size_a + size_b)
                }
                Linkage::Ward => {
                    let total = size_a + size_b + size_k;
                    let alpha_a = (size_a + size_k) / total;
                    let alpha_b = (size_b + size_k) / total;
                    let beta = -size_k / total;
                    alpha_a * d_ak + alpha_b * d_bk + beta * d_ab
                }
            };
            self.set(a, k, new_dist);
        }

        self.size[a] = self.size[a] + self.size[b];
        self.active[b] = false;
    }
}

impl ClusterAlgorithm for Hierarchical {
    fn cluster(&self, graph: &CouplingGraph) -> Result<Vec<Vec<EntityId>>> {
        let nodes: Vec<EntityId> = graph.graph.node_indices().map(|idx| graph.graph[idx]).collect();
        let n = nodes.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        if n == 1 {
            return Ok(vec![vec![nodes[0]]]);
        }

        let mut d = vec![1.0_f64; n * n];
        for edge in graph.graph.edge_indices() {
            let (a, b) = graph.graph.edge_endpoints(edge).unwrap();
            let weight = graph.graph[edge];
            let dist = (1.0 - weight).max(0.0);
            d[a.index() * n + b.index()] = dist;
            d[b.index() * n + a.index()] = dist;
        }

        let mut matrix = DistanceMatrix { n, active: vec![true; n], size: vec![1; n], d };

        // membership[i] = set of original node indices currently merged
        // into active cluster i.
        let mut membership: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
        let mut last_merge_distance = 0.0_f64;

        loop {
            let active_count = matrix.active.iter().filter(|&&a| a).count();
            if self.should_stop(active_count, last_merge_distance) {
                break;
            }
            let Some((a, b, dist)) = matrix.closest_pair() else { break };
            if !dist.is_finite() {
                break;
            }

            matrix.merge(a, b, self.linkage);
            let moved = std::mem::take(&mut membership[b]);
            membership[a].extend(moved);
            last_merge_distance = dist;
        }

        let clusters = (0..n)
            .filter(|&i| matrix.active[i])
            .map(|i| membership[i].iter().map(|&idx| nodes[idx]).collect())
            .collect();

        Ok(clusters)
    }
}

impl Hierarchical {
    fn should_stop(&self, active_count: usize, last_merge_distance: f64) -> bool {
        if active_count <= 1 {
            return true;
        }
        match self.cut {
            HierarchicalCut::NClusters(k) => active_count <= k,
            HierarchicalCut::DistanceThreshold(t) => last_merge_distance > t,
        }
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
    fn n_clusters_cut_stops_at_requested_count() {
        let edges = vec![edge(1, 2, 0.9), edge(2, 3, 0.9), edge(3, 4, 0.1)];
        let graph = CouplingGraph::build(&edges, 0.0);
        let clusters = Hierarchical { linkage: Linkage::Average, cut: HierarchicalCut::NClusters(2) }
            .cluster(&graph)
            .unwrap();
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn single_node_graph_is_one_singleton_cluster() {
        let edges: Vec<EdgeRow> = Vec::new();
        let mut graph = CouplingGraph::build(&edges, 0.0);
        let idx = graph.graph.add_node(EntityId(1));
        graph.index_of.insert(EntityId(1), idx);
        let clusters = Hierarchical { linkage: Linkage::Single, cut: HierarchicalCut::NClusters(1) }
            .cluster(&graph)
            .unwrap();
        assert_eq!(clusters, vec![vec![EntityId(1)]]);
    }

    #[test]
    fn distance_threshold_cut_refuses_to_merge_far_apart_clusters() {
        let edges = vec![edge(1, 2, 0.95)];
        let graph = CouplingGraph::build(&edges, 0.0);
        let clusters =
            Hierarchical { linkage: Linkage::Complete, cut: HierarchicalCut::DistanceThreshold(0.01) }
                .cluster(&graph)
                .unwrap();
        assert_eq!(clusters.len(), 2);
    }
}
