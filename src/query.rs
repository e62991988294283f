//! Query API (spec §4.9): read-only projections over the store for a
//! single completed run's worth of data. Every lookup that can fail to
//! find its subject returns `Err` rather than an empty success — an
//! absent file or snapshot is a `ParamInvalid`/`SnapshotNotFound`, never
//! a silently empty list standing in for "not found".
//!
//! Grounded on `neodepends`'s query/reporting layer: read-only
//! `Connection` in, plain structs out, one function per report. Unlike
//! that layer this one returns typed results instead of printing a
//! table, since callers here are the CLI *and* whatever future API sits
//! in front of the engine.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use serde::Serialize;

use crate::cluster::{compare_snapshots, ClusterComparison};
use crate::config::HotspotSelector;
use crate::core::{EntityId, EntityKind, LineageRecord};
use crate::error::{EngineError, Result};
use crate::metrics::{self, metrics_by_file, FileMetrics};
use crate::store::Store;

fn file_not_found(path: &str) -> EngineError {
    EngineError::ParamInvalid(format!("file not found: {path}"))
}

fn zero_metrics(file_id: EntityId) -> FileMetrics {
    FileMetrics {
        file_id,
        total_commits: 0,
        first_commit_time: None,
        last_commit_time: None,
        lines_added: 0,
        lines_deleted: 0,
        churn_rate: 0.0,
        authors_count: 0,
        max_coupling: 0.0,
        coupled_files_count: 0,
        commits_last_30_days: 0,
        risk_score: 0.0,
    }
}

fn require_file(conn: &Connection, path: &str) -> Result<crate::core::Entity> {
    Store::get_entity_by_name(conn, path, EntityKind::File)?.ok_or_else(|| file_not_found(path))
}

// -- list_files --------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub file_id: EntityId,
    pub path: String,
    pub present_at_head: bool,
    pub total_commits: u64,
    pub churn_rate: f64,
    pub max_coupling: f64,
    pub risk_score: f64,
}

#[derive(Debug, Clone)]
pub struct FileListFilter {
    pub substring: Option<String>,
    pub present_at_head_only: bool,
    pub min_risk: Option<f64>,
    pub max_risk: Option<f64>,
    pub min_churn: Option<f64>,
    pub max_churn: Option<f64>,
    pub min_coupling: Option<f64>,
    pub max_coupling: Option<f64>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for FileListFilter {
    fn default() -> Self {
        Self {
            substring: None,
            present_at_head_only: false,
            min_risk: None,
            max_risk: None,
            min_churn: None,
            max_churn: None,
            min_coupling: None,
            max_coupling: None,
            limit: 50,
            offset: 0,
        }
    }
}

pub fn list_files(conn: &Connection, filter: &FileListFilter) -> Result<Vec<FileInfo>> {
    let all_files = Store::list_all_files(conn)?;
    let metrics = metrics::compute_file_metrics(conn)?;
    let metrics_by_id = metrics_by_file(&metrics);

    let mut infos: Vec<FileInfo> = all_files
        .into_iter()
        .filter(|(path, _, present)| {
            if filter.present_at_head_only && !present {
                return false;
            }
            match &filter.substring {
                Some(sub) => path.contains(sub.as_str()),
                None => true,
            }
        })
        .map(|(path, file_id, present_at_head)| {
            let m = metrics_by_id.get(&file_id);
            FileInfo {
                file_id,
                path,
                present_at_head,
                total_commits: m.map_or(0, |m| m.total_commits),
                churn_rate: m.map_or(0.0, |m| m.churn_rate),
                max_coupling: m.map_or(0.0, |m| m.max_coupling),
                risk_score: m.map_or(0.0, |m| m.risk_score),
            }
        })
        .filter(|info| {
            filter.min_risk.map_or(true, |v| info.risk_score >= v)
                && filter.max_risk.map_or(true, |v| info.risk_score <= v)
                && filter.min_churn.map_or(true, |v| info.churn_rate >= v)
                && filter.max_churn.map_or(true, |v| info.churn_rate <= v)
                && filter.min_coupling.map_or(true, |v| info.max_coupling >= v)
                && filter.max_coupling.map_or(true, |v| info.max_coupling <= v)
        })
        .collect();

    infos.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(infos.into_iter().skip(filter.offset).take(filter.limit.max(1)).collect())
}

// -- get_file_details ----------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct FileDetails {
    pub file_id: EntityId,
    pub path: String,
    pub present_at_head: bool,
    pub metrics: FileMetrics,
    pub lineage: Vec<LineageRecord>,
}

pub fn get_file_details(conn: &Connection, path: &str) -> Result<FileDetails> {
    let entity = require_file(conn, path)?;
    let metrics = metrics::compute_file_metrics(conn)?;
    let file_metrics =
        metrics.into_iter().find(|m| m.file_id == entity.id).unwrap_or_else(|| zero_metrics(entity.id));
    let lineage = Store::get_lineage(conn, entity.id)?;

    Ok(FileDetails {
        file_id: entity.id,
        path: entity.qualified_name,
        present_at_head: entity.present_at_head,
        metrics: file_metrics,
        lineage,
    })
}

// -- get_coupling / get_impact -------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CoupledFile {
    pub file_id: EntityId,
    pub path: String,
    pub pair_count: i64,
    pub weighted_pair_count: f64,
    pub jaccard: f64,
    pub weighted_jaccard: f64,
    pub p_given_query: f64,
    pub p_query_given: f64,
}

#[derive(Debug, Clone)]
pub struct CouplingOptions {
    pub min_weighted_jaccard: f64,
    pub limit: Option<usize>,
}

impl Default for CouplingOptions {
    fn default() -> Self {
        Self { min_weighted_jaccard: 0.0, limit: None }
    }
}

pub fn get_coupling(conn: &Connection, path: &str, opts: &CouplingOptions) -> Result<Vec<CoupledFile>> {
    let entity = require_file(conn, path)?;
    let mut rows = Store::coupling_for(conn, entity.id)?;
    rows.retain(|e| e.weighted_jaccard >= opts.min_weighted_jaccard);
    rows.sort_by(|a, b| b.weighted_jaccard.partial_cmp(&a.weighted_jaccard).unwrap_or(Ordering::Equal));
    if let Some(limit) = opts.limit {
        rows.truncate(limit);
    }

    let mut out = Vec::with_capacity(rows.len());
    for edge in rows {
        // Edges are stored once as a `(min, max)` pair; the query's
        // subject may sit on either side, so the "given" probabilities
        // get swapped to always read relative to it.
        let (neighbor_id, p_query_given, p_given_query) = if edge.src == entity.id {
            (edge.dst, edge.p_dst_given_src, edge.p_src_given_dst)
        } else {
            (edge.src, edge.p_src_given_dst, edge.p_dst_given_src)
        };
        let neighbor = Store::get_entity(conn, neighbor_id)?;
        let path = neighbor.map(|e| e.qualified_name).unwrap_or_default();

        out.push(CoupledFile {
            file_id: neighbor_id,
            path,
            pair_count: edge.pair_count,
            weighted_pair_count: edge.weighted_pair_count,
            jaccard: edge.jaccard,
            weighted_jaccard: edge.weighted_jaccard,
            p_given_query,
            p_query_given,
        });
    }
    Ok(out)
}

pub fn get_impact(conn: &Connection, path: &str) -> Result<Vec<CoupledFile>> {
    get_coupling(conn, path, &CouplingOptions::default())
}

// -- get_coupling_graph / get_impact_graph -------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub file_id: EntityId,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub src: EntityId,
    pub dst: EntityId,
    pub pair_count: i64,
    pub weighted_jaccard: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone)]
pub struct CouplingGraphOptions {
    pub min_weighted_jaccard: f64,
    pub limit: usize,
}

impl Default for CouplingGraphOptions {
    fn default() -> Self {
        Self { min_weighted_jaccard: 0.0, limit: 500 }
    }
}

/// Every live file whose path sits under `root_path`. A trailing `/` is
/// enforced on the prefix so `src` never matches `srcgen/foo.rs`.
pub fn get_coupling_graph(conn: &Connection, root_path: &str, opts: &CouplingGraphOptions) -> Result<Graph> {
    let root_path = root_path.trim_end_matches('/');
    let prefix = format!("{root_path}/");

    let in_scope: HashMap<EntityId, String> = Store::list_live_files(conn)?
        .into_iter()
        .filter(|(path, _)| root_path.is_empty() || path == root_path || path.starts_with(&prefix))
        .map(|(path, id)| (id, path))
        .collect();

    let mut edges = Store::all_edges(conn, opts.min_weighted_jaccard)?;
    edges.retain(|e| in_scope.contains_key(&e.src) && in_scope.contains_key(&e.dst));
    edges.sort_by(|a, b| b.weighted_jaccard.partial_cmp(&a.weighted_jaccard).unwrap_or(Ordering::Equal));
    edges.truncate(opts.limit.max(1));

    let mut node_ids: HashSet<EntityId> = HashSet::new();
    for edge in &edges {
        node_ids.insert(edge.src);
        node_ids.insert(edge.dst);
    }

    let nodes = node_ids
        .into_iter()
        .map(|id| GraphNode { file_id: id, path: in_scope.get(&id).cloned().unwrap_or_default() })
        .collect();
    let edges = edges
        .into_iter()
        .map(|e| GraphEdge { src: e.src, dst: e.dst, pair_count: e.pair_count, weighted_jaccard: e.weighted_jaccard })
        .collect();

    Ok(Graph { nodes, edges })
}

/// One-hop ego graph around a single file: the file itself plus everyone
/// it is directly coupled to.
pub fn get_impact_graph(conn: &Connection, path: &str) -> Result<Graph> {
    let entity = require_file(conn, path)?;
    let edges = Store::coupling_for(conn, entity.id)?;

    let mut nodes = vec![GraphNode { file_id: entity.id, path: entity.qualified_name.clone() }];
    let mut graph_edges = Vec::with_capacity(edges.len());
    for edge in edges {
        let other_id = if edge.src == entity.id { edge.dst } else { edge.src };
        if let Some(other) = Store::get_entity(conn, other_id)? {
            nodes.push(GraphNode { file_id: other.id, path: other.qualified_name });
        }
        graph_edges.push(GraphEdge {
            src: edge.src,
            dst: edge.dst,
            pair_count: edge.pair_count,
            weighted_jaccard: edge.weighted_jaccard,
        });
    }

    Ok(Graph { nodes, edges: graph_edges })
}

// -- get_lineage ----------------------------------------------------------

pub fn get_lineage(conn: &Connection, path: &str) -> Result<Vec<LineageRecord>> {
    let entity = require_file(conn, path)?;
    Ok(Store::get_lineage(conn, entity.id)?)
}

// -- get_hotspots -----------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Hotspot {
    pub file_id: EntityId,
    pub path: String,
    pub metrics: FileMetrics,
}

pub fn get_hotspots(conn: &Connection, selector: HotspotSelector) -> Result<Vec<Hotspot>> {
    let all_metrics = metrics::compute_file_metrics(conn)?;
    let selected = metrics::select_hotspots(&all_metrics, selector);

    let path_by_id: HashMap<EntityId, String> =
        Store::list_live_files(conn)?.into_iter().map(|(path, id)| (id, path)).collect();

    Ok(selected
        .into_iter()
        .map(|m| Hotspot { file_id: m.file_id, path: path_by_id.get(&m.file_id).cloned().unwrap_or_default(), metrics: m })
        .collect())
}

// -- get_component_coupling -------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ComponentCoupling {
    pub component: String,
    pub file_count: usize,
    pub internal_coupling: f64,
    pub external_coupling: f64,
    pub cohesion: f64,
}

/// Every file entity nested under `root`, descending through at most
/// `depth` levels of intermediate folder/component entities. Files
/// themselves are always collected regardless of the depth at which
/// they're found; `depth` only bounds how far the walk descends through
/// non-file containers looking for more.
fn collect_descendant_files(conn: &Connection, root: EntityId, depth: u32) -> rusqlite::Result<Vec<EntityId>> {
    let mut files = Vec::new();
    let mut frontier = vec![root];
    let mut level = 0u32;

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for id in frontier {
            for child in Store::children(conn, id)? {
                if child.kind == EntityKind::File {
                    files.push(child.id);
                } else {
                    next.push(child.id);
                }
            }
        }
        level += 1;
        if level >= depth.max(1) {
            break;
        }
        frontier = next;
    }

    Ok(files)
}

pub fn get_component_coupling(conn: &Connection, component: &str, depth: u32) -> Result<ComponentCoupling> {
    let entity = Store::get_entity_by_name(conn, component, EntityKind::Component)?
        .ok_or_else(|| EngineError::ParamInvalid(format!("component not found: {component}")))?;

    let member_files = collect_descendant_files(conn, entity.id, depth)?;
    let members: HashSet<EntityId> = member_files.iter().copied().collect();

    let mut internal_weight = 0.0;
    let mut internal_pairs = 0u64;
    let mut external_weight = 0.0;
    let mut external_pairs = 0u64;

    for &file_id in &member_files {
        for edge in Store::coupling_for(conn, file_id)? {
            let other = if edge.src == file_id { edge.dst } else { edge.src };
            if members.contains(&other) {
                internal_weight += edge.weighted_jaccard;
                internal_pairs += 1;
            } else {
                external_weight += edge.weighted_jaccard;
                external_pairs += 1;
            }
        }
    }

    // Every internal pair is counted from both endpoints.
    internal_weight /= 2.0;
    internal_pairs /= 2;

    let internal_coupling = if internal_pairs == 0 { 0.0 } else { internal_weight / internal_pairs as f64 };
    let external_coupling = if external_pairs == 0 { 0.0 } else { external_weight / external_pairs as f64 };
    let cohesion = if internal_coupling + external_coupling <= 0.0 {
        0.0
    } else {
        internal_coupling / (internal_coupling + external_coupling)
    };

    Ok(ComponentCoupling {
        component: component.to_string(),
        file_count: member_files.len(),
        internal_coupling,
        external_coupling,
        cohesion,
    })
}

// -- get_cluster_snapshot / compare_cluster_snapshots -----------------------

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub cluster_id: i64,
    pub size: usize,
    pub avg_coupling: f64,
    pub internal_churn: u64,
    pub top_files: Vec<EntityId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshotView {
    pub snapshot_id: i64,
    pub algorithm: String,
    pub parameters: String,
    pub input_edge_filter: String,
    pub clusters: Vec<ClusterSummary>,
}

fn load_cluster_map(conn: &Connection, snapshot_id: i64) -> Result<HashMap<i64, Vec<EntityId>>> {
    Store::snapshot_meta(conn, snapshot_id)?.ok_or_else(|| EngineError::SnapshotNotFound(snapshot_id.to_string()))?;
    let members = Store::snapshot_members(conn, snapshot_id)?;
    let mut map: HashMap<i64, Vec<EntityId>> = HashMap::new();
    for (cluster_id, file_id) in members {
        map.entry(cluster_id).or_default().push(file_id);
    }
    Ok(map)
}

/// Per-cluster size, internal coupling, and churn, derived on read from
/// membership plus the edges and file metrics already on disk rather
/// than persisted redundantly alongside the snapshot.
pub fn get_cluster_snapshot(conn: &Connection, snapshot_id: i64) -> Result<ClusterSnapshotView> {
    let (algorithm, parameters, input_edge_filter) = Store::snapshot_meta(conn, snapshot_id)?
        .ok_or_else(|| EngineError::SnapshotNotFound(snapshot_id.to_string()))?;
    let by_cluster = load_cluster_map(conn, snapshot_id)?;

    let all_metrics = metrics::compute_file_metrics(conn)?;
    let metrics_by_id = metrics_by_file(&all_metrics);

    let mut clusters = Vec::with_capacity(by_cluster.len());
    for (cluster_id, files) in by_cluster {
        let file_set: HashSet<EntityId> = files.iter().copied().collect();

        let mut weight_sum = 0.0;
        let mut pair_count = 0u64;
        let mut churn = 0u64;
        for &file_id in &files {
            if let Some(m) = metrics_by_id.get(&file_id) {
                churn += m.lines_added + m.lines_deleted;
            }
            for edge in Store::coupling_for(conn, file_id)? {
                let other = if edge.src == file_id { edge.dst } else { edge.src };
                if file_set.contains(&other) {
                    weight_sum += edge.weighted_jaccard;
                    pair_count += 1;
                }
            }
        }
        let pair_count = pair_count / 2;
        let weight_sum = weight_sum / 2.0;
        let avg_coupling = if pair_count == 0 { 0.0 } else { weight_sum / pair_count as f64 };

        let mut top_files = files.clone();
        top_files.sort_by(|a, b| {
            let ra = metrics_by_id.get(a).map_or(0.0, |m| m.risk_score);
            let rb = metrics_by_id.get(b).map_or(0.0, |m| m.risk_score);
            rb.partial_cmp(&ra).unwrap_or(Ordering::Equal)
        });
        top_files.truncate(5);

        clusters.push(ClusterSummary { cluster_id, size: files.len(), avg_coupling, internal_churn: churn, top_files });
    }
    clusters.sort_by_key(|c| c.cluster_id);

    Ok(ClusterSnapshotView { snapshot_id, algorithm, parameters, input_edge_filter, clusters })
}

pub fn compare_cluster_snapshots(
    conn: &Connection,
    snapshot_a: i64,
    snapshot_b: i64,
) -> Result<Vec<ClusterComparison>> {
    let a = load_cluster_map(conn, snapshot_a)?;
    let b = load_cluster_map(conn, snapshot_b)?;
    Ok(compare_snapshots(&a, &b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntityKind, Identity};
    use crate::store::Store;

    fn seed(store: &Store) {
        store
            .write(|tx| {
                Store::upsert_entity_with_id(tx, EntityId(1), "src/a.rs", EntityKind::File, None)?;
                Store::upsert_entity_with_id(tx, EntityId(2), "src/b.rs", EntityKind::File, None)?;
                Store::upsert_entity_with_id(tx, EntityId(3), "docs/c.rs", EntityKind::File, None)?;
                Ok(())
            })
            .unwrap();

        store
            .write(|tx| {
                let identity = Identity::canonicalize("a", "a@example.com");
                Store::bump_file_stats(tx, EntityId(1), 0, 10, 2, &identity)?;
                Store::bump_file_stats(tx, EntityId(2), 0, 5, 1, &identity)?;
                Ok(())
            })
            .unwrap();

        let edge = crate::store::EdgeRow {
            src: EntityId(1),
            dst: EntityId(2),
            pair_count: 4,
            weighted_pair_count: 3.5,
            jaccard: 0.5,
            weighted_jaccard: 0.6,
            p_dst_given_src: 0.8,
            p_src_given_dst: 0.8,
        };
        store.replace_edges(&[edge], &HashMap::new()).unwrap();
    }

    #[test]
    fn list_files_filters_by_substring_and_head_presence() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        seed(&store);

        let conn = store.read_conn().unwrap();
        let filter = FileListFilter { substring: Some("src/".to_string()), ..Default::default() };
        let files = list_files(&conn, &filter).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.path.starts_with("src/")));
    }

    #[test]
    fn get_coupling_is_symmetric_regardless_of_storage_side() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        seed(&store);

        let conn = store.read_conn().unwrap();
        let from_a = get_coupling(&conn, "src/a.rs", &CouplingOptions::default()).unwrap();
        let from_b = get_coupling(&conn, "src/b.rs", &CouplingOptions::default()).unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_a[0].path, "src/b.rs");
        assert_eq!(from_b[0].path, "src/a.rs");
    }

    #[test]
    fn get_coupling_graph_respects_trailing_slash_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        seed(&store);
        store
            .write(|tx| {
                Store::upsert_entity_with_id(tx, EntityId(4), "srcgen/d.rs", EntityKind::File, None)?;
                Ok(())
            })
            .unwrap();

        let conn = store.read_conn().unwrap();
        let graph = get_coupling_graph(&conn, "src", &CouplingGraphOptions::default()).unwrap();
        assert!(graph.nodes.iter().all(|n| n.path != "srcgen/d.rs"));
    }

    #[test]
    fn unknown_file_is_param_invalid_not_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        seed(&store);

        let conn = store.read_conn().unwrap();
        let err = get_file_details(&conn, "does/not/exist.rs").unwrap_err();
        assert_eq!(err.code(), "PARAM_INVALID");
    }

    #[test]
    fn unknown_snapshot_is_snapshot_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        seed(&store);

        let conn = store.read_conn().unwrap();
        let err = get_cluster_snapshot(&conn, 999).unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT_NOT_FOUND");
    }
}
