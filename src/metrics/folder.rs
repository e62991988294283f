//! Folder-level roll-ups of the per-file metrics (spec §4.6).
//!
//! Grounded on `hotspots-core`'s `DirectoryAggregates`/`ModuleInstability`
//! (a folder's coupling is compared internal-vs-external to get an
//! afferent/efferent-style cohesion signal) — this crate doesn't carry
//! that repo's Ca/Ce terminology since no language-aware dependency edges
//! exist here, only co-change edges, but the internal-vs-external ratio
//! shape is the same idea applied to coupling instead of imports.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;

use crate::core::EntityId;
use crate::metrics::{metrics_by_file, FileMetrics};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq)]
pub struct FolderAggregate {
    pub path: String,
    pub file_count: usize,
    pub total_commits: u64,
    pub total_lines_changed: u64,
    pub avg_risk: f64,
    /// Fraction of this folder's coupling strength that stays internal
    /// to the folder, in `[0, 1]`. A folder near 1.0 changes as a
    /// self-contained unit; near 0.0 its files mostly couple with files
    /// elsewhere.
    pub cohesion: f64,
}

pub fn aggregate_folders(conn: &Connection, metrics: &[FileMetrics]) -> rusqlite::Result<Vec<FolderAggregate>> {
    let live_files = Store::list_live_files(conn)?;
    let metrics_by_id = metrics_by_file(metrics);

    let mut folders: HashMap<String, Vec<EntityId>> = HashMap::new();
    for (path, id) in &live_files {
        folders.entry(folder_of(path)).or_default().push(*id);
    }

    let mut result = Vec::with_capacity(folders.len());
    for (folder, file_ids) in &folders {
        let file_set: HashSet<EntityId> = file_ids.iter().copied().collect();

        let mut total_commits = 0u64;
        let mut total_lines = 0u64;
        let mut risk_sum = 0.0;
        let mut internal_weight_sum = 0.0;
        let mut internal_pairs = 0u64;
        let mut external_weight_sum = 0.0;
        let mut external_pairs = 0u64;

        for &id in file_ids {
            if let Some(m) = metrics_by_id.get(&id) {
                total_commits += m.total_commits;
                total_lines += m.lines_added + m.lines_deleted;
                risk_sum += m.risk_score;
            }

            for edge in Store::coupling_for(conn, id)? {
                let other = if edge.src == id { edge.dst } else { edge.src };
                if file_set.contains(&other) {
                    internal_weight_sum += edge.weighted_jaccard;
                    internal_pairs += 1;
                } else {
                    external_weight_sum += edge.weighted_jaccard;
                    external_pairs += 1;
                }
            }
        }

        // Each internal pair was counted once from each endpoint.
        let internal_pairs = internal_pairs / 2;
        let internal_weight_sum = internal_weight_sum / 2.0;

        let avg_internal = if internal_pairs == 0 { 0.0 } else { internal_weight_sum / internal_pairs as f64 };
        let avg_external = if external_pairs == 0 { 0.0 } else { external_weight_sum / external_pairs as f64 };
        let cohesion =
            if avg_internal + avg_external <= 0.0 { 0.0 } else { avg_internal / (avg_internal + avg_external) };

        result.push(FolderAggregate {
            path: folder.clone(),
            file_count: file_ids.len(),
            total_commits,
            total_lines_changed: total_lines,
            avg_risk: if file_ids.is_empty() { 0.0 } else { risk_sum / file_ids.len() as f64 },
            cohesion,
        });
    }

    result.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(result)
}

fn folder_of(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityKind;
    use crate::store::Store;

    #[test]
    fn cohesion_is_high_when_a_folders_files_only_couple_with_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store
            .write(|tx| {
                Store::upsert_entity_with_id(tx, EntityId(1), "pkg/a.rs", EntityKind::File, None)?;
                Store::upsert_entity_with_id(tx, EntityId(2), "pkg/b.rs", EntityKind::File, None)?;
                Store::upsert_entity_with_id(tx, EntityId(3), "other/c.rs", EntityKind::File, None)?;
                Ok(())
            })
            .unwrap();

        let edge = crate::store::EdgeRow {
            src: EntityId(1),
            dst: EntityId(2),
            pair_count: 5,
            weighted_pair_count: 5.0,
            jaccard: 0.8,
            weighted_jaccard: 0.8,
            p_dst_given_src: 1.0,
            p_src_given_dst: 1.0,
        };
        let mut topk = HashMap::new();
        topk.insert(EntityId(1), vec![crate::store::TopKEntry { neighbor: EntityId(2), weighted_jaccard: 0.8 }]);
        topk.insert(EntityId(2), vec![crate::store::TopKEntry { neighbor: EntityId(1), weighted_jaccard: 0.8 }]);
        store.replace_edges(&[edge], &topk).unwrap();

        let conn = store.read_conn().unwrap();
        let metrics = crate::metrics::compute_file_metrics(&conn).unwrap();
        let folders = aggregate_folders(&conn, &metrics).unwrap();

        let pkg = folders.iter().find(|f| f.path == "pkg").unwrap();
        assert_eq!(pkg.file_count, 2);
        assert!((pkg.cohesion - 1.0).abs() < 1e-9);
    }
}
