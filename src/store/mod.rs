//! Embedded relational store (spec §3/§6): one SQLite database per
//! repository for entities, commits, changes, lineage, edges, top-K,
//! runs, configs and cluster snapshots, plus a columnar CSV sidecar for
//! bulk commit/change rows (see [sidecar]).
//!
//! Grounded on the teacher's `storage.rs` (`Connection` opened with
//! `PRAGMA`s, a `CREATE TABLE IF NOT EXISTS` schema string, prepared
//! statements via `prepare_cached`), generalized from a single
//! content-addressed cache table into the full schema spec §3 describes,
//! and on `codegraph-storage`'s `SqliteChunkStore` for the
//! one-writer-behind-a-mutex + indexed-foreign-key shape.

pub mod sidecar;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::{Change, ChangeKind, Commit, CommitId, Entity, EntityId, EntityKind, Identity, LineageRecord};
use crate::error::{EngineError, Result};

const SCHEMA_VERSION: i64 = 1;

const PRAGMAS: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;
"#;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    qualified_name TEXT NOT NULL,
    parent_id INTEGER REFERENCES entities(id),
    present_at_head INTEGER NOT NULL DEFAULT 0,
    attrs TEXT NOT NULL DEFAULT '{}',
    UNIQUE (qualified_name, kind)
);

CREATE TABLE IF NOT EXISTS file_stats (
    file_id INTEGER PRIMARY KEY REFERENCES entities(id),
    total_commits INTEGER NOT NULL DEFAULT 0,
    first_commit_time INTEGER,
    last_commit_time INTEGER,
    lines_added INTEGER NOT NULL DEFAULT 0,
    lines_deleted INTEGER NOT NULL DEFAULT 0,
    authors TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS commits (
    vcs_object_id TEXT PRIMARY KEY,
    author_name TEXT NOT NULL,
    author_email TEXT NOT NULL,
    committer_name TEXT NOT NULL,
    committer_email TEXT NOT NULL,
    author_time INTEGER NOT NULL,
    committer_time INTEGER NOT NULL,
    message TEXT NOT NULL,
    parent_count INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_commits_author_time ON commits(author_time);

CREATE TABLE IF NOT EXISTS changes (
    commit_id TEXT NOT NULL REFERENCES commits(vcs_object_id),
    file_id INTEGER NOT NULL REFERENCES entities(id),
    kind TEXT NOT NULL,
    lines_added INTEGER NOT NULL,
    lines_deleted INTEGER NOT NULL,
    prior_path TEXT,
    line_stats_available INTEGER NOT NULL,
    PRIMARY KEY (commit_id, file_id)
);

CREATE INDEX IF NOT EXISTS idx_changes_file ON changes(file_id);

CREATE TABLE IF NOT EXISTS lineage (
    id INTEGER PRIMARY KEY,
    file_id INTEGER NOT NULL REFERENCES entities(id),
    path TEXT NOT NULL,
    start_commit TEXT NOT NULL,
    end_commit TEXT
);

CREATE INDEX IF NOT EXISTS idx_lineage_file ON lineage(file_id);
CREATE INDEX IF NOT EXISTS idx_lineage_path ON lineage(path);

CREATE TABLE IF NOT EXISTS edges (
    src_file_id INTEGER NOT NULL REFERENCES entities(id),
    dst_file_id INTEGER NOT NULL REFERENCES entities(id),
    pair_count INTEGER NOT NULL,
    weighted_pair_count REAL NOT NULL,
    jaccard REAL NOT NULL,
    weighted_jaccard REAL NOT NULL,
    p_dst_given_src REAL NOT NULL,
    p_src_given_dst REAL NOT NULL,
    PRIMARY KEY (src_file_id, dst_file_id)
);

CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges(dst_file_id);

CREATE TABLE IF NOT EXISTS topk_edges (
    file_id INTEGER NOT NULL REFERENCES entities(id),
    rank INTEGER NOT NULL,
    neighbor_id INTEGER NOT NULL REFERENCES entities(id),
    weighted_jaccard REAL NOT NULL,
    PRIMARY KEY (file_id, rank)
);

CREATE TABLE IF NOT EXISTS configs (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    body TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY,
    config_id INTEGER NOT NULL REFERENCES configs(id),
    state TEXT NOT NULL,
    stage TEXT,
    processed_commits INTEGER NOT NULL DEFAULT 0,
    total_commits INTEGER,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    heartbeat_at INTEGER NOT NULL,
    error_code TEXT,
    error_message TEXT
);

-- At most one run per repository has state = 'running' (spec invariant 5).
-- A repository's store is its own partition, so this unique partial
-- index is sufficient; it also survives process restarts, unlike an
-- in-process mutex.
CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_single_active
    ON runs (state) WHERE state = 'running';

CREATE TABLE IF NOT EXISTS cluster_snapshots (
    id INTEGER PRIMARY KEY,
    algorithm TEXT NOT NULL,
    parameters TEXT NOT NULL,
    input_edge_filter TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cluster_members (
    snapshot_id INTEGER NOT NULL REFERENCES cluster_snapshots(id) ON DELETE CASCADE,
    cluster_id INTEGER NOT NULL,
    file_id INTEGER NOT NULL REFERENCES entities(id),
    PRIMARY KEY (snapshot_id, cluster_id, file_id)
);

CREATE INDEX IF NOT EXISTS idx_cluster_members_snapshot ON cluster_members(snapshot_id);
"#;

pub struct Store {
    dir: PathBuf,
    writer: Mutex<Connection>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let conn = Connection::open(dir.join("store.sqlite3"))?;
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(SCHEMA)?;

        let store = Self { dir, writer: Mutex::new(conn) };
        store.check_schema_version()?;
        store.reconcile_runs()?;
        Ok(store)
    }

    fn check_schema_version(&self) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        let current: Option<i64> =
            conn.query_row("SELECT version FROM schema_meta LIMIT 1", [], |r| r.get(0)).optional()?;

        match current {
            None => {
                conn.execute("INSERT INTO schema_meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
                Ok(())
            }
            Some(v) if v == SCHEMA_VERSION => Ok(()),
            Some(v) => Err(EngineError::Internal(anyhow::anyhow!(
                "schema version mismatch: store has v{v}, crate expects v{SCHEMA_VERSION}"
            ))),
        }
    }

    /// Promote any run stuck in `running` past its heartbeat timeout to
    /// `failed` (spec §4.8: "a crashed run is observed on restart ...").
    fn reconcile_runs(&self) -> Result<()> {
        let conn = self.writer.lock().unwrap();
        let stale_after_secs = 5 * 60;
        let now = now_unix();
        conn.execute(
            "UPDATE runs SET state = 'failed', finished_at = ?1,
                error_code = 'INTERNAL', error_message = 'run did not complete before process exit'
             WHERE state = 'running' AND heartbeat_at < ?2",
            params![now, now - stale_after_secs],
        )?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open a fresh read-only connection. Cheap; callers are expected to
    /// keep one per concurrent reader rather than sharing across threads.
    pub fn read_conn(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            self.dir.join("store.sqlite3"),
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    /// Run `f` inside a single write transaction. On error, the
    /// transaction rolls back and is never partially observed (spec §3's
    /// "no partial edge state is ever observed by readers" generalizes to
    /// every multi-row write in this store).
    pub fn write<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self.writer.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|err| EngineError::StoreWriteFailed { rolled_back: true, source: err.into() })?;
        let result = f(&tx)
            .map_err(|err| EngineError::StoreWriteFailed { rolled_back: true, source: err.into() })?;
        tx.commit()
            .map_err(|err| EngineError::StoreWriteFailed { rolled_back: false, source: err.into() })?;
        Ok(result)
    }

    // -- entities -----------------------------------------------------

    /// Resolve or create an entity, enforcing the `(qualified_name, kind)`
    /// uniqueness invariant.
    pub fn upsert_entity(
        tx: &rusqlite::Transaction,
        qualified_name: &str,
        kind: EntityKind,
        parent_id: Option<EntityId>,
    ) -> rusqlite::Result<EntityId> {
        tx.execute(
            "INSERT INTO entities (kind, qualified_name, parent_id, present_at_head)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(qualified_name, kind) DO UPDATE SET present_at_head = 1",
            params![kind.as_str(), qualified_name, parent_id.map(|i| i.0)],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM entities WHERE qualified_name = ?1 AND kind = ?2",
            params![qualified_name, kind.as_str()],
            |r| r.get(0),
        )?;
        Ok(EntityId(id))
    }

    /// Like [Self::upsert_entity] but with the id fixed by the caller.
    /// Used by the extractor, which must keep the in-memory
    /// [crate::pathresolver::PathResolver]'s ids in lockstep with the
    /// `entities` table's rowids across batches.
    pub fn upsert_entity_with_id(
        tx: &rusqlite::Transaction,
        id: EntityId,
        qualified_name: &str,
        kind: EntityKind,
        parent_id: Option<EntityId>,
    ) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO entities (id, kind, qualified_name, parent_id, present_at_head)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT(id) DO UPDATE SET present_at_head = 1, qualified_name = ?3",
            params![id.0, kind.as_str(), qualified_name, parent_id.map(|i| i.0)],
        )?;
        Ok(())
    }

    pub fn set_present_at_head(tx: &rusqlite::Transaction, id: EntityId, present: bool) -> rusqlite::Result<()> {
        tx.execute(
            "UPDATE entities SET present_at_head = ?1 WHERE id = ?2",
            params![present as i64, id.0],
        )?;
        Ok(())
    }

    pub fn get_entity_by_name(conn: &Connection, qualified_name: &str, kind: EntityKind) -> rusqlite::Result<Option<Entity>> {
        conn.query_row(
            "SELECT id, kind, qualified_name, parent_id, present_at_head FROM entities
             WHERE qualified_name = ?1 AND kind = ?2",
            params![qualified_name, kind.as_str()],
            Self::row_to_entity,
        )
        .optional()
    }

    pub fn list_live_files(conn: &Connection) -> rusqlite::Result<Vec<(String, EntityId)>> {
        let mut stmt = conn.prepare(
            "SELECT qualified_name, id FROM entities WHERE kind = 'file' AND present_at_head = 1",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, EntityId(r.get(1)?))))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Every file entity ever sighted, including those no longer present
    /// at HEAD. Filtering by head-presence happens in the caller, not here.
    pub fn list_all_files(conn: &Connection) -> rusqlite::Result<Vec<(String, EntityId, bool)>> {
        let mut stmt =
            conn.prepare("SELECT qualified_name, id, present_at_head FROM entities WHERE kind = 'file'")?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(0)?, EntityId(r.get(1)?), r.get::<_, i64>(2)? != 0))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_entity(conn: &Connection, id: EntityId) -> rusqlite::Result<Option<Entity>> {
        conn.query_row(
            "SELECT id, kind, qualified_name, parent_id, present_at_head FROM entities WHERE id = ?1",
            params![id.0],
            Self::row_to_entity,
        )
        .optional()
    }

    pub fn children(conn: &Connection, parent_id: EntityId) -> rusqlite::Result<Vec<Entity>> {
        let mut stmt = conn.prepare(
            "SELECT id, kind, qualified_name, parent_id, present_at_head FROM entities WHERE parent_id = ?1",
        )?;
        let rows = stmt.query_map(params![parent_id.0], Self::row_to_entity)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn max_entity_id(conn: &Connection) -> rusqlite::Result<i64> {
        conn.query_row("SELECT COALESCE(MAX(id), 0) FROM entities", [], |r| r.get(0))
    }

    fn row_to_entity(row: &rusqlite::Row) -> rusqlite::Result<Entity> {
        let kind_str: String = row.get(1)?;
        Ok(Entity {
            id: EntityId(row.get(0)?),
            kind: parse_entity_kind(&kind_str),
            qualified_name: row.get(2)?,
            parent_id: row.get::<_, Option<i64>>(3)?.map(EntityId),
            present_at_head: row.get::<_, i64>(4)? != 0,
        })
    }

    // -- commits / changes ---------------------------------------------

    pub fn insert_commit(tx: &rusqlite::Transaction, commit: &Commit) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT OR IGNORE INTO commits
                (vcs_object_id, author_name, author_email, committer_name, committer_email,
                 author_time, committer_time, message, parent_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                commit.id.to_hex(),
                commit.author.name,
                commit.author.email,
                commit.committer.name,
                commit.committer.email,
                commit.author_time,
                commit.committer_time,
                commit.message,
                commit.parent_count,
            ],
        )?;
        Ok(())
    }

    pub fn insert_change(tx: &rusqlite::Transaction, change: &Change) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT OR IGNORE INTO changes
                (commit_id, file_id, kind, lines_added, lines_deleted, prior_path, line_stats_available)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                change.commit_id.to_hex(),
                change.file_id.0,
                change.kind.as_str(),
                change.lines_added,
                change.lines_deleted,
                change.prior_path,
                change.line_stats_available as i64,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_lineage(tx: &rusqlite::Transaction, record: &LineageRecord) -> rusqlite::Result<()> {
        // The resolver hands us the whole lineage delta each batch,
        // including records that were opened in a prior batch and are
        // only now being closed; an id-less upsert keyed on
        // (file_id, path, start_commit) keeps this idempotent.
        tx.execute(
            "INSERT INTO lineage (file_id, path, start_commit, end_commit)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![record.file_id.0, record.path, record.start_commit.to_hex(), record.end_commit.map(|c| c.to_hex())],
        )?;
        tx.execute(
            "UPDATE lineage SET end_commit = ?1
             WHERE file_id = ?2 AND path = ?3 AND start_commit = ?4",
            params![
                record.end_commit.map(|c| c.to_hex()),
                record.file_id.0,
                record.path,
                record.start_commit.to_hex(),
            ],
        )?;
        Ok(())
    }

    pub fn get_lineage(conn: &Connection, file_id: EntityId) -> rusqlite::Result<Vec<LineageRecord>> {
        let mut stmt = conn.prepare(
            "SELECT file_id, path, start_commit, end_commit FROM lineage
             WHERE file_id = ?1 ORDER BY start_commit",
        )?;
        let rows = stmt
            .query_map(params![file_id.0], |r| {
                let start: String = r.get(2)?;
                let end: Option<String> = r.get(3)?;
                Ok(LineageRecord {
                    file_id: EntityId(r.get(0)?),
                    path: r.get(1)?,
                    start_commit: CommitId::from_hex(&start).expect("valid oid in store"),
                    end_commit: end.map(|e| CommitId::from_hex(&e).expect("valid oid in store")),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- file stats -----------------------------------------------------

    pub fn bump_file_stats(
        tx: &rusqlite::Transaction,
        file_id: EntityId,
        commit_time: i64,
        lines_added: u32,
        lines_deleted: u32,
        author: &Identity,
    ) -> rusqlite::Result<()> {
        let existing: Option<String> = tx
            .query_row("SELECT authors FROM file_stats WHERE file_id = ?1", params![file_id.0], |r| r.get(0))
            .optional()?;

        let mut authors: Vec<String> = existing
            .map(|s| serde_json::from_str(&s).unwrap_or_default())
            .unwrap_or_default();
        let author_key = author.email.clone();
        if !authors.contains(&author_key) {
            authors.push(author_key);
        }
        let authors_json = serde_json::to_string(&authors).unwrap();

        tx.execute(
            "INSERT INTO file_stats (file_id, total_commits, first_commit_time, last_commit_time,
                lines_added, lines_deleted, authors)
             VALUES (?1, 1, ?2, ?2, ?3, ?4, ?5)
             ON CONFLICT(file_id) DO UPDATE SET
                total_commits = total_commits + 1,
                first_commit_time = MIN(first_commit_time, ?2),
                last_commit_time = MAX(last_commit_time, ?2),
                lines_added = lines_added + ?3,
                lines_deleted = lines_deleted + ?4,
                authors = ?5",
            params![file_id.0, commit_time, lines_added, lines_deleted, authors_json],
        )?;
        Ok(())
    }

    pub fn file_stats(conn: &Connection, file_id: EntityId) -> rusqlite::Result<Option<FileStatsRow>> {
        conn.query_row(
            "SELECT total_commits, first_commit_time, last_commit_time, lines_added, lines_deleted, authors
             FROM file_stats WHERE file_id = ?1",
            params![file_id.0],
            |r| {
                let authors: String = r.get(5)?;
                Ok(FileStatsRow {
                    total_commits: r.get(0)?,
                    first_commit_time: r.get(1)?,
                    last_commit_time: r.get(2)?,
                    lines_added: r.get(3)?,
                    lines_deleted: r.get(4)?,
                    authors: serde_json::from_str(&authors).unwrap_or_default(),
                })
            },
        )
        .optional()
    }

    pub fn now_unix() -> i64 {
        now_unix()
    }

    /// Count of commits touching `file_id` with `author_time >= since`.
    /// Backs `commits_last_30_days` (spec §4.6).
    pub fn commits_in_window(conn: &Connection, file_id: EntityId, since: i64) -> rusqlite::Result<u64> {
        conn.query_row(
            "SELECT COUNT(*) FROM changes c JOIN commits m ON m.vcs_object_id = c.commit_id
             WHERE c.file_id = ?1 AND m.author_time >= ?2",
            params![file_id.0, since],
            |r| r.get::<_, i64>(0),
        )
        .map(|n| n as u64)
    }

    /// All recorded commits, oldest first, for the Changeset Builder to
    /// group (spec §4.4). Each commit is paired with the file ids its
    /// persisted changes touch — already reflecting whatever
    /// `merge_handling` was in effect at extraction time.
    pub fn commit_rows(conn: &Connection) -> rusqlite::Result<Vec<(CommitId, Identity, i64, String)>> {
        let mut stmt = conn.prepare(
            "SELECT vcs_object_id, author_name, author_email, author_time, message
             FROM commits ORDER BY author_time, vcs_object_id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                let oid: String = r.get(0)?;
                Ok((
                    CommitId::from_hex(&oid).expect("valid oid in store"),
                    Identity { name: r.get(1)?, email: r.get(2)? },
                    r.get::<_, i64>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn files_for_commit(conn: &Connection, commit_id: CommitId) -> rusqlite::Result<Vec<EntityId>> {
        let mut stmt = conn.prepare("SELECT file_id FROM changes WHERE commit_id = ?1")?;
        let rows = stmt
            .query_map(params![commit_id.to_hex()], |r| Ok(EntityId(r.get(0)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// File ids whose lifetime commit count meets `min_revisions` (spec
    /// §6): the Edge Aggregator only pairs files that clear this floor.
    pub fn files_with_min_revisions(conn: &Connection, min_revisions: u32) -> rusqlite::Result<HashSet<EntityId>> {
        let mut stmt = conn.prepare("SELECT file_id FROM file_stats WHERE total_commits >= ?1")?;
        let rows = stmt
            .query_map(params![min_revisions], |r| Ok(EntityId(r.get(0)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().collect())
    }

    // -- edges ------------------------------------------------------------

    /// Rewrite the entire edge table within one transaction (spec §4.5:
    /// readers never observe a partial edge set).
    pub fn replace_edges(&self, edges: &[EdgeRow], topk: &HashMap<EntityId, Vec<TopKEntry>>) -> Result<()> {
        self.write(|tx| {
            tx.execute("DELETE FROM edges", [])?;
            tx.execute("DELETE FROM topk_edges", [])?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO edges (src_file_id, dst_file_id, pair_count, weighted_pair_count,
                        jaccard, weighted_jaccard, p_dst_given_src, p_src_given_dst)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for edge in edges {
                    stmt.execute(params![
                        edge.src.0,
                        edge.dst.0,
                        edge.pair_count,
                        edge.weighted_pair_count,
                        edge.jaccard,
                        edge.weighted_jaccard,
                        edge.p_dst_given_src,
                        edge.p_src_given_dst,
                    ])?;
                }
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO topk_edges (file_id, rank, neighbor_id, weighted_jaccard)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (file_id, entries) in topk {
                    for (rank, entry) in entries.iter().enumerate() {
                        stmt.execute(params![file_id.0, rank as i64, entry.neighbor.0, entry.weighted_jaccard])?;
                    }
                }
            }

            Ok(())
        })
    }

    pub fn coupling_for(conn: &Connection, file_id: EntityId) -> rusqlite::Result<Vec<EdgeRow>> {
        let mut stmt = conn.prepare(
            "SELECT src_file_id, dst_file_id, pair_count, weighted_pair_count, jaccard,
                    weighted_jaccard, p_dst_given_src, p_src_given_dst
             FROM edges WHERE src_file_id = ?1 OR dst_file_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![file_id.0], Self::row_to_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn all_edges(conn: &Connection, min_weighted_jaccard: f64) -> rusqlite::Result<Vec<EdgeRow>> {
        let mut stmt = conn.prepare(
            "SELECT src_file_id, dst_file_id, pair_count, weighted_pair_count, jaccard,
                    weighted_jaccard, p_dst_given_src, p_src_given_dst
             FROM edges WHERE weighted_jaccard >= ?1",
        )?;
        let rows = stmt
            .query_map(params![min_weighted_jaccard], Self::row_to_edge)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<EdgeRow> {
        Ok(EdgeRow {
            src: EntityId(row.get(0)?),
            dst: EntityId(row.get(1)?),
            pair_count: row.get(2)?,
            weighted_pair_count: row.get(3)?,
            jaccard: row.get(4)?,
            weighted_jaccard: row.get(5)?,
            p_dst_given_src: row.get(6)?,
            p_src_given_dst: row.get(7)?,
        })
    }

    // -- runs -------------------------------------------------------------

    pub fn create_run(&self, config_id: i64, total_commits: Option<i64>) -> Result<i64> {
        let now = now_unix();
        self.write(|tx| {
            tx.execute(
                "INSERT INTO runs (config_id, state, stage, total_commits, started_at, heartbeat_at)
                 VALUES (?1, 'pending', NULL, ?2, ?3, ?3)",
                params![config_id, total_commits, now],
            )?;
            Ok(tx.last_insert_rowid())
        })
        .map_err(|err| match err {
            EngineError::StoreWriteFailed { source, .. } if is_unique_violation(&source) => {
                EngineError::AnalysisBusy
            }
            other => other,
        })
    }

    pub fn transition_run(&self, run_id: i64, state: RunState, stage: Option<&str>) -> Result<()> {
        let now = now_unix();
        let finished = matches!(state, RunState::Completed | RunState::Failed | RunState::Cancelled);
        self.write(|tx| {
            tx.execute(
                "UPDATE runs SET state = ?1, stage = COALESCE(?2, stage), heartbeat_at = ?3,
                    finished_at = CASE WHEN ?4 THEN ?3 ELSE finished_at END
                 WHERE id = ?5",
                params![state.as_str(), stage, now, finished, run_id],
            )?;
            Ok(())
        })
        .map_err(|err| match err {
            EngineError::StoreWriteFailed { source, .. } if is_unique_violation(&source) => {
                EngineError::AnalysisBusy
            }
            other => other,
        })
    }

    pub fn fail_run(&self, run_id: i64, code: &str, message: &str) -> Result<()> {
        let now = now_unix();
        self.write(|tx| {
            tx.execute(
                "UPDATE runs SET state = 'failed', heartbeat_at = ?1, finished_at = ?1,
                    error_code = ?2, error_message = ?3
                 WHERE id = ?4",
                params![now, code, message, run_id],
            )?;
            Ok(())
        })
    }

    pub fn heartbeat(&self, run_id: i64, processed_commits: i64) -> Result<()> {
        let now = now_unix();
        self.write(|tx| {
            tx.execute(
                "UPDATE runs SET processed_commits = ?1, heartbeat_at = ?2 WHERE id = ?3",
                params![processed_commits, now, run_id],
            )?;
            Ok(())
        })
    }

    pub fn get_run(conn: &Connection, run_id: i64) -> rusqlite::Result<Option<RunRow>> {
        conn.query_row(
            "SELECT id, config_id, state, stage, processed_commits, total_commits,
                    started_at, finished_at, error_code, error_message
             FROM runs WHERE id = ?1",
            params![run_id],
            Self::row_to_run,
        )
        .optional()
    }

    pub fn list_runs(conn: &Connection) -> rusqlite::Result<Vec<RunRow>> {
        let mut stmt = conn.prepare(
            "SELECT id, config_id, state, stage, processed_commits, total_commits,
                    started_at, finished_at, error_code, error_message
             FROM runs ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map([], Self::row_to_run)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<RunRow> {
        let state: String = row.get(2)?;
        Ok(RunRow {
            id: row.get(0)?,
            config_id: row.get(1)?,
            state: RunState::parse(&state),
            stage: row.get(3)?,
            processed_commits: row.get(4)?,
            total_commits: row.get(5)?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            error_code: row.get(8)?,
            error_message: row.get(9)?,
        })
    }

    // -- configs ----------------------------------------------------------

    pub fn save_config(&self, name: &str, body: &str) -> Result<i64> {
        let now = now_unix();
        self.write(|tx| {
            tx.execute("UPDATE configs SET is_active = 0", [])?;
            tx.execute(
                "INSERT INTO configs (name, body, is_active, created_at) VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(name) DO UPDATE SET body = ?2, is_active = 1",
                params![name, body, now],
            )?;
            tx.query_row("SELECT id FROM configs WHERE name = ?1", params![name], |r| r.get(0))
        })
    }

    pub fn active_config(conn: &Connection) -> rusqlite::Result<Option<(i64, String)>> {
        conn.query_row("SELECT id, body FROM configs WHERE is_active = 1", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()
    }

    // -- cluster snapshots --------------------------------------------------

    pub fn save_snapshot(
        &self,
        algorithm: &str,
        parameters: &str,
        input_edge_filter: &str,
        members: &[(i64, EntityId)],
    ) -> Result<i64> {
        let now = now_unix();
        self.write(|tx| {
            tx.execute(
                "INSERT INTO cluster_snapshots (algorithm, parameters, input_edge_filter, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![algorithm, parameters, input_edge_filter, now],
            )?;
            let snapshot_id = tx.last_insert_rowid();

            let mut stmt = tx.prepare(
                "INSERT INTO cluster_members (snapshot_id, cluster_id, file_id) VALUES (?1, ?2, ?3)",
            )?;
            for (cluster_id, file_id) in members {
                stmt.execute(params![snapshot_id, cluster_id, file_id.0])?;
            }

            Ok(snapshot_id)
        })
    }

    pub fn delete_snapshot(&self, snapshot_id: i64) -> Result<()> {
        self.write(|tx| {
            tx.execute("DELETE FROM cluster_snapshots WHERE id = ?1", params![snapshot_id])?;
            Ok(())
        })
    }

    pub fn snapshot_members(conn: &Connection, snapshot_id: i64) -> rusqlite::Result<Vec<(i64, EntityId)>> {
        let mut stmt =
            conn.prepare("SELECT cluster_id, file_id FROM cluster_members WHERE snapshot_id = ?1")?;
        let rows = stmt
            .query_map(params![snapshot_id], |r| Ok((r.get::<_, i64>(0)?, EntityId(r.get(1)?))))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn snapshot_meta(conn: &Connection, snapshot_id: i64) -> rusqlite::Result<Option<(String, String, String)>> {
        conn.query_row(
            "SELECT algorithm, parameters, input_edge_filter FROM cluster_snapshots WHERE id = ?1",
            params![snapshot_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rusqlite::Error>()
        .map(|e| matches!(e, rusqlite::Error::SqliteFailure(code, _) if code.code == rusqlite::ErrorCode::ConstraintViolation))
        .unwrap_or(false)
}

fn parse_entity_kind(s: &str) -> EntityKind {
    match s {
        "file" => EntityKind::File,
        "folder" => EntityKind::Folder,
        "component" => EntityKind::Component,
        _ => EntityKind::External,
    }
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub config_id: i64,
    pub state: RunState,
    pub stage: Option<String>,
    pub processed_commits: i64,
    pub total_commits: Option<i64>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileStatsRow {
    pub total_commits: i64,
    pub first_commit_time: Option<i64>,
    pub last_commit_time: Option<i64>,
    pub lines_added: i64,
    pub lines_deleted: i64,
    pub authors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeRow {
    pub src: EntityId,
    pub dst: EntityId,
    pub pair_count: i64,
    pub weighted_pair_count: f64,
    pub jaccard: f64,
    pub weighted_jaccard: f64,
    pub p_dst_given_src: f64,
    pub p_src_given_dst: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopKEntry {
    pub neighbor: EntityId,
    pub weighted_jaccard: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityKind;

    #[test]
    fn entities_are_unique_by_name_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let a = store.write(|tx| Store::upsert_entity(tx, "src/a.rs", EntityKind::File, None)).unwrap();
        let b = store.write(|tx| Store::upsert_entity(tx, "src/a.rs", EntityKind::File, None)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn at_most_one_running_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let config_id = store.save_config("default", "{}").unwrap();

        let run_a = store.create_run(config_id, None).unwrap();
        store.transition_run(run_a, RunState::Running, Some("extracting")).unwrap();

        let run_b = store.create_run(config_id, None).unwrap();
        let err = store.transition_run(run_b, RunState::Running, Some("extracting")).unwrap_err();
        assert_eq!(err.code(), "ANALYSIS_BUSY");
    }

    #[test]
    fn schema_reopens_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _store = Store::open(dir.path()).unwrap();
        }
        let _store2 = Store::open(dir.path()).unwrap();
    }
}
