//! Author statistics (spec §4.6): per-identity commit/file counts used
//! both directly (an "authors touching this file" view) and as an input
//! to the risk formula's bus-factor term.
//!
//! Grounded on the teacher's `git.rs`/`core.rs` identity handling;
//! aggregated here straight off the `commits`/`changes` tables rather
//! than needing its own store table, since it's cheap to recompute and
//! spec doesn't call for it to be queried as a standalone run stage.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;

use crate::core::EntityId;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthorStats {
    pub email: String,
    pub display_name: String,
    pub total_commits: u64,
    pub distinct_files_touched: u64,
    pub first_commit_time: i64,
    pub last_commit_time: i64,
}

pub fn compute_author_stats(conn: &Connection) -> rusqlite::Result<Vec<AuthorStats>> {
    let mut stmt = conn.prepare(
        "SELECT author_name, author_email, author_time, vcs_object_id FROM commits ORDER BY author_time",
    )?;

    struct Row {
        name: String,
        email: String,
        time: i64,
        commit_id: String,
    }

    let rows = stmt
        .query_map([], |r| {
            Ok(Row { name: r.get(0)?, email: r.get(1)?, time: r.get(2)?, commit_id: r.get(3)? })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut files_stmt = conn.prepare("SELECT file_id FROM changes WHERE commit_id = ?1")?;

    #[derive(Default)]
    struct Acc {
        name: String,
        commits: u64,
        files: HashSet<EntityId>,
        first: i64,
        last: i64,
    }

    let mut by_author: HashMap<String, Acc> = HashMap::new();

    for row in rows {
        let files: Vec<EntityId> =
            files_stmt.query_map(rusqlite::params![row.commit_id], |r| Ok(EntityId(r.get(0)?)))?.collect::<rusqlite::Result<Vec<_>>>()?;

        let acc = by_author.entry(row.email.clone()).or_insert_with(|| Acc {
            name: row.name.clone(),
            commits: 0,
            files: HashSet::new(),
            first: row.time,
            last: row.time,
        });
        acc.commits += 1;
        acc.files.extend(files);
        acc.first = acc.first.min(row.time);
        acc.last = acc.last.max(row.time);
    }

    let mut stats: Vec<AuthorStats> = by_author
        .into_iter()
        .map(|(email, acc)| AuthorStats {
            email,
            display_name: acc.name,
            total_commits: acc.commits,
            distinct_files_touched: acc.files.len() as u64,
            first_commit_time: acc.first,
            last_commit_time: acc.last,
        })
        .collect();

    stats.sort_by(|a, b| b.total_commits.cmp(&a.total_commits));
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Commit, EntityKind, Identity};
    use crate::store::Store;

    #[test]
    fn aggregates_commits_and_distinct_files_per_author() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let identity = Identity::canonicalize("Ada", "ADA@EXAMPLE.COM");
        store
            .write(|tx| {
                Store::upsert_entity_with_id(tx, EntityId(1), "a.rs", EntityKind::File, None)?;
                for i in 0..3u8 {
                    let commit = Commit {
                        id: crate::core::CommitId(git2::Oid::from_bytes(&[i; 20]).unwrap()),
                        author: identity.clone(),
                        committer: identity.clone(),
                        author_time: i as i64,
                        committer_time: i as i64,
                        message: "msg".to_string(),
                        parent_count: 0,
                    };
                    Store::insert_commit(tx, &commit)?;
                    Store::insert_change(
                        tx,
                        &crate::core::Change {
                            commit_id: commit.id,
                            file_id: EntityId(1),
                            kind: crate::core::ChangeKind::Modify,
                            lines_added: 1,
                            lines_deleted: 0,
                            prior_path: None,
                            line_stats_available: true,
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();

        let conn = store.read_conn().unwrap();
        let stats = compute_author_stats(&conn).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_commits, 3);
        assert_eq!(stats[0].distinct_files_touched, 1);
        assert_eq!(stats[0].email, "ada@example.com");
    }
}
