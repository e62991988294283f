//! Changeset Builder (spec §4.4): groups raw commits into logical
//! changesets per `changeset_mode`, then assigns each changeset a decayed
//! weight used by the Edge Aggregator.
//!
//! Grounded on the teacher's `matrix.rs::calc_cochanges`, which treats
//! one commit's file set as the unit a pair is drawn from; this
//! generalizes "unit" from "one commit" to "one logical changeset" per
//! the three grouping policies, and layers the age/size decay on top.

use std::collections::HashMap;

use regex::Regex;

use crate::config::{ChangesetMode, Config};
use crate::core::{CommitId, EntityId, Identity};
use crate::error::{EngineError, Result};

/// One grouped unit of co-change: a set of commits treated as a single
/// logical change, plus the union of files they touched.
#[derive(Debug, Clone)]
pub struct LogicalChangeset {
    pub commit_ids: Vec<CommitId>,
    pub file_ids: Vec<EntityId>,
    pub anchor_time: i64,
    pub size: usize,
}

/// A raw (commit, file-ids-touched) row the builder consumes; decoupled
/// from [crate::store::Store]'s row shape so this module can be unit
/// tested without a database.
#[derive(Debug, Clone)]
pub struct CommitFiles {
    pub commit_id: CommitId,
    pub author: Identity,
    pub author_time: i64,
    pub message: String,
    pub file_ids: Vec<EntityId>,
}

pub struct ChangesetBuilder<'a> {
    config: &'a Config,
    ticket_pattern: Option<Regex>,
}

impl<'a> ChangesetBuilder<'a> {
    pub fn new(config: &'a Config) -> Result<Self> {
        let ticket_pattern = match (&config.changeset_mode, &config.ticket_id_pattern) {
            (ChangesetMode::ByTicketId, Some(pattern)) => {
                Some(Regex::new(pattern).map_err(|err| EngineError::ParamInvalid(err.to_string()))?)
            }
            _ => None,
        };
        Ok(Self { config, ticket_pattern })
    }

    /// Group `commits` (assumed already sorted oldest-first, per
    /// [crate::history::HistoryReader]'s topological order) into logical
    /// changesets, then discard any whose distinct-file count exceeds the
    /// size cap for the active policy: `max_changeset_size` for
    /// `by_commit`, `max_logical_changeset_size` for the grouped policies
    /// (spec §4.4's combinatorial-blowup guard — a discard, not a split,
    /// so a dropped commit is filtered exactly once).
    pub fn build(&self, commits: &[CommitFiles]) -> Vec<LogicalChangeset> {
        let groups = match self.config.changeset_mode {
            ChangesetMode::ByCommit => commits.iter().cloned().map(|c| vec![c]).collect(),
            ChangesetMode::ByAuthorTime => self.group_by_author_time(commits),
            ChangesetMode::ByTicketId => self.group_by_ticket_id(commits),
        };

        let max_size = match self.config.changeset_mode {
            ChangesetMode::ByCommit => self.config.max_changeset_size,
            ChangesetMode::ByAuthorTime | ChangesetMode::ByTicketId => self.config.max_logical_changeset_size,
        };

        groups
            .into_iter()
            .map(|group| self.to_changeset(group))
            .filter(|cs| cs.size <= max_size)
            .collect()
    }

    fn group_by_author_time(&self, commits: &[CommitFiles]) -> Vec<Vec<CommitFiles>> {
        let window = self.config.author_time_window_hours as i64 * 3600;

        // Session-anchored: commits are grouped per-author, then a new
        // session starts whenever the gap since the *session's first*
        // commit exceeds the window — not a rolling window from the
        // immediately prior commit, so a slow trickle of edits that never
        // gaps past the window still forms one session.
        let mut by_author: HashMap<String, Vec<CommitFiles>> = HashMap::new();
        for commit in commits {
            by_author.entry(commit.author.email.clone()).or_default().push(commit.clone());
        }

        let mut groups = Vec::new();
        for (_, mut author_commits) in by_author {
            author_commits.sort_by_key(|c| c.author_time);
            let mut current: Vec<CommitFiles> = Vec::new();
            let mut anchor_time = i64::MIN;

            for commit in author_commits {
                if current.is_empty() {
                    anchor_time = commit.author_time;
                } else if commit.author_time - anchor_time > window {
                    groups.push(std::mem::take(&mut current));
                    anchor_time = commit.author_time;
                }
                current.push(commit);
            }
            if !current.is_empty() {
                groups.push(current);
            }
        }
        groups
    }

    fn group_by_ticket_id(&self, commits: &[CommitFiles]) -> Vec<Vec<CommitFiles>> {
        let pattern =
            self.ticket_pattern.as_ref().expect("validated config guarantees a pattern in ticket mode");
        let mut by_ticket: HashMap<String, Vec<CommitFiles>> = HashMap::new();
        let mut untagged = Vec::new();

        for commit in commits {
            match pattern.find(&commit.message) {
                Some(m) => by_ticket.entry(m.as_str().to_string()).or_default().push(commit.clone()),
                // A commit with no ticket token forms its own singleton
                // changeset rather than being silently dropped.
                None => untagged.push(vec![commit.clone()]),
            }
        }

        let mut groups: Vec<_> = by_ticket.into_values().collect();
        groups.extend(untagged);
        groups
    }

    fn to_changeset(&self, group: Vec<CommitFiles>) -> LogicalChangeset {
        let mut file_ids: Vec<EntityId> = group.iter().flat_map(|c| c.file_ids.iter().copied()).collect();
        file_ids.sort_unstable();
        file_ids.dedup();

        let anchor_time = group.iter().map(|c| c.author_time).max().unwrap_or(0);
        let commit_ids = group.into_iter().map(|c| c.commit_id).collect();

        let size = file_ids.len();
        LogicalChangeset { commit_ids, file_ids, anchor_time, size }
    }
}

/// Exponential half-life age decay combined with a soft top-decile size
/// penalty: changesets in the largest 10% by file count get
/// `1 / log2(size + 2)` multiplied into their weight; everything else is
/// unpenalized on size. Age decay multiplies in independently, and only
/// when `half_life_days` is configured.
pub fn weigh(changesets: &[LogicalChangeset], reference_time: i64, half_life_days: Option<f64>) -> Vec<f64> {
    let threshold = top_decile_size_threshold(changesets);

    changesets
        .iter()
        .map(|cs| {
            let mut weight = 1.0;

            if let Some(half_life) = half_life_days {
                let age_days = (reference_time - cs.anchor_time).max(0) as f64 / 86400.0;
                weight *= 0.5f64.powf(age_days / half_life);
            }

            if cs.size > threshold {
                weight *= 1.0 / (cs.size as f64 + 2.0).log2();
            }

            weight
        })
        .collect()
}

fn top_decile_size_threshold(changesets: &[LogicalChangeset]) -> usize {
    if changesets.is_empty() {
        return usize::MAX;
    }
    let mut sizes: Vec<usize> = changesets.iter().map(|cs| cs.size).collect();
    sizes.sort_unstable();
    let idx = ((sizes.len() as f64) * 0.9).floor() as usize;
    sizes[idx.min(sizes.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn cid(n: u8) -> CommitId {
        CommitId(git2::Oid::from_bytes(&[n; 20]).unwrap())
    }

    fn commit(n: u8, author: &str, time: i64, files: &[i64]) -> CommitFiles {
        CommitFiles {
            commit_id: cid(n),
            author: Identity::canonicalize(author, author),
            author_time: time,
            message: format!("commit {n}"),
            file_ids: files.iter().map(|f| EntityId(*f)).collect(),
        }
    }

    #[test]
    fn by_commit_mode_is_one_changeset_per_commit() {
        let config = Config::default();
        let builder = ChangesetBuilder::new(&config).unwrap();
        let commits = vec![commit(1, "a", 0, &[1, 2]), commit(2, "a", 10, &[3])];
        let changesets = builder.build(&commits);
        assert_eq!(changesets.len(), 2);
    }

    #[test]
    fn author_time_mode_merges_within_window_and_splits_on_gap() {
        let config = Config {
            changeset_mode: ChangesetMode::ByAuthorTime,
            author_time_window_hours: 1,
            ..Config::default()
        };
        let builder = ChangesetBuilder::new(&config).unwrap();

        let commits = vec![
            commit(1, "a", 0, &[1]),
            commit(2, "a", 1800, &[2]),     // 30 min later, same session
            commit(3, "a", 3600 * 5, &[3]), // 5h later, new session
        ];
        let changesets = builder.build(&commits);
        assert_eq!(changesets.len(), 2);
        let sizes: Vec<usize> = changesets.iter().map(|c| c.commit_ids.len()).collect();
        assert!(sizes.contains(&2));
        assert!(sizes.contains(&1));
    }

    #[test]
    fn ticket_id_mode_groups_across_authors() {
        let config = Config {
            changeset_mode: ChangesetMode::ByTicketId,
            ticket_id_pattern: Some(r"[A-Z]+-\d+".to_string()),
            ..Config::default()
        };
        let builder = ChangesetBuilder::new(&config).unwrap();

        let mut c1 = commit(1, "a", 0, &[1]);
        c1.message = "PROJ-42: fix thing".to_string();
        let mut c2 = commit(2, "b", 100, &[2]);
        c2.message = "PROJ-42: follow-up".to_string();
        let mut c3 = commit(3, "a", 200, &[3]);
        c3.message = "no ticket here".to_string();

        let changesets = builder.build(&[c1, c2, c3]);
        assert_eq!(changesets.len(), 2);
        let grouped = changesets.iter().find(|cs| cs.commit_ids.len() == 2).unwrap();
        assert_eq!(grouped.file_ids.len(), 2);
    }

    #[test]
    fn oversized_by_commit_changeset_is_discarded_exactly_once() {
        let config = Config { max_changeset_size: 3, ..Config::default() };
        let builder = ChangesetBuilder::new(&config).unwrap();

        let small = commit(1, "a", 0, &[1, 2]);
        let huge_files: Vec<i64> = (0..200).collect();
        let huge = commit(2, "a", 10, &huge_files);
        let changesets = builder.build(&[small, huge]);

        assert_eq!(changesets.len(), 1);
        assert_eq!(changesets[0].commit_ids, vec![cid(1)]);
    }

    #[test]
    fn oversized_grouped_changeset_uses_the_logical_size_cap() {
        let config = Config {
            changeset_mode: ChangesetMode::ByAuthorTime,
            author_time_window_hours: 1000,
            max_logical_changeset_size: 3,
            ..Config::default()
        };
        let builder = ChangesetBuilder::new(&config).unwrap();

        let commits: Vec<_> = (0..5u8).map(|i| commit(i, "a", i as i64, &[i as i64])).collect();
        let changesets = builder.build(&commits);
        // All 5 commits land in one author-time session with 5 distinct
        // files, which exceeds the cap of 3, so the whole session is dropped.
        assert!(changesets.is_empty());
    }

    #[test]
    fn decay_reduces_weight_of_older_changesets() {
        let changesets = vec![
            LogicalChangeset { commit_ids: vec![cid(1)], file_ids: vec![EntityId(1)], anchor_time: 0, size: 1 },
            LogicalChangeset { commit_ids: vec![cid(2)], file_ids: vec![EntityId(1)], anchor_time: 100, size: 1 },
        ];
        let weights = weigh(&changesets, 100, Some(10.0));
        assert!(weights[0] < weights[1]);
    }
}
