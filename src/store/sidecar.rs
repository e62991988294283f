//! Columnar CSV sidecar (spec §3: "a bulk scan over all changes in a
//! window should not require random access into the relational store").
//!
//! Grounded directly on the teacher's `tables.rs`: a small `TableWriter`
//! trait plus a `csv::Writer`-backed implementation, one file per table,
//! headers written once at creation.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::Writer;
use serde::Serialize;

use crate::core::{Change, Commit};
use crate::error::Result;

pub trait TableWriter<T: Serialize> {
    fn write_row(&mut self, row: &T) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct CsvTableWriter<T> {
    writer: Writer<File>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Serialize> CsvTableWriter<T> {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self { writer: Writer::from_writer(file), _marker: std::marker::PhantomData })
    }
}

impl<T: Serialize> TableWriter<T> for CsvTableWriter<T> {
    fn write_row(&mut self, row: &T) -> Result<()> {
        self.writer.serialize(row).map_err(|err| crate::error::EngineError::Internal(err.into()))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct CommitRow {
    vcs_object_id: String,
    author_name: String,
    author_email: String,
    author_time: i64,
    committer_time: i64,
    parent_count: u32,
}

#[derive(Serialize)]
struct ChangeRow {
    commit_id: String,
    file_id: i64,
    kind: &'static str,
    lines_added: u32,
    lines_deleted: u32,
    line_stats_available: bool,
}

/// Appends commits/changes to `commits.csv`/`changes.csv` under `dir`, for
/// predicate-pushdown scans that don't want SQLite's per-row overhead.
/// Sidecar files are a derived cache: the relational store is the single
/// source of truth and these are rebuilt wholesale if ever out of sync.
pub struct SidecarWriter {
    commits: CsvTableWriter<CommitRow>,
    changes: CsvTableWriter<ChangeRow>,
}

impl SidecarWriter {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            commits: CsvTableWriter::create(&commits_path(dir))?,
            changes: CsvTableWriter::create(&changes_path(dir))?,
        })
    }

    pub fn write_commit(&mut self, commit: &Commit) -> Result<()> {
        self.commits.write_row(&CommitRow {
            vcs_object_id: commit.id.to_hex(),
            author_name: commit.author.name.clone(),
            author_email: commit.author.email.clone(),
            author_time: commit.author_time,
            committer_time: commit.committer_time,
            parent_count: commit.parent_count,
        })
    }

    pub fn write_change(&mut self, change: &Change) -> Result<()> {
        self.changes.write_row(&ChangeRow {
            commit_id: change.commit_id.to_hex(),
            file_id: change.file_id.0,
            kind: change.kind.as_str(),
            lines_added: change.lines_added,
            lines_deleted: change.lines_deleted,
            line_stats_available: change.line_stats_available,
        })
    }

    pub fn finish(mut self) -> Result<()> {
        self.commits.flush()?;
        self.changes.flush()?;
        Ok(())
    }
}

pub fn commits_path(dir: &Path) -> PathBuf {
    dir.join("commits.csv")
}

pub fn changes_path(dir: &Path) -> PathBuf {
    dir.join("changes.csv")
}
