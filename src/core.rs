//! Shared identifiers and domain types threaded through every component.
//!
//! Kept deliberately thin: these are the nouns from the data model, not
//! behaviour. Components add their own local types around these.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A stable integer id for an [Entity]. Assigned by [crate::store::Store]
/// (SQLite rowid), never reused even if the underlying file is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    File,
    Folder,
    Component,
    External,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
            Self::Component => "component",
            Self::External => "external",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(qualified_name, kind)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub qualified_name: String,
    pub parent_id: Option<EntityId>,
    pub present_at_head: bool,
}

/// A git commit's object id. Thin wrapper around [git2::Oid] so most of the
/// crate need not depend on git2 directly; stored as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitId(#[serde(with = "oid_hex")] pub git2::Oid);

impl CommitId {
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        Ok(Self(git2::Oid::from_str(s)?))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

mod oid_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(oid: &git2::Oid, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&oid.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<git2::Oid, D::Error> {
        let text = String::deserialize(d)?;
        git2::Oid::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// Author/committer identity, canonicalized: trimmed name, lowercased email.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn canonicalize(name: &str, email: &str) -> Self {
        Self { name: name.trim().to_string(), email: email.trim().to_lowercase() }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub author: Identity,
    pub committer: Identity,
    pub author_time: i64,
    pub committer_time: i64,
    pub message: String,
    pub parent_count: u32,
}

impl Commit {
    pub fn is_merge(&self) -> bool {
        self.parent_count >= 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    Rename,
    Copy,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::Copy => "copy",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per (commit, file) pair. At most one [Change] per resolved file
/// id within a single commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub commit_id: CommitId,
    pub file_id: EntityId,
    pub kind: ChangeKind,
    pub lines_added: u32,
    pub lines_deleted: u32,
    pub prior_path: Option<String>,
    pub line_stats_available: bool,
}

/// `(stable_file_id, path, start_commit, end_commit)`. `end_commit` is
/// `None` while the path is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub file_id: EntityId,
    pub path: String,
    pub start_commit: CommitId,
    pub end_commit: Option<CommitId>,
}

impl LineageRecord {
    pub fn is_active(&self) -> bool {
        self.end_commit.is_none()
    }
}
