//! A configuration is a versioned, named, validated object scoped to a
//! repository (spec §6). Recognized options exactly match the spec's
//! table; nothing here is guessed.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, FieldError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeHandling {
    None,
    FirstParent,
    Include,
}

impl Default for MergeHandling {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesetMode {
    ByCommit,
    ByAuthorTime,
    ByTicketId,
}

impl Default for ChangesetMode {
    fn default() -> Self {
        Self::ByCommit
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "algorithm")]
pub enum ClusteringConfig {
    Louvain { resolution: f64, max_iterations: u32 },
    Hierarchical { linkage: Linkage, cut: HierarchicalCut },
    Dbscan { eps: f64, min_samples: usize },
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self::Louvain { resolution: 1.0, max_iterations: 100 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    Average,
    Complete,
    Single,
    Ward,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchicalCut {
    NClusters(usize),
    DistanceThreshold(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotspotSelector {
    TopPercentile(f64),
    TopN(usize),
}

impl Default for HotspotSelector {
    fn default() -> Self {
        Self::TopPercentile(0.95)
    }
}

impl HotspotSelector {
    /// Parse the `top_p:0..1` / `top_n:int` string forms from spec §6.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("hotspot_selector must be 'top_p:<f64>' or 'top_n:<usize>', got '{s}'"))?;

        match kind {
            "top_p" => {
                let p: f64 = value.parse().map_err(|_| format!("invalid top_p value: '{value}'"))?;
                if !(0.0..=1.0).contains(&p) {
                    return Err(format!("top_p must be within [0, 1], got {p}"));
                }
                Ok(Self::TopPercentile(p))
            }
            "top_n" => {
                let n: usize = value.parse().map_err(|_| format!("invalid top_n value: '{value}'"))?;
                Ok(Self::TopN(n))
            }
            _ => Err(format!("unknown hotspot_selector kind: '{kind}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub since: Option<i64>,
    pub until: Option<i64>,
    #[serde(default = "default_ref")]
    pub vcs_ref: String,
    #[serde(default)]
    pub include_all_refs: bool,
    #[serde(default)]
    pub merge_handling: MergeHandling,
    #[serde(default)]
    pub changeset_mode: ChangesetMode,
    #[serde(default = "default_author_time_window_hours")]
    pub author_time_window_hours: u32,
    pub ticket_id_pattern: Option<String>,
    #[serde(default = "default_max_changeset_size")]
    pub max_changeset_size: usize,
    #[serde(default = "default_max_logical_changeset_size")]
    pub max_logical_changeset_size: usize,
    #[serde(default = "default_min_revisions")]
    pub min_revisions: u32,
    #[serde(default = "default_min_cooccurrence")]
    pub min_cooccurrence: u32,
    pub window_days: Option<u32>,
    pub decay_half_life_days: Option<f64>,
    #[serde(default = "default_topk_edges_per_file")]
    pub topk_edges_per_file: usize,
    #[serde(default = "default_rename_threshold")]
    pub rename_threshold: u8,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub include_extensions: Vec<String>,
    #[serde(default)]
    pub exclude_extensions: Vec<String>,
    #[serde(default = "default_hotspot_selector")]
    pub hotspot_selector: HotspotSelector,
    /// Graph-projection floor for the clusterer (spec §4.7): nodes/edges
    /// below this `weighted_jaccard` never enter the graph, regardless of
    /// which algorithm subsequently partitions it.
    #[serde(default = "default_min_edge_weight")]
    pub min_edge_weight: f64,
    #[serde(default)]
    pub clustering: Option<ClusteringConfig>,
}

fn default_ref() -> String {
    "HEAD".to_string()
}
fn default_author_time_window_hours() -> u32 {
    24
}
fn default_max_changeset_size() -> usize {
    50
}
fn default_max_logical_changeset_size() -> usize {
    100
}
fn default_min_revisions() -> u32 {
    5
}
fn default_min_cooccurrence() -> u32 {
    5
}
fn default_topk_edges_per_file() -> usize {
    50
}
fn default_rename_threshold() -> u8 {
    60
}
fn default_hotspot_selector() -> HotspotSelector {
    HotspotSelector::default()
}
fn default_min_edge_weight() -> f64 {
    0.1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            vcs_ref: default_ref(),
            include_all_refs: false,
            merge_handling: MergeHandling::default(),
            changeset_mode: ChangesetMode::default(),
            author_time_window_hours: default_author_time_window_hours(),
            ticket_id_pattern: None,
            max_changeset_size: default_max_changeset_size(),
            max_logical_changeset_size: default_max_logical_changeset_size(),
            min_revisions: default_min_revisions(),
            min_cooccurrence: default_min_cooccurrence(),
            window_days: None,
            decay_half_life_days: None,
            topk_edges_per_file: default_topk_edges_per_file(),
            rename_threshold: default_rename_threshold(),
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            include_extensions: Vec::new(),
            exclude_extensions: Vec::new(),
            hotspot_selector: default_hotspot_selector(),
            min_edge_weight: default_min_edge_weight(),
            clustering: None,
        }
    }
}

/// A [Config] that has passed [Config::validate]. Consumed by a run; the
/// orchestrator reads it once at run start into an immutable snapshot
/// (spec §5) and mid-run config changes never affect an in-flight run.
#[derive(Debug, Clone)]
pub struct ValidatedConfig(pub Config);

impl Config {
    pub fn validate(self) -> Result<ValidatedConfig, EngineError> {
        let mut fields = Vec::new();

        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                fields.push(FieldError::new("since", "must not be after `until`"));
            }
        }

        if self.vcs_ref.trim().is_empty() {
            fields.push(FieldError::new("ref", "must not be empty"));
        }

        if self.author_time_window_hours == 0 {
            fields.push(FieldError::new("author_time_window_hours", "must be > 0"));
        }

        if matches!(self.changeset_mode, ChangesetMode::ByTicketId) {
            match &self.ticket_id_pattern {
                None => fields.push(FieldError::new(
                    "ticket_id_pattern",
                    "required when changeset_mode is by_ticket_id",
                )),
                Some(pattern) => {
                    if let Err(err) = regex::Regex::new(pattern) {
                        fields.push(FieldError::new("ticket_id_pattern", &err.to_string()));
                    }
                }
            }
        }

        if self.max_changeset_size < 2 {
            fields.push(FieldError::new("max_changeset_size", "must be >= 2"));
        }

        if self.max_logical_changeset_size < 2 {
            fields.push(FieldError::new("max_logical_changeset_size", "must be >= 2"));
        }

        if self.min_revisions < 1 {
            fields.push(FieldError::new("min_revisions", "must be >= 1"));
        }

        if self.min_cooccurrence < 1 {
            fields.push(FieldError::new("min_cooccurrence", "must be >= 1"));
        }

        if let Some(days) = self.window_days {
            if days == 0 {
                fields.push(FieldError::new("window_days", "must be > 0 when set"));
            }
        }

        if let Some(half_life) = self.decay_half_life_days {
            if !(half_life > 0.0) {
                fields.push(FieldError::new("decay_half_life_days", "must be > 0 when set"));
            }
        }

        if self.topk_edges_per_file < 1 {
            fields.push(FieldError::new("topk_edges_per_file", "must be >= 1"));
        }

        if self.rename_threshold > 100 {
            fields.push(FieldError::new("rename_threshold", "must be within 0..=100"));
        }

        if !(0.0..=1.0).contains(&self.min_edge_weight) {
            fields.push(FieldError::new("min_edge_weight", "must be within 0..=1"));
        }

        if let Some(ClusteringConfig::Hierarchical { linkage: Linkage::Ward, .. }) = &self.clustering {
            // Node-count bound is enforced against the live graph in
            // `cluster::hierarchical`, not here — this struct alone can't
            // know the graph size yet. Kept as a reminder that Ward
            // validation happens in two places for two different reasons.
        }

        if !fields.is_empty() {
            return Err(EngineError::ConfigInvalid { fields });
        }

        Ok(ValidatedConfig(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn since_after_until_is_rejected() {
        let config = Config { since: Some(100), until: Some(50), ..Config::default() };
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_INVALID");
    }

    #[test]
    fn ticket_mode_requires_pattern() {
        let config = Config { changeset_mode: ChangesetMode::ByTicketId, ..Config::default() };
        assert!(config.validate().is_err());

        let config = Config {
            changeset_mode: ChangesetMode::ByTicketId,
            ticket_id_pattern: Some(r"[A-Z]+-\d+".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn hotspot_selector_parses_both_forms() {
        assert_eq!(HotspotSelector::parse("top_p:0.95").unwrap(), HotspotSelector::TopPercentile(0.95));
        assert_eq!(HotspotSelector::parse("top_n:20").unwrap(), HotspotSelector::TopN(20));
        assert!(HotspotSelector::parse("top_p:1.5").is_err());
        assert!(HotspotSelector::parse("nonsense").is_err());
    }
}
