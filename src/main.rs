//! CLI front end for the logical coupling engine: drives a run over a
//! local repository clone and answers read-only queries against the
//! most recent analysis stored alongside it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use serde::Serialize;

use logical_coupling::config::{ChangesetMode, ClusteringConfig, Config, HierarchicalCut, HotspotSelector, Linkage};
use logical_coupling::orchestrator::{Orchestrator, ProgressEvent};
use logical_coupling::query;
use logical_coupling::store::{RunRow, Store};

const DEFAULT_STORE_DIR: &str = ".logical-coupling";

/// Extract logical coupling between files from a git repository's
/// history and expose it as a queryable coupling graph, hotspot
/// ranking, per-file risk scores, and community-detected clusters.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the git repository to analyze or query.
    ///
    /// Defaults to the current working directory.
    #[arg(short, long, default_value = ".")]
    repo: PathBuf,

    /// Directory holding the analysis store's SQLite database. Created
    /// if missing.
    ///
    /// Defaults to `{repo}/.logical-coupling`.
    #[arg(short, long)]
    store_dir: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an analysis over the repository's history, blocking until it
    /// completes, fails, or is cancelled from another invocation.
    Analyze(AnalyzeArgs),
    /// List every run recorded against this store.
    Runs,
    /// Show one run's current status.
    Run { run_id: i64 },
    /// Request cancellation of a running analysis.
    Cancel { run_id: i64 },
    /// Read-only queries over the most recent analysis.
    #[command(subcommand)]
    Query(QueryCommand),
}

#[derive(clap::Args, Debug)]
struct AnalyzeArgs {
    /// Only include commits with author time at or after this Unix
    /// timestamp.
    #[arg(long)]
    since: Option<i64>,

    /// Only include commits with author time at or before this Unix
    /// timestamp.
    #[arg(long)]
    until: Option<i64>,

    /// Git ref to walk history from.
    #[arg(long, default_value = "HEAD")]
    vcs_ref: String,

    /// How commits are grouped into changesets before weighing.
    #[arg(long, value_enum, default_value_t = ChangesetModeArg::ByCommit)]
    changeset_mode: ChangesetModeArg,

    /// Regex used to pull a ticket id out of a commit message. Required
    /// when `--changeset-mode by-ticket-id` is set.
    #[arg(long)]
    ticket_id_pattern: Option<String>,

    /// Minimum number of revisions a file needs before it's considered
    /// for coupling at all.
    #[arg(long, default_value_t = 5)]
    min_revisions: u32,

    /// Minimum raw co-occurrence count a file pair needs to survive
    /// into the edge set.
    #[arg(long, default_value_t = 5)]
    min_cooccurrence: u32,

    /// Restrict history to the last N days.
    #[arg(long)]
    window_days: Option<u32>,

    /// Exponential half-life, in days, for age-decaying changeset
    /// weight. Omit to disable decay.
    #[arg(long)]
    decay_half_life_days: Option<f64>,

    /// Run clustering after the coupling graph is derived.
    #[arg(long)]
    cluster: bool,

    /// Clustering algorithm, only consulted when `--cluster` is set.
    #[arg(long, value_enum, default_value_t = ClusterAlgorithmArg::Louvain)]
    cluster_algorithm: ClusterAlgorithmArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
enum ChangesetModeArg {
    ByCommit,
    ByAuthorTime,
    ByTicketId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
enum ClusterAlgorithmArg {
    Louvain,
    Hierarchical,
    Dbscan,
}

#[derive(Subcommand, Debug)]
enum QueryCommand {
    /// List files, optionally filtered by path substring, head
    /// presence, or metric ranges.
    Files {
        #[arg(long)]
        contains: Option<String>,
        #[arg(long)]
        present_at_head_only: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show one file's metrics and path lineage.
    File { path: String },
    /// Show the files most tightly coupled to one file.
    Coupling {
        path: String,
        #[arg(long, default_value_t = 0.0)]
        min_weighted_jaccard: f64,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show the coupling subgraph rooted at a path prefix.
    CouplingGraph {
        root: String,
        #[arg(long, default_value_t = 0.0)]
        min_weighted_jaccard: f64,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// List the current hotspots by risk score.
    Hotspots,
    /// Show the files directly impacted by changing one file.
    Impact { path: String },
    /// Show the one-hop impact graph around one file.
    ImpactGraph { path: String },
    /// Show a file's path history across renames.
    Lineage { path: String },
    /// Show internal vs. external coupling for a named component.
    Component {
        name: String,
        #[arg(long, default_value_t = 1)]
        depth: u32,
    },
    /// Show one cluster snapshot's membership and derived metrics.
    Snapshot { snapshot_id: i64 },
    /// Compare two cluster snapshots and classify cluster drift.
    CompareSnapshots { snapshot_a: i64, snapshot_b: i64 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let logger = env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init().unwrap();

    let store_dir = cli.store_dir.clone().unwrap_or_else(|| cli.repo.join(DEFAULT_STORE_DIR));

    match &cli.command {
        Command::Analyze(args) => run_analyze(&cli, args, store_dir, progress),
        Command::Runs => run_runs(&store_dir),
        Command::Run { run_id } => run_get(&store_dir, *run_id),
        Command::Cancel { run_id } => run_cancel(&store_dir, *run_id),
        Command::Query(query_command) => run_query(&store_dir, query_command),
    }
}

fn build_config(args: &AnalyzeArgs) -> Result<Config> {
    let changeset_mode = match args.changeset_mode {
        ChangesetModeArg::ByCommit => ChangesetMode::ByCommit,
        ChangesetModeArg::ByAuthorTime => ChangesetMode::ByAuthorTime,
        ChangesetModeArg::ByTicketId => ChangesetMode::ByTicketId,
    };

    let clustering = args.cluster.then(|| match args.cluster_algorithm {
        ClusterAlgorithmArg::Louvain => ClusteringConfig::Louvain { resolution: 1.0, max_iterations: 100 },
        ClusterAlgorithmArg::Hierarchical => {
            ClusteringConfig::Hierarchical { linkage: Linkage::Average, cut: HierarchicalCut::NClusters(10) }
        }
        ClusterAlgorithmArg::Dbscan => ClusteringConfig::Dbscan { eps: 0.5, min_samples: 3 },
    });

    Ok(Config {
        since: args.since,
        until: args.until,
        vcs_ref: args.vcs_ref.clone(),
        changeset_mode,
        ticket_id_pattern: args.ticket_id_pattern.clone(),
        min_revisions: args.min_revisions,
        min_cooccurrence: args.min_cooccurrence,
        window_days: args.window_days,
        decay_half_life_days: args.decay_half_life_days,
        clustering,
        ..Config::default()
    })
}

fn run_analyze(cli: &Cli, args: &AnalyzeArgs, store_dir: PathBuf, progress: MultiProgress) -> Result<()> {
    let store = Arc::new(Store::open(&store_dir)?);
    let orchestrator = Orchestrator::new(store, cli.repo.clone());

    let config = build_config(args)?;
    let handle = orchestrator.start(config)?;
    let run_id = handle.run_id;
    log::info!("started run {run_id}");

    let bar = progress.add(ProgressBar::new_spinner());
    bar.set_style(ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}").unwrap());
    bar.enable_steady_tick(std::time::Duration::from_millis(120));

    let runtime = tokio::runtime::Builder::new_current_thread().build()?;
    let mut receiver = handle.progress;
    let final_state = runtime.block_on(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    report_progress(&bar, &event);
                    if matches!(event.state.as_str(), "completed" | "failed" | "cancelled") {
                        bar.finish_and_clear();
                        return event.state;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    bar.finish_and_clear();
                    return "closed".to_string();
                }
            }
        }
    });

    let run = orchestrator.get_run(run_id)?;
    println!("{}", serde_json::to_string_pretty(&RunView::from(&run))?);

    if final_state == "failed" {
        anyhow::bail!("analysis failed: {}", run.error_message.unwrap_or_default());
    }
    Ok(())
}

fn report_progress(bar: &ProgressBar, event: &ProgressEvent) {
    let total = event.total.map(|t| t.to_string()).unwrap_or_else(|| "?".to_string());
    let eta = event.eta_seconds.map(|s| format!(", eta {s:.0}s")).unwrap_or_default();
    bar.set_message(format!("{} {}/{} ({:.1}/s{eta})", event.stage, event.processed, total, event.rate));
}

#[derive(Debug, Serialize)]
struct RunView {
    run_id: i64,
    state: String,
    stage: Option<String>,
    processed_commits: i64,
    total_commits: Option<i64>,
    started_at: i64,
    finished_at: Option<i64>,
    error_code: Option<String>,
    error_message: Option<String>,
}

impl From<&RunRow> for RunView {
    fn from(run: &RunRow) -> Self {
        Self {
            run_id: run.id,
            state: run.state.as_str().to_string(),
            stage: run.stage.clone(),
            processed_commits: run.processed_commits,
            total_commits: run.total_commits,
            started_at: run.started_at,
            finished_at: run.finished_at,
            error_code: run.error_code.clone(),
            error_message: run.error_message.clone(),
        }
    }
}

fn run_runs(store_dir: &std::path::Path) -> Result<()> {
    let store = Store::open(store_dir)?;
    let conn = store.read_conn()?;
    let runs: Vec<RunView> = Store::list_runs(&conn)?.iter().map(RunView::from).collect();
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}

fn run_get(store_dir: &std::path::Path, run_id: i64) -> Result<()> {
    let store = Store::open(store_dir)?;
    let orchestrator = Orchestrator::new(Arc::new(store), ".");
    let run = orchestrator.get_run(run_id)?;
    println!("{}", serde_json::to_string_pretty(&RunView::from(&run))?);
    Ok(())
}

fn run_cancel(store_dir: &std::path::Path, run_id: i64) -> Result<()> {
    let store = Store::open(store_dir)?;
    let orchestrator = Orchestrator::new(Arc::new(store), ".");
    orchestrator.cancel_run(run_id)?;
    log::info!("cancellation requested for run {run_id}");
    Ok(())
}

fn run_query(store_dir: &std::path::Path, command: &QueryCommand) -> Result<()> {
    let store = Store::open(store_dir)?;
    let conn = store.read_conn()?;

    match command {
        QueryCommand::Files { contains, present_at_head_only, limit, offset } => {
            let filter = query::FileListFilter {
                substring: contains.clone(),
                present_at_head_only: *present_at_head_only,
                limit: *limit,
                offset: *offset,
                ..Default::default()
            };
            print_json(&query::list_files(&conn, &filter)?)
        }
        QueryCommand::File { path } => print_json(&query::get_file_details(&conn, path)?),
        QueryCommand::Coupling { path, min_weighted_jaccard, limit } => {
            let opts = query::CouplingOptions { min_weighted_jaccard: *min_weighted_jaccard, limit: *limit };
            print_json(&query::get_coupling(&conn, path, &opts)?)
        }
        QueryCommand::CouplingGraph { root, min_weighted_jaccard, limit } => {
            let opts = query::CouplingGraphOptions { min_weighted_jaccard: *min_weighted_jaccard, limit: *limit };
            print_json(&query::get_coupling_graph(&conn, root, &opts)?)
        }
        QueryCommand::Hotspots => {
            let selector = Store::active_config(&conn)?
                .and_then(|(_, body)| serde_json::from_str::<Config>(&body).ok())
                .map(|config| config.hotspot_selector)
                .unwrap_or_else(HotspotSelector::default);
            print_json(&query::get_hotspots(&conn, selector)?)
        }
        QueryCommand::Impact { path } => print_json(&query::get_impact(&conn, path)?),
        QueryCommand::ImpactGraph { path } => print_json(&query::get_impact_graph(&conn, path)?),
        QueryCommand::Lineage { path } => print_json(&query::get_lineage(&conn, path)?),
        QueryCommand::Component { name, depth } => print_json(&query::get_component_coupling(&conn, name, *depth)?),
        QueryCommand::Snapshot { snapshot_id } => print_json(&query::get_cluster_snapshot(&conn, *snapshot_id)?),
        QueryCommand::CompareSnapshots { snapshot_a, snapshot_b } => {
            print_json(&query::compare_cluster_snapshots(&conn, *snapshot_a, *snapshot_b)?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
