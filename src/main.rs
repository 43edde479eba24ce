//! Metamorph Daemon
//!
//! Entry point for the self-mutation daemon. Handles CLI args,
//! subsystem wiring, and the daemon lifecycle.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::info;

use metamorph::config::{self, DaemonConfig, LogLevel};
use metamorph::daemon::{DaemonOptions, ImprovementDaemon, ImprovementPipeline};
use metamorph::filter::ContentFilter;
use metamorph::implementer::AutoImplementer;
use metamorph::ledger::VersionLedger;
use metamorph::notify::{LogNotifier, WebhookNotifier};
use metamorph::patcher::HotPatcher;
use metamorph::sandbox::SandboxGuard;
use metamorph::types::{ImprovementSource, Issue, NotificationSink, Solution};
use metamorph::updater::{SelfUpdater, SupervisorCli};
use metamorph::vcs::{GitCli, VersionControl};

const VERSION: &str = "0.1.0";

/// Metamorph -- Autonomous Self-Mutation Daemon
#[derive(Parser, Debug)]
#[command(
    name = "metamorph",
    version = VERSION,
    about = "Metamorph -- Autonomous Self-Mutation Daemon"
)]
struct Cli {
    /// Start the daemon loop
    #[arg(long)]
    run: bool,

    /// Run one improvement cycle immediately and exit
    #[arg(long)]
    cycle: bool,

    /// Show daemon status
    #[arg(long)]
    status: bool,

    /// List recent version records
    #[arg(long)]
    versions: bool,

    /// List recent implementation records
    #[arg(long)]
    implementations: bool,

    /// List hot patches (pending and applied)
    #[arg(long)]
    patches: bool,

    /// Roll back an implementation by record id
    #[arg(long, value_name = "ID")]
    rollback: Option<String>,

    /// Write a default config to ~/.metamorph/config.json
    #[arg(long)]
    init: bool,
}

// ---- Inbox Source -----------------------------------------------------------

/// Issue/solution pairs queued by an external analyzer (or an operator)
/// in `<data_dir>/inbox.json`. Consumed entries are removed from the
/// file once a solution is handed out.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboxEntry {
    issue: Issue,
    solution: Solution,
}

struct InboxSource {
    path: std::path::PathBuf,
    entries: Mutex<Vec<InboxEntry>>,
}

impl InboxSource {
    fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("inbox.json"),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn persist(&self, entries: &[InboxEntry]) {
        if let Ok(json) = serde_json::to_string_pretty(entries) {
            let _ = fs::write(&self.path, json);
        }
    }
}

#[async_trait]
impl ImprovementSource for InboxSource {
    async fn analyze_performance(&self) -> Result<Vec<Issue>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let loaded: Vec<InboxEntry> =
            serde_json::from_str(&contents).context("inbox.json is malformed")?;
        let issues = loaded.iter().map(|e| e.issue.clone()).collect();
        *self.entries.lock().unwrap() = loaded;
        Ok(issues)
    }

    async fn generate_improvement(&self, issue: &Issue) -> Result<Option<Solution>> {
        let mut entries = self.entries.lock().unwrap();
        let Some(pos) = entries
            .iter()
            .position(|e| e.issue.description == issue.description)
        else {
            return Ok(None);
        };
        let entry = entries.remove(pos);
        self.persist(&entries);
        Ok(Some(entry.solution))
    }
}

// ---- Wiring -----------------------------------------------------------------

fn load_config_or_die() -> DaemonConfig {
    match config::load_config() {
        Some(config) => config,
        None => {
            eprintln!("No config found. Run: metamorph --init");
            std::process::exit(1);
        }
    }
}

fn init_tracing(level: LogLevel) {
    let level = match level {
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Error => tracing::Level::ERROR,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn build_pipeline(config: &DaemonConfig) -> Result<ImprovementPipeline> {
    let data_dir = config::resolve_path(&config.data_dir);
    let data_dir = Path::new(&data_dir);
    let sandbox_root = config::resolve_path(&config.sandbox_root);
    fs::create_dir_all(&sandbox_root).context("failed to create sandbox root")?;
    let repo_path = config::resolve_path(&config.repo_path);

    let sandbox = Arc::new(SandboxGuard::new(&sandbox_root));
    let filter = Arc::new(ContentFilter::new());
    let vcs: Arc<dyn VersionControl> = Arc::new(GitCli::new(&sandbox_root));
    let repo_vcs: Arc<dyn VersionControl> = Arc::new(GitCli::new(&repo_path));

    let sink: Arc<dyn NotificationSink> = match config.webhook_url {
        Some(ref url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let source = Arc::new(InboxSource::new(data_dir));

    Ok(ImprovementPipeline {
        ledger: VersionLedger::open(data_dir)?,
        implementer: AutoImplementer::open(data_dir, sandbox, filter.clone(), vcs)?,
        // Patch targets live under the data dir, not the workspace, so
        // the patcher gets its own guard rooted there.
        patcher: HotPatcher::open(
            data_dir,
            data_dir.join("data"),
            data_dir.to_path_buf(),
            Arc::new(SandboxGuard::new(data_dir)),
            filter,
        )?,
        updater: SelfUpdater::new(
            &repo_path,
            data_dir,
            &config.process_name,
            repo_vcs,
            Arc::new(SupervisorCli::new("metamorph")),
        ),
        source,
        sink,
        auto_update: config.auto_update,
    })
}

// ---- Commands ---------------------------------------------------------------

fn show_status(config: &DaemonConfig) -> Result<()> {
    let data_dir = config::resolve_path(&config.data_dir);
    let ledger = VersionLedger::open(&data_dir)?;
    let records = ledger.get_all();
    let implemented = records
        .iter()
        .filter(|r| r.status == metamorph::types::VersionStatus::Implemented)
        .count();

    println!("{}", "=== METAMORPH STATUS ===".bold());
    println!("Name:             {}", config.name);
    println!("Version:          {}", ledger.get_current_version().green());
    println!("Sandbox root:     {}", config.sandbox_root);
    println!("Data dir:         {}", config.data_dir);
    println!("Cycle schedule:   {}", config.cycle_schedule);
    println!("Auto-update:      {}", config.auto_update);
    println!(
        "Versions:         {} total, {} implemented",
        records.len(),
        implemented
    );
    Ok(())
}

fn list_versions(config: &DaemonConfig) -> Result<()> {
    let data_dir = config::resolve_path(&config.data_dir);
    let ledger = VersionLedger::open(&data_dir)?;
    let recent = ledger.get_recent(20);
    if recent.is_empty() {
        println!("No versions recorded yet.");
        return Ok(());
    }
    for record in recent {
        println!("{}", ledger.format_version(&record));
    }
    Ok(())
}

fn list_implementations(config: &DaemonConfig) -> Result<()> {
    let data_dir = config::resolve_path(&config.data_dir);
    let sandbox_root = config::resolve_path(&config.sandbox_root);
    let sandbox = Arc::new(SandboxGuard::new(&sandbox_root));
    let filter = Arc::new(ContentFilter::new());
    let vcs: Arc<dyn VersionControl> = Arc::new(GitCli::new(&sandbox_root));
    let implementer = AutoImplementer::open(&data_dir, sandbox, filter, vcs)?;

    let totals = implementer.totals();
    println!(
        "{} attempts, {} succeeded, {} failed",
        totals.attempts,
        totals.successes.to_string().green(),
        totals.failures.to_string().red()
    );
    for record in implementer.get_recent(20) {
        let marker = if record.success {
            "ok".green()
        } else {
            "failed".red()
        };
        println!(
            "[{}] v{} {} -> {} ({})",
            marker,
            record.version,
            record.id,
            record.target_file,
            record.commit_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn list_patches(config: &DaemonConfig) -> Result<()> {
    let data_dir = config::resolve_path(&config.data_dir);
    let data_dir = Path::new(&data_dir);
    let patcher = HotPatcher::open(
        data_dir,
        data_dir.join("data"),
        data_dir.to_path_buf(),
        Arc::new(SandboxGuard::new(data_dir)),
        Arc::new(ContentFilter::new()),
    )?;

    let totals = patcher.totals();
    println!(
        "{} created, {} applied, {} failed",
        totals.created, totals.applied, totals.failed
    );
    for patch in patcher.pending() {
        println!("[{}] {} -> {}", "pending".yellow(), patch.id, patch.target);
    }
    for patch in patcher.applied() {
        println!("[{}] {} -> {}", "applied".green(), patch.id, patch.target);
    }
    Ok(())
}

async fn rollback(config: &DaemonConfig, id: &str) -> Result<()> {
    let data_dir = config::resolve_path(&config.data_dir);
    let sandbox_root = config::resolve_path(&config.sandbox_root);
    let sandbox = Arc::new(SandboxGuard::new(&sandbox_root));
    let filter = Arc::new(ContentFilter::new());
    let vcs: Arc<dyn VersionControl> = Arc::new(GitCli::new(&sandbox_root));
    let mut implementer = AutoImplementer::open(&data_dir, sandbox, filter, vcs)?;

    let sink: Arc<dyn NotificationSink> = match config.webhook_url {
        Some(ref url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    if implementer.rollback(id) {
        sink.notify_finding("Rollback applied", id).await;
        println!("{} rolled back {}", "ok".green(), id);
    } else {
        eprintln!("{} no restorable backup for {}", "failed".red(), id);
        std::process::exit(1);
    }
    Ok(())
}

// ---- Run --------------------------------------------------------------------

async fn run(config: DaemonConfig) -> Result<()> {
    info!("Metamorph v{} starting", VERSION);

    let pipeline = build_pipeline(&config)?;
    let mut daemon = ImprovementDaemon::new(
        pipeline,
        DaemonOptions {
            cycle_schedule: config.cycle_schedule.clone(),
            ..DaemonOptions::default()
        },
    );
    daemon.start();

    signal::ctrl_c()
        .await
        .context("failed to register Ctrl+C handler")?;
    info!("Received shutdown signal");
    daemon.stop();

    Ok(())
}

async fn run_one_cycle(config: DaemonConfig) -> Result<()> {
    let mut pipeline = build_pipeline(&config)?;
    let report = pipeline.run_cycle().await;
    println!(
        "{} issues, {} implemented, {} failed, {} patches applied",
        report.issues_found,
        report.implemented.to_string().green(),
        report.failed.to_string().red(),
        report.patches_applied,
    );
    Ok(())
}

// ---- Entry Point ------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.init {
        let config = config::default_config();
        match config::save_config(&config) {
            Ok(()) => println!(
                "Wrote default config to {}",
                config::get_config_path().display()
            ),
            Err(e) => {
                eprintln!("Init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let config = load_config_or_die();

    if cli.status {
        if let Err(e) = show_status(&config) {
            eprintln!("Status failed: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    if cli.versions {
        if let Err(e) = list_versions(&config) {
            eprintln!("Listing versions failed: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    if cli.implementations {
        if let Err(e) = list_implementations(&config) {
            eprintln!("Listing implementations failed: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    if cli.patches {
        if let Err(e) = list_patches(&config) {
            eprintln!("Listing patches failed: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    if let Some(ref id) = cli.rollback {
        if let Err(e) = rollback(&config, id).await {
            eprintln!("Rollback failed: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    init_tracing(config.log_level);

    if cli.cycle {
        if let Err(e) = run_one_cycle(config).await {
            eprintln!("Cycle failed: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    if cli.run {
        if let Err(e) = run(config).await {
            eprintln!("Fatal: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    println!("Run \"metamorph --help\" for usage information.");
    println!("Run \"metamorph --run\" to start the daemon.");
}
