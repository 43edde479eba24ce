//! Self-Updater
//!
//! Pulls upstream changes into the working tree, reinstalls dependencies
//! and rebuilds when the pulled files call for it, and restarts the
//! daemon through the external process supervisor. A lock file makes
//! overlapping invocations mutually exclusive: the loser exits cleanly
//! with zero side effects. A lock orphaned by a crash must be cleared
//! externally; it is not auto-healed.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::types::{ProcessSupervisor, UpdateCheck, UpdateOutcome, UpdateReport};
use crate::vcs::VersionControl;

/// Lock file name within the data directory.
const LOCK_FILENAME: &str = "update.lock";

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// Held for the duration of one pull/rebuild. Created with `create_new`
/// so acquisition is atomic across invocations; removed on drop so every
/// exit path releases it.
pub struct UpdateLock {
    path: PathBuf,
}

impl UpdateLock {
    /// Try to take the lock. Returns `None` when another invocation
    /// already holds it.
    pub fn acquire(data_dir: &Path) -> Result<Option<Self>> {
        let path = data_dir.join(LOCK_FILENAME);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => {
                let info = format!("pid={} at={}\n", std::process::id(), Utc::now().to_rfc3339());
                let _ = fs::write(&path, info);
                Ok(Some(Self { path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to create {}", path.display())),
        }
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove update lock {}: {}", self.path.display(), e);
        }
    }
}

// ---------------------------------------------------------------------------
// Updater
// ---------------------------------------------------------------------------

pub struct SelfUpdater {
    repo_path: PathBuf,
    data_dir: PathBuf,
    process_name: String,
    vcs: Arc<dyn VersionControl>,
    supervisor: Arc<dyn ProcessSupervisor>,
}

impl SelfUpdater {
    pub fn new(
        repo_path: impl AsRef<Path>,
        data_dir: impl AsRef<Path>,
        process_name: impl Into<String>,
        vcs: Arc<dyn VersionControl>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
            data_dir: data_dir.as_ref().to_path_buf(),
            process_name: process_name.into(),
            vcs,
            supervisor,
        }
    }

    /// Take the cross-invocation lock on behalf of a caller that needs
    /// the working tree to itself. The improvement cycle holds this for
    /// its whole mutation phase so it can never interleave with a
    /// pull/rebuild from another invocation.
    pub fn try_lock(&self) -> Result<Option<UpdateLock>> {
        UpdateLock::acquire(&self.data_dir)
    }

    /// Read-only: fetch remote state and report how many commits local
    /// HEAD is behind, with their one-line summaries.
    pub fn check_for_updates(&self) -> Result<UpdateCheck> {
        self.vcs.fetch().context("fetch failed")?;
        let behind = self.vcs.behind_count()?;
        let commits = if behind > 0 {
            self.vcs.behind_summaries()?
        } else {
            Vec::new()
        };
        info!("Update check: {} commit(s) behind", behind);
        Ok(UpdateCheck { behind, commits })
    }

    /// Pull upstream changes, then reinstall dependencies and rebuild
    /// if the pulled commit touched the manifest or source. Guarded by
    /// the update lock; the lock is released on every exit path.
    pub fn pull_and_rebuild(&self) -> UpdateOutcome {
        let _lock = match UpdateLock::acquire(&self.data_dir) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!("{}; skipping this invocation", CoreError::ConcurrencyGuard);
                return UpdateOutcome::LockHeld;
            }
            Err(e) => {
                return UpdateOutcome::Failed {
                    error: format!("{:#}", e),
                }
            }
        };

        // Best-effort: a dirty tree must not block the pull.
        if let Err(e) = self.vcs.stash() {
            warn!("Stash failed (continuing): {:#}", e);
        }

        if let Err(e) = self.vcs.pull() {
            return UpdateOutcome::Failed {
                error: CoreError::TransientIo(format!("pull failed: {:#}", e)).to_string(),
            };
        }

        let changed_files = self.vcs.last_commit_files().unwrap_or_default();
        info!("Pulled {} changed file(s)", changed_files.len());

        if changed_files.iter().any(|f| is_manifest_path(f)) {
            self.run_tool("cargo", &["fetch"]);
        }

        let mut rebuilt = false;
        if changed_files.iter().any(|f| is_source_path(f)) {
            rebuilt = self.run_tool("cargo", &["build", "--release"]);
        }

        UpdateOutcome::Pulled {
            changed_files,
            rebuilt,
        }
    }

    /// Ask the supervisor for a detached restart so this process is not
    /// terminated mid-update.
    pub fn restart(&self) -> Result<()> {
        info!("Requesting detached restart of {}", self.process_name);
        self.supervisor.restart_detached(&self.process_name)
    }

    /// check -> pull/rebuild -> restart only when source files changed.
    pub fn run_full_update(&self) -> UpdateReport {
        let check = match self.check_for_updates() {
            Ok(c) => c,
            Err(e) => {
                return UpdateReport {
                    updated: false,
                    behind: 0,
                    restarted: false,
                    error: Some(CoreError::TransientIo(format!("{:#}", e)).to_string()),
                }
            }
        };

        if check.behind == 0 {
            return UpdateReport {
                updated: false,
                behind: 0,
                restarted: false,
                error: None,
            };
        }

        match self.pull_and_rebuild() {
            UpdateOutcome::LockHeld => UpdateReport {
                updated: false,
                behind: check.behind,
                restarted: false,
                error: None,
            },
            UpdateOutcome::Failed { error } => UpdateReport {
                updated: false,
                behind: check.behind,
                restarted: false,
                error: Some(error),
            },
            UpdateOutcome::Pulled { changed_files, .. } => {
                let mut restarted = false;
                if changed_files.iter().any(|f| is_source_path(f)) {
                    match self.restart() {
                        Ok(()) => restarted = true,
                        Err(e) => warn!("Restart request failed: {:#}", e),
                    }
                }
                UpdateReport {
                    updated: true,
                    behind: check.behind,
                    restarted,
                    error: None,
                }
            }
        }
    }

    fn run_tool(&self, program: &str, args: &[&str]) -> bool {
        info!("Running {} {}", program, args.join(" "));
        match Command::new(program)
            .args(args)
            .current_dir(&self.repo_path)
            .status()
        {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!("{} exited with {}", program, status);
                false
            }
            Err(e) => {
                warn!("Failed to run {}: {}", program, e);
                false
            }
        }
    }
}

/// Paths whose change triggers a dependency reinstall.
fn is_manifest_path(path: &str) -> bool {
    path.ends_with("Cargo.toml") || path.ends_with("Cargo.lock")
}

/// Paths whose change triggers a rebuild and a restart.
fn is_source_path(path: &str) -> bool {
    path.ends_with(".rs") || path.ends_with("Cargo.toml") || path.ends_with("build.rs")
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Spawns `<program> restart <name>` without waiting on it, stdio
/// detached, so the restart outlives this process.
pub struct SupervisorCli {
    program: String,
}

impl SupervisorCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ProcessSupervisor for SupervisorCli {
    fn restart_detached(&self, process_name: &str) -> Result<()> {
        Command::new(&self.program)
            .args(["restart", process_name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {} restart", self.program))?;
        Ok(())
    }
}
