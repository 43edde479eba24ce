//! Auto-Implementer
//!
//! Orchestrates validate -> backup -> write -> commit -> record for one
//! proposal at a time. Aborts at the validation or path check leave the
//! filesystem untouched; a failed commit after a successful write is
//! recorded with the "no-commit" sentinel and still counts as a success
//! (a lenient, documented policy choice).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::filter::ContentFilter;
use crate::ledger::target_file_name;
use crate::sandbox::SandboxGuard;
use crate::types::{ChangeAction, ImplementationRecord, IssueArea, Proposal, NO_COMMIT};
use crate::vcs::VersionControl;

/// History document file name within the data directory.
const HISTORY_FILENAME: &str = "implementations.json";

/// Subdirectory implementations land in when the area is unmapped.
const DEFAULT_SUBDIR: &str = "src/autogen/misc";

/// Fixed area-to-subdirectory table, relative to the sandbox root.
fn area_subdir(area: IssueArea) -> &'static str {
    match area {
        IssueArea::DecisionMaking => "src/autogen/decision",
        IssueArea::Learning => "src/autogen/learning",
        IssueArea::Efficiency => "src/autogen/perf",
        IssueArea::Memory => "src/autogen/memory",
        IssueArea::Engagement => "src/autogen/engagement",
        IssueArea::Optimization => "src/autogen/optim",
    }
}

// ---------------------------------------------------------------------------
// History persistence
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningTotals {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// On-disk shape of `implementations.json`. Append-only; additive fields
/// keep it forward-compatible with hand edits.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryDocument {
    implementations: Vec<ImplementationRecord>,
    #[serde(default)]
    totals: RunningTotals,
}

// ---------------------------------------------------------------------------
// Implementer
// ---------------------------------------------------------------------------

/// Constructor-injected implementer; lifetime matches the owning
/// orchestrator.
pub struct AutoImplementer {
    data_dir: PathBuf,
    sandbox: Arc<SandboxGuard>,
    filter: Arc<ContentFilter>,
    vcs: Arc<dyn VersionControl>,
    history: Vec<ImplementationRecord>,
    totals: RunningTotals,
}

impl AutoImplementer {
    /// Open the implementation history under `data_dir` and bind the
    /// guard, filter, and version-control collaborators.
    pub fn open(
        data_dir: impl AsRef<Path>,
        sandbox: Arc<SandboxGuard>,
        filter: Arc<ContentFilter>,
        vcs: Arc<dyn VersionControl>,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let history_path = data_dir.join(HISTORY_FILENAME);
        let doc: HistoryDocument = if history_path.exists() {
            let contents = fs::read_to_string(&history_path)
                .with_context(|| format!("failed to read {}", history_path.display()))?;
            serde_json::from_str(&contents).context("failed to parse implementations.json")?
        } else {
            HistoryDocument::default()
        };

        Ok(Self {
            data_dir,
            sandbox,
            filter,
            vcs,
            history: doc.implementations,
            totals: doc.totals,
        })
    }

    /// Attempt to implement one proposal under the given version string.
    /// Always returns a recorded `ImplementationRecord`; the `success`
    /// flag carries the verdict.
    pub fn implement(&mut self, proposal: &Proposal, version: &str) -> ImplementationRecord {
        let file = target_file_name(&proposal.solution.filename, &proposal.solution.language);
        let subdir = area_subdir(proposal.issue.area);
        let relative = format!("{}/{}", subdir, file);

        // 1. Safety scan before anything touches the filesystem.
        let report = self.filter.is_code_safe(&proposal.solution.code);
        if !report.safe {
            error!(
                "Security rejection for proposal {}: {}",
                proposal.id,
                report.issues.join("; ")
            );
            return self.record_failure(
                proposal,
                version,
                &relative,
                CoreError::SecurityRejection(format!(
                    "unsafe code: {}",
                    report.issues.join("; ")
                )),
            );
        }

        // 2. Redact before write, never after.
        let sanitized = self.filter.sanitize_code(&proposal.solution.code);

        // 3. Path check against the trust boundary.
        let target = match self.sandbox.resolve_path(&relative) {
            Some(p) => p,
            None => {
                return self.record_failure(
                    proposal,
                    version,
                    &relative,
                    CoreError::SecurityRejection(format!(
                        "target path rejected by sandbox: {}",
                        relative
                    )),
                );
            }
        };

        // 4. Backup before mutating an existing target.
        let exists = target.exists();
        let backup_path = if exists {
            match self.backup(&target, &file) {
                Ok(p) => Some(p),
                Err(e) => {
                    return self.record_failure(
                        proposal,
                        version,
                        &relative,
                        CoreError::ValidationFailure(format!("backup failed: {:#}", e)),
                    );
                }
            }
        } else {
            None
        };

        // 5. Write the provenance-wrapped content.
        let content = format!(
            "{}{}",
            provenance_header(proposal, version, &proposal.solution.language),
            sanitized
        );
        if let Err(e) = write_target(&target, &content) {
            return self.record_failure(
                proposal,
                version,
                &relative,
                CoreError::TransientIo(format!("write failed: {:#}", e)),
            );
        }

        // 6. Stage and commit the single file. A commit failure keeps
        // the write and records the sentinel instead.
        let commit_id = match self.commit_target(&target, proposal, version) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(
                    "{}",
                    CoreError::ToolFailure(format!("commit failed for {}: {:#}", relative, e))
                );
                NO_COMMIT.to_string()
            }
        };

        // 7. Record the attempt and update totals.
        let record = ImplementationRecord {
            id: format!("impl_{}", Uuid::new_v4()),
            timestamp: Utc::now().to_rfc3339(),
            proposal_id: proposal.id.clone(),
            version: version.to_string(),
            target_file: target.to_string_lossy().to_string(),
            action: if exists {
                ChangeAction::Modified
            } else {
                ChangeAction::Created
            },
            backup_path,
            commit_id: Some(commit_id),
            success: true,
            error: None,
        };
        info!(
            "Implemented {} -> {} (v{})",
            proposal.id, record.target_file, version
        );
        self.append(record.clone());
        record
    }

    /// Restore the backup behind an implementation byte-for-byte and
    /// commit a rollback record. Returns `false` without further
    /// mutation when no backup exists or the restore fails. The original
    /// record is kept; rollback appends, never deletes.
    pub fn rollback(&mut self, implementation_id: &str) -> bool {
        let Some(original) = self
            .history
            .iter()
            .find(|r| r.id == implementation_id)
            .cloned()
        else {
            warn!("Rollback requested for unknown id {}", implementation_id);
            return false;
        };

        let Some(ref backup_path) = original.backup_path else {
            warn!(
                "Rollback refused for {}: no backup recorded",
                implementation_id
            );
            return false;
        };

        let bytes = match fs::read(backup_path) {
            Ok(b) => b,
            Err(e) => {
                error!("Rollback failed reading backup {}: {}", backup_path, e);
                return false;
            }
        };

        if let Err(e) = fs::write(&original.target_file, &bytes) {
            error!(
                "Rollback failed restoring {}: {}",
                original.target_file, e
            );
            return false;
        }

        let commit_id = match self.commit_rollback(&original) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Rollback commit failed: {:#}", e);
                NO_COMMIT.to_string()
            }
        };

        let record = ImplementationRecord {
            id: format!("impl_{}", Uuid::new_v4()),
            timestamp: Utc::now().to_rfc3339(),
            proposal_id: original.proposal_id.clone(),
            version: original.version.clone(),
            target_file: original.target_file.clone(),
            action: ChangeAction::Modified,
            backup_path: None,
            commit_id: Some(commit_id),
            success: true,
            error: Some(format!("rollback of {}", implementation_id)),
        };
        info!("Rolled back {} on {}", implementation_id, original.target_file);
        self.append(record);
        true
    }

    // ─── Queries ─────────────────────────────────────────────────

    /// The most recent `n` records, newest first.
    pub fn get_recent(&self, n: usize) -> Vec<ImplementationRecord> {
        self.history.iter().rev().take(n).cloned().collect()
    }

    pub fn get_by_id(&self, id: &str) -> Option<&ImplementationRecord> {
        self.history.iter().find(|r| r.id == id)
    }

    pub fn totals(&self) -> RunningTotals {
        self.totals
    }

    // ─── Internals ───────────────────────────────────────────────

    fn backup(&self, target: &Path, file: &str) -> Result<String> {
        let backups = self.data_dir.join("backups");
        fs::create_dir_all(&backups)
            .with_context(|| format!("failed to create {}", backups.display()))?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let backup = backups.join(format!("{}.{}.bak", file, stamp));
        fs::copy(target, &backup)
            .with_context(|| format!("failed to back up {}", target.display()))?;
        Ok(backup.to_string_lossy().to_string())
    }

    fn commit_target(&self, target: &Path, proposal: &Proposal, version: &str) -> Result<String> {
        let path = target.to_string_lossy();
        self.vcs.stage(&path)?;
        self.vcs.commit(&format!(
            "auto-improve(v{}): {} [{}]",
            version, proposal.solution.description, proposal.id
        ))?;
        self.vcs.short_head()
    }

    fn commit_rollback(&self, original: &ImplementationRecord) -> Result<String> {
        self.vcs.stage(&original.target_file)?;
        self.vcs.commit(&format!(
            "rollback(v{}): restore {} ({})",
            original.version, original.target_file, original.id
        ))?;
        self.vcs.short_head()
    }

    fn record_failure(
        &mut self,
        proposal: &Proposal,
        version: &str,
        relative: &str,
        error: CoreError,
    ) -> ImplementationRecord {
        let record = ImplementationRecord {
            id: format!("impl_{}", Uuid::new_v4()),
            timestamp: Utc::now().to_rfc3339(),
            proposal_id: proposal.id.clone(),
            version: version.to_string(),
            target_file: relative.to_string(),
            action: ChangeAction::Created,
            backup_path: None,
            commit_id: None,
            success: false,
            error: Some(error.to_string()),
        };
        self.append(record.clone());
        record
    }

    fn append(&mut self, record: ImplementationRecord) {
        self.totals.attempts += 1;
        if record.success {
            self.totals.successes += 1;
        } else {
            self.totals.failures += 1;
        }
        self.history.push(record);
        if let Err(e) = self.save() {
            error!("Failed to persist implementation history: {:#}", e);
        }
    }

    fn save(&self) -> Result<()> {
        let doc = HistoryDocument {
            implementations: self.history.clone(),
            totals: self.totals,
        };
        let path = self.data_dir.join(HISTORY_FILENAME);
        fs::write(&path, serde_json::to_string_pretty(&doc)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write_target(target: &Path, content: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(target, content).with_context(|| format!("failed to write {}", target.display()))
}

/// Comment block recording which version/issue/solution produced a file.
fn provenance_header(proposal: &Proposal, version: &str, language: &str) -> String {
    let prefix = match language.to_lowercase().as_str() {
        "python" | "py" | "shell" | "sh" | "ruby" => "#",
        _ => "//",
    };
    format!(
        "{p} metamorph provenance\n{p} version: {}\n{p} issue: {}\n{p} solution: {}\n{p} generated: {}\n\n",
        version,
        proposal.issue.description,
        proposal.solution.description,
        Utc::now().to_rfc3339(),
        p = prefix
    )
}
