//! Metamorph - Type Definitions
//!
//! All shared types for the autonomous mutation pipeline: issues,
//! solutions, proposals, versions, implementations, patches, and the
//! collaborator traits the core consumes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─── Issues & Solutions ──────────────────────────────────────────

/// Functional area an issue was detected in. Drives the target
/// subdirectory an implementation is written to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueArea {
    DecisionMaking,
    Learning,
    Efficiency,
    Memory,
    Engagement,
    Optimization,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A detected concern, produced by the external improvement source.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub area: IssueArea,
    pub description: String,
    pub severity: Severity,
    /// Free-form metrics snapshot captured at detection time.
    #[serde(default)]
    pub metrics: serde_json::Value,
}

/// Candidate code addressing one issue.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    pub description: String,
    pub approach: String,
    pub code: String,
    /// Language tag, e.g. "rust", "javascript", "python".
    pub language: String,
    /// Target file name without directory (extension optional).
    pub filename: String,
    pub estimated_impact: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Proposed,
    Approved,
    Implemented,
    Rejected,
}

/// An issue/solution pair awaiting a version. Ephemeral per cycle; only
/// the ledger and implementation records persist its outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub created_at: String,
    pub issue: Issue,
    pub solution: Solution,
    pub status: ProposalStatus,
}

// ─── Version Ledger ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VersionType {
    Feature,
    Improvement,
    Optimization,
    Bugfix,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Proposed,
    Approved,
    Implemented,
    Reverted,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Modified,
}

/// One file-level change attributed to a version.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub file: String,
    pub action: ChangeAction,
    pub description: String,
    pub lines: u32,
}

/// A ledger entry assigning a semantic version to a proposal.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub id: String,
    pub version: String,
    pub created_at: String,
    pub proposal_id: String,
    #[serde(rename = "type")]
    pub version_type: VersionType,
    pub summary: String,
    pub changes: Vec<ChangeEntry>,
    pub status: VersionStatus,
    pub snapshot_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_before: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_after: Option<serde_json::Value>,
}

// ─── Implementations ─────────────────────────────────────────────

/// Commit-id sentinel recorded when the content write succeeded but the
/// commit step failed. A lenient policy choice: the mutation is kept and
/// counted as a success even without a commit audit trail.
pub const NO_COMMIT: &str = "no-commit";

/// One concrete attempt to write and commit a solution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationRecord {
    pub id: String,
    pub timestamp: String,
    pub proposal_id: String,
    pub version: String,
    pub target_file: String,
    pub action: ChangeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Hot Patches ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    Config,
    Data,
    Behavior,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatchAction {
    Replace,
    Append,
    ModifyJson,
}

/// A non-rebuild runtime change to a data/config artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub patch_type: PatchType,
    pub description: String,
    /// Namespaced target, e.g. "data/responses.json" or "config/limits.json".
    pub target: String,
    pub action: PatchAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    pub new_value: serde_json::Value,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Parameters for creating a new hot patch.
#[derive(Clone, Debug)]
pub struct PatchSpec {
    pub patch_type: PatchType,
    pub description: String,
    pub target: String,
    pub action: PatchAction,
    pub old_value: Option<String>,
    pub new_value: serde_json::Value,
}

// ─── Sandbox ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    EscapesRoot,
    BlockedName,
    BlockedExtension,
    Unresolvable,
}

/// One rejected mutation target, recorded before any write happens.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxViolation {
    pub path: String,
    pub timestamp: String,
    pub reason: ViolationReason,
}

// ─── Code Safety ─────────────────────────────────────────────────

/// Heuristic static-scan verdict for generated code. Best-effort pattern
/// checks, not a verified sandbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSafetyReport {
    pub safe: bool,
    pub issues: Vec<String>,
}

// ─── Self-Update ─────────────────────────────────────────────────

/// Read-only report of how far local HEAD is behind the remote.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub behind: u32,
    pub commits: Vec<String>,
}

/// Outcome of one pull-and-rebuild attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Pull completed; lists the files the last commit changed.
    Pulled {
        changed_files: Vec<String>,
        rebuilt: bool,
    },
    /// Another invocation holds the update lock. Clean skip, no mutation.
    LockHeld,
    /// The pull itself failed (remote unreachable, merge conflict).
    Failed { error: String },
}

/// Summary of a full check-pull-restart sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub updated: bool,
    pub behind: u32,
    pub restarted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Collaborator Traits ─────────────────────────────────────────

/// External source of issues and candidate solutions. The core imposes
/// no constraint on how these are produced beyond the `Solution` shape.
#[async_trait]
pub trait ImprovementSource: Send + Sync {
    async fn analyze_performance(&self) -> anyhow::Result<Vec<Issue>>;
    async fn generate_improvement(&self, issue: &Issue) -> anyhow::Result<Option<Solution>>;
}

/// Opaque delivery channel for structured finding/alert events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_finding(&self, title: &str, description: &str);
    async fn notify_alert(&self, message: &str, error: &str);
}

/// A "detached restart of named process" capability, so the update code
/// is not itself terminated mid-flight.
pub trait ProcessSupervisor: Send + Sync {
    fn restart_detached(&self, process_name: &str) -> anyhow::Result<()>;
}
