//! Version Ledger
//!
//! Semantic version assignment, changelog generation, and immutable code
//! snapshots. The ledger document (`ledger.json`) is the source of
//! truth; `CHANGELOG.md` is regenerated wholesale from the structured
//! entry list on every save and is never parsed back.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use tracing::info;
use uuid::Uuid;

use crate::types::{
    ChangeAction, ChangeEntry, Proposal, Severity, VersionRecord, VersionStatus, VersionType,
};

/// Ledger document file name within the data directory.
const LEDGER_FILENAME: &str = "ledger.json";

/// Generated changelog file name within the data directory.
const CHANGELOG_FILENAME: &str = "CHANGELOG.md";

/// Constant changelog header; entries are rendered below it newest-first.
const CHANGELOG_HEADER: &str = "# Changelog\n\nAll notable self-applied changes to this service are recorded here.\nThis file is generated from the version ledger; edit ledger.json instead.\n";

// ---------------------------------------------------------------------------
// Semantic versions
// ---------------------------------------------------------------------------

/// An ordered `major.minor.patch` triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    pub const BASE: SemVer = SemVer {
        major: 1,
        minor: 0,
        patch: 0,
    };

    /// Parse a `x.y.z` string. Returns `None` on any malformed input.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().splitn(3, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// Apply the bump rule: a feature increments minor and resets patch;
    /// everything else increments patch only.
    pub fn bump(self, version_type: VersionType) -> Self {
        match version_type {
            VersionType::Feature => Self {
                major: self.major,
                minor: self.minor + 1,
                patch: 0,
            },
            VersionType::Improvement | VersionType::Optimization | VersionType::Bugfix => Self {
                major: self.major,
                minor: self.minor,
                patch: self.patch + 1,
            },
        }
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// On-disk shape of `ledger.json`. Additive fields keep the document
/// forward-compatible with hand edits between runs.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerDocument {
    records: Vec<VersionRecord>,
}

/// Snapshot metadata sidecar written next to each snapshot.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotMeta {
    version: String,
    proposal_id: String,
    issue: String,
    solution: String,
    digest: String,
    created_at: String,
}

/// The version ledger. Owns `ledger.json`, the generated changelog, and
/// the snapshot tree under its data directory.
pub struct VersionLedger {
    data_dir: PathBuf,
    records: Vec<VersionRecord>,
}

impl VersionLedger {
    /// Open (or create) the ledger under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let ledger_path = data_dir.join(LEDGER_FILENAME);
        let records = if ledger_path.exists() {
            let contents = fs::read_to_string(&ledger_path)
                .with_context(|| format!("failed to read {}", ledger_path.display()))?;
            let doc: LedgerDocument =
                serde_json::from_str(&contents).context("failed to parse ledger.json")?;
            doc.records
        } else {
            Vec::new()
        };

        Ok(Self { data_dir, records })
    }

    /// Assign the next semantic version to `proposal`, persist a code
    /// snapshot + metadata sidecar, and append a changelog entry.
    pub fn create_version(&mut self, proposal: &Proposal) -> Result<VersionRecord> {
        let version_type = derive_version_type(proposal);
        let current = self.current_semver();
        let next = current.bump(version_type);

        // Monotonicity guard. The bump rule always advances, so a
        // regression here means the ledger document was corrupted.
        if next <= current && !self.records.is_empty() {
            bail!(
                "version {} does not advance past current {}",
                next,
                current
            );
        }

        let now = Utc::now().to_rfc3339();
        let snapshot_path = self.write_snapshot(&next.to_string(), proposal, &now)?;

        let file = target_file_name(&proposal.solution.filename, &proposal.solution.language);
        let record = VersionRecord {
            id: format!("ver_{}", Uuid::new_v4()),
            version: next.to_string(),
            created_at: now,
            proposal_id: proposal.id.clone(),
            version_type,
            summary: proposal.solution.description.clone(),
            changes: vec![ChangeEntry {
                file,
                action: ChangeAction::Created,
                description: proposal.solution.approach.clone(),
                lines: proposal.solution.code.lines().count() as u32,
            }],
            status: VersionStatus::Proposed,
            snapshot_path,
            metrics_before: Some(proposal.issue.metrics.clone()),
            metrics_after: None,
        };

        info!(
            "Created version {} ({:?}) for proposal {}",
            record.version, record.version_type, record.proposal_id
        );

        self.records.push(record.clone());
        self.save()?;
        Ok(record)
    }

    /// Rewrite a record's status (and optional after-metrics), then
    /// regenerate the changelog so its block matches.
    pub fn update_status(
        &mut self,
        version_id: &str,
        status: VersionStatus,
        metrics_after: Option<serde_json::Value>,
    ) -> Result<bool> {
        let Some(record) = self.records.iter_mut().find(|r| r.id == version_id) else {
            return Ok(false);
        };
        record.status = status;
        if metrics_after.is_some() {
            record.metrics_after = metrics_after;
        }
        self.save()?;
        Ok(true)
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub fn get_all(&self) -> &[VersionRecord] {
        &self.records
    }

    /// The most recent `n` records, newest first.
    pub fn get_recent(&self, n: usize) -> Vec<VersionRecord> {
        self.records.iter().rev().take(n).cloned().collect()
    }

    pub fn get_by_status(&self, status: VersionStatus) -> Vec<VersionRecord> {
        self.records
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// The highest assigned version, or the 1.0.0 base before any
    /// version exists.
    pub fn get_current_version(&self) -> String {
        self.current_semver().to_string()
    }

    /// Human-readable one-record summary.
    pub fn format_version(&self, record: &VersionRecord) -> String {
        let mut out = format!(
            "v{} [{:?}/{:?}] {}\n  created: {}\n",
            record.version, record.version_type, record.status, record.summary, record.created_at
        );
        for change in &record.changes {
            out.push_str(&format!(
                "  {:?} {} ({} lines): {}\n",
                change.action, change.file, change.lines, change.description
            ));
        }
        out
    }

    /// Files introduced in version `b` that `a` does not carry, plus
    /// `b`'s summary.
    pub fn get_diff(&self, a: &str, b: &str) -> Option<(Vec<String>, String)> {
        let rec_a = self.records.iter().find(|r| r.version == a)?;
        let rec_b = self.records.iter().find(|r| r.version == b)?;

        let files_a: Vec<&str> = rec_a.changes.iter().map(|c| c.file.as_str()).collect();
        let introduced = rec_b
            .changes
            .iter()
            .filter(|c| !files_a.contains(&c.file.as_str()))
            .map(|c| c.file.clone())
            .collect();

        Some((introduced, rec_b.summary.clone()))
    }

    // ─── Internals ───────────────────────────────────────────────

    fn current_semver(&self) -> SemVer {
        self.records
            .iter()
            .filter_map(|r| SemVer::parse(&r.version))
            .max()
            .unwrap_or(SemVer::BASE)
    }

    /// Persist an immutable snapshot of the proposal's code plus a
    /// metadata sidecar under `snapshots/<version>/`.
    fn write_snapshot(&self, version: &str, proposal: &Proposal, now: &str) -> Result<String> {
        let dir = self.data_dir.join("snapshots").join(version);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;

        let file = target_file_name(&proposal.solution.filename, &proposal.solution.language);
        let code_path = dir.join(&file);
        fs::write(&code_path, &proposal.solution.code)
            .with_context(|| format!("failed to write snapshot {}", code_path.display()))?;

        let digest = hex::encode(Sha3_256::digest(proposal.solution.code.as_bytes()));
        let meta = SnapshotMeta {
            version: version.to_string(),
            proposal_id: proposal.id.clone(),
            issue: proposal.issue.description.clone(),
            solution: proposal.solution.description.clone(),
            digest,
            created_at: now.to_string(),
        };
        let meta_path = dir.join("metadata.json");
        fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("failed to write {}", meta_path.display()))?;

        Ok(dir.to_string_lossy().to_string())
    }

    fn save(&self) -> Result<()> {
        let doc = LedgerDocument {
            records: self.records.clone(),
        };
        let ledger_path = self.data_dir.join(LEDGER_FILENAME);
        fs::write(&ledger_path, serde_json::to_string_pretty(&doc)?)
            .with_context(|| format!("failed to write {}", ledger_path.display()))?;

        let changelog_path = self.data_dir.join(CHANGELOG_FILENAME);
        fs::write(&changelog_path, self.render_changelog())
            .with_context(|| format!("failed to write {}", changelog_path.display()))?;
        Ok(())
    }

    /// Render the full changelog from the structured records, newest
    /// entries first, under the constant document header.
    fn render_changelog(&self) -> String {
        let mut out = String::from(CHANGELOG_HEADER);
        for record in self.records.iter().rev() {
            out.push_str(&format!(
                "\n## [{}] - {} - {} ({})\n\n{}\n",
                record.version,
                // Date prefix of an RFC 3339 timestamp; hand-edited
                // documents may hold arbitrary text, so fall back to the
                // whole string rather than slicing mid-character.
                record.created_at.get(..10).unwrap_or(&record.created_at),
                type_label(record.version_type),
                status_label(record.status),
                record.summary
            ));
            for change in &record.changes {
                out.push_str(&format!(
                    "- {} `{}` ({} lines): {}\n",
                    action_label(change.action),
                    change.file,
                    change.lines,
                    change.description
                ));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Derivation helpers
// ---------------------------------------------------------------------------

/// Derive the version type from issue keywords and severity. Only the
/// issue text is consulted; the solution's own wording does not change
/// the classification.
fn derive_version_type(proposal: &Proposal) -> VersionType {
    let text = proposal.issue.description.to_lowercase();

    if text.contains("efficiency") || text.contains("faster") {
        VersionType::Optimization
    } else if text.contains("bug") || text.contains("fix") || text.contains("error") {
        VersionType::Bugfix
    } else if proposal.issue.severity == Severity::High {
        VersionType::Feature
    } else {
        VersionType::Improvement
    }
}

/// Attach the language-appropriate extension if the filename has none.
pub fn target_file_name(filename: &str, language: &str) -> String {
    if Path::new(filename).extension().is_some() {
        return filename.to_string();
    }
    let ext = match language.to_lowercase().as_str() {
        "rust" => "rs",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "python" | "py" => "py",
        _ => "txt",
    };
    format!("{}.{}", filename, ext)
}

fn type_label(t: VersionType) -> &'static str {
    match t {
        VersionType::Feature => "feature",
        VersionType::Improvement => "improvement",
        VersionType::Optimization => "optimization",
        VersionType::Bugfix => "bugfix",
    }
}

fn status_label(s: VersionStatus) -> &'static str {
    match s {
        VersionStatus::Proposed => "proposed",
        VersionStatus::Approved => "approved",
        VersionStatus::Implemented => "implemented",
        VersionStatus::Reverted => "reverted",
    }
}

fn action_label(a: ChangeAction) -> &'static str {
    match a {
        ChangeAction::Created => "created",
        ChangeAction::Modified => "modified",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Issue, IssueArea, ProposalStatus, Solution};

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("metamorph-ledger-{}-{}", tag, Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn proposal(area: IssueArea, severity: Severity, description: &str) -> Proposal {
        Proposal {
            id: format!("prop_{}", Uuid::new_v4()),
            created_at: Utc::now().to_rfc3339(),
            issue: Issue {
                area,
                description: description.to_string(),
                severity,
                metrics: serde_json::json!({"latencyMs": 120}),
            },
            solution: Solution {
                description: "Cache lookups".to_string(),
                approach: "Add an LRU cache in front of the store".to_string(),
                code: "pub fn cached() {}\n".to_string(),
                language: "rust".to_string(),
                filename: "cache-utility".to_string(),
                estimated_impact: "30% fewer lookups".to_string(),
            },
            status: ProposalStatus::Proposed,
        }
    }

    #[test]
    fn test_semver_parse_and_ordering() {
        let a = SemVer::parse("1.2.3").unwrap();
        let b = SemVer::parse("1.10.0").unwrap();
        assert!(b > a);
        assert!(SemVer::parse("1.2").is_none());
        assert!(SemVer::parse("x.y.z").is_none());
    }

    #[test]
    fn test_bump_rule() {
        let v = SemVer::parse("1.3.7").unwrap();
        let feature = v.bump(VersionType::Feature);
        assert_eq!(feature.to_string(), "1.4.0");
        assert_eq!(v.bump(VersionType::Bugfix).to_string(), "1.3.8");
        assert_eq!(v.bump(VersionType::Optimization).to_string(), "1.3.8");
    }

    #[test]
    fn test_type_derivation_from_keywords() {
        let dir = scratch_dir("derive");
        let mut ledger = VersionLedger::open(&dir).unwrap();

        let opt = ledger
            .create_version(&proposal(
                IssueArea::Efficiency,
                Severity::Medium,
                "efficiency of lookups is poor",
            ))
            .unwrap();
        assert_eq!(opt.version_type, VersionType::Optimization);

        let bugfix = ledger
            .create_version(&proposal(
                IssueArea::Memory,
                Severity::Low,
                "error in retention pruning",
            ))
            .unwrap();
        assert_eq!(bugfix.version_type, VersionType::Bugfix);

        let feature = ledger
            .create_version(&proposal(
                IssueArea::Engagement,
                Severity::High,
                "engagement dropping sharply",
            ))
            .unwrap();
        assert_eq!(feature.version_type, VersionType::Feature);
    }

    #[test]
    fn test_versions_strictly_increase_and_feature_resets_patch() {
        let dir = scratch_dir("increase");
        let mut ledger = VersionLedger::open(&dir).unwrap();

        let v1 = ledger
            .create_version(&proposal(IssueArea::Efficiency, Severity::Medium, "faster path"))
            .unwrap();
        let v2 = ledger
            .create_version(&proposal(IssueArea::Learning, Severity::Medium, "tune model"))
            .unwrap();
        let v3 = ledger
            .create_version(&proposal(IssueArea::Engagement, Severity::High, "new channel"))
            .unwrap();
        let v4 = ledger
            .create_version(&proposal(IssueArea::Memory, Severity::Low, "bug in pruning"))
            .unwrap();

        let parsed: Vec<SemVer> = [&v1, &v2, &v3, &v4]
            .iter()
            .map(|r| SemVer::parse(&r.version).unwrap())
            .collect();
        assert!(parsed.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(SemVer::parse(&v3.version).unwrap().patch, 0);
    }

    #[test]
    fn test_first_version_bumps_from_base() {
        let dir = scratch_dir("base");
        let mut ledger = VersionLedger::open(&dir).unwrap();
        assert_eq!(ledger.get_current_version(), "1.0.0");

        let v = ledger
            .create_version(&proposal(IssueArea::Efficiency, Severity::Medium, "faster path"))
            .unwrap();
        assert_eq!(v.version, "1.0.1");
        assert_eq!(ledger.get_current_version(), "1.0.1");
    }

    #[test]
    fn test_snapshot_written_with_sidecar() {
        let dir = scratch_dir("snapshot");
        let mut ledger = VersionLedger::open(&dir).unwrap();
        let record = ledger
            .create_version(&proposal(IssueArea::Efficiency, Severity::Medium, "faster path"))
            .unwrap();

        let snapshot_dir = PathBuf::from(&record.snapshot_path);
        assert!(snapshot_dir.join("cache-utility.rs").exists());
        let meta: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(snapshot_dir.join("metadata.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["version"], record.version);
        assert_eq!(meta["digest"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_changelog_regenerated_newest_first_with_header() {
        let dir = scratch_dir("changelog");
        let mut ledger = VersionLedger::open(&dir).unwrap();
        ledger
            .create_version(&proposal(IssueArea::Efficiency, Severity::Medium, "faster path"))
            .unwrap();
        ledger
            .create_version(&proposal(IssueArea::Learning, Severity::Medium, "tune model"))
            .unwrap();

        let changelog = fs::read_to_string(dir.join(CHANGELOG_FILENAME)).unwrap();
        assert!(changelog.starts_with("# Changelog"));
        let pos_102 = changelog.find("## [1.0.2]").unwrap();
        let pos_101 = changelog.find("## [1.0.1]").unwrap();
        assert!(pos_102 < pos_101);
    }

    #[test]
    fn test_update_status_rewrites_record_and_changelog() {
        let dir = scratch_dir("status");
        let mut ledger = VersionLedger::open(&dir).unwrap();
        let record = ledger
            .create_version(&proposal(IssueArea::Efficiency, Severity::Medium, "faster path"))
            .unwrap();

        let found = ledger
            .update_status(
                &record.id,
                VersionStatus::Implemented,
                Some(serde_json::json!({"latencyMs": 80})),
            )
            .unwrap();
        assert!(found);

        let updated = &ledger.get_all()[0];
        assert_eq!(updated.status, VersionStatus::Implemented);
        assert!(updated.metrics_after.is_some());

        let changelog = fs::read_to_string(dir.join(CHANGELOG_FILENAME)).unwrap();
        assert!(changelog.contains("(implemented)"));

        assert!(!ledger
            .update_status("ver_missing", VersionStatus::Reverted, None)
            .unwrap());
    }

    #[test]
    fn test_type_derivation_ignores_solution_wording() {
        let dir = scratch_dir("solution-text");
        let mut ledger = VersionLedger::open(&dir).unwrap();

        let mut prop = proposal(
            IssueArea::Learning,
            Severity::Medium,
            "tune retention window",
        );
        prop.solution.description = "Fix by caching recent windows".to_string();
        let record = ledger.create_version(&prop).unwrap();
        assert_eq!(record.version_type, VersionType::Improvement);
    }

    #[test]
    fn test_changelog_survives_hand_edited_multibyte_timestamp() {
        let dir = scratch_dir("multibyte");
        let record_id;
        {
            let mut ledger = VersionLedger::open(&dir).unwrap();
            record_id = ledger
                .create_version(&proposal(IssueArea::Efficiency, Severity::Medium, "faster"))
                .unwrap()
                .id;
        }

        // Hand-edit the document: a createdAt whose tenth byte falls
        // inside a multibyte character.
        let path = dir.join(LEDGER_FILENAME);
        let mut doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc["records"][0]["createdAt"] = serde_json::json!("aééééééééé");
        fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

        let mut ledger = VersionLedger::open(&dir).unwrap();
        assert!(ledger
            .update_status(&record_id, VersionStatus::Implemented, None)
            .unwrap());
        let changelog = fs::read_to_string(dir.join(CHANGELOG_FILENAME)).unwrap();
        assert!(changelog.contains("aééééééééé"));
    }

    #[test]
    fn test_ledger_reopens_from_disk() {
        let dir = scratch_dir("reopen");
        {
            let mut ledger = VersionLedger::open(&dir).unwrap();
            ledger
                .create_version(&proposal(IssueArea::Efficiency, Severity::Medium, "faster"))
                .unwrap();
        }
        let ledger = VersionLedger::open(&dir).unwrap();
        assert_eq!(ledger.get_all().len(), 1);
        assert_eq!(ledger.get_current_version(), "1.0.1");
    }

    #[test]
    fn test_get_diff_reports_introduced_files_and_summary() {
        let dir = scratch_dir("diff");
        let mut ledger = VersionLedger::open(&dir).unwrap();
        let v1 = ledger
            .create_version(&proposal(IssueArea::Efficiency, Severity::Medium, "faster"))
            .unwrap();

        let mut second = proposal(IssueArea::Learning, Severity::Medium, "tune model");
        second.solution.filename = "tuner".to_string();
        let v2 = ledger.create_version(&second).unwrap();

        let (files, summary) = ledger.get_diff(&v1.version, &v2.version).unwrap();
        assert_eq!(files, vec!["tuner.rs".to_string()]);
        assert_eq!(summary, v2.summary);
        assert!(ledger.get_diff("9.9.9", &v2.version).is_none());
    }

    #[test]
    fn test_get_recent_is_newest_first() {
        let dir = scratch_dir("recent");
        let mut ledger = VersionLedger::open(&dir).unwrap();
        ledger
            .create_version(&proposal(IssueArea::Efficiency, Severity::Medium, "faster"))
            .unwrap();
        ledger
            .create_version(&proposal(IssueArea::Learning, Severity::Medium, "tune"))
            .unwrap();

        let recent = ledger.get_recent(5);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].version, "1.0.2");
    }
}
