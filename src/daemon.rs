//! Improvement Daemon
//!
//! Runs the background loop that ties the external issue/solution
//! source to the mutation pipeline. Uses `tokio::time::interval` for
//! the tick loop, a cron schedule for the due-check, and
//! `Arc<AtomicBool>` for graceful shutdown signaling. One cycle runs
//! start-to-finish before the next trigger fires; there is no in-cycle
//! parallel mutation of the working tree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::implementer::AutoImplementer;
use crate::ledger::VersionLedger;
use crate::patcher::HotPatcher;
use crate::types::{
    ImprovementSource, Issue, NotificationSink, Proposal, ProposalStatus, Solution, VersionStatus,
};
use crate::updater::SelfUpdater;

/// Summary of one improvement cycle; every item's outcome is reported
/// individually, never as one opaque cycle failure.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub issues_found: u32,
    pub implemented: u32,
    pub failed: u32,
    pub patches_applied: u32,
    pub patches_failed: u32,
    pub updated: bool,
    /// True when the mutation phase was skipped because another
    /// invocation held the update lock.
    pub skipped: bool,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// One dependency-injected bundle of the pipeline services. Owned by the
/// daemon; tests drive `run_cycle` directly.
pub struct ImprovementPipeline {
    pub ledger: VersionLedger,
    pub implementer: AutoImplementer,
    pub patcher: HotPatcher,
    pub updater: SelfUpdater,
    pub source: Arc<dyn ImprovementSource>,
    pub sink: Arc<dyn NotificationSink>,
    pub auto_update: bool,
}

impl ImprovementPipeline {
    /// Run one full cycle: optional self-update, then one implementation
    /// attempt per detected issue, then all pending hot patches. The
    /// mutation phase takes the update lock; when another invocation
    /// holds it the cycle skips cleanly with zero side effects. No
    /// single failing item aborts the rest of the cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        if self.auto_update {
            let update = self.updater.run_full_update();
            report.updated = update.updated;
            if update.updated {
                self.sink
                    .notify_finding(
                        "Self-update applied",
                        &format!("{} commit(s) pulled, restarted={}", update.behind, update.restarted),
                    )
                    .await;
            } else if let Some(ref error) = update.error {
                self.sink.notify_alert("Self-update failed", error).await;
            }
        }

        // The same lock that guards pull/rebuild guards the mutation
        // phase: implementations and patches must never land in the
        // working tree while another invocation is mid-update. Held
        // until the cycle returns.
        let _guard = match self.updater.try_lock() {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("{}; skipping this cycle", CoreError::ConcurrencyGuard);
                report.skipped = true;
                return report;
            }
            Err(e) => {
                self.sink
                    .notify_alert("Update lock check failed", &format!("{:#}", e))
                    .await;
                report.skipped = true;
                return report;
            }
        };

        let issues = match self.source.analyze_performance().await {
            Ok(issues) => issues,
            Err(e) => {
                self.sink
                    .notify_alert("Performance analysis failed", &format!("{:#}", e))
                    .await;
                return report;
            }
        };
        report.issues_found = issues.len() as u32;
        info!("Cycle found {} issue(s)", issues.len());

        for issue in &issues {
            match self.handle_issue(issue).await {
                Ok(true) => report.implemented += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    // Item-level fault; the cycle continues.
                    report.failed += 1;
                    self.sink
                        .notify_alert("Improvement attempt failed", &format!("{:#}", e))
                        .await;
                }
            }
        }

        match self.patcher.apply_all() {
            Ok((applied, failed)) => {
                report.patches_applied = applied;
                report.patches_failed = failed;
            }
            Err(e) => {
                self.sink
                    .notify_alert("Patch pass failed", &format!("{:#}", e))
                    .await;
            }
        }

        info!(
            "Cycle complete: {}/{} implemented, {} patches applied",
            report.implemented, report.issues_found, report.patches_applied
        );
        report
    }

    /// Propose, version, and implement a single issue. `Ok(true)` means
    /// the implementation landed.
    async fn handle_issue(&mut self, issue: &Issue) -> Result<bool> {
        let Some(solution) = self.source.generate_improvement(issue).await? else {
            debug!("No solution generated for issue: {}", issue.description);
            return Ok(false);
        };

        let proposal = build_proposal(issue.clone(), solution);
        let version = self
            .ledger
            .create_version(&proposal)
            .context("version assignment failed")?;

        let record = self.implementer.implement(&proposal, &version.version);

        if record.success {
            self.ledger
                .update_status(&version.id, VersionStatus::Implemented, None)?;
            self.sink
                .notify_finding(
                    &format!("Implemented v{}", version.version),
                    &format!(
                        "{} -> {} (commit {})",
                        proposal.solution.description,
                        record.target_file,
                        record.commit_id.as_deref().unwrap_or("none"),
                    ),
                )
                .await;
            Ok(true)
        } else {
            self.sink
                .notify_alert(
                    &format!("Implementation rejected for v{}", version.version),
                    record.error.as_deref().unwrap_or("unknown"),
                )
                .await;
            Ok(false)
        }
    }
}

/// Assemble a proposal for one issue/solution pair.
pub fn build_proposal(issue: Issue, solution: Solution) -> Proposal {
    Proposal {
        id: format!("prop_{}", Uuid::new_v4()),
        created_at: Utc::now().to_rfc3339(),
        issue,
        solution,
        status: ProposalStatus::Proposed,
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Options for creating the improvement daemon.
pub struct DaemonOptions {
    /// Tick interval in seconds. Defaults to 60.
    pub tick_interval_secs: u64,
    /// Cron expression gating when a cycle is due.
    pub cycle_schedule: String,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            cycle_schedule: "0 0 */6 * * *".to_string(),
        }
    }
}

/// The improvement daemon. Runs a background tokio task that ticks at
/// the configured interval and runs a cycle whenever the schedule says
/// one is due.
pub struct ImprovementDaemon {
    running: Arc<AtomicBool>,
    interval_handle: Option<JoinHandle<()>>,
    tick_interval_secs: u64,
    cycle_schedule: String,
    pipeline: Arc<tokio::sync::Mutex<ImprovementPipeline>>,
}

impl ImprovementDaemon {
    pub fn new(pipeline: ImprovementPipeline, options: DaemonOptions) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            interval_handle: None,
            tick_interval_secs: options.tick_interval_secs,
            cycle_schedule: options.cycle_schedule,
            pipeline: Arc::new(tokio::sync::Mutex::new(pipeline)),
        }
    }

    /// Start the background loop.
    pub fn start(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("Improvement daemon is already running");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            "Starting improvement daemon ({}s tick, schedule '{}')",
            self.tick_interval_secs, self.cycle_schedule
        );

        let running = Arc::clone(&self.running);
        let pipeline = Arc::clone(&self.pipeline);
        let schedule_str = self.cycle_schedule.clone();
        let tick_secs = self.tick_interval_secs;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));
            let mut last_run: Option<DateTime<Utc>> = None;

            loop {
                interval.tick().await;

                if !running.load(Ordering::SeqCst) {
                    info!("Improvement daemon stopping");
                    break;
                }

                if !is_due(&schedule_str, last_run) {
                    continue;
                }

                // The mutex serializes cycles: an overlapping trigger
                // waits for the running cycle rather than racing it.
                let mut pipeline = pipeline.lock().await;
                let report = pipeline.run_cycle().await;
                drop(pipeline);
                last_run = Some(Utc::now());
                debug!("Cycle report: {:?}", report);
            }
        });

        self.interval_handle = Some(handle);
    }

    /// Stop the daemon gracefully.
    pub fn stop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("Improvement daemon is not running");
            return;
        }

        info!("Stopping improvement daemon");
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.interval_handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one cycle immediately, regardless of the schedule.
    pub async fn force_cycle(&self) -> CycleReport {
        info!("Force-running improvement cycle");
        let mut pipeline = self.pipeline.lock().await;
        pipeline.run_cycle().await
    }
}

/// Check whether a cycle is due under `schedule` given the last run
/// time. An unparsable schedule disables the trigger rather than
/// erroring the loop.
pub fn is_due(schedule: &str, last_run: Option<DateTime<Utc>>) -> bool {
    let schedule: Schedule = match schedule.parse() {
        Ok(s) => s,
        Err(e) => {
            error!("Invalid cron schedule '{}': {}", schedule, e);
            return false;
        }
    };

    match last_run {
        Some(last) => match schedule.after(&last).next() {
            Some(next) => Utc::now() >= next,
            None => false,
        },
        // Never run yet; due immediately.
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ContentFilter;
    use crate::notify::test_support::RecordingSink;
    use crate::sandbox::SandboxGuard;
    use crate::types::{IssueArea, ProcessSupervisor, Severity};
    use crate::vcs::test_support::FakeVcs;
    use async_trait::async_trait;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct StaticSource {
        issues: Vec<Issue>,
        solutions: Mutex<Vec<Option<Solution>>>,
    }

    #[async_trait]
    impl ImprovementSource for StaticSource {
        async fn analyze_performance(&self) -> Result<Vec<Issue>> {
            Ok(self.issues.clone())
        }

        async fn generate_improvement(&self, _issue: &Issue) -> Result<Option<Solution>> {
            let mut solutions = self.solutions.lock().unwrap();
            Ok(solutions.pop().flatten())
        }
    }

    struct NoopSupervisor;

    impl ProcessSupervisor for NoopSupervisor {
        fn restart_detached(&self, _process_name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn issue(description: &str) -> Issue {
        Issue {
            area: IssueArea::Efficiency,
            description: description.to_string(),
            severity: Severity::Medium,
            metrics: serde_json::Value::Null,
        }
    }

    fn solution(code: &str) -> Solution {
        Solution {
            description: "Cache lookups".to_string(),
            approach: "LRU cache".to_string(),
            code: code.to_string(),
            language: "rust".to_string(),
            filename: "cache-utility".to_string(),
            estimated_impact: "30% fewer lookups".to_string(),
        }
    }

    fn pipeline(
        tag: &str,
        source: Arc<dyn ImprovementSource>,
        sink: Arc<RecordingSink>,
    ) -> (ImprovementPipeline, PathBuf, PathBuf) {
        let base = std::env::temp_dir().join(format!("metamorph-daemon-{}-{}", tag, Uuid::new_v4()));
        let root = base.join("workspace");
        let data_dir = base.join("state");
        fs::create_dir_all(root.join("data")).unwrap();
        fs::create_dir_all(root.join("config")).unwrap();
        fs::create_dir_all(&data_dir).unwrap();

        let sandbox = Arc::new(SandboxGuard::new(&root));
        let filter = Arc::new(ContentFilter::new());
        let vcs = Arc::new(FakeVcs::behind_by(0, vec![], vec![]));

        let pipeline = ImprovementPipeline {
            ledger: VersionLedger::open(&data_dir).unwrap(),
            implementer: AutoImplementer::open(
                &data_dir,
                sandbox.clone(),
                filter.clone(),
                vcs.clone(),
            )
            .unwrap(),
            patcher: HotPatcher::open(
                &data_dir,
                root.join("data"),
                root.join("config"),
                sandbox,
                filter,
            )
            .unwrap(),
            updater: SelfUpdater::new(&root, &data_dir, "metamorph", vcs, Arc::new(NoopSupervisor)),
            source,
            sink,
            auto_update: false,
        };
        (pipeline, root, data_dir)
    }

    #[tokio::test]
    async fn test_cycle_implements_safe_solution_and_notifies() {
        let sink = Arc::new(RecordingSink::default());
        let source = Arc::new(StaticSource {
            issues: vec![issue("efficiency of lookups is poor")],
            solutions: Mutex::new(vec![Some(solution("pub fn cached() {}\n"))]),
        });
        let (mut pipeline, root, _data_dir) = pipeline("happy", source, sink.clone());

        let report = pipeline.run_cycle().await;
        assert_eq!(report.issues_found, 1);
        assert_eq!(report.implemented, 1);
        assert_eq!(report.failed, 0);

        // Version assigned, status synchronized, target written.
        assert_eq!(pipeline.ledger.get_current_version(), "1.0.1");
        assert_eq!(
            pipeline.ledger.get_all()[0].status,
            VersionStatus::Implemented
        );
        assert!(root.join("src/autogen/perf/cache-utility.rs").exists());

        let findings = sink.findings.lock().unwrap();
        assert!(findings[0].0.contains("Implemented v1.0.1"));
    }

    #[tokio::test]
    async fn test_unsafe_solution_is_isolated_and_alerted() {
        let sink = Arc::new(RecordingSink::default());
        let source = Arc::new(StaticSource {
            issues: vec![
                issue("efficiency of lookups is poor"),
                issue("faster startup wanted"),
            ],
            // Popped in reverse order: first issue gets the unsafe code.
            solutions: Mutex::new(vec![
                Some(solution("pub fn cached() {}\n")),
                Some(solution(r#"let k = fs::read("~/.ssh/id_rsa");"#)),
            ]),
        });
        let (mut pipeline, root, _data_dir) = pipeline("unsafe", source, sink.clone());

        let report = pipeline.run_cycle().await;
        assert_eq!(report.implemented, 1);
        assert_eq!(report.failed, 1);

        // The unsafe item produced no file; the safe one still landed.
        assert!(root.join("src/autogen/perf/cache-utility.rs").exists());
        assert_eq!(sink.alerts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_source_without_solution_counts_as_failed_not_fatal() {
        let sink = Arc::new(RecordingSink::default());
        let source = Arc::new(StaticSource {
            issues: vec![issue("engagement dropping")],
            solutions: Mutex::new(vec![None]),
        });
        let (mut pipeline, _root, _data_dir) = pipeline("nosolution", source, sink);

        let report = pipeline.run_cycle().await;
        assert_eq!(report.issues_found, 1);
        assert_eq!(report.implemented, 0);
        assert_eq!(report.failed, 1);
        // No version was minted for an issue with no solution.
        assert!(pipeline.ledger.get_all().is_empty());
    }

    #[tokio::test]
    async fn test_mutation_phase_skipped_while_update_lock_held() {
        let sink = Arc::new(RecordingSink::default());
        let source = Arc::new(StaticSource {
            issues: vec![issue("efficiency of lookups is poor")],
            solutions: Mutex::new(vec![Some(solution("pub fn cached() {}\n"))]),
        });
        let (mut pipeline, root, data_dir) = pipeline("lockheld", source, sink);

        let held = crate::updater::UpdateLock::acquire(&data_dir).unwrap().unwrap();
        let report = pipeline.run_cycle().await;
        assert!(report.skipped);
        assert_eq!(report.implemented, 0);
        // Zero side effects while the lock is held.
        assert!(!root.join("src/autogen/perf/cache-utility.rs").exists());
        assert!(pipeline.ledger.get_all().is_empty());
        drop(held);

        // Lock released; the next cycle proceeds normally.
        let report = pipeline.run_cycle().await;
        assert!(!report.skipped);
        assert_eq!(report.implemented, 1);
        assert!(root.join("src/autogen/perf/cache-utility.rs").exists());
    }

    #[test]
    fn test_is_due_schedule_gating() {
        // Due immediately when never run.
        assert!(is_due("0 0 * * * *", None));
        // Not due right after a run under an hourly schedule.
        assert!(!is_due("0 0 * * * *", Some(Utc::now())));
        // Invalid schedules disable the trigger.
        assert!(!is_due("not a schedule", None));
        // Due when the slot has passed since the last run.
        let long_ago = Utc::now() - chrono::Duration::hours(3);
        assert!(is_due("0 0 * * * *", Some(long_ago)));
    }
}
