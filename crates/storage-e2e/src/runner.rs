//! Sequential scenario execution and the run report.
//!
//! Every scenario gets its own project: the runner creates it, hands the
//! body a CLI bound to it, drains the cleanup stack once the body returns
//! and deletes the project last.

use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use e2e_util::{Cleanup, Cli};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::scenarios::{self, skip_reason, Scenario};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

/// Result of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub id: String,
    pub case_id: Option<u32>,
    pub title: String,
    pub status: Outcome,
    pub duration_secs: f64,
    /// Failure chain or skip reason.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scenarios: Vec<ScenarioReport>,
}

impl RunReport {
    fn count(&self, outcome: Outcome) -> usize {
        self.scenarios.iter().filter(|s| s.status == outcome).count()
    }

    #[must_use]
    pub fn passed(&self) -> usize {
        self.count(Outcome::Passed)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(Outcome::Failed)
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(Outcome::Skipped)
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    /// Write the report as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing report to {}", path.display()))?;
        info!(path = %path.display(), "Wrote run report");
        Ok(())
    }
}

/// Resolve the scenarios to run from ids or case numbers, keeping
/// registry order. `all` selects every scenario.
///
/// # Errors
///
/// Returns an error for an unknown id or an empty selection.
pub fn select(keys: &[String], all: bool) -> Result<Vec<Scenario>> {
    if all {
        return Ok(scenarios::all());
    }
    if keys.is_empty() {
        bail!("name at least one scenario or pass --all");
    }
    let mut selected: Vec<Scenario> = Vec::new();
    for key in keys {
        let scenario = scenarios::find(key)
            .with_context(|| format!("unknown scenario '{key}', see `storage-e2e list`"))?;
        if !selected.iter().any(|s| s.id == scenario.id) {
            selected.push(scenario);
        }
    }
    let order: Vec<&str> = scenarios::all().iter().map(|s| s.id).collect();
    selected.sort_by_key(|s| order.iter().position(|id| *id == s.id));
    Ok(selected)
}

/// Run one scenario in a fresh project and classify the result.
pub async fn run_scenario(cli: &Cli, scenario: &Scenario) -> ScenarioReport {
    let started_at = Utc::now();
    let start = Instant::now();
    info!(scenario = scenario.id, case = %scenario.case_label(), "Scenario start");

    let mut project = cli.clone();
    let result = match project.setup_project().await {
        Ok(_) => {
            let cleanup = Cleanup::new();
            let result = scenario.run(project.clone(), cleanup.clone()).await;
            cleanup.run().await;
            project.teardown_project().await;
            result
        }
        Err(e) => Err(anyhow::Error::new(e).context("creating the test project")),
    };

    let (status, error) = match &result {
        Ok(()) => (Outcome::Passed, None),
        Err(e) => match skip_reason(e) {
            Some(reason) => {
                warn!(scenario = scenario.id, reason, "Scenario skipped");
                (Outcome::Skipped, Some(reason.to_string()))
            }
            None => {
                let message = format!("{e:#}");
                error!(scenario = scenario.id, error = %message, "Scenario failed");
                (Outcome::Failed, Some(message))
            }
        },
    };
    let duration_secs = start.elapsed().as_secs_f64();
    info!(scenario = scenario.id, status = ?status, duration_secs, "Scenario finished");

    ScenarioReport {
        id: scenario.id.to_string(),
        case_id: scenario.case_id,
        title: scenario.title.to_string(),
        status,
        duration_secs,
        error,
        started_at,
    }
}

/// Hooks around each scenario of a run, e.g. to drive a spinner.
pub trait Progress {
    fn started(&mut self, _scenario: &Scenario) {}
    fn finished(&mut self, _report: &ScenarioReport) {}
}

impl Progress for () {}

/// Run `selected` one after another, reporting each one to `progress`.
pub async fn run_all(cli: &Cli, selected: &[Scenario], progress: &mut impl Progress) -> RunReport {
    let started_at = Utc::now();
    let mut reports = Vec::with_capacity(selected.len());
    for scenario in selected {
        progress.started(scenario);
        let report = run_scenario(cli, scenario).await;
        progress.finished(&report);
        reports.push(report);
    }
    RunReport {
        started_at,
        finished_at: Utc::now(),
        scenarios: reports,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use e2e_util::testing::ScriptedRunner;
    use e2e_util::CommandOutput;

    use super::*;
    use crate::scenarios::skip;

    /// Create `pod sentinel` and defer its delete, then finish with `result`.
    async fn with_sentinel(
        cli: Cli,
        cleanup: Cleanup,
        result: anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        cli.run("create").args(["pod", "sentinel"]).execute().await?;
        cleanup.defer("delete sentinel", move || async move {
            let _ = cli.run("delete").args(["pod", "sentinel"]).execute().await;
        });
        result
    }

    fn passing() -> Scenario {
        Scenario::new("passing", Some(1), "always passes", |cli, cleanup| {
            Box::pin(with_sentinel(cli, cleanup, Ok(())))
        })
    }

    fn failing_after_create() -> Scenario {
        Scenario::new("failing-after-create", None, "fails after a create", |cli, cleanup| {
            Box::pin(with_sentinel(
                cli,
                cleanup,
                Err(anyhow::anyhow!("pod never became ready")),
            ))
        })
    }

    fn skipping_after_create() -> Scenario {
        Scenario::new("skipping-after-create", None, "skips after a create", |cli, cleanup| {
            Box::pin(with_sentinel(cli, cleanup, Err(skip("driver not installed"))))
        })
    }

    fn failing() -> Scenario {
        Scenario::new("failing", None, "always fails", |_, _| {
            Box::pin(async {
                Err::<(), _>(anyhow::anyhow!("volume never bound")).context("waiting for pvc")
            })
        })
    }

    fn skipping() -> Scenario {
        Scenario::new("skipping", None, "always skips", |_, _| {
            Box::pin(async { Err(skip("single node cluster")) })
        })
    }

    /// Index of the first call starting with `verb` and containing `target`.
    fn position(calls: &[String], verb: &str, target: &str) -> usize {
        calls
            .iter()
            .position(|c| c.starts_with(verb) && c.contains(target))
            .unwrap_or_else(|| panic!("no `{verb} .. {target}` call in {calls:?}"))
    }

    fn assert_cleaned_up_in_order(calls: &[String]) {
        let created = position(calls, "create", "namespace e2e-test-storage-");
        let sentinel = position(calls, "create", "pod sentinel");
        let cleaned = position(calls, "delete", "pod sentinel");
        let torn_down = position(calls, "delete", "namespace e2e-test-storage-");
        assert!(created < sentinel && sentinel < cleaned && cleaned < torn_down);
        assert!(calls[sentinel].contains("--namespace=e2e-test-storage-"));
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl Progress for Recorder {
        fn started(&mut self, scenario: &Scenario) {
            self.events.push(format!("start {}", scenario.id));
        }

        fn finished(&mut self, report: &ScenarioReport) {
            self.events.push(format!("finish {} {:?}", report.id, report.status));
        }
    }

    #[tokio::test]
    async fn test_run_scenario_drains_cleanup_before_teardown() {
        let runner = Arc::new(ScriptedRunner::new());
        let cli = Cli::new("oc", runner.clone());

        let report = run_scenario(&cli, &passing()).await;
        assert_eq!(report.status, Outcome::Passed);
        assert!(report.error.is_none());
        assert_cleaned_up_in_order(&runner.calls());
    }

    #[tokio::test]
    async fn test_failed_body_still_drains_cleanup_and_tears_down() {
        let runner = Arc::new(ScriptedRunner::new());
        let cli = Cli::new("oc", runner.clone());

        let report = run_scenario(&cli, &failing_after_create()).await;
        assert_eq!(report.status, Outcome::Failed);
        assert_eq!(report.error.as_deref(), Some("pod never became ready"));
        let calls = runner.calls();
        assert_cleaned_up_in_order(&calls);
        assert_eq!(runner.calls_matching("pod sentinel").len(), 2);
    }

    #[tokio::test]
    async fn test_skipped_body_still_drains_cleanup_and_tears_down() {
        let runner = Arc::new(ScriptedRunner::new());
        let cli = Cli::new("oc", runner.clone());

        let report = run_scenario(&cli, &skipping_after_create()).await;
        assert_eq!(report.status, Outcome::Skipped);
        assert_eq!(report.error.as_deref(), Some("driver not installed"));
        assert_cleaned_up_in_order(&runner.calls());
    }

    #[tokio::test]
    async fn test_cleanup_survives_failing_deletes() {
        let runner = Arc::new(
            ScriptedRunner::new().on("delete --namespace", CommandOutput::failed("etcd timeout")),
        );
        let cli = Cli::new("oc", runner.clone());

        let report = run_scenario(&cli, &failing_after_create()).await;
        assert_eq!(report.status, Outcome::Failed);
        assert_cleaned_up_in_order(&runner.calls());
    }

    #[tokio::test]
    async fn test_run_scenario_classifies_failures_and_skips() {
        let cli = Cli::new("oc", Arc::new(ScriptedRunner::new()));

        let failed = run_scenario(&cli, &failing()).await;
        assert_eq!(failed.status, Outcome::Failed);
        assert_eq!(
            failed.error.as_deref(),
            Some("waiting for pvc: volume never bound")
        );

        let skipped = run_scenario(&cli, &skipping()).await;
        assert_eq!(skipped.status, Outcome::Skipped);
        assert_eq!(skipped.error.as_deref(), Some("single node cluster"));
    }

    #[tokio::test]
    async fn test_project_setup_failure_fails_without_running_body() {
        let runner = Arc::new(
            ScriptedRunner::new().on("create namespace", CommandOutput::failed("forbidden")),
        );
        let cli = Cli::new("oc", runner.clone());

        let report = run_scenario(&cli, &passing()).await;
        assert_eq!(report.status, Outcome::Failed);
        assert!(report.error.unwrap().contains("creating the test project"));
        assert!(runner.calls_matching("pod sentinel").is_empty());
    }

    #[tokio::test]
    async fn test_run_all_counts() {
        let cli = Cli::new("oc", Arc::new(ScriptedRunner::new()));
        let report = run_all(&cli, &[passing(), failing(), skipping()], &mut ()).await;
        assert_eq!(
            (report.passed(), report.failed(), report.skipped()),
            (1, 1, 1)
        );
        assert!(report.has_failures());
        assert!(report.finished_at >= report.started_at);
    }

    #[tokio::test]
    async fn test_run_all_reports_progress_around_each_scenario() {
        let cli = Cli::new("oc", Arc::new(ScriptedRunner::new()));
        let mut recorder = Recorder::default();
        run_all(&cli, &[passing(), skipping()], &mut recorder).await;
        assert_eq!(
            recorder.events,
            [
                "start passing",
                "finish passing Passed",
                "start skipping",
                "finish skipping Skipped",
            ]
        );
    }

    #[test]
    fn test_select_keeps_registry_order_and_dedups() {
        let keys = vec![
            "ephemeral-limitrange".to_string(),
            "26747".to_string(),
            "configmap-subpath".to_string(),
        ];
        let ids: Vec<&str> = select(&keys, false).unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, ["configmap-subpath", "ephemeral-limitrange"]);
    }

    #[test]
    fn test_select_rejects_unknown_and_empty() {
        let err = select(&["nope".to_string()], false).unwrap_err();
        assert!(err.to_string().contains("unknown scenario 'nope'"));
        assert!(select(&[], false).is_err());
        assert_eq!(select(&[], true).unwrap().len(), scenarios::all().len());
    }

    #[test]
    fn test_report_json_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = RunReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            scenarios: vec![ScenarioReport {
                id: "nfs-statefulset".to_string(),
                case_id: Some(52071),
                title: "NFS".to_string(),
                status: Outcome::Skipped,
                duration_secs: 1.5,
                error: Some("no workers".to_string()),
                started_at: Utc::now(),
            }],
        };
        report.write_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let entry = &value["scenarios"][0];
        assert_eq!(entry["status"], "skipped");
        assert_eq!(entry["case_id"], 52071);
        assert_eq!(entry["error"], "no workers");
        assert!(entry["started_at"].is_string());
    }
}
