//! Runnable storage scenarios.
//!
//! Each scenario receives a CLI already switched to a fresh project and a
//! cleanup stack. Bodies register a delete right after every create; the
//! runner drains the stack whatever the outcome.

use e2e_util::{Cleanup, Cli, E2eError};
use futures::future::BoxFuture;

mod configmap;
mod ephemeral;
mod inline;
mod iscsi;
mod metrics;
mod nfs;
mod vac;

pub type ScenarioFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A registered scenario.
#[derive(Clone, Copy)]
pub struct Scenario {
    pub id: &'static str,
    /// Case number tracked by the upstream test plan, if any.
    pub case_id: Option<u32>,
    pub title: &'static str,
    body: fn(Cli, Cleanup) -> ScenarioFuture,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("id", &self.id)
            .field("case_id", &self.case_id)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

impl Scenario {
    pub const fn new(
        id: &'static str,
        case_id: Option<u32>,
        title: &'static str,
        body: fn(Cli, Cleanup) -> ScenarioFuture,
    ) -> Self {
        Self {
            id,
            case_id,
            title,
            body,
        }
    }

    /// Run the body. The caller owns project setup and cleanup.
    pub async fn run(&self, cli: Cli, cleanup: Cleanup) -> anyhow::Result<()> {
        (self.body)(cli, cleanup).await
    }

    /// `26747` or `-` for scenarios without a tracked case.
    #[must_use]
    pub fn case_label(&self) -> String {
        self.case_id
            .map_or_else(|| "-".to_string(), |id| id.to_string())
    }
}

/// Every scenario in execution order.
#[must_use]
pub fn all() -> Vec<Scenario> {
    vec![
        Scenario::new(
            "configmap-subpath",
            Some(26747),
            "Pod with configmap using subpath should not stuck",
            |cli, cleanup| Box::pin(configmap::subpath_does_not_hot_update(cli, cleanup)),
        ),
        Scenario::new(
            "nfs-daemonset-rwx",
            Some(51424),
            "NFS RWX volume shared by a daemonset",
            |cli, cleanup| Box::pin(nfs::daemonset_rwx(cli, cleanup)),
        ),
        Scenario::new(
            "nfs-statefulset",
            Some(52071),
            "NFS volumes bound to statefulset claims",
            |cli, cleanup| Box::pin(nfs::statefulset(cli, cleanup)),
        ),
        Scenario::new(
            "iscsi-rwo-same-node",
            Some(52683),
            "iSCSI RWO volume is only usable from one node",
            |cli, cleanup| Box::pin(iscsi::rwo_same_node(cli, cleanup)),
        ),
        Scenario::new(
            "iscsi-chap",
            Some(52835),
            "iSCSI CHAP discovery authentication",
            |cli, cleanup| Box::pin(iscsi::chap_discovery_auth(cli, cleanup)),
        ),
        Scenario::new(
            "iscsi-drain-node",
            Some(15413),
            "iSCSI volume follows its pod when the node is drained",
            |cli, cleanup| Box::pin(iscsi::drain_node(cli, cleanup)),
        ),
        Scenario::new(
            "iscsi-multipath",
            Some(52770),
            "iSCSI volume stays usable through a second portal",
            |cli, cleanup| Box::pin(iscsi::multipath(cli, cleanup)),
        ),
        Scenario::new(
            "ephemeral-pod-level-limits",
            Some(55151),
            "Pod is evicted when the sum of container ephemeral limits is exceeded",
            |cli, cleanup| Box::pin(ephemeral::pod_level_limits(cli, cleanup)),
        ),
        Scenario::new(
            "ephemeral-emptydir-size-limit",
            Some(56080),
            "Pod is evicted when an emptyDir exceeds its sizeLimit",
            |cli, cleanup| Box::pin(ephemeral::emptydir_size_limit(cli, cleanup)),
        ),
        Scenario::new(
            "ephemeral-container-level-limits",
            Some(56223),
            "Pod is evicted when a container exceeds its ephemeral limit",
            |cli, cleanup| Box::pin(ephemeral::container_level_limits(cli, cleanup)),
        ),
        Scenario::new(
            "ephemeral-scheduling-requests",
            Some(56225),
            "Pod requesting more ephemeral storage than any node offers stays pending",
            |cli, cleanup| Box::pin(ephemeral::scheduling_requests(cli, cleanup)),
        ),
        Scenario::new(
            "ephemeral-limitrange",
            Some(56364),
            "LimitRange bounds and defaults for ephemeral storage",
            |cli, cleanup| Box::pin(ephemeral::limit_range(cli, cleanup)),
        ),
        Scenario::new(
            "ephemeral-resourcequota",
            Some(56365),
            "ResourceQuota accounting for ephemeral storage",
            |cli, cleanup| Box::pin(ephemeral::resource_quota(cli, cleanup)),
        ),
        Scenario::new(
            "inline-volume-admission",
            Some(60915),
            "Shared resource inline volumes follow the pod security admission levels",
            |cli, cleanup| Box::pin(inline::shared_resource_admission(cli, cleanup)),
        ),
        Scenario::new(
            "metrics-volume-mode-counts",
            Some(37783),
            "Volume mode counts per plugin rise after provisioning",
            |cli, cleanup| Box::pin(metrics::volume_mode_counts(cli, cleanup)),
        ),
        Scenario::new(
            "alert-mount-failure-node-name",
            Some(64184),
            "Mount failure alert names the node of the failing pod",
            |cli, cleanup| Box::pin(metrics::mount_failure_alert_node(cli, cleanup)),
        ),
        Scenario::new(
            "alert-attach-failure",
            Some(64186),
            "Attach failure of a deleted volume raises the storage alert",
            |cli, cleanup| Box::pin(metrics::attach_failure_alert(cli, cleanup)),
        ),
        Scenario::new(
            "metrics-efs-usage",
            Some(75823),
            "Kubelet volume stats are reported for EFS claims",
            |cli, cleanup| Box::pin(metrics::efs_usage_metrics(cli, cleanup)),
        ),
        Scenario::new(
            "vac-static-pv",
            None,
            "Static PV with a VolumeAttributesClass",
            |cli, cleanup| Box::pin(vac::static_pv(cli, cleanup)),
        ),
    ]
}

/// Look a scenario up by id or case number.
#[must_use]
pub fn find(key: &str) -> Option<Scenario> {
    all()
        .into_iter()
        .find(|s| s.id == key || s.case_id.is_some_and(|id| id.to_string() == key))
}

/// Error that makes the runner report the scenario as skipped.
pub fn skip(reason: impl Into<String>) -> anyhow::Error {
    E2eError::Skipped(reason.into()).into()
}

/// Skip reason, if `err` was raised through [`skip`].
#[must_use]
pub fn skip_reason(err: &anyhow::Error) -> Option<&str> {
    match err.downcast_ref::<E2eError>() {
        Some(E2eError::Skipped(reason)) => Some(reason),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_and_cases_are_unique() {
        let scenarios = all();
        let ids: HashSet<_> = scenarios.iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), scenarios.len());
        let cases: Vec<_> = scenarios.iter().filter_map(|s| s.case_id).collect();
        let unique: HashSet<_> = cases.iter().collect();
        assert_eq!(unique.len(), cases.len());
    }

    #[test]
    fn test_find_by_id_or_case() {
        assert_eq!(find("nfs-statefulset").map(|s| s.case_id), Some(Some(52071)));
        assert_eq!(find("56365").map(|s| s.id), Some("ephemeral-resourcequota"));
        assert!(find("does-not-exist").is_none());
    }

    #[test]
    fn test_skip_reason_round_trips_through_anyhow() {
        let err = skip("needs two workers");
        assert_eq!(skip_reason(&err), Some("needs two workers"));
        let wrapped = err.context("while running");
        assert_eq!(skip_reason(&wrapped), Some("needs two workers"));
        assert!(skip_reason(&anyhow::anyhow!("boom")).is_none());
    }

    #[test]
    fn test_every_scenario_is_registered() {
        let cases: Vec<_> = all().iter().filter_map(|s| s.case_id).collect();
        for case in [15413, 52770, 60915, 64184, 64186, 75823] {
            assert!(cases.contains(&case), "case {case} is not registered");
        }
        assert_eq!(all().len(), 19);
    }

    #[test]
    fn test_case_label() {
        assert_eq!(find("vac-static-pv").map(|s| s.case_label()), Some("-".to_string()));
        assert_eq!(find("configmap-subpath").map(|s| s.case_label()), Some("26747".to_string()));
    }
}
