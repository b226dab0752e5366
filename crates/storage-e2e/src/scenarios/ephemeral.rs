//! Local ephemeral storage: limits, emptyDir sizeLimit, scheduling and
//! namespace policies.

use std::time::Duration;

use anyhow::{ensure, Result};
use e2e_util::{random_num, random_string, wait, Cleanup, Cli, JsonEdit};
use serde_json::json;
use tracing::info;

use super::skip;
use crate::cluster::{check_pod_ready, get_pod_status};
use crate::consts::BASE_FEDORA_IMAGE;
use crate::node::{
    get_all_nodes_info, max_allocatable_ephemeral_storage, schedulable_linux_workers,
};
use crate::resources::{LimitRange, Pod, ResourceQuota};

const EVICTION_TIMEOUT: Duration = Duration::from_secs(180);
const EVICTION_INTERVAL: Duration = Duration::from_secs(10);
const POD_TOTAL_LIMIT_EXCEEDED: &str =
    "Pod ephemeral local storage usage exceeds the total limit of containers";

/// Two containers sharing an emptyDir named `data` at `/mnt/storage`.
fn ephemeral_pod() -> Pod {
    Pod::new()
        .with_template("pod-with-multiple-containers-using-emptydir-template.yaml")
        .with_image(BASE_FEDORA_IMAGE)
}

/// `ephemeral-storage` request or limit of one container.
fn storage(container: usize, kind: &str, quantity: &str) -> JsonEdit {
    JsonEdit::set(
        format!("items.0.spec.containers.{container}.resources.{kind}."),
        json!({ "ephemeral-storage": quantity }),
    )
}

/// Requests and limits for both containers, in container order.
fn pod_storage(
    requests_0: &str,
    limits_0: &str,
    requests_1: &str,
    limits_1: &str,
) -> Vec<JsonEdit> {
    vec![
        storage(0, "requests", requests_0),
        storage(0, "limits", limits_0),
        storage(1, "requests", requests_1),
        storage(1, "limits", limits_1),
    ]
}

/// Drop the shared emptyDir so containers only write to their own layer.
fn without_volumes() -> [JsonEdit; 3] {
    [
        JsonEdit::delete("items.0.spec.containers.0.volumeMounts"),
        JsonEdit::delete("items.0.spec.containers.1.volumeMounts"),
        JsonEdit::delete("items.0.spec.volumes"),
    ]
}

fn defer_delete(cli: &Cli, cleanup: &Cleanup, pod: &Pod) {
    let (cli, pod) = (cli.clone(), pod.clone());
    cleanup.defer("delete pod", move || async move { pod.delete_as_admin(&cli).await });
}

async fn fallocate(cli: &Cli, pod: &Pod, container: usize, size: &str, path: &str) -> Result<()> {
    pod.exec_command_in_specified_container(
        cli,
        &format!("{}-container-{container}", pod.name),
        &format!("fallocate -l {size} {path}"),
    )
    .await?;
    info!(pod = %pod.name, container, size, "Wrote data");
    Ok(())
}

async fn is_ready(cli: &Cli, pod: &Pod) -> bool {
    check_pod_ready(cli, &pod.namespace, &pod.name)
        .await
        .unwrap_or(false)
}

async fn stays_ready(cli: &Cli, pod: &Pod) -> Result<()> {
    wait::consistently(
        "pod to stay ready",
        Duration::from_secs(60),
        Duration::from_secs(10),
        || is_ready(cli, pod),
        |ready| *ready,
    )
    .await?;
    Ok(())
}

async fn json_path(cli: &Cli, pod: &Pod, path: &str) -> String {
    pod.get_value_by_json_path(cli, path).await.unwrap_or_default()
}

/// Wait for the kubelet to evict the pod with `message`.
async fn wait_evicted(cli: &Cli, pod: &Pod, message: &str) -> Result<()> {
    wait::eventually(
        "pod to be evicted",
        EVICTION_TIMEOUT,
        EVICTION_INTERVAL,
        || json_path(cli, pod, "{.status.reason}"),
        |reason| reason.contains("Evicted"),
    )
    .await?;
    wait::eventually(
        "eviction message",
        EVICTION_TIMEOUT,
        EVICTION_INTERVAL,
        || json_path(cli, pod, "{.status.message}"),
        |status| status.contains(message),
    )
    .await?;
    info!(pod = %pod.name, message, "Pod evicted");
    Ok(())
}

/// An evicted pod stays in its failed phase.
async fn stays_evicted(cli: &Cli, pod: &Pod) -> Result<()> {
    wait::eventually(
        "pod to stop being ready",
        EVICTION_TIMEOUT,
        EVICTION_INTERVAL,
        || is_ready(cli, pod),
        |ready| !*ready,
    )
    .await?;
    wait::consistently(
        "pod to stay not ready",
        Duration::from_secs(30),
        Duration::from_secs(10),
        || is_ready(cli, pod),
        |ready| !*ready,
    )
    .await?;
    Ok(())
}

/// Container limits add up to a pod level limit: 7G in the shared
/// emptyDir exceeds the 6Gi total.
pub(super) async fn pod_level_limits(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let mut pod = ephemeral_pod();

    info!("Create a pod with ephemeral-storage requests and limits");
    pod.create_with_edits(&cli, &pod_storage("1Gi", "2Gi", "2Gi", "4Gi"))
        .await?;
    defer_delete(&cli, &cleanup, &pod);
    pod.wait_ready(&cli).await?;

    info!("Write 4G to the emptyDir from container-0, the pod stays running");
    fallocate(&cli, &pod, 0, "4G", "/mnt/storage/testdata_4G").await?;
    stays_ready(&cli, &pod).await?;

    info!("Write 3G more from container-1, the pod gets evicted");
    fallocate(&cli, &pod, 1, "3G", "/mnt/storage/testdata_3G").await?;
    wait_evicted(
        &cli,
        &pod,
        &format!("{POD_TOTAL_LIMIT_EXCEEDED} 6Gi."),
    )
    .await?;
    stays_evicted(&cli, &pod).await
}

/// An emptyDir `sizeLimit` applies to the pod as a whole and is enforced
/// before the larger container total.
pub(super) async fn emptydir_size_limit(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let mut pod = ephemeral_pod();

    info!("Create a pod with ephemeral-storage limits and an emptyDir sizeLimit");
    let mut edits = pod_storage("1Gi", "2Gi", "2Gi", "4Gi");
    edits.push(JsonEdit::set(
        "items.0.spec.volumes.0.emptyDir.",
        json!({ "sizeLimit": "4Gi" }),
    ));
    pod.create_with_edits(&cli, &edits).await?;
    defer_delete(&cli, &cleanup, &pod);
    pod.wait_ready(&cli).await?;

    info!("Write 3G from container-0, below the sizeLimit");
    fallocate(&cli, &pod, 0, "3.0G", "/mnt/storage/testdata_3.0G").await?;
    stays_ready(&cli, &pod).await?;

    info!("Write 2G more from container-1, above the sizeLimit");
    fallocate(&cli, &pod, 1, "2.0G", "/mnt/storage/testdata_2.0G").await?;
    wait_evicted(
        &cli,
        &pod,
        r#"Usage of EmptyDir volume "data" exceeds the limit "4Gi"."#,
    )
    .await?;
    stays_evicted(&cli, &pod).await
}

/// Writes outside any volume count against the writing container's own
/// limit.
pub(super) async fn container_level_limits(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let mut pod = ephemeral_pod();

    info!("Create a pod with container level ephemeral-storage limits and no volumes");
    let mut edits = vec![
        storage(0, "requests", "1Gi"),
        storage(0, "limits", "2Gi"),
        storage(1, "limits", "4Gi"),
    ];
    edits.extend(without_volumes());
    pod.create_with_edits(&cli, &edits).await?;
    defer_delete(&cli, &cleanup, &pod);
    pod.wait_ready(&cli).await?;

    info!("Write 3G to container-0's /tmp");
    fallocate(&cli, &pod, 0, "3G", "/tmp/testdata_3G").await?;
    wait_evicted(
        &cli,
        &pod,
        &format!(
            r#"Container {}-container-0 exceeded its local ephemeral storage limit "2Gi"."#,
            pod.name
        ),
    )
    .await?;
    stays_evicted(&cli, &pod).await
}

/// The scheduler sums container requests: asking for more than the largest
/// allocatable ephemeral storage keeps the pod pending.
pub(super) async fn scheduling_requests(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let nodes = get_all_nodes_info(&cli).await?;
    for node in &nodes {
        ensure!(
            !node.ephemeral_storage_capacity.is_empty()
                && !node.allocatable_ephemeral_storage.is_empty(),
            "node {} does not report ephemeral storage",
            node.name
        );
    }
    let workers = schedulable_linux_workers(&nodes);
    if workers.is_empty() {
        return Err(skip("no schedulable linux workers"));
    }
    let max = max_allocatable_ephemeral_storage(&workers)?;
    info!(max_allocatable = max, "Largest allocatable ephemeral storage");

    info!("Create a pod whose total requests exceed every node's allocatable storage");
    let mut pod = ephemeral_pod();
    let max = max.to_string();
    let mut edits = vec![
        storage(0, "requests", &max),
        storage(0, "limits", &max),
        storage(1, "requests", "1"),
    ];
    edits.extend(without_volumes());
    pod.create_with_edits(&cli, &edits).await?;
    defer_delete(&cli, &cleanup, &pod);

    info!("Check the pod stays pending for lack of ephemeral storage");
    wait::eventually(
        "scheduler to report insufficient ephemeral storage",
        EVICTION_TIMEOUT,
        EVICTION_INTERVAL,
        || json_path(&cli, &pod, r#"{.status.conditions[?(@.type=="PodScheduled")].message}"#),
        |message| message.contains("Insufficient ephemeral-storage"),
    )
    .await?;
    wait::consistently(
        "pod to stay pending",
        Duration::from_secs(60),
        Duration::from_secs(10),
        || async {
            get_pod_status(&cli, &pod.namespace, &pod.name)
                .await
                .unwrap_or_default()
        },
        |status| status == "Pending",
    )
    .await?;
    Ok(())
}

/// A LimitRange rejects out-of-bounds pods and fills in defaults.
pub(super) async fn limit_range(cli: Cli, cleanup: Cleanup) -> Result<()> {
    info!("Create an ephemeral-storage LimitRange");
    let mut limit_range = LimitRange::new()
        .with_type("Container")
        .with_kind("ephemeral-storage")
        .with_default_request("1Gi")
        .with_default_limit("1Gi")
        .with_min("500Mi")
        .with_max("2Gi");
    limit_range.name = format!("ephemeral-limitrange-{}", random_string());
    limit_range.create(&cli).await?;
    {
        let (cli, limit_range) = (cli.clone(), limit_range.clone());
        cleanup.defer("delete limitrange", move || async move {
            limit_range.delete_as_admin(&cli).await;
        });
    }

    // Namespaced up front so the deferred delete targets the project
    let mut pod = ephemeral_pod().with_namespace(cli.namespace());
    defer_delete(&cli, &cleanup, &pod);

    info!("A limit above the LimitRange maximum is rejected");
    let message = pod
        .try_create_with_edits(&cli, &pod_storage("1Gi", "2Gi", "2Gi", "4Gi"))
        .await?;
    let expected = "is forbidden: maximum ephemeral-storage usage per Container is 2Gi, \
                    but limit is 4Gi";
    ensure!(message.contains(expected), "unexpected rejection {message:?}");

    info!("A request below the LimitRange minimum is rejected");
    let message = pod
        .try_create_with_edits(&cli, &pod_storage("1Gi", "2Gi", "400Mi", "400Mi"))
        .await?;
    let expected = "is forbidden: minimum ephemeral-storage usage per Container is 500Mi, \
                    but request is 400Mi";
    ensure!(message.contains(expected), "unexpected rejection {message:?}");

    info!("Without explicit settings the LimitRange defaults apply");
    pod.create(&cli).await?;
    pod.wait_ready(&cli).await?;

    info!("Write 1.5G from container-0, within the 2Gi pod total");
    fallocate(&cli, &pod, 0, "1.5G", "/mnt/storage/testdata_1.5G").await?;
    stays_ready(&cli, &pod).await?;

    info!("Write 1G more from container-1, above the pod total");
    fallocate(&cli, &pod, 1, "1G", "/mnt/storage/testdata_1G").await?;
    wait_evicted(
        &cli,
        &pod,
        &format!("{POD_TOTAL_LIMIT_EXCEEDED} 2Gi."),
    )
    .await
}

async fn wait_quota_used(
    cli: &Cli,
    quota: &ResourceQuota,
    kind: &str,
    expected: &str,
    timeout: Duration,
) -> Result<()> {
    let path = format!(r"{{.status.used.{kind}\.ephemeral-storage}}");
    wait::eventually(
        &format!("quota {kind} usage to be {expected}"),
        timeout,
        Duration::from_secs(10),
        || async {
            quota
                .get_value_by_json_path(cli, &path)
                .await
                .unwrap_or_default()
        },
        |used| used == expected,
    )
    .await?;
    Ok(())
}

/// A ResourceQuota rejects pods over its hard limits, accounts admitted
/// pods and releases their usage once they are evicted.
pub(super) async fn resource_quota(cli: Cli, cleanup: Cleanup) -> Result<()> {
    info!("Create an ephemeral-storage ResourceQuota");
    let mut quota = ResourceQuota::new()
        .with_type("ephemeral-storage")
        .with_hard_requests("6Gi")
        .with_hard_limits("6Gi");
    quota.name = format!("ephemeral-resourcequota-{}", random_string());
    quota.create(&cli).await?;
    {
        let (cli, quota) = (cli.clone(), quota.clone());
        cleanup.defer("delete resourcequota", move || async move {
            quota.delete_as_admin(&cli).await;
        });
    }

    // Namespaced up front so the deferred delete targets the project
    let mut pod = ephemeral_pod().with_namespace(cli.namespace());
    defer_delete(&cli, &cleanup, &pod);

    info!("Limits above the quota are rejected");
    let message = pod
        .try_create_with_edits(&cli, &pod_storage("2Gi", "2Gi", "1Gi", "5Gi"))
        .await?;
    let expected = format!(
        "is forbidden: exceeded quota: {}, requested: limits.ephemeral-storage=7Gi, \
         used: limits.ephemeral-storage=0, limited: limits.ephemeral-storage=6Gi",
        quota.name
    );
    ensure!(message.contains(&expected), "unexpected rejection {message:?}");

    info!("Requests and limits above the quota are rejected");
    let message = pod
        .try_create_with_edits(&cli, &pod_storage("2Gi", "2Gi", "5Gi", "5Gi"))
        .await?;
    let expected = format!(
        "is forbidden: exceeded quota: {}, \
         requested: limits.ephemeral-storage=7Gi,requests.ephemeral-storage=7Gi, \
         used: limits.ephemeral-storage=0,requests.ephemeral-storage=0, \
         limited: limits.ephemeral-storage=6Gi,requests.ephemeral-storage=6Gi",
        quota.name
    );
    ensure!(message.contains(&expected), "unexpected rejection {message:?}");

    info!("A pod within the quota is admitted");
    let container_1 = random_num(1, 4);
    let total = container_1 + 2;
    let container_1 = format!("{container_1}Gi");
    pod.create_with_edits(&cli, &pod_storage("2Gi", "2Gi", &container_1, &container_1))
        .await?;
    pod.wait_ready(&cli).await?;

    info!("Check the quota accounts the pod");
    let total_gi = format!("{total}Gi");
    wait_quota_used(&cli, &quota, "requests", &total_gi, Duration::from_secs(60)).await?;
    wait_quota_used(&cli, &quota, "limits", &total_gi, Duration::from_secs(60)).await?;

    info!("Write beyond the pod total and check the usage is released after eviction");
    fallocate(&cli, &pod, 0, &format!("{}G", total + 2), "/mnt/storage/testdata").await?;
    let message = format!("{POD_TOTAL_LIMIT_EXCEEDED} {total}Gi.");
    wait_evicted(&cli, &pod, &message).await?;
    wait_quota_used(&cli, &quota, "requests", "0", EVICTION_TIMEOUT).await?;
    wait_quota_used(&cli, &quota, "limits", "0", EVICTION_TIMEOUT).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use e2e_util::testing::ScriptedRunner;
    use e2e_util::CommandOutput;
    use serde_json::Value;

    use super::*;
    use crate::scenarios::skip_reason;

    fn control_plane_node(name: &str) -> Value {
        json!({
            "metadata": {
                "name": name,
                "labels": {"node-role.kubernetes.io/master": "", "kubernetes.io/os": "linux"}
            },
            "status": {
                "conditions": [{"type": "Ready", "status": "True"}],
                "capacity": {"ephemeral-storage": "125293548Ki"},
                "allocatable": {"ephemeral-storage": "114396791822"}
            }
        })
    }

    #[tokio::test]
    async fn test_scheduling_requests_skips_without_workers() {
        let nodes = json!({
            "items": [control_plane_node("master-0"), control_plane_node("master-1")]
        });
        let runner = Arc::new(
            ScriptedRunner::new().on("get nodes -o json", CommandOutput::ok(nodes.to_string())),
        );
        let cli = runner.clone().into_cli("ns1");

        let err = scheduling_requests(cli, Cleanup::new()).await.unwrap_err();
        assert_eq!(skip_reason(&err), Some("no schedulable linux workers"));
        assert!(runner.calls_matching("apply").is_empty());
    }

    #[test]
    fn test_pod_storage_edits() {
        let edits = pod_storage("1Gi", "2Gi", "2Gi", "4Gi");
        assert_eq!(edits.len(), 4);
        assert_eq!(
            edits[3],
            JsonEdit::set(
                "items.0.spec.containers.1.resources.limits.",
                json!({ "ephemeral-storage": "4Gi" })
            )
        );
    }

    #[test]
    fn test_edits_apply_to_two_container_pod() {
        let mut doc = json!({
            "kind": "List",
            "items": [{
                "spec": {
                    "containers": [
                        {"name": "c0", "volumeMounts": [{"name": "data"}]},
                        {"name": "c1", "volumeMounts": [{"name": "data"}]},
                    ],
                    "volumes": [{"name": "data", "emptyDir": {}}],
                }
            }]
        });
        let mut edits = vec![storage(0, "limits", "2Gi")];
        edits.extend(without_volumes());
        e2e_util::jsonpath::apply_edits(&mut doc, &edits).unwrap();
        let spec = &doc["items"][0]["spec"];
        assert_eq!(spec["containers"][0]["resources"]["limits"]["ephemeral-storage"], "2Gi");
        assert_eq!(spec["containers"][0].get("volumeMounts"), None);
        assert_eq!(spec["containers"][1].get("volumeMounts"), None);
        assert_eq!(spec.get("volumes"), None::<&Value>);
    }
}
