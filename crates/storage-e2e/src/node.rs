//! Node inventory and on-node command execution.

use std::collections::BTreeMap;
use std::time::Duration;

use e2e_util::wait::poll;
use e2e_util::{Cli, E2eError, E2eResult};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cluster::get_node_name_by_pod;
use crate::cluster::get_pods_list_by_label;
use crate::consts::BASE_FEDORA_IMAGE;

const ROLE_LABEL_PREFIX: &str = "node-role.kubernetes.io/";
const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
const EBS_ZONE_LABEL: &str = "topology.ebs.csi.aws.com/zone";
const OS_LABEL: &str = "kubernetes.io/os";
const OS_ID_LABEL: &str = "node.openshift.io/os_id";
const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
const EPHEMERAL_STORAGE: &str = "ephemeral-storage";

const NODE_EXEC_RETRY_INTERVAL: Duration = Duration::from_secs(10);
const NODE_EXEC_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Scheduling-relevant facts about one cluster node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub instance_id: String,
    pub instance_type: String,
    pub zone: String,
    pub os_type: String,
    pub os_id: String,
    pub os_image: String,
    pub roles: Vec<String>,
    pub schedulable: bool,
    /// `True`, `False` or `Unknown` (powered off or disconnected).
    pub ready_status: String,
    pub architecture: String,
    pub allocatable_ephemeral_storage: String,
    pub ephemeral_storage_capacity: String,
    pub has_no_schedule_taints: bool,
}

impl NodeInfo {
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    fn is_usable_worker(&self) -> bool {
        self.schedulable
            && self.has_role("worker")
            && !self.has_role("infra")
            && !self.has_role("edge")
            && !self.has_no_schedule_taints
            && self.ready_status == "True"
    }
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        let labels = node.metadata.labels.clone().unwrap_or_default();
        let label = |key: &str| labels.get(key).cloned().unwrap_or_default();

        let roles = labels
            .keys()
            .filter_map(|key| key.strip_prefix(ROLE_LABEL_PREFIX))
            .map(str::to_string)
            .collect();
        let zone = labels
            .get(ZONE_LABEL)
            .or_else(|| labels.get(EBS_ZONE_LABEL))
            .cloned()
            .unwrap_or_default();

        let spec = node.spec.clone().unwrap_or_default();
        let status = node.status.clone().unwrap_or_default();
        let ready_status = status
            .conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|c| c.type_ == "Ready")
            .map(|c| c.status.clone())
            .unwrap_or_default();
        let node_info = status.node_info.clone().unwrap_or_default();
        // PreferNoSchedule taints are tolerated
        let has_no_schedule_taints = spec
            .taints
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|t| t.effect == "NoSchedule");

        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            instance_id: spec
                .provider_id
                .as_deref()
                .and_then(|id| id.rsplit('/').next())
                .unwrap_or_default()
                .to_string(),
            instance_type: label(INSTANCE_TYPE_LABEL),
            zone,
            os_type: label(OS_LABEL),
            os_id: label(OS_ID_LABEL),
            os_image: node_info.os_image,
            roles,
            schedulable: !spec.unschedulable.unwrap_or(false),
            ready_status,
            architecture: node_info.architecture,
            allocatable_ephemeral_storage: ephemeral(status.allocatable.as_ref()),
            ephemeral_storage_capacity: ephemeral(status.capacity.as_ref()),
            has_no_schedule_taints,
        }
    }
}

fn ephemeral(quantities: Option<&BTreeMap<String, Quantity>>) -> String {
    quantities
        .and_then(|q| q.get(EPHEMERAL_STORAGE))
        .map(|q| q.0.clone())
        .unwrap_or_default()
}

/// Parse the output of `get nodes -o json`.
///
/// # Errors
///
/// Returns `Json` when the document or one of its nodes is malformed.
pub fn parse_nodes(nodes_json: &str) -> E2eResult<Vec<NodeInfo>> {
    let mut doc: Value = serde_json::from_str(nodes_json)?;
    let items: Vec<Node> = serde_json::from_value(doc["items"].take())?;
    Ok(items.iter().map(NodeInfo::from).collect())
}

/// Every node in the cluster.
///
/// # Errors
///
/// Returns the CLI failure or a parse error.
pub async fn get_all_nodes_info(cli: &Cli) -> E2eResult<Vec<NodeInfo>> {
    let nodes_json = cli
        .as_admin()
        .without_namespace()
        .run("get")
        .args(["nodes", "-o", "json"])
        .output()
        .await?;
    let nodes = parse_nodes(&nodes_json)?;
    debug!(count = nodes.len(), ?nodes, "Cluster nodes");
    for node in nodes.iter().filter(|n| n.has_role("worker") && n.has_no_schedule_taints) {
        info!(node = %node.name, "Worker has NoSchedule taints");
    }
    Ok(nodes)
}

/// Ready, untainted linux workers. A single-node cluster yields its node.
#[must_use]
pub fn schedulable_linux_workers(all: &[NodeInfo]) -> Vec<NodeInfo> {
    if all.len() == 1 {
        return all.to_vec();
    }
    all.iter()
        .filter(|n| n.os_type == "linux" && n.is_usable_worker())
        .cloned()
        .collect()
}

/// Same as [`schedulable_linux_workers`] restricted to RHEL nodes.
#[must_use]
pub fn schedulable_rhel_workers(all: &[NodeInfo]) -> Vec<NodeInfo> {
    if all.len() == 1 {
        return all.to_vec();
    }
    all.iter()
        .filter(|n| n.os_id == "rhel" && n.is_usable_worker())
        .cloned()
        .collect()
}

/// One schedulable worker, RHEL workers first.
#[must_use]
pub fn one_schedulable_worker(all: &[NodeInfo]) -> Option<NodeInfo> {
    let worker = schedulable_rhel_workers(all)
        .into_iter()
        .next()
        .or_else(|| schedulable_linux_workers(all).into_iter().next());
    debug!(?worker, "Selected schedulable worker");
    worker
}

/// Names of the nodes carrying the worker role.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn workers_list(cli: &Cli) -> E2eResult<Vec<String>> {
    let output = cli
        .as_admin()
        .without_namespace()
        .run("get")
        .args([
            "nodes",
            "-l",
            "node-role.kubernetes.io/worker",
            "-o=jsonpath={.items[*].metadata.name}",
        ])
        .output()
        .await?;
    Ok(output.split_whitespace().map(str::to_string).collect())
}

/// Nodes hosting the pods that match `selector`.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn get_node_list_for_pod_by_label(
    cli: &Cli,
    namespace: &str,
    selector: &str,
) -> E2eResult<Vec<String>> {
    let mut nodes = Vec::new();
    for pod in get_pods_list_by_label(cli, namespace, selector).await? {
        nodes.push(get_node_name_by_pod(cli, namespace, &pod).await?);
    }
    Ok(nodes)
}

/// Debug-pod output: stdout alone when stderr only carries a warning,
/// otherwise stderr and stdout joined.
fn node_exec_output(stdout: &str, stderr: &str) -> String {
    if stderr.to_lowercase().contains("warning") {
        stdout.trim().to_string()
    } else {
        format!("{stderr}\n{stdout}").trim().to_string()
    }
}

/// Run `command` on the host of `node` through a debug pod.
///
/// Debug pod creation is flaky, so failures are retried every 10s for up to
/// 30s.
///
/// # Errors
///
/// Returns the last CLI failure.
pub async fn exec_command_in_specific_node(
    cli: &Cli,
    node: &str,
    command: &str,
) -> E2eResult<String> {
    let admin = cli.as_admin();
    let mut args = vec![format!("node/{node}"), "-q".to_string()];
    if admin.is_openshift() {
        if admin.namespace().is_empty() {
            args.push("--to-namespace=default".to_string());
        }
    } else {
        args.extend([
            "--profile=sysadmin".to_string(),
            "--attach=true".to_string(),
            format!("--image={BASE_FEDORA_IMAGE}"),
        ]);
    }
    args.extend(
        ["--", "chroot", "/host", "/bin/sh", "-c", command]
            .iter()
            .map(|s| (*s).to_string()),
    );

    let deadline = Instant::now() + NODE_EXEC_RETRY_TIMEOUT;
    loop {
        match admin.run("debug").args(&args).outputs().await {
            Ok((stdout, stderr)) => {
                let output = node_exec_output(&stdout, &stderr);
                debug!(node, command, output = %output, "Executed on node");
                return Ok(output);
            }
            Err(e) if Instant::now() + NODE_EXEC_RETRY_INTERVAL <= deadline => {
                warn!(node, command, error = %e, "Node exec failed, retrying");
                sleep(NODE_EXEC_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether the cluster runs in FIPS mode, judged from the first linux worker.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn check_fips(cli: &Cli) -> E2eResult<bool> {
    let node = cli
        .as_admin()
        .without_namespace()
        .run("get")
        .args([
            "node",
            "--selector=node-role.kubernetes.io/worker,kubernetes.io/os=linux",
            "-o=jsonpath={.items[0].metadata.name}",
        ])
        .output()
        .await?;
    let output = exec_command_in_specific_node(cli, &node, "fips-mode-setup --check").await?;
    let enabled = !output.contains("FIPS mode is disabled.");
    info!(node = %node, enabled, "Checked FIPS mode");
    Ok(enabled)
}

/// Wait until `mount` on the node lists the volume.
///
/// # Errors
///
/// Returns `WaitTimeout` after 60 seconds.
pub async fn check_volume_mount_on_node(cli: &Cli, volume: &str, node: &str) -> E2eResult<()> {
    let command = format!("mount | grep {volume}");
    poll(
        &format!("volume {volume} mounted on node {node}"),
        Duration::from_secs(10),
        Duration::from_secs(60),
        || async { Ok(exec_command_in_specific_node(cli, node, &command).await.is_ok()) },
    )
    .await
}

/// Wait until the node's `mount` entry for the volume contains `content`,
/// typically its filesystem type.
///
/// # Errors
///
/// Returns `WaitTimeout` after 60 seconds.
pub async fn check_volume_mount_cmd_contain(
    cli: &Cli,
    volume: &str,
    node: &str,
    content: &str,
) -> E2eResult<()> {
    let command = format!("mount | grep {volume}");
    poll(
        &format!("volume {volume} mount on node {node} to contain {content:?}"),
        Duration::from_secs(10),
        Duration::from_secs(60),
        || async {
            match exec_command_in_specific_node(cli, node, &command).await {
                Ok(output) => Ok(output.contains(content)),
                Err(e) => {
                    warn!(node, error = %e, "Node mount check failed, trying again");
                    Ok(false)
                }
            }
        },
    )
    .await
}

/// Cordon `node` and evict the pods labelled `app=<app_label>` from it.
///
/// # Errors
///
/// Returns the CLI failure, including a drain that outlives its 600s
/// timeout.
pub async fn drain_node_with_pod_label(cli: &Cli, node: &str, app_label: &str) -> E2eResult<()> {
    let target = format!("nodes/{node}");
    let selector = format!("app={app_label}");
    info!(node, selector = %selector, "Draining node");
    cli.as_admin()
        .without_namespace()
        .run("adm")
        .args([
            "drain",
            target.as_str(),
            "--pod-selector",
            selector.as_str(),
            "--ignore-daemonsets",
            "--delete-emptydir-data",
            "--force",
            "--timeout=600s",
        ])
        .execute()
        .await
}

/// Mark `node` schedulable again.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn uncordon_specific_node(cli: &Cli, node: &str) -> E2eResult<()> {
    info!(node, "Uncordoning node");
    cli.as_admin()
        .without_namespace()
        .run("adm")
        .args(["uncordon", &format!("nodes/{node}")])
        .execute()
        .await
}

async fn wait_count_zero(
    cli: &Cli,
    node: &str,
    command: &str,
    what: &str,
    timeout: Duration,
) -> E2eResult<()> {
    poll(what, Duration::from_secs(10), timeout, || async {
        match exec_command_in_specific_node(cli, node, command).await {
            Ok(count) => Ok(count == "0"),
            Err(e) => {
                warn!(node, error = %e, "Node check failed, trying again");
                Ok(false)
            }
        }
    })
    .await
}

/// Wait until no mount on the node references the volume.
///
/// # Errors
///
/// Returns `WaitTimeout` after 180 seconds.
pub async fn check_volume_not_mount_on_node(
    cli: &Cli,
    volume: &str,
    node: &str,
) -> E2eResult<()> {
    wait_count_zero(
        cli,
        node,
        &format!("mount | grep -c \"{volume}\" || true"),
        &format!("volume {volume} unmounted from node {node}"),
        Duration::from_secs(180),
    )
    .await?;
    info!(volume, node, "Volume unmounted from node");
    Ok(())
}

/// Wait until `lsblk` on the node no longer shows the volume.
///
/// # Errors
///
/// Returns `WaitTimeout` after 120 seconds.
pub async fn check_volume_detached_from_node(
    cli: &Cli,
    volume: &str,
    node: &str,
) -> E2eResult<()> {
    wait_count_zero(
        cli,
        node,
        &format!("lsblk | grep -c \"{volume}\" || true"),
        &format!("volume {volume} detached from node {node}"),
        Duration::from_secs(120),
    )
    .await?;
    info!(volume, node, "Volume detached from node");
    Ok(())
}

/// Largest allocatable ephemeral storage among the nodes, in bytes.
///
/// # Errors
///
/// Returns an assertion error when a node does not report it.
pub fn max_allocatable_ephemeral_storage(nodes: &[NodeInfo]) -> E2eResult<i64> {
    let mut max = 0;
    for node in nodes {
        let bytes = crate::quantity::parse_capacity_to_bytes(&node.allocatable_ephemeral_storage)
            .map_err(|e| {
                E2eError::assertion(format!(
                    "node {} allocatable ephemeral storage: {e}",
                    node.name
                ))
            })?;
        max = max.max(bytes);
    }
    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2e_util::testing::ScriptedRunner;
    use e2e_util::CommandOutput;
    use serde_json::json;
    use std::sync::Arc;

    fn node_json(
        name: &str,
        labels: Value,
        unschedulable: bool,
        ready: &str,
        taints: Value,
    ) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {"name": name, "labels": labels},
            "spec": {
                "providerID": format!("aws:///us-east-2a/i-{name}"),
                "unschedulable": unschedulable,
                "taints": taints
            },
            "status": {
                "conditions": [{"type": "Ready", "status": ready}],
                "capacity": {"ephemeral-storage": "125293548Ki"},
                "allocatable": {"ephemeral-storage": "114396791822"},
                "nodeInfo": {
                    "architecture": "amd64",
                    "bootID": "", "containerRuntimeVersion": "", "kernelVersion": "",
                    "kubeProxyVersion": "", "kubeletVersion": "", "machineID": "",
                    "operatingSystem": "linux", "osImage": "Red Hat Enterprise Linux CoreOS",
                    "systemUUID": ""
                }
            }
        })
    }

    fn worker_labels(os_id: &str) -> Value {
        json!({
            "node-role.kubernetes.io/worker": "",
            "kubernetes.io/os": "linux",
            "node.openshift.io/os_id": os_id,
            "topology.kubernetes.io/zone": "us-east-2a",
            "node.kubernetes.io/instance-type": "m6i.xlarge"
        })
    }

    fn nodes_list(items: Vec<Value>) -> String {
        json!({"apiVersion": "v1", "kind": "List", "items": items}).to_string()
    }

    #[test]
    fn test_parse_node_fields() {
        let nodes = parse_nodes(&nodes_list(vec![node_json(
            "w1",
            worker_labels("rhcos"),
            false,
            "True",
            json!([{"key": "UpdateInProgress", "effect": "PreferNoSchedule"}]),
        )]))
        .unwrap();
        let node = &nodes[0];
        assert_eq!(node.name, "w1");
        assert_eq!(node.roles, vec!["worker"]);
        assert_eq!(node.zone, "us-east-2a");
        assert_eq!(node.instance_id, "i-w1");
        assert_eq!(node.instance_type, "m6i.xlarge");
        assert_eq!(node.ready_status, "True");
        assert!(node.schedulable);
        assert!(!node.has_no_schedule_taints);
        assert_eq!(node.ephemeral_storage_capacity, "125293548Ki");
        assert_eq!(node.allocatable_ephemeral_storage, "114396791822");
        assert_eq!(node.architecture, "amd64");
    }

    #[test]
    fn test_zone_falls_back_to_ebs_label() {
        let labels = json!({"topology.ebs.csi.aws.com/zone": "us-east-2b"});
        let nodes =
            parse_nodes(&nodes_list(vec![node_json("n", labels, false, "True", json!([]))]))
                .unwrap();
        assert_eq!(nodes[0].zone, "us-east-2b");
    }

    #[test]
    fn test_worker_selection_filters() {
        let mut infra = worker_labels("rhcos");
        infra["node-role.kubernetes.io/infra"] = json!("");
        let master_labels =
            json!({"node-role.kubernetes.io/master": "", "kubernetes.io/os": "linux"});
        let no_schedule = json!([{"key": "k", "effect": "NoSchedule"}]);
        let nodes = parse_nodes(&nodes_list(vec![
            node_json("master", master_labels, false, "True", json!([])),
            node_json("cordoned", worker_labels("rhcos"), true, "True", json!([])),
            node_json("tainted", worker_labels("rhcos"), false, "True", no_schedule),
            node_json("infra", infra, false, "True", json!([])),
            node_json("down", worker_labels("rhcos"), false, "Unknown", json!([])),
            node_json("good", worker_labels("rhcos"), false, "True", json!([])),
            node_json("rhel", worker_labels("rhel"), false, "True", json!([])),
        ]))
        .unwrap();
        let names: Vec<_> = schedulable_linux_workers(&nodes).into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["good", "rhel"]);
        assert_eq!(one_schedulable_worker(&nodes).unwrap().name, "rhel");
    }

    #[test]
    fn test_single_node_cluster_is_its_own_worker() {
        let nodes = parse_nodes(&nodes_list(vec![node_json(
            "sno",
            json!({"node-role.kubernetes.io/master": ""}),
            false,
            "True",
            json!([{"key": "k", "effect": "NoSchedule"}]),
        )]))
        .unwrap();
        assert_eq!(schedulable_linux_workers(&nodes).len(), 1);
        assert_eq!(one_schedulable_worker(&nodes).unwrap().name, "sno");
    }

    #[test]
    fn test_node_exec_output_drops_warnings() {
        assert_eq!(node_exec_output("0\n", "Warning: would violate PodSecurity"), "0");
        assert_eq!(node_exec_output("out", "Starting pod"), "Starting pod\nout");
        assert_eq!(node_exec_output("1", ""), "1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_not_mount_polls_until_zero() {
        let runner = Arc::new(ScriptedRunner::new().on_sequence(
            "node/worker-0",
            vec![CommandOutput::ok("1"), CommandOutput::ok("0")],
        ));
        let cli = runner.clone().into_cli("ns");
        check_volume_not_mount_on_node(&cli, "pvc-123", "worker-0")
            .await
            .unwrap();
        let calls = runner.calls_matching("debug");
        assert_eq!(calls.len(), 2);
        assert!(calls[0]
            .ends_with("-- chroot /host /bin/sh -c mount | grep -c \"pvc-123\" || true"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_detached_polls_lsblk() {
        let runner = Arc::new(ScriptedRunner::new().on_sequence(
            "lsblk",
            vec![CommandOutput::ok("1"), CommandOutput::ok("1"), CommandOutput::ok("0")],
        ));
        let cli = runner.clone().into_cli("ns");
        check_volume_detached_from_node(&cli, "vol-0abc", "worker-1")
            .await
            .unwrap();
        let calls = runner.calls_matching("node/worker-1");
        assert_eq!(calls.len(), 3);
        assert!(calls[2]
            .ends_with("-- chroot /host /bin/sh -c lsblk | grep -c \"vol-0abc\" || true"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_detached_times_out_while_attached() {
        let runner = Arc::new(ScriptedRunner::new().on("lsblk", CommandOutput::ok("1")));
        let cli = runner.clone().into_cli("ns");
        let err = check_volume_detached_from_node(&cli, "vol-0abc", "worker-1")
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::WaitTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_cmd_contain_waits_for_content() {
        let runner = Arc::new(ScriptedRunner::new().on_sequence(
            "mount | grep pvc-123",
            vec![
                CommandOutput::failed("grep: no match"),
                CommandOutput::ok("/dev/sdb on /var/lib/kubelet/pods/x/pvc-123 type ext4 (rw)"),
            ],
        ));
        let cli = runner.clone().into_cli("ns");
        check_volume_mount_cmd_contain(&cli, "pvc-123", "worker-0", "ext4")
            .await
            .unwrap();
        assert!(runner.calls_matching("debug node/worker-0").len() >= 2);
    }

    #[tokio::test]
    async fn test_drain_and_uncordon_commands() {
        let runner = Arc::new(ScriptedRunner::new());
        let cli = runner.clone().into_cli("ns");
        drain_node_with_pod_label(&cli, "worker-0", "myapp").await.unwrap();
        uncordon_specific_node(&cli, "worker-0").await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "adm drain nodes/worker-0 --pod-selector app=myapp --ignore-daemonsets \
                 --delete-emptydir-data --force --timeout=600s",
                "adm uncordon nodes/worker-0",
            ]
        );
    }

    #[tokio::test]
    async fn test_check_fips() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("kubernetes.io/os=linux", CommandOutput::ok("worker-0"))
                .on("fips-mode-setup --check", CommandOutput::ok("FIPS mode is disabled.")),
        );
        let cli = runner.clone().into_cli("ns");
        assert!(!check_fips(&cli).await.unwrap());
        assert_eq!(runner.calls_matching("node/worker-0").len(), 1);
    }

    #[test]
    fn test_max_allocatable() {
        let node = |name: &str, allocatable: &str| NodeInfo {
            name: name.to_string(),
            allocatable_ephemeral_storage: allocatable.to_string(),
            ..Default::default()
        };
        let nodes = vec![node("a", "10Gi"), node("b", "114396791822")];
        assert_eq!(max_allocatable_ephemeral_storage(&nodes).unwrap(), 114_396_791_822);
    }
}
