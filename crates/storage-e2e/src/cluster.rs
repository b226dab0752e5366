//! Cluster-level helpers shared by resources and scenarios.

use std::time::Duration;

use e2e_util::wait::{interval_for, poll};
use e2e_util::{jsonpath, Cli, E2eError, E2eResult};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::consts::{
    DEFAULT_MAX_WAITING_TIME, EXEC_RETRY_INTERVAL, EXEC_RETRY_TIMEOUT, TRANSIENT_EXEC_ERRORS,
};

fn is_transient_exec_error(err: &E2eError) -> bool {
    let output = err.output();
    TRANSIENT_EXEC_ERRORS
        .iter()
        .any(|fragment| output.contains(fragment))
}

async fn exec_with_retry(cli: &Cli, args: Vec<String>) -> E2eResult<String> {
    let deadline = Instant::now() + EXEC_RETRY_TIMEOUT;
    loop {
        let result = cli.without_namespace().run("exec").args(&args).output().await;
        let retry = Instant::now() + EXEC_RETRY_INTERVAL <= deadline;
        match result {
            Ok(output) => return Ok(output),
            Err(e) if retry && is_transient_exec_error(&e) => {
                warn!(error = %e, "Transient exec failure, retrying");
                sleep(EXEC_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run `command` through `/bin/sh -c` in the pod's default container.
///
/// # Errors
///
/// Returns the CLI failure; its output carries the command's stderr.
pub async fn exec_command_in_specific_pod(
    cli: &Cli,
    namespace: &str,
    pod: &str,
    command: &str,
) -> E2eResult<String> {
    let output = exec_with_retry(
        cli,
        vec![
            "-n".to_string(),
            namespace.to_string(),
            pod.to_string(),
            "--".to_string(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ],
    )
    .await?;
    debug!(pod, command, output = %output, "Executed in pod");
    Ok(output)
}

/// Run `command` in a named container of the pod.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn exec_command_in_specified_container(
    cli: &Cli,
    namespace: &str,
    pod: &str,
    container: &str,
    command: &str,
) -> E2eResult<String> {
    exec_with_retry(
        cli,
        vec![
            "-n".to_string(),
            namespace.to_string(),
            pod.to_string(),
            "-c".to_string(),
            container.to_string(),
            "--".to_string(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ],
    )
    .await
}

fn target_args(kind: &str, name: &str, namespace: &str) -> Vec<String> {
    let mut args = vec![kind.to_string()];
    if name.is_empty() {
        args.push("--all".to_string());
    } else {
        args.push(name.to_string());
    }
    if !namespace.is_empty() {
        args.push("-n".to_string());
        args.push(namespace.to_string());
    }
    args
}

/// Delete `kind/name` as admin, ignoring a missing object, and log failures.
pub async fn delete_best_effort(cli: &Cli, kind: &str, name: &str, namespace: &str) {
    let result = cli
        .as_admin()
        .without_namespace()
        .run("delete")
        .args(target_args(kind, name, namespace))
        .arg("--ignore-not-found")
        .execute()
        .await;
    if let Err(e) = result {
        warn!(kind, name, namespace, error = %e, "Cleanup delete failed");
    }
}

/// Delete and wait until the object is gone. An empty name deletes all
/// objects of `kind` in the namespace.
///
/// # Errors
///
/// Returns an error if the delete fails or the object lingers.
pub async fn delete_specified_resource(
    cli: &Cli,
    kind: &str,
    name: &str,
    namespace: &str,
) -> E2eResult<()> {
    cli.as_admin()
        .without_namespace()
        .run("delete")
        .args(target_args(kind, name, namespace))
        .arg("--ignore-not-found")
        .execute()
        .await?;
    check_resources_not_exist(cli, kind, name, namespace).await
}

/// Poll until `get` reports nothing for the object.
///
/// # Errors
///
/// Returns `WaitTimeout` if the object is still there after the default
/// wait.
pub async fn check_resources_not_exist(
    cli: &Cli,
    kind: &str,
    name: &str,
    namespace: &str,
) -> E2eResult<()> {
    let admin = cli.as_admin().without_namespace();
    let mut args = vec![kind.to_string()];
    if !name.is_empty() {
        args.push(name.to_string());
    }
    if !namespace.is_empty() {
        args.push("-n".to_string());
        args.push(namespace.to_string());
    }
    args.extend(["--ignore-not-found".to_string(), "-o".to_string(), "name".to_string()]);
    let what = format!("{kind}/{name} in {namespace:?} to be deleted");
    poll(&what, Duration::from_secs(5), DEFAULT_MAX_WAITING_TIME, || {
        let admin = admin.clone();
        let args = args.clone();
        async move {
            let remaining = admin.run("get").args(&args).output().await?;
            Ok(remaining.is_empty())
        }
    })
    .await?;
    info!(kind, name, namespace, "Resource deleted");
    Ok(())
}

/// `patch -p <patch> --type=<patch_type>` as admin, expecting "patched".
///
/// # Errors
///
/// Returns the CLI failure or an assertion error on unexpected output.
pub async fn patch_resource_as_admin(
    cli: &Cli,
    namespace: &str,
    kind_and_name: &str,
    patch: &str,
    patch_type: &str,
) -> E2eResult<()> {
    let mut args = Vec::new();
    if !namespace.is_empty() {
        args.extend(["-n".to_string(), namespace.to_string()]);
    }
    args.extend([
        kind_and_name.to_string(),
        "-p".to_string(),
        patch.to_string(),
        format!("--type={patch_type}"),
    ]);
    let output = cli
        .as_admin()
        .without_namespace()
        .run("patch")
        .args(args)
        .output()
        .await?;
    if !output.contains("patched") {
        return Err(E2eError::assertion(format!(
            "patch of {kind_and_name} returned {output:?}"
        )));
    }
    Ok(())
}

/// `.status.phase` of a pod.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn get_pod_status(cli: &Cli, namespace: &str, pod: &str) -> E2eResult<String> {
    let status = cli
        .without_namespace()
        .run("get")
        .args(["pod", "-n", namespace, pod, "-o=jsonpath={.status.phase}"])
        .output()
        .await?;
    debug!(pod, namespace, status = %status, "Pod status");
    Ok(status)
}

/// Whether the pod phase is Running, Ready or Complete.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn check_pod_ready(cli: &Cli, namespace: &str, pod: &str) -> E2eResult<bool> {
    let status = get_pod_status(cli, namespace, pod).await?;
    Ok(matches!(status.as_str(), "Running" | "Ready" | "Complete"))
}

/// Poll until the pod is ready, within the default wait.
///
/// # Errors
///
/// Returns `WaitTimeout` or the CLI failure.
pub async fn wait_pod_ready(cli: &Cli, namespace: &str, pod: &str) -> E2eResult<()> {
    poll(
        &format!("pod {namespace}/{pod} to become ready"),
        interval_for(DEFAULT_MAX_WAITING_TIME),
        DEFAULT_MAX_WAITING_TIME,
        || check_pod_ready(cli, namespace, pod),
    )
    .await
}

/// `describe pod` text; failures are folded into the returned text.
pub async fn describe_pod(cli: &Cli, namespace: &str, pod: &str) -> String {
    cli.without_namespace()
        .run("describe")
        .args(["pod", "-n", namespace, pod])
        .output()
        .await
        .unwrap_or_else(|e| e.output())
}

/// `describe pvc` text; failures are folded into the returned text.
pub async fn describe_persistent_volume_claim(cli: &Cli, namespace: &str, pvc: &str) -> String {
    cli.without_namespace()
        .run("describe")
        .args(["pvc", "-n", namespace, pvc])
        .output()
        .await
        .unwrap_or_else(|e| e.output())
}

/// Node the pod is scheduled on.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn get_node_name_by_pod(cli: &Cli, namespace: &str, pod: &str) -> E2eResult<String> {
    let node = cli
        .without_namespace()
        .run("get")
        .args(["pod", pod, "-n", namespace, "-o=jsonpath={.spec.nodeName}"])
        .output()
        .await?;
    debug!(pod, namespace, node = %node, "Pod node");
    Ok(node)
}

/// Names of pods matching a label selector.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn get_pods_list_by_label(
    cli: &Cli,
    namespace: &str,
    selector: &str,
) -> E2eResult<Vec<String>> {
    let output = cli
        .without_namespace()
        .run("get")
        .args([
            "pod",
            "-n",
            namespace,
            "-l",
            selector,
            "-o=jsonpath={.items[*].metadata.name}",
        ])
        .output()
        .await?;
    Ok(output.split_whitespace().map(str::to_string).collect())
}

/// Poll until the pod's `describe` output contains `message`.
///
/// # Errors
///
/// Returns `WaitTimeout` after 60 seconds.
pub async fn check_msg_exists_in_pod_description(
    cli: &Cli,
    namespace: &str,
    pod: &str,
    message: &str,
) -> E2eResult<()> {
    poll(
        &format!("pod/{pod} description to contain {message:?}"),
        Duration::from_secs(5),
        Duration::from_secs(60),
        || async { Ok(describe_pod(cli, namespace, pod).await.contains(message)) },
    )
    .await
}

/// Lower-cased platform type, e.g. `aws`, `gcp`, `vsphere`.
///
/// OpenShift reports it on the `infrastructure/cluster` object. Elsewhere the
/// scheme of the first node's `providerID` is used.
///
/// # Errors
///
/// Returns the CLI failure if neither source is readable.
pub async fn get_cloud_provider(cli: &Cli) -> E2eResult<String> {
    let admin = cli.as_admin().without_namespace();
    let platform = admin
        .run("get")
        .args([
            "infrastructure",
            "cluster",
            "-o=jsonpath={.status.platformStatus.type}",
        ])
        .output()
        .await;
    let provider = match platform {
        Ok(platform) if !platform.is_empty() => platform.to_lowercase(),
        _ => {
            let provider_id = admin
                .run("get")
                .args(["nodes", "-o=jsonpath={.items[0].spec.providerID}"])
                .output()
                .await?;
            provider_id
                .split_once("://")
                .map(|(scheme, _)| scheme)
                .unwrap_or("none")
                .to_lowercase()
        }
    };
    info!(provider = %provider, "Detected cloud provider");
    Ok(provider)
}

/// CSI provisioners a platform ships by default.
#[must_use]
pub fn csi_drivers_for_cloud_provider(provider: &str) -> &'static [&'static str] {
    match provider {
        "aws" => &["ebs.csi.aws.com", "efs.csi.aws.com"],
        "azure" => &["disk.csi.azure.com", "file.csi.azure.com"],
        "gcp" | "gce" => &["pd.csi.storage.gke.io", "filestore.csi.storage.gke.io"],
        "vsphere" => &["csi.vsphere.vmware.com"],
        "alibabacloud" => &["diskplugin.csi.alibabacloud.com"],
        "ibmcloud" => &["vpc.block.csi.ibm.io"],
        _ => &[],
    }
}

/// Names of the `CSIDriver` objects registered in the cluster.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn get_installed_csi_drivers(cli: &Cli) -> E2eResult<Vec<String>> {
    let output = cli
        .as_admin()
        .without_namespace()
        .run("get")
        .args(["csidriver", "-o=jsonpath={.items[*].metadata.name}"])
        .output()
        .await?;
    Ok(output.split_whitespace().map(str::to_string).collect())
}

/// Whether every provisioner in `provisioners` has a registered driver.
pub async fn check_csi_driver_installed(cli: &Cli, provisioners: &[&str]) -> bool {
    for provisioner in provisioners {
        let result = cli
            .as_admin()
            .without_namespace()
            .run("get")
            .args(["csidriver", provisioner])
            .execute()
            .await;
        if let Err(e) = result {
            info!(provisioner, error = %e, "CSI driver not installed");
            return false;
        }
    }
    true
}

/// Value of label `key` on `resource`, e.g. `csidriver/<name>`. Empty when
/// the label is unset.
///
/// # Errors
///
/// Returns the CLI failure.
pub async fn get_resource_label(cli: &Cli, resource: &str, key: &str) -> E2eResult<String> {
    let escaped = key.replace('.', "\\.");
    cli.as_admin()
        .without_namespace()
        .run("get")
        .args([
            resource.to_string(),
            format!("-o=jsonpath={{.metadata.labels.{escaped}}}"),
        ])
        .output()
        .await
}

/// `label --overwrite` as admin with each `key=value` in `labels`.
///
/// # Errors
///
/// Returns the CLI failure, or an assertion error when the output does not
/// confirm the change.
pub async fn add_labels_to_resource(
    cli: &Cli,
    resource: &str,
    labels: &[&str],
) -> E2eResult<()> {
    let output = cli
        .as_admin()
        .without_namespace()
        .run("label")
        .arg(resource)
        .args(labels)
        .arg("--overwrite")
        .output()
        .await?;
    if !output.contains("labeled") {
        return Err(E2eError::assertion(format!(
            "labeling {resource} returned {output:?}"
        )));
    }
    info!(resource, ?labels, "Labeled resource");
    Ok(())
}

/// `major.minor` of the version the cluster is at or updating to.
///
/// # Errors
///
/// Returns the CLI failure, or an assertion error for a malformed version.
pub async fn get_cluster_version(cli: &Cli) -> E2eResult<String> {
    let version = cli
        .as_admin()
        .without_namespace()
        .run("get")
        .args([
            "clusterversion",
            "version",
            "-o=jsonpath={.status.desired.version}",
        ])
        .output()
        .await?;
    let mut parts = version.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) if !major.is_empty() && !minor.is_empty() => {
            Ok(format!("{major}.{minor}"))
        }
        _ => Err(E2eError::assertion(format!(
            "unexpected cluster version {version:?}"
        ))),
    }
}

/// Available, not progressing and not degraded.
///
/// # Errors
///
/// Returns the CLI failure or a parse error.
pub async fn check_co_healthy(cli: &Cli, name: &str) -> E2eResult<bool> {
    let output = cli
        .as_admin()
        .without_namespace()
        .run("get")
        .args(["co", name, "-o", "json"])
        .output()
        .await?;
    let co: Value = serde_json::from_str(&output)?;
    let condition =
        |kind: &str| jsonpath::get_string(&co, &format!("status.conditions.#(type={kind}).status"));
    let (degraded, progressing, available) =
        (condition("Degraded"), condition("Progressing"), condition("Available"));
    debug!(
        operator = name,
        degraded = %degraded,
        progressing = %progressing,
        available = %available,
        "Cluster operator conditions"
    );
    Ok(degraded == "False" && progressing == "False" && available == "True")
}

/// Wait for the `storage` cluster operator to settle after its operands
/// were touched.
///
/// # Errors
///
/// Returns the CLI failure or `WaitTimeout`.
pub async fn wait_cso_healthy(cli: &Cli) -> E2eResult<()> {
    poll(
        "cluster storage operator to become healthy",
        interval_for(DEFAULT_MAX_WAITING_TIME),
        DEFAULT_MAX_WAITING_TIME,
        || check_co_healthy(cli, "storage"),
    )
    .await?;
    info!("Cluster storage operator is healthy");
    Ok(())
}

const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Name of a storage class shipped for `provisioner`, preferring the
/// cluster default.
///
/// # Errors
///
/// Returns the CLI failure or a parse error.
pub async fn get_preset_storage_class_name_by_provisioner(
    cli: &Cli,
    provisioner: &str,
) -> E2eResult<Option<String>> {
    let output = cli
        .as_admin()
        .without_namespace()
        .run("get")
        .args(["storageclass", "-o", "json"])
        .output()
        .await?;
    let list: Value = serde_json::from_str(&output)?;
    let mut candidates: Vec<(bool, String)> = list["items"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter(|sc| sc["provisioner"] == provisioner)
        .filter_map(|sc| {
            let name = sc["metadata"]["name"].as_str()?.to_string();
            let is_default = sc["metadata"]["annotations"][DEFAULT_CLASS_ANNOTATION] == "true";
            Some((is_default, name))
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    let name = candidates.into_iter().next().map(|(_, name)| name);
    debug!(provisioner, storage_class = ?name, "Preset storage class");
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2e_util::testing::ScriptedRunner;
    use e2e_util::CommandOutput;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_exec_retries_transient_errors() {
        let runner = Arc::new(ScriptedRunner::new().on_sequence(
            "mypod -- /bin/sh -c cat /mnt/storage/testfile",
            vec![
                CommandOutput::failed("error dialing backend: EOF"),
                CommandOutput::ok("storage test\n"),
            ],
        ));
        let cli = runner.clone().into_cli("ns");
        let out = exec_command_in_specific_pod(&cli, "ns", "mypod", "cat /mnt/storage/testfile")
            .await
            .unwrap();
        assert_eq!(out, "storage test");
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_does_not_retry_real_failures() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "mypod -- /bin/sh",
            CommandOutput::failed("cat: /mnt/storage/storage.properties: Is a directory"),
        ));
        let cli = runner.clone().into_cli("ns");
        let command = "cat /mnt/storage/storage.properties";
        let err = exec_command_in_specific_pod(&cli, "ns", "mypod", command)
            .await
            .unwrap_err();
        assert!(err.output().contains("Is a directory"));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_exec_in_container_passes_container_flag() {
        let runner = Arc::new(ScriptedRunner::new());
        let cli = runner.clone().into_cli("ns");
        exec_command_in_specified_container(&cli, "ns", "p", "p-container-0", "true")
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec!["exec -n ns p -c p-container-0 -- /bin/sh -c true"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_specified_resource_waits_for_absence() {
        let runner = Arc::new(ScriptedRunner::new().on_sequence(
            "daemonset my-ds -n ns --ignore-not-found -o name",
            vec![CommandOutput::ok("daemonset.apps/my-ds"), CommandOutput::ok("")],
        ));
        let cli = runner.clone().into_cli("ns");
        delete_specified_resource(&cli, "daemonset", "my-ds", "ns")
            .await
            .unwrap();
        assert_eq!(runner.calls_matching("delete daemonset my-ds").len(), 1);
        assert_eq!(runner.calls_matching("-o name").len(), 2);
    }

    #[tokio::test]
    async fn test_empty_name_deletes_all() {
        let runner = Arc::new(ScriptedRunner::new());
        let cli = runner.clone().into_cli("ns");
        delete_best_effort(&cli, "pvc", "", "ns").await;
        assert_eq!(runner.calls(), vec!["delete pvc --all -n ns --ignore-not-found"]);
    }

    #[tokio::test]
    async fn test_check_pod_ready_phases() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("pod -n ns a -o", CommandOutput::ok("Running"))
                .on("pod -n ns b -o", CommandOutput::ok("Pending")),
        );
        let cli = runner.into_cli("ns");
        assert!(check_pod_ready(&cli, "ns", "a").await.unwrap());
        assert!(!check_pod_ready(&cli, "ns", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_patch_expects_patched() {
        let runner = Arc::new(
            ScriptedRunner::new().on("cm/my-cm", CommandOutput::ok("configmap/my-cm patched")),
        );
        let cli = runner.clone().into_cli("ns");
        patch_resource_as_admin(&cli, "ns", "cm/my-cm", "[]", "json")
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec!["patch -n ns cm/my-cm -p [] --type=json"]
        );
    }

    #[tokio::test]
    async fn test_cloud_provider_falls_back_to_provider_id() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on(
                    "infrastructure cluster",
                    CommandOutput::failed(
                        "the server doesn't have a resource type \"infrastructure\"",
                    ),
                )
                .on(
                    "nodes -o=jsonpath",
                    CommandOutput::ok("aws:///us-east-1a/i-0123456789"),
                ),
        );
        let cli = runner.into_cli("ns");
        assert_eq!(get_cloud_provider(&cli).await.unwrap(), "aws");
    }

    #[test]
    fn test_csi_drivers_for_cloud_provider() {
        assert!(csi_drivers_for_cloud_provider("aws").contains(&"ebs.csi.aws.com"));
        assert!(csi_drivers_for_cloud_provider("baremetal").is_empty());
    }

    #[tokio::test]
    async fn test_preset_storage_class_prefers_default() {
        let classes = serde_json::json!({
            "items": [
                {"metadata": {"name": "gp2-csi"}, "provisioner": "ebs.csi.aws.com"},
                {"metadata": {"name": "efs-sc"}, "provisioner": "efs.csi.aws.com"},
                {
                    "metadata": {
                        "name": "gp3-csi",
                        "annotations": {"storageclass.kubernetes.io/is-default-class": "true"}
                    },
                    "provisioner": "ebs.csi.aws.com"
                }
            ]
        });
        let runner = Arc::new(ScriptedRunner::new().on(
            "get storageclass -o json",
            CommandOutput::ok(classes.to_string()),
        ));
        let cli = runner.into_cli("ns");
        assert_eq!(
            get_preset_storage_class_name_by_provisioner(&cli, "ebs.csi.aws.com").await.unwrap(),
            Some("gp3-csi".to_string())
        );
        assert_eq!(
            get_preset_storage_class_name_by_provisioner(&cli, "efs.csi.aws.com").await.unwrap(),
            Some("efs-sc".to_string())
        );
        assert_eq!(
            get_preset_storage_class_name_by_provisioner(&cli, "disk.csi.azure.com").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_label_get_and_set() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("-o=jsonpath=", CommandOutput::ok("restricted\n"))
                .on("label", CommandOutput::ok("csidriver.storage.k8s.io/drv labeled")),
        );
        let cli = runner.clone().into_cli("ns");
        let key = "security.openshift.io/csi-ephemeral-volume-profile";
        let value = get_resource_label(&cli, "csidriver/drv", key).await.unwrap();
        assert_eq!(value, "restricted");
        let label = format!("{key}=privileged");
        add_labels_to_resource(&cli, "csidriver/drv", &[label.as_str()])
            .await
            .unwrap();
        let calls = runner.calls();
        assert_eq!(
            calls[0],
            format!(
                "get csidriver/drv -o=jsonpath={{.metadata.labels.{}}}",
                r"security\.openshift\.io/csi-ephemeral-volume-profile"
            )
        );
        assert_eq!(calls[1], format!("label csidriver/drv {label} --overwrite"));
    }

    #[tokio::test]
    async fn test_label_requires_confirmation() {
        let runner = Arc::new(ScriptedRunner::new().on("label", CommandOutput::ok("")));
        let cli = runner.into_cli("ns");
        assert!(add_labels_to_resource(&cli, "ns/ns", &["a=b"]).await.is_err());
    }

    #[tokio::test]
    async fn test_cluster_version_is_major_minor() {
        let runner = Arc::new(ScriptedRunner::new().on_sequence(
            "{.status.desired.version}",
            vec![CommandOutput::ok("4.14.3\n"), CommandOutput::ok("")],
        ));
        let cli = runner.into_cli("ns");
        assert_eq!(get_cluster_version(&cli).await.unwrap(), "4.14");
        assert!(get_cluster_version(&cli).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cso_healthy_polls_conditions() {
        let co = |degraded: &str, progressing: &str| {
            serde_json::json!({"status": {"conditions": [
                {"type": "Degraded", "status": degraded},
                {"type": "Progressing", "status": progressing},
                {"type": "Available", "status": "True"},
            ]}})
            .to_string()
        };
        let runner = Arc::new(ScriptedRunner::new().on_sequence(
            "get co storage -o json",
            vec![
                CommandOutput::ok(co("False", "True")),
                CommandOutput::ok(co("False", "False")),
            ],
        ));
        let cli = runner.clone().into_cli("ns");
        wait_cso_healthy(&cli).await.unwrap();
        assert_eq!(runner.calls_matching("get co storage").len(), 2);
    }
}
