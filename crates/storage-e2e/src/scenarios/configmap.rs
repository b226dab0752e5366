use std::time::Duration;

use anyhow::{ensure, Context, Result};
use e2e_util::{wait, Cleanup, Cli, JsonEdit};
use serde_json::json;
use tracing::info;

use crate::cluster::{
    delete_specified_resource, exec_command_in_specific_pod, patch_resource_as_admin,
};
use crate::resources::{ConfigMap, Deployment};

/// A configmap key mounted through `subPath` is a snapshot: updates only
/// show up after the pod is recreated, and deleting the workload must not
/// hang.
pub(super) async fn subpath_does_not_hot_update(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let mut cm = ConfigMap::new();
    let mut dep = Deployment::new()
        .with_template("deployment-with-inline-volume-template.yaml")
        .with_mount_path("/mnt/storage/cm.cnf");

    info!("Create configmap");
    cm.create(&cli).await?;
    {
        let (cli, cm) = (cli.clone(), cm.clone());
        cleanup.defer("delete configmap", move || async move { cm.delete_as_admin(&cli).await });
    }

    info!("Create a deployment mounting the configmap through subPath");
    // Only a subPath matching one of the configMap item paths is populated
    let edits = [
        JsonEdit::set(
            "items.0.spec.template.spec.containers.0.volumeMounts.0.",
            json!({ "subPath": "storageConfig" }),
        ),
        JsonEdit::set(
            "items.0.spec.template.spec.containers.0.volumeMounts.1.",
            json!({
                "name": "inline-volume",
                "mountPath": "/mnt/storage/storage.properties",
                "subPath": "not-match-cm-paths",
            }),
        ),
        JsonEdit::set(
            "items.0.spec.template.spec.volumes.0.",
            json!({
                "configMap": {
                    "name": cm.name,
                    "items": [
                        { "key": "storage.properties", "path": "storageConfig-0" },
                        { "key": "storage.cnf", "path": "storageConfig" },
                    ],
                },
            }),
        ),
    ];
    dep.create_with_edits(&cli, &edits).await?;
    {
        let (cli, dep) = (cli.clone(), dep.clone());
        cleanup.defer("delete deployment", move || async move { dep.delete_as_admin(&cli).await });
    }
    dep.wait_ready(&cli).await?;

    info!("Check the pod mounts the configmap key");
    let pod = first_pod(&cli, &dep).await?;
    let output = exec_command_in_specific_pod(&cli, &dep.namespace, &pod, "cat /mnt/storage/cm.cnf")
        .await
        .context("reading the subPath mounted config")?;
    ensure!(output.contains("e2e-test = true"), "unexpected config content {output:?}");

    // A subPath matching no item path mounts an empty directory
    let err = exec_command_in_specific_pod(
        &cli,
        &dep.namespace,
        &pod,
        "cat /mnt/storage/storage.properties",
    )
    .await
    .err()
    .context("reading an unmatched subPath should fail")?;
    ensure!(
        err.output()
            .contains("cat: /mnt/storage/storage.properties: Is a directory"),
        "unexpected error reading unmatched subPath: {}",
        err.output()
    );

    info!("Update the configmap and check the subPath mount does not hot update");
    patch_resource_as_admin(
        &cli,
        &cm.namespace,
        &format!("cm/{}", cm.name),
        r#"[{"op":"replace", "path":"/data/storage.cnf", "value":"newConfig-v2"}]"#,
        "json",
    )
    .await?;
    wait::consistently(
        "subPath mounted config keeps the old content",
        Duration::from_secs(30),
        Duration::from_secs(10),
        || async {
            exec_command_in_specific_pod(&cli, &dep.namespace, &pod, "cat /mnt/storage/cm.cnf")
                .await
                .unwrap_or_default()
        },
        |content| content.contains("e2e-test = true"),
    )
    .await?;

    info!("Restart the deployment and check the mount picks up the update");
    dep.restart(&cli).await?;
    let pod = first_pod(&cli, &dep).await?;
    let output =
        exec_command_in_specific_pod(&cli, &dep.namespace, &pod, "cat /mnt/storage/cm.cnf").await?;
    ensure!(output.contains("newConfig-v2"), "config not updated after restart: {output:?}");

    info!("Delete the deployment, it must not get stuck terminating");
    delete_specified_resource(&cli, "deployment", &dep.name, &dep.namespace).await?;
    Ok(())
}

async fn first_pod(cli: &Cli, dep: &Deployment) -> Result<String> {
    dep.get_pod_list(cli)
        .await?
        .into_iter()
        .next()
        .with_context(|| format!("deployment {} has no pods", dep.name))
}
