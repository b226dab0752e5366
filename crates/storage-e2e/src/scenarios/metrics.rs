use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use e2e_util::{wait, Cleanup, Cli, JsonEdit};
use serde_json::json;
use tracing::{info, warn};

use super::skip;
use crate::cluster::{
    check_csi_driver_installed, check_resources_not_exist, csi_drivers_for_cloud_provider,
    delete_specified_resource, describe_pod, get_cloud_provider, get_installed_csi_drivers,
    get_node_name_by_pod, get_preset_storage_class_name_by_provisioner, patch_resource_as_admin,
    wait_cso_healthy,
};
use crate::consts::{
    ATTACH_FAILURE_ALERT_PROVISIONERS, EFS_CSI_DRIVER, METRICS_SCENARIO_PROVISIONERS,
    MOUNT_FAILURE_ALERT, MOUNT_FAILURE_ALERT_PROVISIONERS,
};
use crate::monitor::{AlertsClient, Monitor};
use crate::quantity::slice_intersect;
use crate::resources::{
    Deployment, PersistentVolume, PersistentVolumeClaim, Pod, PvKind, StorageClass,
};

const METRIC_TIMEOUT: Duration = Duration::from_secs(180);
const METRIC_INTERVAL: Duration = Duration::from_secs(5);

/// Provisioners without raw block support only get a Filesystem claim.
const FILESYSTEM_ONLY: &[&str] = &["efs.csi.aws.com", "file.csi.azure.com"];

const EVENT_TIMEOUT: Duration = Duration::from_secs(120);
const ALERT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(360);
const ALERT_RESOLVE_INTERVAL: Duration = Duration::from_secs(20);

/// Cloud provider and the installed drivers of that provider found in
/// `supported`. Skips when none is left.
async fn supported_provisioners(cli: &Cli, supported: &[&str]) -> Result<(String, Vec<String>)> {
    let provider = get_cloud_provider(cli).await?;
    let installed = get_installed_csi_drivers(cli).await?;
    let provider_drivers: Vec<String> = csi_drivers_for_cloud_provider(&provider)
        .iter()
        .filter(|driver| installed.iter().any(|i| i == *driver))
        .map(|driver| (*driver).to_string())
        .collect();
    let provisioners = slice_intersect(supported, &provider_drivers);
    if provisioners.is_empty() {
        return Err(skip(format!("no supported provisioner on {provider}")));
    }
    Ok((provider, provisioners))
}

fn defer_delete_sc(cli: &Cli, cleanup: &Cleanup, sc: &StorageClass) {
    let (cli, sc) = (cli.clone(), sc.clone());
    cleanup.defer("delete storageclass", move || async move { sc.delete_as_admin(&cli).await });
}

async fn create_bound_pvc(
    cli: &Cli,
    cleanup: &Cleanup,
    mut pvc: PersistentVolumeClaim,
) -> Result<PersistentVolumeClaim> {
    pvc.create(cli).await?;
    {
        let (cli, pvc) = (cli.clone(), pvc.clone());
        cleanup.defer("delete pvc", move || async move { pvc.delete_as_admin(&cli).await });
    }
    pvc.wait_status_as_expected(cli, "Bound").await?;
    Ok(pvc)
}

/// Deploy a consumer of `pvc` and wait until its pod's events report
/// `message`. Returns the pod name.
async fn deploy_until_event(
    cli: &Cli,
    cleanup: &Cleanup,
    pvc: &PersistentVolumeClaim,
    message: &str,
) -> Result<String> {
    let mut dep = Deployment::new().with_pvc(&pvc.name);
    dep.create(cli).await?;
    {
        let (cli, dep) = (cli.clone(), dep.clone());
        cleanup.defer("delete deployment", move || async move { dep.delete_as_admin(&cli).await });
    }
    let dep = &dep;
    let pods = wait::eventually(
        "deployment pod to be created",
        EVENT_TIMEOUT,
        METRIC_INTERVAL,
        || async {
            dep.get_pod_list_without_filter_status(cli)
                .await
                .unwrap_or_default()
        },
        |pods| !pods.is_empty(),
    )
    .await?;
    let pod = pods[0].clone();
    wait::eventually(
        &format!("pod {pod} to report {message:?}"),
        EVENT_TIMEOUT,
        METRIC_INTERVAL,
        || async { describe_pod(cli, &dep.namespace, &pod).await.contains(message) },
        |found| *found,
    )
    .await?;
    Ok(pod)
}

/// Poll the volume-count metric until `volume_mode` reports `expected`.
async fn wait_volume_count(
    monitor: &Monitor,
    provisioner: &str,
    volume_mode: &str,
    expected: i64,
) -> Result<()> {
    wait::eventually(
        &format!("{provisioner} {volume_mode} volume count to be {expected}"),
        METRIC_TIMEOUT,
        METRIC_INTERVAL,
        || async {
            monitor
                .get_provisioned_volumes_metric(provisioner)
                .await
                .ok()
                .and_then(|counts| counts.get(volume_mode).copied())
        },
        |count| *count == Some(expected),
    )
    .await?;
    Ok(())
}

/// Provision one claim of `volume_mode` and check the count rises by one.
/// The deferred cleanup deletes the claim and waits for the count to fall
/// back.
async fn check_volume_mode_count(
    cli: &Cli,
    cleanup: &Cleanup,
    monitor: &Monitor,
    provisioner: &str,
    sc_name: &str,
    volume_mode: &str,
    baseline: &BTreeMap<String, i64>,
) -> Result<()> {
    let before = baseline.get(volume_mode).copied().unwrap_or(0);

    info!(volume_mode, "Create a pvc");
    let mut pvc = PersistentVolumeClaim::new()
        .with_storage_class(sc_name)
        .with_volume_mode(volume_mode);
    pvc.create(cli).await?;
    {
        let (cli, pvc, monitor) = (cli.clone(), pvc.clone(), monitor.clone());
        let (provisioner, volume_mode) = (provisioner.to_string(), volume_mode.to_string());
        cleanup.defer(format!("delete {volume_mode} pvc"), move || async move {
            pvc.delete_as_admin(&cli).await;
            if let Err(e) = wait_volume_count(&monitor, &provisioner, &volume_mode, before).await {
                warn!(
                    provisioner = %provisioner,
                    volume_mode = %volume_mode,
                    error = %e,
                    "Volume count did not fall back"
                );
            }
        });
    }
    pvc.wait_status_as_expected(cli, "Bound").await?;

    info!(volume_mode, "Check the metric counts the new volume");
    wait_volume_count(monitor, provisioner, volume_mode, before + 1).await
}

/// Per-plugin Filesystem and Block volume counts follow provisioning.
pub(super) async fn volume_mode_counts(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let (provider, provisioners) =
        supported_provisioners(&cli, METRICS_SCENARIO_PROVISIONERS).await?;

    let monitor = Monitor::new(&cli).await?;
    for provisioner in &provisioners {
        info!(provider = %provider, provisioner = %provisioner, "Volume count phase start");
        let baseline = monitor.get_provisioned_volumes_metric(provisioner).await?;

        let sc_name = if provisioner == EFS_CSI_DRIVER {
            get_preset_storage_class_name_by_provisioner(&cli, provisioner)
                .await?
                .context("no preset storage class for efs.csi.aws.com")?
        } else {
            info!("Create a storage class with Immediate binding");
            let sc = StorageClass::new()
                .with_provisioner(provisioner)
                .with_volume_binding_mode("Immediate");
            sc.create(&cli).await?;
            defer_delete_sc(&cli, &cleanup, &sc);
            sc.name
        };

        let modes: &[&str] = if FILESYSTEM_ONLY.contains(&provisioner.as_str()) {
            &["Filesystem"]
        } else {
            &["Filesystem", "Block"]
        };
        for mode in modes {
            check_volume_mode_count(
                &cli,
                &cleanup,
                &monitor,
                provisioner,
                &sc_name,
                mode,
                &baseline,
            )
            .await?;
        }
        info!(provisioner = %provisioner, "Volume count phase finished");
    }
    Ok(())
}

/// A mount that keeps failing raises the storage operations alert, and the
/// alert names the node of the failing pod.
pub(super) async fn mount_failure_alert_node(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let (provider, provisioners) =
        supported_provisioners(&cli, MOUNT_FAILURE_ALERT_PROVISIONERS).await?;
    let alerts = AlertsClient::from_cluster(&cli).await?;
    if alerts.is_alert_raised(MOUNT_FAILURE_ALERT).await? {
        return Err(skip(format!("{MOUNT_FAILURE_ALERT} is already raised")));
    }
    {
        let resolve = alerts
            .clone()
            .with_timing(ALERT_RESOLVE_TIMEOUT, ALERT_RESOLVE_INTERVAL);
        cleanup.defer("wait for the alert to resolve", move || async move {
            if let Err(e) = resolve.check_alert_resolved(MOUNT_FAILURE_ALERT).await {
                warn!(alert = MOUNT_FAILURE_ALERT, error = %e, "Alert did not resolve");
            }
        });
    }

    for provisioner in &provisioners {
        info!(provider = %provider, provisioner = %provisioner, "Mount alert phase start");
        let sc = StorageClass::new()
            .with_provisioner(provisioner)
            .with_volume_binding_mode("Immediate")
            .with_reclaim_policy("Delete")
            .with_allow_volume_expansion(true);
        let mount_options = JsonEdit::set("items.0.mountOptions", json!(["debug1234"]));
        sc.create_with_edits(&cli, vec![mount_options]).await?;
        defer_delete_sc(&cli, &cleanup, &sc);
        let options = sc.get_field_by_json_path(&cli, "{.mountOptions}").await?;
        ensure!(options.contains("debug1234"), "unexpected mount options {options:?}");

        info!("Create a pvc and a deployment that cannot mount it");
        let pvc = PersistentVolumeClaim::new().with_storage_class(&sc.name);
        let pvc = create_bound_pvc(&cli, &cleanup, pvc).await?;
        let pv_name = pvc.get_volume_name(&cli).await?;
        let message = format!("MountVolume.MountDevice failed for volume \"{pv_name}\"");
        let pod = deploy_until_event(&cli, &cleanup, &pvc, &message).await?;

        info!("Check the alert names the node of the failing pod");
        let node = get_node_name_by_pod(&cli, &pvc.namespace, &pod).await?;
        ensure!(
            alerts
                .check_alert_node_name_match_desc(MOUNT_FAILURE_ALERT, &node)
                .await?,
            "{MOUNT_FAILURE_ALERT} does not name node {node}"
        );
        info!(provisioner = %provisioner, "Mount alert phase finished");
    }
    Ok(())
}

/// A static PV whose backing volume is gone fails to attach and raises the
/// storage operations alert.
pub(super) async fn attach_failure_alert(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let (provider, provisioners) =
        supported_provisioners(&cli, ATTACH_FAILURE_ALERT_PROVISIONERS).await?;
    let alerts = AlertsClient::from_cluster(&cli).await?;

    for provisioner in &provisioners {
        info!(provider = %provider, provisioner = %provisioner, "Attach alert phase start");
        let sc = StorageClass::new()
            .with_provisioner(provisioner)
            .with_volume_binding_mode("Immediate")
            .with_reclaim_policy("Delete");
        sc.create(&cli).await?;
        defer_delete_sc(&cli, &cleanup, &sc);

        info!("Provision a volume and delete it with its claim");
        let pvc = PersistentVolumeClaim::new().with_storage_class(&sc.name);
        let pvc = create_bound_pvc(&cli, &cleanup, pvc).await?;
        let handle = pvc.get_volume_id(&cli).await?;
        let old_pv = pvc.get_volume_name(&cli).await?;
        delete_specified_resource(&cli, "pvc", &pvc.name, &pvc.namespace).await?;
        check_resources_not_exist(&cli, "pv", &old_pv, "").await?;

        info!(volume_handle = %handle, "Create a static pv for the deleted volume");
        let pv = PersistentVolume::new()
            .with_kind(PvKind::Csi)
            .with_driver(provisioner)
            .with_storage_class(&sc.name)
            .with_volume_handle(&handle)
            .with_capacity(&pvc.capacity);
        pv.create(&cli).await?;
        {
            let (cli, pv) = (cli.clone(), pv.clone());
            cleanup.defer("delete pv", move || async move { pv.delete_as_admin(&cli).await });
        }
        let mut claim = PersistentVolumeClaim::new()
            .with_storage_class(&sc.name)
            .with_capacity(&pvc.capacity);
        claim.create(&cli).await?;
        {
            let (cli, claim) = (cli.clone(), claim.clone());
            cleanup.defer("delete pvc", move || async move { claim.delete_as_admin(&cli).await });
        }

        let message = format!("AttachVolume.Attach failed for volume \"{}\"", pv.name);
        deploy_until_event(&cli, &cleanup, &claim, &message).await?;
        alerts.check_alert_raised(MOUNT_FAILURE_ALERT).await?;
        info!(provisioner = %provisioner, "Attach alert phase finished");
    }
    Ok(())
}

/// JSON patch setting the EFS volume metrics state of the cluster driver.
fn efs_volume_metrics_patch(state: &str) -> String {
    json!([{
        "op": "replace",
        "path": "/spec/driverConfig",
        "value": {"driverType": "AWS", "aws": {"efsVolumeMetrics": {"state": state}}},
    }])
    .to_string()
}

/// With EFS volume metrics enabled the kubelet reports usage for EFS claims.
pub(super) async fn efs_usage_metrics(cli: Cli, cleanup: Cleanup) -> Result<()> {
    if !check_csi_driver_installed(&cli, &[EFS_CSI_DRIVER]).await {
        return Err(skip(format!("{EFS_CSI_DRIVER} is not installed")));
    }
    let sc_name = get_preset_storage_class_name_by_provisioner(&cli, EFS_CSI_DRIVER)
        .await?
        .context("no preset storage class for efs.csi.aws.com")?;

    info!("Enable EFS volume metrics on the cluster CSI driver");
    let driver = format!("clustercsidriver/{EFS_CSI_DRIVER}");
    let enable = efs_volume_metrics_patch("RecursiveWalk");
    patch_resource_as_admin(&cli, "", &driver, &enable, "json").await?;
    {
        let (cli, driver) = (cli.clone(), driver.clone());
        cleanup.defer("disable EFS volume metrics", move || async move {
            let disable = efs_volume_metrics_patch("Disabled");
            if let Err(e) = patch_resource_as_admin(&cli, "", &driver, &disable, "json").await {
                warn!(error = %e, "Failed to disable EFS volume metrics");
                return;
            }
            if let Err(e) = wait_cso_healthy(&cli).await {
                warn!(error = %e, "Storage operator is not healthy");
            }
        });
    }
    wait_cso_healthy(&cli).await?;

    info!("Create a pvc and a pod consuming it");
    let mut pvc = PersistentVolumeClaim::new().with_storage_class(&sc_name);
    pvc.create(&cli).await?;
    {
        let (cli, pvc) = (cli.clone(), pvc.clone());
        cleanup.defer("delete pvc", move || async move { pvc.delete_as_admin(&cli).await });
    }
    let mut pod = Pod::new().with_pvc(&pvc.name);
    pod.create(&cli).await?;
    {
        let (cli, pod) = (cli.clone(), pod.clone());
        cleanup.defer("delete pod", move || async move { pod.delete_as_admin(&cli).await });
    }
    pod.wait_ready(&cli).await?;

    info!("Check the kubelet reports volume stats for the project");
    let monitor = Monitor::new(&cli).await?;
    let namespace = pvc.namespace.clone();
    wait::eventually(
        "kubelet volume stats for the EFS claim",
        EVENT_TIMEOUT,
        METRIC_INTERVAL,
        || async {
            monitor
                .get_specified_metric_value("kubelet_volume_stats_capacity_bytes", "data.result")
                .await
                .is_ok_and(|result| result.contains(&namespace))
        },
        |reported| *reported,
    )
    .await?;
    Ok(())
}
