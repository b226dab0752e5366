use anyhow::{ensure, Result};
use e2e_util::{Cleanup, Cli, JsonEdit};
use serde_json::json;
use tracing::info;

use super::skip;
use crate::cluster::{check_csi_driver_installed, delete_specified_resource};
use crate::resources::{
    get_volume_attributes_class_from_pv, PersistentVolume, PersistentVolumeClaim, Pod, PvKind,
    StorageClass, VolumeAttributesClass,
};

const EBS_DRIVER: &str = "ebs.csi.aws.com";
const CAPACITY: &str = "4Gi";

async fn volume_attributes_class_served(cli: &Cli) -> bool {
    cli.as_admin()
        .without_namespace()
        .run("get")
        .args(["volumeattributesclass"])
        .execute()
        .await
        .is_ok()
}

fn gp3_class(iops: &str) -> VolumeAttributesClass {
    VolumeAttributesClass::new()
        .with_driver(EBS_DRIVER)
        .with_parameter("type", "gp3")
        .with_parameter("iops", iops)
}

/// Provision a volume through a Retain storage class and release it,
/// leaving the backing disk for a static PV. Returns the volume handle.
async fn retained_volume_handle(cli: &Cli, cleanup: &Cleanup) -> Result<String> {
    let sc = StorageClass::new()
        .with_provisioner(EBS_DRIVER)
        .with_reclaim_policy("Retain")
        .with_volume_binding_mode("WaitForFirstConsumer");
    sc.create(cli).await?;
    {
        let (cli, sc) = (cli.clone(), sc.clone());
        cleanup.defer("delete storageclass", move || async move { sc.delete_as_admin(&cli).await });
    }

    let mut pvc = PersistentVolumeClaim::new()
        .with_storage_class(&sc.name)
        .with_capacity(CAPACITY);
    pvc.create(cli).await?;
    {
        let (cli, pvc) = (cli.clone(), pvc.clone());
        cleanup.defer("delete source pvc", move || async move { pvc.delete_as_admin(&cli).await });
    }
    let mut pod = Pod::new().with_pvc(&pvc.name);
    pod.create(cli).await?;
    {
        let (cli, pod) = (cli.clone(), pod.clone());
        cleanup.defer("delete source pod", move || async move { pod.delete_as_admin(&cli).await });
    }
    pod.wait_ready(cli).await?;

    let handle = pvc.get_volume_id(cli).await?;
    let source_pv = pvc.get_volume_name(cli).await?;
    info!(volume_handle = %handle, pv = %source_pv, "Release the provisioned volume");
    delete_specified_resource(cli, "pod", &pod.name, &pod.namespace).await?;
    delete_specified_resource(cli, "pvc", &pvc.name, &pvc.namespace).await?;
    delete_specified_resource(&cli.as_admin(), "pv", &source_pv, "").await?;
    Ok(handle)
}

/// A static PV created with a volume attributes class keeps it, and its
/// claim can move the volume to another class.
pub(super) async fn static_pv(cli: Cli, cleanup: Cleanup) -> Result<()> {
    if !check_csi_driver_installed(&cli, &[EBS_DRIVER]).await {
        return Err(skip(format!("{EBS_DRIVER} is not installed")));
    }
    if !volume_attributes_class_served(&cli).await {
        return Err(skip("the VolumeAttributesClass API is not served"));
    }

    info!("Create two volume attributes classes");
    let vac1 = gp3_class("3000");
    let vac2 = gp3_class("4000");
    for vac in [&vac1, &vac2] {
        vac.create(&cli).await?;
        let (cli, vac) = (cli.clone(), vac.clone());
        cleanup.defer("delete vac", move || async move { vac.delete_as_admin(&cli).await });
    }

    let handle = retained_volume_handle(&cli, &cleanup).await?;

    info!("Create a static pv with the first volume attributes class");
    let sc_name = format!("static-{}", vac1.name);
    let pv = PersistentVolume::new()
        .with_kind(PvKind::Csi)
        .with_driver(EBS_DRIVER)
        .with_volume_handle(handle)
        .with_storage_class(&sc_name)
        .with_reclaim_policy("Delete")
        .with_capacity(CAPACITY);
    pv.create_with_volume_attributes_class(&cli, &vac1.name).await?;
    {
        let (cli, pv) = (cli.clone(), pv.clone());
        cleanup.defer("delete static pv", move || async move { pv.delete_as_admin(&cli).await });
    }
    let applied = get_volume_attributes_class_from_pv(&cli, &pv.name).await?;
    ensure!(
        applied == vac1.name,
        "pv/{} has volume attributes class {applied:?}, expected {:?}",
        pv.name,
        vac1.name
    );

    info!("Bind a pvc to the static pv");
    let mut pvc = PersistentVolumeClaim::new()
        .with_storage_class(&sc_name)
        .with_capacity(CAPACITY);
    pvc.create_with_edits(
        &cli,
        &[JsonEdit::set(
            "items.0.spec.",
            json!({ "volumeName": pv.name, "volumeAttributesClassName": vac1.name }),
        )],
    )
    .await?;
    {
        let (cli, pvc) = (cli.clone(), pvc.clone());
        cleanup.defer("delete static pvc", move || async move { pvc.delete_as_admin(&cli).await });
    }
    pvc.wait_status_as_expected(&cli, "Bound").await?;

    info!("Move the pvc to the second volume attributes class");
    pvc.modify_volume_attributes_class(&cli, &vac2.name).await?;
    pvc.wait_vac_applied(&cli, &vac2.name).await?;
    let applied = get_volume_attributes_class_from_pv(&cli, &pv.name).await?;
    ensure!(
        applied == vac2.name,
        "pv/{} still has volume attributes class {applied:?} after the modification",
        pv.name
    );
    Ok(())
}
