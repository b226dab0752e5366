use std::collections::BTreeSet;

use anyhow::{Context, Result};
use e2e_util::{random_string, Cleanup, Cli};
use tracing::info;

use crate::cluster::{delete_specified_resource, get_node_name_by_pod};
use crate::node::{check_volume_not_mount_on_node, workers_list};
use crate::resources::{
    setup_nfs_server, DaemonSet, NfsServer, PersistentVolume, PersistentVolumeClaim, PvKind,
    StatefulSet,
};

async fn nfs_server(cli: &Cli, cleanup: &Cleanup) -> Result<NfsServer> {
    let server = setup_nfs_server(cli).await.context("installing the NFS server")?;
    let (cli, uninstall) = (cli.clone(), server.clone());
    cleanup.defer("uninstall NFS server", move || async move { uninstall.uninstall(&cli).await });
    Ok(server)
}

fn nfs_pv(
    server: &NfsServer,
    sc_name: &str,
    access_mode: &str,
    capacity: &str,
) -> PersistentVolume {
    PersistentVolume::new()
        .with_kind(PvKind::Nfs)
        .with_nfs_server_ip(&server.cluster_ip)
        .with_access_mode(access_mode)
        .with_storage_class(sc_name)
        .with_reclaim_policy("Delete")
        .with_capacity(capacity)
}

/// A RWX NFS volume shared by a daemonset: every pod writes its own file
/// and reads the files of all the others.
pub(super) async fn daemonset_rwx(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let server = nfs_server(&cli, &cleanup).await?;
    let sc_name = format!("nfs-sc-{}", random_string());
    let mut pvc = PersistentVolumeClaim::new()
        .with_storage_class(&sc_name)
        .with_capacity("5Gi")
        .with_access_mode("ReadWriteMany");
    let pv = nfs_pv(&server, &sc_name, "ReadWriteMany", "5Gi");

    info!("Create a pv with the storageclass");
    pv.create(&cli).await?;
    {
        let (cli, pv) = (cli.clone(), pv.clone());
        cleanup.defer("delete pv", move || async move { pv.delete_as_admin(&cli).await });
    }

    info!("Create a pvc with the storageclass");
    pvc.create(&cli).await?;
    {
        let (cli, pvc) = (cli.clone(), pvc.clone());
        cleanup.defer("delete pvc", move || async move { pvc.delete_as_admin(&cli).await });
    }

    info!("Create a daemonset using the pvc and wait for it to be ready");
    let mut ds = DaemonSet::new().with_pvc(&pvc.name);
    ds.create(&cli).await?;
    {
        let (cli, ds) = (cli.clone(), ds.clone());
        cleanup.defer("delete daemonset", move || async move { ds.delete_as_admin(&cli).await });
    }
    ds.wait_ready(&cli).await?;

    info!("Check every pod can write to the volume");
    let files = ds.check_pod_mounted_volume_could_write(&cli).await?;

    info!("Check every pod can read the data of the others");
    ds.check_pod_mounted_volume_could_read(&cli, files).await?;

    info!("Delete the daemonset");
    delete_specified_resource(&cli, "daemonset", &ds.name, &ds.namespace).await?;

    info!("Check the volume is unmounted from the workers");
    let volume = pvc.get_volume_name(&cli).await?;
    for node in workers_list(&cli).await? {
        check_volume_not_mount_on_node(&cli, &volume, &node).await?;
    }

    info!("Delete the pvc");
    delete_specified_resource(&cli, "pvc", &pvc.name, &pvc.namespace).await?;
    Ok(())
}

/// Pre-bound NFS claims consumed by statefulset replicas store data and
/// allow executing files from the volume.
pub(super) async fn statefulset(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let server = nfs_server(&cli, &cleanup).await?;
    let sc_name = format!("nfs-sc-{}", random_string());
    let mut sts = StatefulSet::new()
        .with_name(format!("nfs-sts-{}", random_string()))
        .with_volume_name(format!("vol-{}", random_string()))
        .with_replicas("2")
        .with_storage_class(&sc_name);
    let replicas = 2;

    info!("Create a pv per replica");
    let mut pv_names = Vec::new();
    for _ in 0..replicas {
        let pv = nfs_pv(&server, &sc_name, "ReadWriteOnce", "2Gi");
        pv.create(&cli).await?;
        pv_names.push(pv.name.clone());
        let cli = cli.clone();
        cleanup.defer("delete pv", move || async move { pv.delete_as_admin(&cli).await });
    }

    info!("Create the claims the statefulset will adopt");
    for ordinal in 0..replicas {
        let mut pvc = PersistentVolumeClaim::new()
            .with_name(sts.pvc_name(ordinal))
            .with_storage_class(&sc_name)
            .with_capacity("2Gi")
            .with_access_mode("ReadWriteOnce");
        pvc.create(&cli).await?;
        let cli = cli.clone();
        cleanup.defer("delete pvc", move || async move { pvc.delete_as_admin(&cli).await });
    }

    info!("Create the statefulset and wait for it to be ready");
    sts.create(&cli).await?;
    {
        let (cli, sts) = (cli.clone(), sts.clone());
        cleanup.defer("delete statefulset", move || async move { sts.delete_as_admin(&cli).await });
    }
    sts.wait_ready(&cli).await?;

    let mut nodes = BTreeSet::new();
    for pod in sts.get_pod_list(&cli).await? {
        nodes.insert(get_node_name_by_pod(&cli, &sts.namespace, &pod).await?);
    }

    info!("Check the pods can read and write the volume");
    sts.check_mounted_volume_could_rw(&cli).await?;

    info!("Check the volume has the exec right");
    sts.check_mounted_volume_have_exec_right(&cli).await?;

    info!("Delete the statefulset");
    delete_specified_resource(&cli, "statefulset", &sts.name, &sts.namespace).await?;

    info!("Check the volumes are unmounted from the nodes");
    for node in &nodes {
        for pv_name in &pv_names {
            check_volume_not_mount_on_node(&cli, pv_name, node).await?;
        }
    }
    Ok(())
}
