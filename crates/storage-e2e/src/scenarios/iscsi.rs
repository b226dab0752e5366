use std::time::Duration;

use anyhow::{ensure, Context, Result};
use e2e_util::{random_string, wait, Cleanup, Cli};
use tracing::{info, warn};

use super::skip;
use crate::cluster::{
    check_msg_exists_in_pod_description, delete_specified_resource, describe_pod,
    exec_command_in_specific_pod, get_node_name_by_pod, patch_resource_as_admin,
};
use crate::consts::ISCSI_PORT;
use crate::node::{
    check_fips, check_volume_mount_cmd_contain, check_volume_not_mount_on_node,
    drain_node_with_pod_label, get_all_nodes_info, schedulable_linux_workers,
    uncordon_specific_node,
};
use crate::resources::{
    setup_iscsi_server, Deployment, IscsiServer, PersistentVolume, PersistentVolumeClaim, Pod,
    PvKind, Secret, Service,
};

const LOGIN_FAILED: &str = "Login failed to authenticate with target";

async fn iscsi_server(cli: &Cli, cleanup: &Cleanup) -> Result<IscsiServer> {
    let server = setup_iscsi_server(cli)
        .await
        .context("installing the iSCSI target")?;
    let (cli, uninstall) = (cli.clone(), server.clone());
    cleanup.defer("uninstall iSCSI target", move || async move { uninstall.uninstall(&cli).await });
    Ok(server)
}

/// Static iSCSI PV, its claim and a deployment consuming it.
async fn provision(
    cli: &Cli,
    cleanup: &Cleanup,
    pv: PersistentVolume,
    sc_name: &str,
) -> Result<(PersistentVolumeClaim, Deployment)> {
    info!("Create a pv with the storageclass");
    pv.create(cli).await?;
    {
        let cli = cli.clone();
        cleanup.defer("delete pv", move || async move { pv.delete_as_admin(&cli).await });
    }

    info!("Create a pvc with the storageclass");
    let mut pvc = PersistentVolumeClaim::new()
        .with_storage_class(sc_name)
        .with_capacity("2Gi")
        .with_access_mode("ReadWriteOnce");
    pvc.create(cli).await?;
    {
        let (cli, pvc) = (cli.clone(), pvc.clone());
        cleanup.defer("delete pvc", move || async move { pvc.delete_as_admin(&cli).await });
    }

    info!("Create a deployment consuming the pvc and wait for it to be ready");
    let mut dep = Deployment::new().with_pvc(&pvc.name);
    dep.create(cli).await?;
    {
        let (cli, dep) = (cli.clone(), dep.clone());
        cleanup.defer("delete deployment", move || async move { dep.delete_as_admin(&cli).await });
    }
    dep.wait_ready(cli).await?;
    Ok((pvc, dep))
}

async fn first_pod_node(cli: &Cli, dep: &Deployment) -> Result<String> {
    let pod = dep
        .get_pod_list(cli)
        .await?
        .into_iter()
        .next()
        .context("deployment has no running pod")?;
    Ok(get_node_name_by_pod(cli, &dep.namespace, &pod).await?)
}

async fn read_in_first_pod(cli: &Cli, dep: &Deployment, command: &str) -> Result<String> {
    let pod = dep
        .get_pod_list(cli)
        .await?
        .into_iter()
        .next()
        .context("deployment has no running pod")?;
    Ok(exec_command_in_specific_pod(cli, &dep.namespace, &pod, command).await?)
}

/// Draining the node under an iSCSI consumer moves the pod elsewhere with
/// its data, and the old node unmounts the volume.
pub(super) async fn drain_node(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let workers = schedulable_linux_workers(&get_all_nodes_info(&cli).await?);
    if workers.len() < 2 {
        return Err(skip(
            "needs at least 2 schedulable workers, the cluster has fewer",
        ));
    }

    let server = iscsi_server(&cli, &cleanup).await?;
    let sc_name = format!("iscsi-sc-{}", random_string());
    let pv = PersistentVolume::new()
        .with_kind(PvKind::Iscsi)
        .with_iscsi_server_ip(&server.cluster_ip)
        .with_access_mode("ReadWriteOnce")
        .with_storage_class(&sc_name)
        .with_reclaim_policy("Delete")
        .with_capacity("2Gi");
    let volume = pv.name.clone();
    let (_pvc, dep) = provision(&cli, &cleanup, pv, &sc_name).await?;

    info!("Check the pod can read and write the volume");
    dep.check_pod_mounted_volume_could_rw(&cli).await?;

    info!("Drain the node running the deployment pod");
    let origin = first_pod_node(&cli, &dep).await?;
    drain_node_with_pod_label(&cli, &origin, &dep.app_label).await?;
    {
        let (cli, origin) = (cli.clone(), origin.clone());
        cleanup.defer("uncordon drained node", move || async move {
            if let Err(e) = uncordon_specific_node(&cli, &origin).await {
                warn!(node = %origin, error = %e, "Failed to uncordon node");
            }
        });
    }

    info!("Check the rescheduled pod still has the data");
    dep.wait_ready(&cli).await?;
    let read = format!("cat {}/testfile*", dep.mount_path);
    let output = read_in_first_pod(&cli, &dep, &read).await?;
    ensure!(output.contains("storage test"), "unexpected volume content {output:?}");

    let node = first_pod_node(&cli, &dep).await?;
    ensure!(node != origin, "pod stayed on drained node {origin}");

    info!("Uncordon the node and check the volume left it");
    uncordon_specific_node(&cli, &origin).await?;
    check_volume_not_mount_on_node(&cli, &volume, &origin).await?;
    Ok(())
}

/// Multipath iSCSI: the volume stays usable through a second portal after
/// the service behind the primary portal is deleted.
pub(super) async fn multipath(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let server = iscsi_server(&cli, &cleanup).await?;

    info!("Create a second service in front of the iSCSI target");
    let mut svc = Service::new()
        .with_name(format!("iscsi-service-{}", random_string()))
        .with_selector_label(&server.deploy.app_label)
        .with_port(ISCSI_PORT)
        .with_target_port(ISCSI_PORT)
        .with_protocol("TCP");
    svc.create(&cli).await?;
    {
        let (cli, svc) = (cli.clone(), svc.clone());
        cleanup.defer("delete second service", move || async move {
            svc.delete_as_admin(&cli).await;
        });
    }
    let portal_ip = svc.get_cluster_ip(&cli).await?;

    info!(portal = %portal_ip, "Create a network portal for the second service");
    server.create_network_portal(&cli, &portal_ip).await?;
    {
        let (cli, server, portal_ip) = (cli.clone(), server.clone(), portal_ip.clone());
        cleanup.defer("delete network portal", move || async move {
            if let Err(e) = server.delete_network_portal(&cli, &portal_ip).await {
                warn!(portal = %portal_ip, error = %e, "Failed to delete network portal");
            }
        });
    }

    let sc_name = format!("iscsi-sc-{}", random_string());
    let pv = PersistentVolume::new()
        .with_kind(PvKind::Iscsi)
        .with_iscsi_server_ip(&server.cluster_ip)
        .with_iscsi_portals(vec![format!("{portal_ip}:{ISCSI_PORT}")])
        .with_access_mode("ReadWriteOnce")
        .with_storage_class(&sc_name)
        .with_reclaim_policy("Delete")
        .with_capacity("2Gi");
    let volume = pv.name.clone();
    let (_pvc, mut dep) = provision(&cli, &cleanup, pv, &sc_name).await?;

    info!("Check the pods can read, write and exec on the volume");
    dep.check_pod_mounted_volume_could_rw(&cli).await?;
    dep.check_pod_mounted_volume_have_exec_right(&cli).await?;

    info!("Check the volume is mounted as ext4");
    let node = first_pod_node(&cli, &dep).await?;
    check_volume_mount_cmd_contain(&cli, &volume, &node, "ext4").await?;

    info!("Delete the service behind the primary portal");
    delete_specified_resource(&cli, "svc", &server.svc.name, &server.svc.namespace).await?;

    info!("Scale to zero and check the volume is unmounted");
    dep.scale_replicas(&cli, "0").await?;
    dep.wait_ready(&cli).await?;
    check_volume_not_mount_on_node(&cli, &volume, &node).await?;

    info!("Scale back up and log in through the second portal");
    dep.scale_replicas(&cli, "1").await?;
    dep.max_wait_ready_time *= 2;
    dep.wait_ready(&cli).await?;

    info!("Check the data survived and the volume still has the exec right");
    let read = format!("cat {}/testfile*", dep.mount_path);
    let output = read_in_first_pod(&cli, &dep, &read).await?;
    ensure!(output.contains("storage test"), "unexpected volume content {output:?}");
    let hello = format!("{}/hello", dep.mount_path);
    let output = read_in_first_pod(&cli, &dep, &hello).await?;
    ensure!(
        output.contains("Hello OpenShift Storage"),
        "unexpected exec output {output:?}"
    );
    Ok(())
}

/// A RWO iSCSI volume attached to one node: a pod elsewhere hits a
/// Multi-Attach error while a pod on the same node shares the data.
pub(super) async fn rwo_same_node(cli: Cli, cleanup: Cleanup) -> Result<()> {
    let workers = schedulable_linux_workers(&get_all_nodes_info(&cli).await?);
    if workers.len() < 2 {
        return Err(skip(
            "needs at least 2 schedulable workers, the cluster has fewer",
        ));
    }

    let server = iscsi_server(&cli, &cleanup).await?;
    let sc_name = format!("iscsi-sc-{}", random_string());
    let pv = PersistentVolume::new()
        .with_kind(PvKind::Iscsi)
        .with_iscsi_server_ip(&server.cluster_ip)
        .with_access_mode("ReadWriteOnce")
        .with_storage_class(&sc_name)
        .with_reclaim_policy("Delete")
        .with_capacity("2Gi");
    let (pvc, dep) = provision(&cli, &cleanup, pv, &sc_name).await?;

    info!("Check the pods can read and write the volume");
    dep.check_pod_mounted_volume_could_rw(&cli).await?;

    info!("Check the volume has the exec right");
    dep.check_pod_mounted_volume_have_exec_right(&cli).await?;

    info!("Check a pod on another node is blocked by a Multi-Attach error");
    let node = first_pod_node(&cli, &dep).await?;
    let mut pod = Pod::new().with_pvc(&pvc.name);
    pod.create_with_node_affinity(&cli, "kubernetes.io/hostname", "NotIn", &[node.clone()])
        .await?;
    {
        let (cli, pod) = (cli.clone(), pod.clone());
        cleanup.defer("delete pod", move || async move { pod.delete_as_admin(&cli).await });
    }
    wait::eventually(
        "pod description to report a Multi-Attach error",
        Duration::from_secs(120),
        Duration::from_secs(5),
        || describe_pod(&cli, &pod.namespace, &pod.name),
        |description| {
            description.contains("Multi-Attach error for volume")
                && description.contains("Volume is already used by pod")
        },
    )
    .await?;

    info!("Check a second pod on the same node mounts the volume");
    let mut pod2 = Pod::new().with_pvc(&pvc.name);
    pod2.create_with_node_affinity(&cli, "kubernetes.io/hostname", "In", &[node])
        .await?;
    {
        let (cli, pod2) = (cli.clone(), pod2.clone());
        cleanup.defer("delete pod2", move || async move { pod2.delete_as_admin(&cli).await });
    }
    pod2.wait_ready(&cli).await?;

    info!("Check the second pod reads the data written earlier");
    let output = exec_command_in_specific_pod(
        &cli,
        &pod2.namespace,
        &pod2.name,
        "cat /mnt/storage/testfile_*",
    )
    .await?;
    ensure!(output.contains("storage test"), "unexpected volume content {output:?}");

    info!("Check the second pod can read, write and exec on the volume");
    pod2.check_mounted_volume_could_rw(&cli).await?;
    pod2.check_mounted_volume_have_exec_right(&cli).await?;
    Ok(())
}

/// Scale to one replica and wait until its pod reports a CHAP login failure.
async fn expect_login_failure(cli: &Cli, dep: &mut Deployment) -> Result<()> {
    dep.scale_replicas(cli, "1").await?;
    let dep: &Deployment = dep;
    let pods = wait::eventually(
        "deployment pod to be scheduled",
        Duration::from_secs(120),
        Duration::from_secs(5),
        || async {
            dep.get_pod_list_without_filter_status(cli)
                .await
                .unwrap_or_default()
        },
        |pods| pods.len() == 1,
    )
    .await?;
    check_msg_exists_in_pod_description(cli, &dep.namespace, &pods[0], LOGIN_FAILED).await?;
    Ok(())
}

async fn scale_to_zero(cli: &Cli, dep: &mut Deployment) -> Result<()> {
    dep.scale_replicas(cli, "0").await?;
    dep.wait_ready(cli).await?;
    Ok(())
}

/// CHAP discovery authentication: valid credentials mount, a wrong or
/// missing password fails the login, and disabling auth mounts again.
pub(super) async fn chap_discovery_auth(cli: Cli, cleanup: Cleanup) -> Result<()> {
    if check_fips(&cli).await? {
        return Err(skip("iSCSI CHAP authentication is not supported with FIPS enabled"));
    }

    let server = iscsi_server(&cli, &cleanup).await?;
    let sc_name = format!("iscsi-sc-{}", random_string());

    info!("Create a secret for iSCSI CHAP authentication");
    let mut secret = Secret::new()
        .with_name(format!("iscsi-secret-{}", random_string()))
        .with_type("kubernetes.io/iscsi-chap");
    secret
        .create_with_data(
            &cli,
            &[
                ("discovery.sendtargets.auth.password", "ZGVtbw=="),
                ("discovery.sendtargets.auth.password_in", "bXBhc3M="),
                ("discovery.sendtargets.auth.username", "dXNlcg=="),
                ("discovery.sendtargets.auth.username_in", "bXVzZXI="),
            ],
        )
        .await?;
    {
        let (cli, secret) = (cli.clone(), secret.clone());
        cleanup.defer("delete secret", move || async move { secret.delete_as_admin(&cli).await });
    }

    info!("Enable target discovery authentication and set the credentials");
    let message = server.enable_target_discovery_auth(&cli, true).await?;
    {
        let (cli, server) = (cli.clone(), server.clone());
        cleanup.defer("disable discovery auth", move || async move {
            if let Err(e) = server.enable_target_discovery_auth(&cli, false).await {
                warn!(error = %e, "Failed to disable iSCSI discovery auth");
            }
        });
    }
    ensure!(
        message.contains("Parameter enable is now 'True'"),
        "unexpected targetcli output {message:?}"
    );
    server
        .set_target_discovery_auth_creds(&cli, "user", "demo", "muser", "mpass")
        .await?;

    let pv = PersistentVolume::new()
        .with_kind(PvKind::IscsiChap)
        .with_iscsi_server_ip(&server.cluster_ip)
        .with_secret_name(&secret.name)
        .with_access_mode("ReadWriteOnce")
        .with_storage_class(&sc_name)
        .with_reclaim_policy("Delete")
        .with_capacity("2Gi");
    let (_pvc, mut dep) = provision(&cli, &cleanup, pv, &sc_name).await?;

    info!("Check the pods can read, write and exec on the volume");
    dep.check_pod_mounted_volume_could_rw(&cli).await?;
    dep.check_pod_mounted_volume_have_exec_right(&cli).await?;
    scale_to_zero(&cli, &mut dep).await?;

    let secret_ref = format!("secret/{}", secret.name);
    info!("Set an invalid password and check the pod fails to log in");
    patch_resource_as_admin(
        &cli,
        &secret.namespace,
        &secret_ref,
        r#"{"data":{"discovery.sendtargets.auth.password":"bmV3UGFzcwo="}}"#,
        "merge",
    )
    .await?;
    expect_login_failure(&cli, &mut dep).await?;
    scale_to_zero(&cli, &mut dep).await?;

    info!("Restore the valid password and check the pod mounts the volume");
    patch_resource_as_admin(
        &cli,
        &secret.namespace,
        &secret_ref,
        r#"{"data":{"discovery.sendtargets.auth.password":"ZGVtbw=="}}"#,
        "merge",
    )
    .await?;
    dep.scale_replicas(&cli, "1").await?;
    dep.wait_ready(&cli).await?;

    info!("Check the data is still there and the volume has the exec right");
    dep.check_pod_mounted_volume_data_exist(&cli, true).await?;
    dep.check_pod_mounted_volume_have_exec_right(&cli).await?;
    scale_to_zero(&cli, &mut dep).await?;

    info!("Remove the credentials and check the pod fails to log in");
    patch_resource_as_admin(
        &cli,
        &secret.namespace,
        &secret_ref,
        r#"[{"op": "remove", "path": "/data"}]"#,
        "json",
    )
    .await?;
    expect_login_failure(&cli, &mut dep).await?;
    scale_to_zero(&cli, &mut dep).await?;

    info!("Disable discovery authentication and check the pod mounts the volume");
    let message = server.enable_target_discovery_auth(&cli, false).await?;
    ensure!(
        message.contains("Parameter enable is now 'False'"),
        "unexpected targetcli output {message:?}"
    );
    dep.scale_replicas(&cli, "1").await?;
    dep.wait_ready(&cli).await?;
    Ok(())
}
