//! In-cluster NFS and iSCSI target servers backing the static PV scenarios.

use e2e_util::{random_string, Cli, E2eError, E2eResult};
use tracing::info;

use super::{Deployment, Service};
use crate::cluster::exec_command_in_specific_pod;
use crate::consts::{ISCSI_PORT, ISCSI_TARGET_IQN};

#[derive(Debug, Clone)]
pub struct NfsServer {
    pub deploy: Deployment,
    pub svc: Service,
    pub cluster_ip: String,
}

impl Default for NfsServer {
    fn default() -> Self {
        Self::new()
    }
}

impl NfsServer {
    #[must_use]
    pub fn new() -> Self {
        let name = format!("nfs-{}", random_string());
        Self {
            deploy: Deployment::new()
                .with_name(&name)
                .with_app_label(&name)
                .with_mount_path("/mnt/data")
                .with_template("nfs-server-deploy-template.yaml"),
            svc: Service::new().with_name("nfs-service").with_selector_label(&name),
            cluster_ip: String::new(),
        }
    }

    #[must_use]
    pub fn with_deployment(mut self, deploy: Deployment) -> Self {
        self.deploy = deploy;
        self
    }

    #[must_use]
    pub fn with_service(mut self, svc: Service) -> Self {
        self.svc = svc;
        self
    }

    pub async fn install(&mut self, cli: &Cli) -> E2eResult<()> {
        self.deploy.create(cli).await?;
        self.deploy.wait_ready(cli).await?;
        self.svc.create(cli).await?;
        self.cluster_ip = self.svc.get_cluster_ip(cli).await?;
        info!(server = %self.deploy.name, ip = %self.cluster_ip, "Installed NFS server");
        Ok(())
    }

    pub async fn uninstall(&self, cli: &Cli) {
        self.svc.delete_as_admin(cli).await;
        self.deploy.delete_as_admin(cli).await;
    }
}

#[derive(Debug, Clone)]
pub struct IscsiServer {
    pub deploy: Deployment,
    pub svc: Service,
    pub cluster_ip: String,
}

impl Default for IscsiServer {
    fn default() -> Self {
        Self::new()
    }
}

impl IscsiServer {
    #[must_use]
    pub fn new() -> Self {
        let name = format!("iscsi-target{}", random_string());
        Self {
            deploy: Deployment::new()
                .with_name(&name)
                .with_app_label(&name)
                .with_mount_path("/lib/modules")
                .with_template("iscsi-server-deploy-template.yaml"),
            svc: Service::new()
                .with_name(format!("iscsi-service{}", random_string()))
                .with_selector_label(&name)
                .with_port(ISCSI_PORT)
                .with_target_port(ISCSI_PORT)
                .with_protocol("TCP"),
            cluster_ip: String::new(),
        }
    }

    /// Deploy the target, expose it and register the service IP as a
    /// portal so initiators can reach it through the service.
    pub async fn install(&mut self, cli: &Cli) -> E2eResult<()> {
        self.deploy.create(cli).await?;
        self.deploy.wait_ready(cli).await?;
        self.svc.create(cli).await?;
        self.cluster_ip = self.svc.get_cluster_ip(cli).await?;
        self.create_network_portal(cli, &self.cluster_ip).await?;
        info!(server = %self.deploy.name, ip = %self.cluster_ip, "Installed iSCSI server");
        Ok(())
    }

    async fn portals(&self, cli: &Cli, action: &str, expected: &str) -> E2eResult<()> {
        let pod = self.target_pod(cli).await?;
        let output = exec_command_in_specific_pod(
            cli,
            &self.deploy.namespace,
            &pod,
            &format!("targetcli /iscsi/{ISCSI_TARGET_IQN}/tpg1/portals {action}"),
        )
        .await?;
        if !output.contains(expected) {
            return Err(E2eError::assertion(format!(
                "targetcli portals {action} returned {output:?}"
            )));
        }
        Ok(())
    }

    /// Listen on `ip` as well, so initiators get a second path to the LUN.
    pub async fn create_network_portal(&self, cli: &Cli, ip: &str) -> E2eResult<()> {
        self.portals(
            cli,
            &format!("create {ip}"),
            &format!("Created network portal {ip}:{ISCSI_PORT}"),
        )
        .await?;
        info!(server = %self.deploy.name, ip, "Created iSCSI network portal");
        Ok(())
    }

    pub async fn delete_network_portal(&self, cli: &Cli, ip: &str) -> E2eResult<()> {
        self.portals(
            cli,
            &format!("delete {ip} {ISCSI_PORT}"),
            &format!("Deleted network portal {ip}:{ISCSI_PORT}"),
        )
        .await?;
        info!(server = %self.deploy.name, ip, "Deleted iSCSI network portal");
        Ok(())
    }

    pub async fn uninstall(&self, cli: &Cli) {
        self.svc.delete_as_admin(cli).await;
        self.deploy.delete_as_admin(cli).await;
    }

    /// First running pod of the target deployment.
    pub async fn target_pod(&self, cli: &Cli) -> E2eResult<String> {
        self.deploy
            .get_pod_list(cli)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                E2eError::assertion(format!("iSCSI target {} has no running pod", self.deploy.name))
            })
    }

    /// Toggle discovery authentication and return the targetcli output.
    pub async fn enable_target_discovery_auth(&self, cli: &Cli, enable: bool) -> E2eResult<String> {
        let pod = self.target_pod(cli).await?;
        let flag = u8::from(enable);
        exec_command_in_specific_pod(
            cli,
            &self.deploy.namespace,
            &pod,
            &format!("targetcli iscsi/ set discovery_auth enable={flag}"),
        )
        .await
    }

    /// Set discovery credentials, including the mutual pair.
    pub async fn set_target_discovery_auth_creds(
        &self,
        cli: &Cli,
        user: &str,
        password: &str,
        mutual_user: &str,
        mutual_password: &str,
    ) -> E2eResult<String> {
        let pod = self.target_pod(cli).await?;
        let output = exec_command_in_specific_pod(
            cli,
            &self.deploy.namespace,
            &pod,
            &format!(
                "targetcli iscsi/ set discovery_auth userid={user} password={password} \
                 mutual_userid={mutual_user} mutual_password={mutual_password}"
            ),
        )
        .await?;
        info!(server = %self.deploy.name, "Set iSCSI discovery credentials");
        Ok(output)
    }
}

async fn grant_privileged_scc(cli: &Cli) -> E2eResult<()> {
    if cli.is_openshift() {
        cli.as_admin()
            .run("adm")
            .args(["policy", "add-scc-to-user", "privileged", "-z", "default"])
            .execute()
            .await?;
    }
    Ok(())
}

/// Grant the default service account the privileged SCC and install an NFS
/// server.
pub async fn setup_nfs_server(cli: &Cli) -> E2eResult<NfsServer> {
    grant_privileged_scc(cli).await?;
    let mut server = NfsServer::new();
    server.install(cli).await?;
    Ok(server)
}

/// Same as [`setup_nfs_server`] for an iSCSI target.
pub async fn setup_iscsi_server(cli: &Cli) -> E2eResult<IscsiServer> {
    grant_privileged_scc(cli).await?;
    let mut server = IscsiServer::new();
    server.install(cli).await?;
    Ok(server)
}
