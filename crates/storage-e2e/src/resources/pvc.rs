use std::path::PathBuf;
use std::time::Duration;

use e2e_util::wait::{consistently, interval_for, poll};
use e2e_util::{random_num, random_string, Cli, E2eError, E2eResult, JsonEdit};
use serde_json::json;
use tracing::{debug, error, info};

use super::resolve_namespace;
use crate::cluster::{delete_best_effort, describe_persistent_volume_claim, patch_resource_as_admin};
use crate::consts::DEFAULT_MAX_WAITING_TIME;

#[derive(Debug, Clone)]
pub struct PersistentVolumeClaim {
    pub name: String,
    pub namespace: String,
    pub template: PathBuf,
    pub sc_name: String,
    pub access_mode: String,
    pub volume_mode: String,
    pub capacity: String,
    pub max_wait_ready_time: Duration,
}

impl Default for PersistentVolumeClaim {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentVolumeClaim {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("my-pvc-{}", random_string()),
            namespace: String::new(),
            template: PathBuf::from("pvc-template.yaml"),
            sc_name: "gp2-csi".to_string(),
            access_mode: "ReadWriteOnce".to_string(),
            volume_mode: "Filesystem".to_string(),
            capacity: format!("{}Gi", random_num(1, 10)),
            max_wait_ready_time: DEFAULT_MAX_WAITING_TIME,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn with_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.template = template.into();
        self
    }

    #[must_use]
    pub fn with_storage_class(mut self, sc_name: impl Into<String>) -> Self {
        self.sc_name = sc_name.into();
        self
    }

    #[must_use]
    pub fn with_access_mode(mut self, mode: impl Into<String>) -> Self {
        self.access_mode = mode.into();
        self
    }

    #[must_use]
    pub fn with_volume_mode(mut self, mode: impl Into<String>) -> Self {
        self.volume_mode = mode.into();
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: impl Into<String>) -> Self {
        self.capacity = capacity.into();
        self
    }

    #[must_use]
    pub fn with_max_wait_ready_time(mut self, max: Duration) -> Self {
        self.max_wait_ready_time = max;
        self
    }

    fn params(&self) -> [(&str, &str); 6] {
        [
            ("PVCNAME", self.name.as_str()),
            ("PVCNAMESPACE", self.namespace.as_str()),
            ("SCNAME", self.sc_name.as_str()),
            ("ACCESSMODE", self.access_mode.as_str()),
            ("VOLUMEMODE", self.volume_mode.as_str()),
            ("PVCCAPACITY", self.capacity.as_str()),
        ]
    }

    pub async fn create(&mut self, cli: &Cli) -> E2eResult<()> {
        self.create_with_edits(cli, &[]).await
    }

    pub async fn create_with_edits(&mut self, cli: &Cli, edits: &[JsonEdit]) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        cli.apply_template(&self.template, &self.params(), edits)
            .await?;
        info!(
            pvc = %self.name,
            namespace = %self.namespace,
            storageclass = %self.sc_name,
            capacity = %self.capacity,
            "Created PVC"
        );
        Ok(())
    }

    pub async fn delete(&self, cli: &Cli) {
        if let Err(e) = cli
            .without_namespace()
            .run("delete")
            .args(["pvc", &self.name, "-n", &self.namespace, "--ignore-not-found"])
            .execute()
            .await
        {
            error!(pvc = %self.name, error = %e, "Failed to delete PVC");
        }
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "pvc", &self.name, &self.namespace).await;
    }

    async fn get_json_path(&self, cli: &Cli, json_path: &str) -> E2eResult<String> {
        cli.without_namespace()
            .run("get")
            .args([
                "pvc",
                &self.name,
                "-n",
                &self.namespace,
                &format!("-o=jsonpath={json_path}"),
            ])
            .output()
            .await
    }

    /// `.status.phase`, e.g. `Pending` or `Bound`.
    pub async fn get_status(&self, cli: &Cli) -> E2eResult<String> {
        let status = self.get_json_path(cli, "{.status.phase}").await?;
        debug!(pvc = %self.name, status = %status, "PVC status");
        Ok(status)
    }

    /// Name of the bound PV.
    pub async fn get_volume_name(&self, cli: &Cli) -> E2eResult<String> {
        self.get_json_path(cli, "{.spec.volumeName}").await
    }

    /// CSI volume handle of the bound PV.
    pub async fn get_volume_id(&self, cli: &Cli) -> E2eResult<String> {
        let pv = self.get_volume_name(cli).await?;
        cli.as_admin()
            .without_namespace()
            .run("get")
            .args(["pv", &pv, "-o=jsonpath={.spec.csi.volumeHandle}"])
            .output()
            .await
    }

    pub async fn get_description(&self, cli: &Cli) -> String {
        describe_persistent_volume_claim(cli, &self.namespace, &self.name).await
    }

    /// `.status.capacity.storage`.
    pub async fn get_size_from_status(&self, cli: &Cli) -> E2eResult<String> {
        self.get_json_path(cli, "{.status.capacity.storage}").await
    }

    /// Request a new size and keep it as the expected capacity.
    pub async fn expand(&mut self, cli: &Cli, capacity: &str) -> E2eResult<()> {
        let patch = json!({"spec": {"resources": {"requests": {"storage": capacity}}}});
        patch_resource_as_admin(
            cli,
            &self.namespace,
            &format!("pvc/{}", self.name),
            &patch.to_string(),
            "merge",
        )
        .await?;
        info!(pvc = %self.name, capacity, "Requested PVC expansion");
        self.capacity = capacity.to_string();
        Ok(())
    }

    /// Poll until the status capacity reports the expanded size.
    pub async fn wait_resize_success(&self, cli: &Cli, expected: &str) -> E2eResult<()> {
        let result = poll(
            &format!("pvc/{} capacity to reach {expected}", self.name),
            Duration::from_secs(10),
            self.max_wait_ready_time,
            || async { Ok(self.get_size_from_status(cli).await? == expected) },
        )
        .await;
        if result.is_err() {
            let description = self.get_description(cli).await;
            error!(
                pvc = %self.name,
                description = %description,
                "PVC did not resize"
            );
        }
        result
    }

    /// Poll until the PVC reaches `expected`. `"deleted"` waits for the PVC
    /// to be gone.
    pub async fn wait_status_as_expected(&self, cli: &Cli, expected: &str) -> E2eResult<()> {
        let max = self.max_wait_ready_time;
        let result = poll(
            &format!("pvc/{} to become {expected}", self.name),
            interval_for(max),
            max,
            || async {
                match self.get_status(cli).await {
                    Ok(status) => Ok(status == expected),
                    Err(e) if expected == "deleted" && e.is_not_found() => {
                        info!(pvc = %self.name, "PVC deleted");
                        Ok(true)
                    }
                    Err(e) => Err(e),
                }
            },
        )
        .await;
        if result.is_err() {
            let description = self.get_description(cli).await;
            error!(
                pvc = %self.name,
                description = %description,
                "PVC did not reach {expected}"
            );
        }
        result
    }

    /// The status stays at `expected` for 60 seconds.
    pub async fn wait_pvc_status_to_timer(&self, cli: &Cli, expected: &str) -> E2eResult<()> {
        consistently(
            &format!("pvc/{} to stay {expected}", self.name),
            Duration::from_secs(60),
            Duration::from_secs(30),
            || async { self.get_status(cli).await.unwrap_or_else(|e| e.output()) },
            |status| status == expected,
        )
        .await
    }

    pub async fn modify_volume_attributes_class(&self, cli: &Cli, vac: &str) -> E2eResult<()> {
        let patch = json!({"spec": {"volumeAttributesClassName": vac}});
        patch_resource_as_admin(
            cli,
            &self.namespace,
            &format!("pvc/{}", self.name),
            &patch.to_string(),
            "merge",
        )
        .await?;
        info!(pvc = %self.name, vac, "Modified PVC volume attributes class");
        Ok(())
    }

    pub async fn get_current_volume_attributes_class(&self, cli: &Cli) -> E2eResult<String> {
        self.get_json_path(cli, "{.status.currentVolumeAttributesClassName}")
            .await
    }

    /// Poll until the controller reports `vac` as the current class.
    pub async fn wait_vac_applied(&self, cli: &Cli, vac: &str) -> E2eResult<()> {
        poll(
            &format!("pvc/{} to apply volume attributes class {vac}", self.name),
            Duration::from_secs(10),
            self.max_wait_ready_time,
            || async { Ok(self.get_current_volume_attributes_class(cli).await? == vac) },
        )
        .await
        .map_err(|e| match e {
            E2eError::WaitTimeout { .. } => {
                E2eError::assertion(format!("pvc/{} never applied {vac}: {e}", self.name))
            }
            other => other,
        })
    }
}
