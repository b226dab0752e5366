use std::path::PathBuf;
use std::time::Duration;

use e2e_util::wait::{interval_for, poll};
use e2e_util::{random_string, Cli, E2eError, E2eResult, JsonEdit};
use tracing::{error, info};

use super::{
    app_selector, exec_right_commands, random_content, resolve_namespace, EXEC_RIGHT_OUTPUT,
};
use crate::cluster::{
    delete_best_effort, describe_pod, exec_command_in_specific_pod, get_pods_list_by_label,
};
use crate::consts::DEFAULT_MAX_WAITING_TIME;

#[derive(Debug, Clone)]
pub struct StatefulSet {
    pub name: String,
    pub namespace: String,
    pub template: PathBuf,
    pub replicas: String,
    pub app_label: String,
    pub volume_name: String,
    pub mount_path: String,
    pub volume_type: String,
    pub path_type: String,
    pub sc_name: String,
    pub capacity: String,
    pub volume_mode: String,
    pub max_wait_ready_time: Duration,
}

impl Default for StatefulSet {
    fn default() -> Self {
        Self::new()
    }
}

impl StatefulSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("my-sts-{}", random_string()),
            namespace: String::new(),
            template: PathBuf::from("sts-template.yaml"),
            replicas: "2".to_string(),
            app_label: format!("mysts-{}", random_string()),
            volume_name: format!("stsvol-{}", random_string()),
            mount_path: "/mnt/local".to_string(),
            volume_type: "volumeMounts".to_string(),
            path_type: "mountPath".to_string(),
            sc_name: "gp2-csi".to_string(),
            capacity: "1Gi".to_string(),
            volume_mode: "Filesystem".to_string(),
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
    pub fn with_replicas(mut self, replicas: impl Into<String>) -> Self {
        self.replicas = replicas.into();
        self
    }

    #[must_use]
    pub fn with_app_label(mut self, label: impl Into<String>) -> Self {
        self.app_label = label.into();
        self
    }

    #[must_use]
    pub fn with_volume_name(mut self, volume_name: impl Into<String>) -> Self {
        self.volume_name = volume_name.into();
        self
    }

    #[must_use]
    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    #[must_use]
    pub fn with_storage_class(mut self, sc_name: impl Into<String>) -> Self {
        self.sc_name = sc_name.into();
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: impl Into<String>) -> Self {
        self.capacity = capacity.into();
        self
    }

    #[must_use]
    pub fn with_volume_mode(mut self, mode: impl Into<String>) -> Self {
        self.volume_mode = mode.into();
        self
    }

    /// Claim name the controller derives for replica `ordinal`.
    #[must_use]
    pub fn pvc_name(&self, ordinal: usize) -> String {
        format!("{}-{}-{ordinal}", self.volume_name, self.name)
    }

    pub async fn create(&mut self, cli: &Cli) -> E2eResult<()> {
        self.create_with_edits(cli, &[]).await
    }

    pub async fn create_with_edits(&mut self, cli: &Cli, edits: &[JsonEdit]) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        cli.apply_template(
            &self.template,
            &[
                ("STSNAME", self.name.as_str()),
                ("STSNAMESPACE", self.namespace.as_str()),
                ("VOLUMENAME", self.volume_name.as_str()),
                ("REPLICASNUM", self.replicas.as_str()),
                ("APPLABEL", self.app_label.as_str()),
                ("MPATH", self.mount_path.as_str()),
                ("VOLUMETYPE", self.volume_type.as_str()),
                ("TYPEPATH", self.path_type.as_str()),
                ("CAPACITY", self.capacity.as_str()),
                ("SCNAME", self.sc_name.as_str()),
                ("VOLUMEMODE", self.volume_mode.as_str()),
            ],
            edits,
        )
        .await?;
        info!(
            statefulset = %self.name,
            namespace = %self.namespace,
            replicas = %self.replicas,
            "Created statefulset"
        );
        Ok(())
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "sts", &self.name, &self.namespace).await;
    }

    pub async fn check_ready(&self, cli: &Cli) -> E2eResult<bool> {
        let ready = cli
            .without_namespace()
            .run("get")
            .args([
                "sts",
                &self.name,
                "-n",
                &self.namespace,
                "-o=jsonpath={.status.readyReplicas}",
            ])
            .output()
            .await?;
        info!(
            statefulset = %self.name,
            ready = %ready,
            desired = %self.replicas,
            "StatefulSet readiness"
        );
        Ok(ready == self.replicas)
    }

    pub async fn wait_ready(&self, cli: &Cli) -> E2eResult<()> {
        let max = self.max_wait_ready_time;
        let result = poll(
            &format!("statefulset {}/{} to become ready", self.namespace, self.name),
            interval_for(max),
            max,
            || self.check_ready(cli),
        )
        .await;
        if result.is_err() {
            for pod in self.get_pod_list(cli).await.unwrap_or_default() {
                let description = describe_pod(cli, &self.namespace, &pod).await;
                error!(
                    pod = %pod,
                    description = %description,
                    "StatefulSet pod not ready"
                );
            }
        }
        result
    }

    pub async fn get_pod_list(&self, cli: &Cli) -> E2eResult<Vec<String>> {
        get_pods_list_by_label(cli, &self.namespace, &app_selector(&self.app_label)).await
    }

    /// Each replica writes and reads back its own volume.
    pub async fn check_mounted_volume_could_rw(&self, cli: &Cli) -> E2eResult<()> {
        let file = format!("{}/testfile", self.mount_path);
        for pod in self.get_pod_list(cli).await? {
            let (quoted, text) = random_content();
            let write = format!("echo {quoted} > {file}");
            exec_command_in_specific_pod(cli, &self.namespace, &pod, &write).await?;
            let content =
                exec_command_in_specific_pod(cli, &self.namespace, &pod, &format!("cat {file}"))
                    .await?;
            if content != text {
                return Err(E2eError::assertion(format!(
                    "pod {pod} read {content:?} from {file}, wrote {text:?}"
                )));
            }
        }
        Ok(())
    }

    pub async fn check_mounted_volume_have_exec_right(&self, cli: &Cli) -> E2eResult<()> {
        let (write, script) = exec_right_commands(&self.mount_path);
        for pod in self.get_pod_list(cli).await? {
            exec_command_in_specific_pod(cli, &self.namespace, &pod, &write).await?;
            let output = exec_command_in_specific_pod(cli, &self.namespace, &pod, &script).await?;
            if output != EXEC_RIGHT_OUTPUT {
                return Err(E2eError::assertion(format!(
                    "pod {pod} ran {script} and got {output:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_names_follow_controller_convention() {
        let sts = StatefulSet::new().with_name("web").with_volume_name("data");
        assert_eq!(sts.pvc_name(0), "data-web-0");
        assert_eq!(sts.pvc_name(1), "data-web-1");
    }
}
