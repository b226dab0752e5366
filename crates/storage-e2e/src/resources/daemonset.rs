use std::path::PathBuf;
use std::time::Duration;

use e2e_util::wait::{interval_for, poll};
use e2e_util::{random_string, Cli, E2eError, E2eResult};
use futures::future::try_join_all;
use tracing::{error, info};

use super::{app_selector, resolve_namespace};
use crate::cluster::{
    delete_best_effort, describe_pod, exec_command_in_specific_pod, get_pods_list_by_label,
};
use crate::consts::DEFAULT_MAX_WAITING_TIME;

#[derive(Debug, Clone)]
pub struct DaemonSet {
    pub name: String,
    pub namespace: String,
    pub template: PathBuf,
    pub app_label: String,
    pub pvc_name: String,
    pub mount_path: String,
    pub volume_type: String,
    pub path_type: String,
    pub max_wait_ready_time: Duration,
}

impl Default for DaemonSet {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("my-ds-{}", random_string()),
            namespace: String::new(),
            template: PathBuf::from("ds-template.yaml"),
            app_label: format!("myds-{}", random_string()),
            pvc_name: format!("my-pvc-{}", random_string()),
            mount_path: "/mnt/ds".to_string(),
            volume_type: "volumeMounts".to_string(),
            path_type: "mountPath".to_string(),
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
    pub fn with_app_label(mut self, label: impl Into<String>) -> Self {
        self.app_label = label.into();
        self
    }

    #[must_use]
    pub fn with_pvc(mut self, pvc_name: impl Into<String>) -> Self {
        self.pvc_name = pvc_name.into();
        self
    }

    #[must_use]
    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    pub async fn create(&mut self, cli: &Cli) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        cli.apply_template(
            &self.template,
            &[
                ("DSNAME", self.name.as_str()),
                ("DSNAMESPACE", self.namespace.as_str()),
                ("PVCNAME", self.pvc_name.as_str()),
                ("DSLABEL", self.app_label.as_str()),
                ("MPATH", self.mount_path.as_str()),
                ("VOLUMETYPE", self.volume_type.as_str()),
                ("TYPEPATH", self.path_type.as_str()),
            ],
            &[],
        )
        .await?;
        info!(
            daemonset = %self.name,
            namespace = %self.namespace,
            pvc = %self.pvc_name,
            "Created daemonset"
        );
        Ok(())
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "ds", &self.name, &self.namespace).await;
    }

    async fn get_json_path(&self, cli: &Cli, json_path: &str) -> E2eResult<String> {
        cli.without_namespace()
            .run("get")
            .args([
                "ds",
                &self.name,
                "-n",
                &self.namespace,
                &format!("-o=jsonpath={json_path}"),
            ])
            .output()
            .await
    }

    /// Available pods match the desired schedule count.
    pub async fn check_ready(&self, cli: &Cli) -> E2eResult<bool> {
        let available = self.get_json_path(cli, "{.status.numberAvailable}").await?;
        let desired = self
            .get_json_path(cli, "{.status.desiredNumberScheduled}")
            .await?;
        info!(
            daemonset = %self.name,
            available = %available,
            desired = %desired,
            "DaemonSet readiness"
        );
        Ok(!desired.is_empty() && available == desired)
    }

    pub async fn wait_ready(&self, cli: &Cli) -> E2eResult<()> {
        let max = self.max_wait_ready_time;
        let result = poll(
            &format!("daemonset {}/{} to become ready", self.namespace, self.name),
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
                    "DaemonSet pod not ready"
                );
            }
        }
        result
    }

    pub async fn get_pod_list(&self, cli: &Cli) -> E2eResult<Vec<String>> {
        get_pods_list_by_label(cli, &self.namespace, &app_selector(&self.app_label)).await
    }

    /// Pod `i` (1-based) writes `testfile_i` to the shared volume. Returns
    /// the number of files written.
    pub async fn check_pod_mounted_volume_could_write(&self, cli: &Cli) -> E2eResult<usize> {
        let pods = self.get_pod_list(cli).await?;
        for (index, pod) in pods.iter().enumerate() {
            let command = format!(
                "echo storage test {}>{}/testfile_{}",
                random_string(),
                self.mount_path,
                index + 1
            );
            exec_command_in_specific_pod(cli, &self.namespace, pod, &command).await?;
        }
        info!(daemonset = %self.name, files = pods.len(), "Every pod wrote its file");
        Ok(pods.len())
    }

    /// Every pod reads every file written by
    /// [`DaemonSet::check_pod_mounted_volume_could_write`].
    pub async fn check_pod_mounted_volume_could_read(
        &self,
        cli: &Cli,
        files: usize,
    ) -> E2eResult<()> {
        let pods = self.get_pod_list(cli).await?;
        try_join_all(pods.iter().map(|pod| async move {
            for index in 1..=files {
                let file = format!("{}/testfile_{index}", self.mount_path);
                let content =
                    exec_command_in_specific_pod(cli, &self.namespace, pod, &format!("cat {file}"))
                        .await?;
                if !content.contains("storage test") {
                    return Err(E2eError::assertion(format!(
                        "pod {pod} read {content:?} from {file}"
                    )));
                }
            }
            Ok(())
        }))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use e2e_util::testing::ScriptedRunner;
    use e2e_util::CommandOutput;

    use super::*;

    fn daemonset() -> DaemonSet {
        DaemonSet::new()
            .with_name("ds")
            .with_namespace("ns1")
            .with_app_label("myds")
    }

    #[tokio::test]
    async fn test_every_pod_reads_every_file() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("-l app=myds", CommandOutput::ok("ds-a ds-b ds-c"))
                .on("-c cat /mnt/ds/testfile_", CommandOutput::ok("storage test abc")),
        );
        let cli = runner.clone().into_cli("ns1");
        let ds = daemonset();
        let files = ds.check_pod_mounted_volume_could_write(&cli).await.unwrap();
        assert_eq!(files, 3);
        assert_eq!(runner.calls_matching("ds-b -- /bin/sh -c echo storage test").len(), 1);
        assert!(runner.calls_matching("-c echo").iter().any(|c| c.ends_with("/mnt/ds/testfile_3")));

        ds.check_pod_mounted_volume_could_read(&cli, files).await.unwrap();
        assert_eq!(runner.calls_matching("-c cat").len(), 9);
    }

    #[tokio::test]
    async fn test_check_ready_compares_available_and_desired() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("{.status.numberAvailable}", CommandOutput::ok("3"))
                .on("{.status.desiredNumberScheduled}", CommandOutput::ok("3")),
        );
        let cli = runner.into_cli("ns1");
        assert!(daemonset().check_ready(&cli).await.unwrap());
    }
}
