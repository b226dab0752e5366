use std::path::PathBuf;
use std::time::Duration;

use e2e_util::wait::{interval_for, poll};
use e2e_util::{random_string, Cli, E2eError, E2eResult, JsonEdit};
use serde_json::json;
use tracing::{error, info};

use super::{exec_right_commands, resolve_namespace, EXEC_RIGHT_OUTPUT};
use crate::cluster::{
    check_pod_ready, delete_best_effort, describe_persistent_volume_claim, describe_pod,
    exec_command_in_specific_pod, exec_command_in_specified_container, get_node_name_by_pod,
};
use crate::consts::{DEFAULT_MAX_WAITING_TIME, HELLO_OPENSHIFT_IMAGE};

#[derive(Debug, Clone)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub template: PathBuf,
    pub pvc_name: String,
    pub image: String,
    pub volume_type: String,
    pub path_type: String,
    pub mount_path: String,
    pub max_wait_ready_time: Duration,
}

impl Default for Pod {
    fn default() -> Self {
        Self::new()
    }
}

impl Pod {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("mypod-{}", random_string()),
            namespace: String::new(),
            template: PathBuf::from("pod-template.yaml"),
            pvc_name: "mypvc".to_string(),
            image: HELLO_OPENSHIFT_IMAGE.to_string(),
            volume_type: "volumeMounts".to_string(),
            path_type: "mountPath".to_string(),
            mount_path: "/mnt/storage".to_string(),
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
    pub fn with_pvc(mut self, pvc_name: impl Into<String>) -> Self {
        self.pvc_name = pvc_name.into();
        self
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Raw block volumes use `volumeDevices`/`devicePath`.
    #[must_use]
    pub fn with_volume_type(mut self, volume_type: impl Into<String>) -> Self {
        self.volume_type = volume_type.into();
        self
    }

    #[must_use]
    pub fn with_path_type(mut self, path_type: impl Into<String>) -> Self {
        self.path_type = path_type.into();
        self
    }

    #[must_use]
    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    #[must_use]
    pub fn with_max_wait_ready_time(mut self, max: Duration) -> Self {
        self.max_wait_ready_time = max;
        self
    }

    fn params(&self) -> [(&str, &str); 7] {
        [
            ("PODNAME", self.name.as_str()),
            ("PODNAMESPACE", self.namespace.as_str()),
            ("PVCNAME", self.pvc_name.as_str()),
            ("PODIMAGE", self.image.as_str()),
            ("VOLUMETYPE", self.volume_type.as_str()),
            ("PATHTYPE", self.path_type.as_str()),
            ("PODMOUNTPATH", self.mount_path.as_str()),
        ]
    }

    pub async fn create(&mut self, cli: &Cli) -> E2eResult<()> {
        self.create_with_edits(cli, &[]).await
    }

    pub async fn create_with_edits(&mut self, cli: &Cli, edits: &[JsonEdit]) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        cli.apply_template(&self.template, &self.params(), edits)
            .await?;
        info!(pod = %self.name, namespace = %self.namespace, pvc = %self.pvc_name, "Created pod");
        Ok(())
    }

    /// Create an object the API server is expected to reject and return its
    /// error message.
    ///
    /// # Errors
    ///
    /// Returns an assertion error when the pod is accepted.
    pub async fn try_create_with_edits(
        &mut self,
        cli: &Cli,
        edits: &[JsonEdit],
    ) -> E2eResult<String> {
        resolve_namespace(&mut self.namespace, cli);
        match cli.apply_template(&self.template, &self.params(), edits).await {
            Ok(output) => Err(E2eError::assertion(format!(
                "pod {} was created but should have been rejected: {output}",
                self.name
            ))),
            Err(e) => {
                info!(pod = %self.name, "Pod rejected as expected");
                Ok(e.output())
            }
        }
    }

    /// Pin the pod with a required node affinity term. Applied as admin so
    /// that `kubernetes.io/hostname` style keys are allowed.
    pub async fn create_with_node_affinity(
        &mut self,
        cli: &Cli,
        key: &str,
        operator: &str,
        values: &[String],
    ) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        let edit = JsonEdit::set(
            concat!(
                "items.0.spec.affinity.nodeAffinity.",
                "requiredDuringSchedulingIgnoredDuringExecution.",
                "nodeSelectorTerms.0.matchExpressions.0."
            ),
            json!({ "key": key, "operator": operator, "values": values }),
        );
        cli.as_admin()
            .apply_template(&self.template, &self.params(), &[edit])
            .await?;
        info!(pod = %self.name, key, operator, ?values, "Created pod with node affinity");
        Ok(())
    }

    pub async fn delete(&self, cli: &Cli) {
        if let Err(e) = cli
            .without_namespace()
            .run("delete")
            .args(["pod", &self.name, "-n", &self.namespace, "--ignore-not-found"])
            .execute()
            .await
        {
            error!(pod = %self.name, error = %e, "Failed to delete pod");
        }
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "pod", &self.name, &self.namespace).await;
    }

    /// Poll until the pod is ready. Pod and PVC descriptions are logged on
    /// timeout.
    pub async fn wait_ready(&self, cli: &Cli) -> E2eResult<()> {
        let max = self.max_wait_ready_time;
        let result = poll(
            &format!("pod {}/{} to become ready", self.namespace, self.name),
            interval_for(max),
            max,
            || check_pod_ready(cli, &self.namespace, &self.name),
        )
        .await;
        if result.is_err() {
            let pvc_description =
                describe_persistent_volume_claim(cli, &self.namespace, &self.pvc_name).await;
            let pod_description = describe_pod(cli, &self.namespace, &self.name).await;
            error!(
                pod = %self.name,
                pod_description = %pod_description,
                pvc_description = %pvc_description,
                "Pod did not become ready"
            );
        }
        result
    }

    pub async fn get_node_name(&self, cli: &Cli) -> E2eResult<String> {
        get_node_name_by_pod(cli, &self.namespace, &self.name).await
    }

    pub async fn exec_command(&self, cli: &Cli, command: &str) -> E2eResult<String> {
        exec_command_in_specific_pod(cli, &self.namespace, &self.name, command).await
    }

    pub async fn exec_command_in_specified_container(
        &self,
        cli: &Cli,
        container: &str,
        command: &str,
    ) -> E2eResult<String> {
        exec_command_in_specified_container(cli, &self.namespace, &self.name, container, command)
            .await
    }

    pub async fn exec_command_as_admin(&self, cli: &Cli, command: &str) -> E2eResult<String> {
        exec_command_in_specific_pod(&cli.as_admin(), &self.namespace, &self.name, command).await
    }

    pub async fn get_value_by_json_path(&self, cli: &Cli, json_path: &str) -> E2eResult<String> {
        cli.as_admin()
            .without_namespace()
            .run("get")
            .args([
                "-n",
                &self.namespace,
                &format!("pod/{}", self.name),
                &format!("-o=jsonpath={json_path}"),
            ])
            .output()
            .await
    }

    /// Write, sync and read back a file on the mounted volume.
    pub async fn check_mounted_volume_could_rw(&self, cli: &Cli) -> E2eResult<()> {
        let file = format!("{}/testfile", self.mount_path);
        self.exec_command(cli, &format!("echo \"storage test\" >{file}"))
            .await?;
        self.exec_command(cli, &format!("sync -f {file}")).await?;
        let content = self.exec_command(cli, &format!("cat {file}")).await?;
        if !content.contains("storage test") {
            return Err(E2eError::assertion(format!(
                "pod {} read {content:?} from {file}",
                self.name
            )));
        }
        info!(pod = %self.name, "Mounted volume is readable and writable");
        Ok(())
    }

    /// Data written by an earlier pod is still on the volume.
    pub async fn check_mounted_volume_data_exist(&self, cli: &Cli, exist: bool) -> E2eResult<()> {
        let file = format!("{}/testfile", self.mount_path);
        let result = self.exec_command(cli, &format!("cat {file}")).await;
        match (exist, result) {
            (true, Ok(content)) if content.contains("storage test") => Ok(()),
            (false, Err(e)) if e.output().contains("No such file or directory") => Ok(()),
            (_, Ok(content)) => Err(E2eError::assertion(format!(
                "pod {} read {content:?} from {file}, expected data present: {exist}",
                self.name
            ))),
            (_, Err(e)) => Err(e),
        }
    }

    /// A script written to the volume can be executed.
    pub async fn check_mounted_volume_have_exec_right(&self, cli: &Cli) -> E2eResult<()> {
        let (write, script) = exec_right_commands(&self.mount_path);
        self.exec_command(cli, &write).await?;
        let output = self.exec_command(cli, &script).await?;
        if output != EXEC_RIGHT_OUTPUT {
            return Err(E2eError::assertion(format!(
                "pod {} ran {script} and got {output:?}",
                self.name
            )));
        }
        Ok(())
    }

    pub async fn write_data_into_raw_block_volume(&self, cli: &Cli) -> E2eResult<()> {
        let device = &self.mount_path;
        self.exec_command(
            cli,
            &format!("/bin/dd  if=/dev/null of={device} bs=512 count=1"),
        )
        .await?;
        self.exec_command(cli, &format!("echo 'storage test' > {device}"))
            .await?;
        info!(pod = %self.name, device = %device, "Wrote data into raw block volume");
        Ok(())
    }

    pub async fn check_data_in_raw_block_volume(&self, cli: &Cli) -> E2eResult<()> {
        let device = &self.mount_path;
        self.exec_command(
            cli,
            &format!("/bin/dd if={device} of=/tmp/testfile bs=512 count=1"),
        )
        .await?;
        let content = self.exec_command(cli, "cat /tmp/testfile").await?;
        if !content.contains("storage test") {
            return Err(E2eError::assertion(format!(
                "raw block device {device} in pod {} holds {content:?}",
                self.name
            )));
        }
        Ok(())
    }
}
