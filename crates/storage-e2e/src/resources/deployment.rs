use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use e2e_util::wait::{eventually, interval_for, poll};
use e2e_util::{random_string, Cli, E2eError, E2eResult, JsonEdit};
use serde_json::Value;
use tracing::{error, info};

use super::{
    app_selector, exec_right_commands, random_content, resolve_namespace, EXEC_RIGHT_OUTPUT,
};
use crate::cluster::{
    delete_best_effort, describe_persistent_volume_claim, describe_pod,
    exec_command_in_specific_pod,
};
use crate::consts::DEFAULT_MAX_WAITING_TIME;

#[derive(Debug, Clone)]
pub struct Deployment {
    pub name: String,
    pub namespace: String,
    pub template: PathBuf,
    pub replicas: String,
    pub app_label: String,
    pub pvc_name: String,
    pub mount_path: String,
    pub volume_type: String,
    pub path_type: String,
    pub max_wait_ready_time: Duration,
}

impl Default for Deployment {
    fn default() -> Self {
        Self::new()
    }
}

impl Deployment {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("my-dep-{}", random_string()),
            namespace: String::new(),
            template: PathBuf::from("dep-template.yaml"),
            replicas: "1".to_string(),
            app_label: format!("myapp-{}", random_string()),
            pvc_name: format!("my-pvc-{}", random_string()),
            mount_path: "/mnt/storage".to_string(),
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
    pub fn with_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.template = template.into();
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
    pub fn with_pvc(mut self, pvc_name: impl Into<String>) -> Self {
        self.pvc_name = pvc_name.into();
        self
    }

    #[must_use]
    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

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
    pub fn with_max_wait_ready_time(mut self, max: Duration) -> Self {
        self.max_wait_ready_time = max;
        self
    }

    fn selector(&self) -> String {
        app_selector(&self.app_label)
    }

    pub async fn create(&mut self, cli: &Cli) -> E2eResult<()> {
        self.create_with_edits(cli, &[]).await
    }

    fn params(&self) -> [(&'static str, &str); 8] {
        [
            ("DNAME", self.name.as_str()),
            ("DNAMESPACE", self.namespace.as_str()),
            ("PVCNAME", self.pvc_name.as_str()),
            ("REPLICASNUM", self.replicas.as_str()),
            ("DLABEL", self.app_label.as_str()),
            ("MPATH", self.mount_path.as_str()),
            ("VOLUMETYPE", self.volume_type.as_str()),
            ("TYPEPATH", self.path_type.as_str()),
        ]
    }

    pub async fn create_with_edits(&mut self, cli: &Cli, edits: &[JsonEdit]) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        cli.apply_template(&self.template, &self.params(), edits).await?;
        info!(
            deployment = %self.name,
            namespace = %self.namespace,
            pvc = %self.pvc_name,
            "Created deployment"
        );
        Ok(())
    }

    /// Apply an inline-volume template with `volume` as the source of its
    /// first volume. Returns stdout and stderr joined, so admission warnings
    /// can be checked; a rejection comes back as the CLI error.
    pub async fn create_with_inline_volume(
        &mut self,
        cli: &Cli,
        volume: Value,
    ) -> E2eResult<String> {
        resolve_namespace(&mut self.namespace, cli);
        let edit = JsonEdit::set("items.0.spec.template.spec.volumes.0.", volume);
        let (stdout, stderr) = cli
            .apply_template_outputs(&self.template, &self.params(), &[edit])
            .await?;
        info!(
            deployment = %self.name,
            namespace = %self.namespace,
            "Created deployment with inline volume"
        );
        Ok(format!("{}\n{}", stdout.trim(), stderr.trim())
            .trim()
            .to_string())
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "deployment", &self.name, &self.namespace).await;
    }

    async fn get_json_path(&self, cli: &Cli, json_path: &str) -> E2eResult<String> {
        cli.without_namespace()
            .run("get")
            .args([
                "deployment",
                &self.name,
                "-n",
                &self.namespace,
                &format!("-o=jsonpath={json_path}"),
            ])
            .output()
            .await
    }

    pub async fn get_replicas_num(&self, cli: &Cli) -> E2eResult<String> {
        self.get_json_path(cli, "{.spec.replicas}").await
    }

    /// All desired replicas are available. An unset `availableReplicas`
    /// counts as zero.
    pub async fn check_ready(&self, cli: &Cli) -> E2eResult<bool> {
        let replicas = self.get_replicas_num(cli).await?;
        let available = self.get_json_path(cli, "{.status.availableReplicas}").await?;
        let ready = available == replicas || (replicas == "0" && available.is_empty());
        info!(
            deployment = %self.name,
            replicas = %replicas,
            available = %available,
            "Deployment readiness"
        );
        Ok(ready)
    }

    pub async fn wait_ready(&self, cli: &Cli) -> E2eResult<()> {
        let max = self.max_wait_ready_time;
        let result = poll(
            &format!("deployment {}/{} to become ready", self.namespace, self.name),
            interval_for(max),
            max,
            || self.check_ready(cli),
        )
        .await;
        if result.is_err() {
            for pod in self.get_pod_list_without_filter_status(cli).await.unwrap_or_default() {
                let description = describe_pod(cli, &self.namespace, &pod).await;
                error!(
                    pod = %pod,
                    description = %description,
                    "Deployment pod not ready"
                );
            }
            let pvc_description =
                describe_persistent_volume_claim(cli, &self.namespace, &self.pvc_name).await;
            error!(
                deployment = %self.name,
                pvc_description = %pvc_description,
                "Deployment did not become ready"
            );
        }
        result
    }

    pub async fn scale_replicas(&mut self, cli: &Cli, replicas: &str) -> E2eResult<()> {
        cli.without_namespace()
            .run("scale")
            .args([
                "deployment",
                &self.name,
                &format!("--replicas={replicas}"),
                "-n",
                &self.namespace,
            ])
            .execute()
            .await?;
        self.replicas = replicas.to_string();
        info!(deployment = %self.name, replicas, "Scaled deployment");
        Ok(())
    }

    /// Running pods, once their number matches the desired replicas.
    pub async fn get_pod_list(&self, cli: &Cli) -> E2eResult<Vec<String>> {
        let replicas: usize = self
            .get_replicas_num(cli)
            .await?
            .parse()
            .map_err(|_| {
                E2eError::assertion(format!("deployment {} has no replica count", self.name))
            })?;
        let selector = self.selector();
        eventually(
            &format!("deployment {} running pods", self.name),
            Duration::from_secs(120),
            Duration::from_secs(5),
            || async {
                cli.without_namespace()
                    .run("get")
                    .args([
                        "pod",
                        "-n",
                        &self.namespace,
                        "-l",
                        &selector,
                        "-o=jsonpath={.items[?(@.status.phase==\"Running\")].metadata.name}",
                    ])
                    .output()
                    .await
                    .map(|out| out.split_whitespace().map(str::to_string).collect::<Vec<_>>())
                    .unwrap_or_default()
            },
            |pods| pods.len() == replicas,
        )
        .await
    }

    pub async fn get_pod_list_without_filter_status(&self, cli: &Cli) -> E2eResult<Vec<String>> {
        let output = cli
            .without_namespace()
            .run("get")
            .args([
                "pod",
                "-n",
                &self.namespace,
                "-l",
                &self.selector(),
                "-o=jsonpath={.items[*].metadata.name}",
            ])
            .output()
            .await?;
        Ok(output.split_whitespace().map(str::to_string).collect())
    }

    /// Rolling restart: wait for a new resourceVersion and a pod set that
    /// shares no pod with the old one.
    pub async fn restart(&self, cli: &Cli) -> E2eResult<()> {
        let old_version = self.get_json_path(cli, "{.metadata.resourceVersion}").await?;
        let old_pods: HashSet<String> = self.get_pod_list(cli).await?.into_iter().collect();
        cli.without_namespace()
            .run("rollout")
            .args(["-n", &self.namespace, "restart", "deployment", &self.name])
            .execute()
            .await?;
        eventually(
            &format!("deployment {} to roll out", self.name),
            DEFAULT_MAX_WAITING_TIME,
            Duration::from_secs(15),
            || async {
                let version = self
                    .get_json_path(cli, "{.metadata.resourceVersion}")
                    .await
                    .unwrap_or_default();
                let pods = self
                    .get_pod_list_without_filter_status(cli)
                    .await
                    .unwrap_or_default();
                (version, pods)
            },
            |(version, pods)| {
                !version.is_empty()
                    && *version != old_version
                    && !pods.is_empty()
                    && pods.iter().all(|pod| !old_pods.contains(pod))
            },
        )
        .await?;
        self.wait_ready(cli).await?;
        info!(deployment = %self.name, "Deployment restarted");
        Ok(())
    }

    /// Delete the pods and let the controller recreate them.
    pub async fn hard_restart(&self, cli: &Cli) -> E2eResult<()> {
        cli.without_namespace()
            .run("delete")
            .args(["-n", &self.namespace, "pod", "-l", &self.selector()])
            .execute()
            .await?;
        self.wait_ready(cli).await
    }

    /// Every pod writes and reads back its own random file.
    pub async fn check_pod_mounted_volume_could_rw(&self, cli: &Cli) -> E2eResult<()> {
        for pod in self.get_pod_list(cli).await? {
            let (quoted, text) = random_content();
            let file = format!("{}/testfile_{}", self.mount_path, random_string());
            let write = format!("echo {quoted}>{file}");
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

    pub async fn check_pod_mounted_volume_data_exist(
        &self,
        cli: &Cli,
        exist: bool,
    ) -> E2eResult<()> {
        for pod in self.get_pod_list(cli).await? {
            let result = exec_command_in_specific_pod(
                cli,
                &self.namespace,
                &pod,
                &format!("cat {}/testfile_*", self.mount_path),
            )
            .await;
            match (exist, result) {
                (true, Ok(content)) if content.contains("storage test") => {}
                (false, Err(e)) if e.output().contains("No such file or directory") => {}
                (_, Ok(content)) => {
                    return Err(E2eError::assertion(format!(
                        "pod {pod} read {content:?}, expected data present: {exist}"
                    )))
                }
                (_, Err(e)) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn check_pod_mounted_volume_have_exec_right(&self, cli: &Cli) -> E2eResult<()> {
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
    use std::sync::Arc;

    use e2e_util::testing::ScriptedRunner;
    use e2e_util::CommandOutput;

    use super::*;

    fn deployment() -> Deployment {
        Deployment::new()
            .with_name("dep")
            .with_namespace("ns1")
            .with_app_label("myapp")
    }

    #[tokio::test]
    async fn test_check_ready_with_zero_replicas() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("{.spec.replicas}", CommandOutput::ok("0"))
                .on("{.status.availableReplicas}", CommandOutput::ok("")),
        );
        let cli = runner.into_cli("ns1");
        assert!(deployment().check_ready(&cli).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_ready_counts_available() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("{.spec.replicas}", CommandOutput::ok("2"))
                .on("{.status.availableReplicas}", CommandOutput::ok("1")),
        );
        let cli = runner.into_cli("ns1");
        assert!(!deployment().check_ready(&cli).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_pod_list_waits_for_all_replicas() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("{.spec.replicas}", CommandOutput::ok("2"))
                .on_sequence(
                    "-l app=myapp -o=jsonpath={.items[?(@.status.phase==\"Running\")]",
                    vec![CommandOutput::ok("dep-a"), CommandOutput::ok("dep-a dep-b")],
                ),
        );
        let cli = runner.into_cli("ns1");
        let pods = deployment().get_pod_list(&cli).await.unwrap();
        assert_eq!(pods, vec!["dep-a", "dep-b"]);
    }

    #[tokio::test]
    async fn test_check_pod_mounted_volume_could_rw_compares_content() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("{.spec.replicas}", CommandOutput::ok("1"))
                .on("metadata.name}", CommandOutput::ok("dep-a"))
                .on("-c cat /mnt/storage/testfile_", CommandOutput::ok("something else")),
        );
        let cli = runner.into_cli("ns1");
        let err = deployment()
            .check_pod_mounted_volume_could_rw(&cli)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dep-a"));
    }

    #[tokio::test]
    async fn test_scale_replicas_updates_expected_count() {
        let runner = Arc::new(ScriptedRunner::new());
        let cli = runner.clone().into_cli("ns1");
        let mut dep = deployment();
        dep.scale_replicas(&cli, "0").await.unwrap();
        assert_eq!(dep.replicas, "0");
        assert_eq!(
            runner.calls_matching("scale"),
            vec!["scale deployment dep --replicas=0 -n ns1"]
        );
    }

    #[tokio::test]
    async fn test_hard_restart_deletes_pods_then_waits_ready() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("{.spec.replicas}", CommandOutput::ok("1"))
                .on("{.status.availableReplicas}", CommandOutput::ok("1")),
        );
        let cli = runner.clone().into_cli("ns1");
        deployment().hard_restart(&cli).await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls[0], "delete -n ns1 pod -l app=myapp");
        assert!(calls[1..]
            .iter()
            .any(|call| call.ends_with("dep -n ns1 -o=jsonpath={.status.availableReplicas}")));
    }

    #[tokio::test]
    async fn test_create_with_inline_volume_returns_warnings() {
        let fixtures = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/storage");
        let out = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on(
            "apply -f",
            CommandOutput {
                success: true,
                stdout: "deployment.apps/dep created\n".to_string(),
                stderr: "Warning: pod security warn level is lower than privileged\n"
                    .to_string(),
            },
        ));
        let cli = runner
            .clone()
            .into_cli("ns1")
            .with_fixture_dir(fixtures)
            .with_output_dir(out.path());
        let mut dep = Deployment::new()
            .with_name("dep")
            .with_template("deployment-with-inline-volume-template.yaml");
        let volume = serde_json::json!({
            "csi": {"driver": "csi.sharedresource.openshift.io", "readOnly": true}
        });
        let output = dep.create_with_inline_volume(&cli, volume).await.unwrap();
        assert_eq!(
            output,
            "deployment.apps/dep created\n\
             Warning: pod security warn level is lower than privileged"
        );

        let apply = runner.calls_matching("apply -f").remove(0);
        let manifest = apply.rsplit(' ').next().unwrap().to_string();
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(manifest).unwrap()).unwrap();
        let volume = &doc["items"][0]["spec"]["template"]["spec"]["volumes"][0];
        assert_eq!(volume["name"], "inline-volume");
        assert_eq!(volume["csi"]["driver"], "csi.sharedresource.openshift.io");
    }
}
