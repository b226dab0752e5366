use std::path::PathBuf;

use e2e_util::{random_string, Cli, E2eResult, JsonEdit};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::cluster::delete_best_effort;

#[derive(Debug, Clone)]
pub struct StorageClass {
    pub name: String,
    pub template: PathBuf,
    pub provisioner: String,
    pub reclaim_policy: String,
    pub volume_binding_mode: String,
    pub parameters: Map<String, Value>,
    pub allow_volume_expansion: Option<bool>,
}

impl Default for StorageClass {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageClass {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("mystorageclass-{}", random_string()),
            template: PathBuf::from("storageclass-template.yaml"),
            provisioner: "ebs.csi.aws.com".to_string(),
            reclaim_policy: "Delete".to_string(),
            volume_binding_mode: "WaitForFirstConsumer".to_string(),
            parameters: Map::new(),
            allow_volume_expansion: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.template = template.into();
        self
    }

    #[must_use]
    pub fn with_provisioner(mut self, provisioner: impl Into<String>) -> Self {
        self.provisioner = provisioner.into();
        self
    }

    #[must_use]
    pub fn with_reclaim_policy(mut self, policy: impl Into<String>) -> Self {
        self.reclaim_policy = policy.into();
        self
    }

    #[must_use]
    pub fn with_volume_binding_mode(mut self, mode: impl Into<String>) -> Self {
        self.volume_binding_mode = mode.into();
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_allow_volume_expansion(mut self, allow: bool) -> Self {
        self.allow_volume_expansion = Some(allow);
        self
    }

    pub async fn create(&self, cli: &Cli) -> E2eResult<()> {
        self.create_with_edits(cli, Vec::new()).await
    }

    /// Create with additional manifest edits, applied after the
    /// `parameters` and `allowVolumeExpansion` edits.
    pub async fn create_with_edits(&self, cli: &Cli, extra: Vec<JsonEdit>) -> E2eResult<()> {
        let mut edits = Vec::new();
        if !self.parameters.is_empty() {
            edits.push(JsonEdit::set(
                "items.0.",
                json!({ "parameters": self.parameters }),
            ));
        }
        if let Some(allow) = self.allow_volume_expansion {
            edits.push(JsonEdit::set(
                "items.0.",
                json!({ "allowVolumeExpansion": allow }),
            ));
        }
        edits.extend(extra);
        cli.as_admin()
            .apply_template(
                &self.template,
                &[
                    ("SCNAME", self.name.as_str()),
                    ("RECLAIMPOLICY", self.reclaim_policy.as_str()),
                    ("PROVISIONER", self.provisioner.as_str()),
                    ("VOLUMEBINDINGMODE", self.volume_binding_mode.as_str()),
                ],
                &edits,
            )
            .await?;
        info!(storageclass = %self.name, provisioner = %self.provisioner, "Created storage class");
        Ok(())
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "sc", &self.name, "").await;
    }

    pub async fn get_field_by_json_path(&self, cli: &Cli, json_path: &str) -> E2eResult<String> {
        cli.as_admin()
            .without_namespace()
            .run("get")
            .args(["sc", &self.name, &format!("-o=jsonpath={json_path}")])
            .output()
            .await
    }
}
