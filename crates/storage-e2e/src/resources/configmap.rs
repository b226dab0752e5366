use std::path::PathBuf;

use e2e_util::{random_string, Cli, E2eResult};
use serde_json::{json, Value};
use tracing::info;

use super::resolve_namespace;
use crate::cluster::delete_best_effort;
use crate::consts::SHARED_RESOURCE_CSI_DRIVER;

#[derive(Debug, Clone)]
pub struct ConfigMap {
    pub name: String,
    pub namespace: String,
    pub template: PathBuf,
}

impl Default for ConfigMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("e2e-test-configmap-{}", random_string()),
            namespace: String::new(),
            template: PathBuf::from("configmap-template.yaml"),
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

    pub async fn create(&mut self, cli: &Cli) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        cli.apply_template(
            &self.template,
            &[
                ("CMNAME", self.name.as_str()),
                ("CMNAMESPACE", self.namespace.as_str()),
            ],
            &[],
        )
        .await?;
        info!(configmap = %self.name, namespace = %self.namespace, "Created configmap");
        Ok(())
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "cm", &self.name, &self.namespace).await;
    }
}

/// Cluster-scoped share of a [`ConfigMap`] served by the shared resource
/// CSI driver.
#[derive(Debug, Clone)]
pub struct SharedConfigMap {
    pub name: String,
    pub template: PathBuf,
    pub ref_cm_name: String,
    pub ref_cm_namespace: String,
}

impl SharedConfigMap {
    #[must_use]
    pub fn new(name: impl Into<String>, cm: &ConfigMap) -> Self {
        Self {
            name: name.into(),
            template: PathBuf::from("csi-sharedconfigmap-template.yaml"),
            ref_cm_name: cm.name.clone(),
            ref_cm_namespace: cm.namespace.clone(),
        }
    }

    /// Created as admin since the object has no namespace.
    pub async fn create(&self, cli: &Cli) -> E2eResult<()> {
        cli.as_admin()
            .apply_template(
                &self.template,
                &[
                    ("SCMNAME", self.name.as_str()),
                    ("REFCMNAME", self.ref_cm_name.as_str()),
                    ("REFCMNAMESPACE", self.ref_cm_namespace.as_str()),
                ],
                &[],
            )
            .await?;
        info!(
            sharedconfigmap = %self.name,
            configmap = %self.ref_cm_name,
            "Created shared configmap"
        );
        Ok(())
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "sharedconfigmap", &self.name, "").await;
    }

    /// Inline CSI volume source mounting this share read-only.
    #[must_use]
    pub fn inline_volume(&self) -> Value {
        json!({
            "csi": {
                "driver": SHARED_RESOURCE_CSI_DRIVER,
                "readOnly": true,
                "volumeAttributes": {"sharedConfigMap": self.name},
            }
        })
    }
}
