use std::path::PathBuf;

use e2e_util::{random_string, Cli, E2eResult, JsonEdit};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::cluster::delete_best_effort;

/// Cluster-scoped `VolumeAttributesClass`.
#[derive(Debug, Clone)]
pub struct VolumeAttributesClass {
    pub name: String,
    pub template: PathBuf,
    pub driver_name: String,
    pub parameters: Map<String, Value>,
}

impl Default for VolumeAttributesClass {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeAttributesClass {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("my-vac-{}", random_string()),
            template: PathBuf::from("volumeattributesclass-template.yaml"),
            driver_name: "ebs.csi.aws.com".to_string(),
            parameters: Map::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver_name = driver.into();
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub async fn create(&self, cli: &Cli) -> E2eResult<()> {
        let mut edits = Vec::new();
        if !self.parameters.is_empty() {
            edits.push(JsonEdit::set(
                "items.0.",
                json!({ "parameters": self.parameters }),
            ));
        }
        cli.as_admin()
            .apply_template(
                &self.template,
                &[
                    ("VACNAME", self.name.as_str()),
                    ("DRIVERNAME", self.driver_name.as_str()),
                ],
                &edits,
            )
            .await?;
        info!(vac = %self.name, driver = %self.driver_name, "Created volume attributes class");
        Ok(())
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "vac", &self.name, "").await;
    }
}
