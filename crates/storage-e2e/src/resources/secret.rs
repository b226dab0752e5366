use std::path::PathBuf;

use e2e_util::{random_string, Cli, E2eResult, JsonEdit};
use serde_json::{json, Map, Value};
use tracing::info;

use super::resolve_namespace;
use crate::cluster::delete_best_effort;

#[derive(Debug, Clone)]
pub struct Secret {
    pub name: String,
    pub namespace: String,
    pub template: PathBuf,
    pub secret_type: String,
}

impl Default for Secret {
    fn default() -> Self {
        Self::new()
    }
}

impl Secret {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("secret-{}", random_string()),
            namespace: String::new(),
            template: PathBuf::from("secret-template.yaml"),
            secret_type: "Opaque".to_string(),
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
    pub fn with_type(mut self, secret_type: impl Into<String>) -> Self {
        self.secret_type = secret_type.into();
        self
    }

    pub async fn create(&mut self, cli: &Cli) -> E2eResult<()> {
        self.create_with_edits(cli, &[]).await
    }

    pub async fn create_with_edits(&mut self, cli: &Cli, edits: &[JsonEdit]) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        cli.apply_template(
            &self.template,
            &[
                ("SECNAME", self.name.as_str()),
                ("SECNAMESPACE", self.namespace.as_str()),
                ("TYPE", self.secret_type.as_str()),
            ],
            edits,
        )
        .await?;
        info!(secret = %self.name, namespace = %self.namespace, "Created secret");
        Ok(())
    }

    /// Create with `data` entries. Values must already be base64 encoded.
    pub async fn create_with_data<K, V>(&mut self, cli: &Cli, data: &[(K, V)]) -> E2eResult<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let data: Map<String, Value> = data
            .iter()
            .map(|(k, v)| (k.as_ref().to_string(), Value::from(v.as_ref())))
            .collect();
        self.create_with_edits(
            cli,
            &[JsonEdit::set("items.0.", json!({ "data": data }))],
        )
        .await
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "secret", &self.name, &self.namespace).await;
    }
}
