//! Namespace policies constraining ephemeral storage.

use std::path::PathBuf;

use e2e_util::{random_string, Cli, E2eResult};
use tracing::info;

use super::resolve_namespace;
use crate::cluster::delete_best_effort;

#[derive(Debug, Clone)]
pub struct LimitRange {
    pub name: String,
    pub namespace: String,
    pub template: PathBuf,
    pub limit_type: String,
    pub kind: String,
    pub default_request: String,
    pub default_limit: String,
    pub min: String,
    pub max: String,
}

impl Default for LimitRange {
    fn default() -> Self {
        Self::new()
    }
}

impl LimitRange {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("my-limitrange-{}", random_string()),
            namespace: String::new(),
            template: PathBuf::from("limitrange-template.yaml"),
            limit_type: "Container".to_string(),
            kind: "ephemeral-storage".to_string(),
            default_request: "1Gi".to_string(),
            default_limit: "1Gi".to_string(),
            min: "500Mi".to_string(),
            max: "2Gi".to_string(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, limit_type: impl Into<String>) -> Self {
        self.limit_type = limit_type.into();
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    #[must_use]
    pub fn with_default_request(mut self, quantity: impl Into<String>) -> Self {
        self.default_request = quantity.into();
        self
    }

    #[must_use]
    pub fn with_default_limit(mut self, quantity: impl Into<String>) -> Self {
        self.default_limit = quantity.into();
        self
    }

    #[must_use]
    pub fn with_min(mut self, quantity: impl Into<String>) -> Self {
        self.min = quantity.into();
        self
    }

    #[must_use]
    pub fn with_max(mut self, quantity: impl Into<String>) -> Self {
        self.max = quantity.into();
        self
    }

    pub async fn create(&mut self, cli: &Cli) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        cli.as_admin()
            .apply_template(
                &self.template,
                &[
                    ("LIMITRANGENAME", self.name.as_str()),
                    ("LIMITRANGENAMESPACE", self.namespace.as_str()),
                    ("LIMITTYPE", self.limit_type.as_str()),
                    ("LIMITKIND", self.kind.as_str()),
                    ("DEFAULTREQUEST", self.default_request.as_str()),
                    ("DEFAULTLIMIT", self.default_limit.as_str()),
                    ("MINVALUE", self.min.as_str()),
                    ("MAXVALUE", self.max.as_str()),
                ],
                &[],
            )
            .await?;
        info!(
            limitrange = %self.name,
            namespace = %self.namespace,
            min = %self.min,
            max = %self.max,
            "Created limit range"
        );
        Ok(())
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "limitrange", &self.name, &self.namespace).await;
    }
}

#[derive(Debug, Clone)]
pub struct ResourceQuota {
    pub name: String,
    pub namespace: String,
    pub template: PathBuf,
    pub resource_type: String,
    pub hard_requests: String,
    pub hard_limits: String,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceQuota {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: format!("my-resourcequota-{}", random_string()),
            namespace: String::new(),
            template: PathBuf::from("resourcequota-template.yaml"),
            resource_type: "ephemeral-storage".to_string(),
            hard_requests: "6Gi".to_string(),
            hard_limits: "6Gi".to_string(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = resource_type.into();
        self
    }

    #[must_use]
    pub fn with_hard_requests(mut self, quantity: impl Into<String>) -> Self {
        self.hard_requests = quantity.into();
        self
    }

    #[must_use]
    pub fn with_hard_limits(mut self, quantity: impl Into<String>) -> Self {
        self.hard_limits = quantity.into();
        self
    }

    pub async fn create(&mut self, cli: &Cli) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        cli.as_admin()
            .apply_template(
                &self.template,
                &[
                    ("RESOURCEQUOTANAME", self.name.as_str()),
                    ("RESOURCEQUOTANAMESPACE", self.namespace.as_str()),
                    ("RESOURCETYPE", self.resource_type.as_str()),
                    ("HARDREQUESTS", self.hard_requests.as_str()),
                    ("HARDLIMITS", self.hard_limits.as_str()),
                ],
                &[],
            )
            .await?;
        info!(resourcequota = %self.name, namespace = %self.namespace, "Created resource quota");
        Ok(())
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "resourcequota", &self.name, &self.namespace).await;
    }

    /// Read a field such as `{.status.used.requests\.ephemeral-storage}`.
    pub async fn get_value_by_json_path(&self, cli: &Cli, json_path: &str) -> E2eResult<String> {
        cli.as_admin()
            .without_namespace()
            .run("get")
            .args([
                "resourcequota",
                &self.name,
                "-n",
                &self.namespace,
                &format!("-o=jsonpath={json_path}"),
            ])
            .output()
            .await
    }
}
