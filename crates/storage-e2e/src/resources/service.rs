use std::path::PathBuf;

use e2e_util::{random_string, Cli, E2eResult};
use tracing::info;

use super::resolve_namespace;
use crate::cluster::delete_best_effort;

#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    pub template: PathBuf,
    pub port: String,
    pub protocol: String,
    pub target_port: String,
    pub selector_label: String,
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl Service {
    #[must_use]
    pub fn new() -> Self {
        let name = format!("storage-svc-{}", random_string());
        Self {
            selector_label: name.clone(),
            name,
            namespace: String::new(),
            template: PathBuf::from("service-template.yaml"),
            port: "2049".to_string(),
            protocol: "TCP".to_string(),
            target_port: "2049".to_string(),
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
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    #[must_use]
    pub fn with_target_port(mut self, port: impl Into<String>) -> Self {
        self.target_port = port.into();
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    #[must_use]
    pub fn with_selector_label(mut self, label: impl Into<String>) -> Self {
        self.selector_label = label.into();
        self
    }

    pub async fn create(&mut self, cli: &Cli) -> E2eResult<()> {
        resolve_namespace(&mut self.namespace, cli);
        cli.apply_template(
            &self.template,
            &[
                ("SERVICENAME", self.name.as_str()),
                ("SERVICENAMESPACE", self.namespace.as_str()),
                ("PORT", self.port.as_str()),
                ("PROTOCOL", self.protocol.as_str()),
                ("TARGETPORT", self.target_port.as_str()),
                ("SELECTORLABEL", self.selector_label.as_str()),
            ],
            &[],
        )
        .await?;
        info!(
            service = %self.name,
            namespace = %self.namespace,
            port = %self.port,
            "Created service"
        );
        Ok(())
    }

    pub async fn delete_as_admin(&self, cli: &Cli) {
        delete_best_effort(cli, "service", &self.name, &self.namespace).await;
    }

    pub async fn get_cluster_ip(&self, cli: &Cli) -> E2eResult<String> {
        let ip = cli
            .without_namespace()
            .run("get")
            .args([
                "service",
                &self.name,
                "-n",
                &self.namespace,
                "-o=jsonpath={.spec.clusterIP}",
            ])
            .output()
            .await?;
        info!(service = %self.name, cluster_ip = %ip, "Service cluster IP");
        Ok(ip)
    }
}
