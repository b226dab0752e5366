//! Prometheus metrics and alerts of the cluster monitoring stack.
//!
//! Metric queries run `curl` inside the Prometheus pod, so they work without
//! any route or port-forward. Alerts are read over HTTPS through the
//! `prometheus-k8s` route.

use std::collections::BTreeMap;
use std::time::Duration;

use e2e_util::jsonpath;
use e2e_util::wait::{consistently, eventually, poll};
use e2e_util::{Cli, E2eError, E2eResult};
use serde_json::Value;
use tracing::{debug, info};

use crate::cluster::exec_command_in_specific_pod;
use crate::consts::{MONITORING_NAMESPACE, PROMETHEUS_QUERY_URL};

const PROMETHEUS_K8S: &str = "prometheus-k8s";
const VOLUME_COUNTS_METRIC: &str = "cluster:kube_persistentvolume_plugin_type_counts:sum";

/// Bearer token of the `prometheus-k8s` service account.
///
/// # Errors
///
/// Returns the CLI failure, or an assertion error for an empty token.
pub async fn get_sa_token(cli: &Cli) -> E2eResult<String> {
    let token = cli
        .as_admin()
        .without_namespace()
        .run("create")
        .args(["token", PROMETHEUS_K8S, "-n", MONITORING_NAMESPACE])
        .output()
        .await?;
    if token.is_empty() {
        return Err(E2eError::assertion("prometheus-k8s token is empty"));
    }
    Ok(token)
}

/// Prometheus client that queries from inside the `prometheus-k8s` pods.
#[derive(Clone)]
pub struct Monitor {
    cli: Cli,
    token: String,
}

impl Monitor {
    /// # Errors
    ///
    /// Returns an error if no token can be minted.
    pub async fn new(cli: &Cli) -> E2eResult<Self> {
        let token = get_sa_token(cli).await?;
        Ok(Self {
            cli: cli.as_admin(),
            token,
        })
    }

    /// Raw instant-query response.
    ///
    /// # Errors
    ///
    /// Returns the exec failure or a JSON parse error.
    pub async fn query(&self, query: &str) -> E2eResult<Value> {
        let command = format!(
            "curl -k -s -G -H \"Authorization: Bearer {}\" \
             --data-urlencode 'query={query}' {PROMETHEUS_QUERY_URL}",
            self.token
        );
        let response = exec_command_in_specific_pod(
            &self.cli,
            MONITORING_NAMESPACE,
            &format!("statefulsets/{PROMETHEUS_K8S}"),
            &command,
        )
        .await?;
        debug!(query, "Prometheus query returned {} bytes", response.len());
        Ok(serde_json::from_str(&response)?)
    }

    /// Value at `value_path` of the query response, e.g.
    /// `data.result.#(metric.check=CheckStorageClasses).value.1`.
    pub async fn get_specified_metric_value(
        &self,
        metric: &str,
        value_path: &str,
    ) -> E2eResult<String> {
        let response = self.query(metric).await?;
        Ok(jsonpath::get_string(&response, value_path))
    }

    /// Poll every 10s for up to 5 minutes until the metric reports
    /// `expected`. Query failures are retried.
    pub async fn wait_specified_metric_value_as_expected(
        &self,
        metric: &str,
        value_path: &str,
        expected: &str,
    ) -> E2eResult<()> {
        poll(
            &format!("metric {metric} {{{value_path}}} to become {expected:?}"),
            Duration::from_secs(10),
            Duration::from_secs(300),
            || async {
                match self.get_specified_metric_value(metric, value_path).await {
                    Ok(value) if value == expected => {
                        info!(metric, value_path, expected, "Metric reached expected value");
                        Ok(true)
                    }
                    Ok(value) => {
                        debug!(metric, value_path, current = %value, "Metric value");
                        Ok(false)
                    }
                    Err(e) => {
                        debug!(metric, error = %e, "Metric query failed, retrying");
                        Ok(false)
                    }
                }
            },
        )
        .await
    }

    /// Filesystem and Block volume counts for `provisioner`.
    pub async fn get_provisioned_volumes_metric(
        &self,
        provisioner: &str,
    ) -> E2eResult<BTreeMap<String, i64>> {
        let response = self.query(VOLUME_COUNTS_METRIC).await?;
        let counts = volume_mode_counts(&response, provisioner);
        info!(provisioner, ?counts, "Provisioned volume counts");
        Ok(counts)
    }
}

/// Fold `plugin_type_counts` samples into per-volume-mode counts for the
/// plugins whose name contains `provisioner`.
#[must_use]
pub fn volume_mode_counts(response: &Value, provisioner: &str) -> BTreeMap<String, i64> {
    let mut counts = BTreeMap::from([("Filesystem".to_string(), 0), ("Block".to_string(), 0)]);
    let samples = jsonpath::get(response, "data.result")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    for sample in &samples {
        if !jsonpath::get_string(sample, "metric.plugin_name").contains(provisioner) {
            continue;
        }
        let mode = jsonpath::get_string(sample, "metric.volume_mode");
        if let Some(slot) = counts.get_mut(&mode) {
            *slot = jsonpath::get_string(sample, "value.1").parse().unwrap_or(0);
        }
    }
    counts
}

/// Alert reader for `/api/v1/alerts`.
#[derive(Clone)]
pub struct AlertsClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    raise_timeout: Duration,
    poll_interval: Duration,
}

impl AlertsClient {
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> E2eResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| E2eError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            raise_timeout: Duration::from_secs(720),
            poll_interval: Duration::from_secs(30),
        })
    }

    /// Client for the cluster's `prometheus-k8s` route.
    ///
    /// # Errors
    ///
    /// Returns the CLI failure when the token or route cannot be read.
    pub async fn from_cluster(cli: &Cli) -> E2eResult<Self> {
        let token = get_sa_token(cli).await?;
        let host = cli
            .as_admin()
            .without_namespace()
            .run("get")
            .args([
                "route",
                PROMETHEUS_K8S,
                "-n",
                MONITORING_NAMESPACE,
                "-o=jsonpath={.spec.host}",
            ])
            .output()
            .await?;
        Self::new(format!("https://{host}"), token)
    }

    /// Override how long alert checks wait and how often they poll.
    #[must_use]
    pub fn with_timing(mut self, timeout: Duration, interval: Duration) -> Self {
        self.raise_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    async fn alerts(&self) -> E2eResult<Value> {
        let response = self
            .http
            .get(format!("{}/api/v1/alerts", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| E2eError::Io {
                reason: format!("alerts request failed: {e}"),
            })?;
        response.json().await.map_err(|e| E2eError::Json {
            reason: e.to_string(),
        })
    }

    /// Names of alerts currently pending or firing.
    ///
    /// # Errors
    ///
    /// Returns an IO error for transport or HTTP status failures.
    pub async fn active_alerts(&self) -> E2eResult<Vec<String>> {
        let body = self.alerts().await?;
        let names = jsonpath::get(&body, "data.alerts.#.labels.alertname")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        Ok(names)
    }

    pub async fn is_alert_raised(&self, name: &str) -> E2eResult<bool> {
        let raised = self.active_alerts().await?.iter().any(|alert| alert == name);
        info!(alert = name, raised, "Checked alert state");
        Ok(raised)
    }

    /// Wait up to 12 minutes for the alert to become pending or firing.
    pub async fn check_alert_raised(&self, name: &str) -> E2eResult<()> {
        eventually(
            &format!("alert {name} to be raised"),
            self.raise_timeout,
            self.poll_interval,
            || async { self.is_alert_raised(name).await.unwrap_or(false) },
            |raised| *raised,
        )
        .await
        .map(|_| ())
    }

    /// `annotations.description` of the first active alert called `name`.
    pub async fn alert_description(&self, name: &str) -> E2eResult<Option<String>> {
        let body = self.alerts().await?;
        let path = format!("data.alerts.#(labels.alertname={name}).annotations.description");
        Ok(jsonpath::get(&body, &path).and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Wait for the alert, then compare the node named in its description.
    ///
    /// # Errors
    ///
    /// Returns an assertion error if the alert never fires or its
    /// description names no node.
    pub async fn check_alert_node_name_match_desc(
        &self,
        name: &str,
        node: &str,
    ) -> E2eResult<bool> {
        self.check_alert_raised(name).await?;
        let description = self.alert_description(name).await?.unwrap_or_default();
        let alert_node = node_name_from_alert_description(&description).ok_or_else(|| {
            E2eError::assertion(format!("alert {name} names no node: {description:?}"))
        })?;
        info!(alert = name, alert_node, node, "Alert description node");
        Ok(alert_node == node)
    }

    /// Wait for a raised alert to clear.
    pub async fn check_alert_resolved(&self, name: &str) -> E2eResult<()> {
        eventually(
            &format!("alert {name} to be resolved"),
            self.raise_timeout,
            self.poll_interval,
            || async { self.is_alert_raised(name).await.unwrap_or(true) },
            |raised| !*raised,
        )
        .await
        .map(|_| ())
    }

    /// The alert stays absent for the whole check window.
    pub async fn check_alert_not_raised(&self, name: &str) -> E2eResult<()> {
        consistently(
            &format!("alert {name} to stay quiet"),
            self.raise_timeout,
            self.poll_interval,
            || async { self.is_alert_raised(name).await.unwrap_or(false) },
            |raised| !*raised,
        )
        .await
    }
}

/// Node in an alert description such as
/// `... oc get pod --field-selector=spec.nodeName=worker-1 --all-namespaces`.
#[must_use]
pub fn node_name_from_alert_description(description: &str) -> Option<&str> {
    let (_, rest) = description.split_once("spec.nodeName=")?;
    let node = rest.split_once(" --all-namespaces").map_or(rest, |(node, _)| node).trim();
    (!node.is_empty()).then_some(node)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use e2e_util::testing::ScriptedRunner;
    use e2e_util::CommandOutput;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn alerts_body(names: &[&str]) -> Value {
        let alerts: Vec<Value> = names
            .iter()
            .map(|name| json!({"labels": {"alertname": name}, "state": "firing"}))
            .collect();
        json!({"status": "success", "data": {"alerts": alerts}})
    }

    fn curl_result(value: &str) -> CommandOutput {
        let body = json!({"data": {"result": [{"metric": {}, "value": [1, value]}]}});
        CommandOutput::ok(body.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_metric_value_retries_until_expected() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("create token prometheus-k8s", CommandOutput::ok("tok"))
                .on_sequence(
                    "statefulsets/prometheus-k8s",
                    vec![
                        curl_result("0"),
                        CommandOutput::ok("not json"),
                        curl_result("1"),
                    ],
                ),
        );
        let monitor = Monitor::new(&runner.clone().into_cli("ns1")).await.unwrap();
        monitor
            .wait_specified_metric_value_as_expected(
                "storage_operation_errors",
                "data.result.0.value.1",
                "1",
            )
            .await
            .unwrap();
        let queries = runner.calls_matching("curl");
        assert_eq!(queries.len(), 3);
        assert!(queries[0].contains("--data-urlencode 'query=storage_operation_errors'"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_metric_value_times_out() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("create token prometheus-k8s", CommandOutput::ok("tok"))
                .on("statefulsets/prometheus-k8s", curl_result("0")),
        );
        let monitor = Monitor::new(&runner.clone().into_cli("ns1")).await.unwrap();
        let err = monitor
            .wait_specified_metric_value_as_expected("m", "data.result.0.value.1", "1")
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::WaitTimeout { .. }));
    }

    #[test]
    fn test_node_name_from_alert_description() {
        let description = "Failed to mount volumes. Check pods with \
                           oc get pod --field-selector=spec.nodeName=worker-b --all-namespaces";
        assert_eq!(node_name_from_alert_description(description), Some("worker-b"));
        assert_eq!(node_name_from_alert_description("no node here"), None);
    }

    #[tokio::test]
    async fn test_alert_node_name_matches_pod_node() {
        let server = MockServer::start().await;
        let body = json!({"status": "success", "data": {"alerts": [
            {"labels": {"alertname": "Other"}, "annotations": {"description": "x"}},
            {
                "labels": {"alertname": "PodStartupStorageOperationsFailing"},
                "annotations": {"description":
                    "oc get pod --field-selector=spec.nodeName=worker-a --all-namespaces"}
            }
        ]}});
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let client = AlertsClient::new(server.uri(), "t").unwrap();
        let alert = "PodStartupStorageOperationsFailing";
        assert!(client.check_alert_node_name_match_desc(alert, "worker-a").await.unwrap());
        assert!(!client.check_alert_node_name_match_desc(alert, "worker-b").await.unwrap());
        assert_eq!(client.alert_description("Missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_check_alert_resolved_waits_for_clear() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(alerts_body(&["Firing"])))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(alerts_body(&[])))
            .mount(&server)
            .await;

        let client = AlertsClient::new(server.uri(), "t")
            .unwrap()
            .with_timing(Duration::from_secs(5), Duration::from_millis(20));
        client.check_alert_resolved("Firing").await.unwrap();
        assert!(server.received_requests().await.unwrap().len() >= 3);
    }

    #[test]
    fn test_volume_mode_counts_filters_by_provisioner() {
        let sample = |plugin: &str, mode: &str, count: &str| {
            let plugin_name = format!("kubernetes.io/csi:{plugin}");
            json!({
                "metric": {"plugin_name": plugin_name, "volume_mode": mode},
                "value": [1_700_000_000.0, count]
            })
        };
        let response = json!({
            "status": "success",
            "data": {"result": [
                sample("ebs.csi.aws.com", "Filesystem", "4"),
                sample("ebs.csi.aws.com", "Block", "1"),
                sample("efs.csi.aws.com", "Filesystem", "9"),
            ]}
        });
        let counts = volume_mode_counts(&response, "ebs.csi.aws.com");
        assert_eq!(counts["Filesystem"], 4);
        assert_eq!(counts["Block"], 1);

        let none = volume_mode_counts(&response, "disk.csi.azure.com");
        assert_eq!(none["Filesystem"], 0);
        assert_eq!(none["Block"], 0);
    }

    #[tokio::test]
    async fn test_metric_value_via_prometheus_pod() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("create token prometheus-k8s", CommandOutput::ok("tok123\n"))
                .on(
                    "statefulsets/prometheus-k8s",
                    CommandOutput::ok(
                        json!({"data": {"result": [
                            {"metric": {"check": "CheckStorageClasses"}, "value": [1, "1"]}
                        ]}})
                        .to_string(),
                    ),
                ),
        );
        let cli = runner.clone().into_cli("ns1");
        let monitor = Monitor::new(&cli).await.unwrap();
        let value = monitor
            .get_specified_metric_value(
                "vsphere_cluster_check_errors",
                "data.result.#(metric.check=CheckStorageClasses).value.1",
            )
            .await
            .unwrap();
        assert_eq!(value, "1");
        let exec = runner.calls_matching("curl");
        assert!(exec[0].starts_with("exec -n openshift-monitoring statefulsets/prometheus-k8s"));
        assert!(exec[0].contains("Authorization: Bearer tok123"));
    }

    #[tokio::test]
    async fn test_alert_raised_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(alerts_body(&[
                "KubePersistentVolumeFillingUp",
                "PodDisruptionBudgetLimit",
            ])))
            .mount(&server)
            .await;

        let client = AlertsClient::new(server.uri(), "secret").unwrap();
        assert!(client.is_alert_raised("PodDisruptionBudgetLimit").await.unwrap());
        assert!(!client.is_alert_raised("KubeletDown").await.unwrap());
    }

    #[tokio::test]
    async fn test_check_alert_raised_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(alerts_body(&[])))
            .mount(&server)
            .await;

        let client = AlertsClient::new(server.uri(), "t")
            .unwrap()
            .with_timing(Duration::from_millis(200), Duration::from_millis(50));
        let err = client.check_alert_raised("StorageAlert").await.unwrap_err();
        assert!(matches!(err, E2eError::Assertion(_)));
        client.check_alert_not_raised("StorageAlert").await.unwrap();
    }

    #[tokio::test]
    async fn test_alerts_http_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = AlertsClient::new(server.uri(), "t").unwrap();
        assert!(client.active_alerts().await.is_err());
    }
}
