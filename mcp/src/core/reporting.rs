//! Metrics and invocation-log reporting to external HTTP endpoints.
//!
//! Reporting is best effort: failures are logged locally and never reach the
//! caller of the operation being reported.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    config::MonitoringConfig,
    credential::CredentialManager,
    metrics::{McpMetrics, MetricsSnapshot},
    supervisor::ToolInvocation,
};
use crate::{
    error::McpResult,
    principal::{PrincipalId, SessionId},
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub timestamp: DateTime<Utc>,
    pub server_id: String,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub server_id: String,
    pub tool_name: String,
    pub principal_id: Option<PrincipalId>,
    pub session_id: Option<SessionId>,
    pub duration_ms: f64,
    pub success: bool,
    pub error: Option<String>,
}

impl InvocationLogEntry {
    pub fn new(server_id: &str, invocation: &ToolInvocation) -> Self {
        Self {
            timestamp: Utc::now(),
            server_id: server_id.to_string(),
            tool_name: invocation.tool_name.clone(),
            principal_id: invocation.context.principal_id.clone(),
            session_id: invocation.context.session_id.clone(),
            duration_ms: invocation.duration_ms,
            success: invocation.success,
            error: invocation.error.clone(),
        }
    }
}

pub struct Reporter {
    http: reqwest::Client,
    server_id: String,
    monitoring: MonitoringConfig,
    credentials: Arc<CredentialManager>,
    metrics: Arc<McpMetrics>,
}

impl Reporter {
    pub fn new(
        http: reqwest::Client,
        server_id: impl Into<String>,
        monitoring: MonitoringConfig,
        credentials: Arc<CredentialManager>,
        metrics: Arc<McpMetrics>,
    ) -> Self {
        Self {
            http,
            server_id: server_id.into(),
            monitoring,
            credentials,
            metrics,
        }
    }

    pub fn detailed_logging_enabled(&self) -> bool {
        self.monitoring.enable_detailed_logging && self.monitoring.logs_endpoint.is_some()
    }

    /// POST one metrics snapshot. No-op without a metrics endpoint.
    pub async fn report_metrics(&self) -> McpResult<()> {
        let Some(endpoint) = self.monitoring.metrics_endpoint()? else {
            return Ok(());
        };

        let report = MetricsReport {
            timestamp: Utc::now(),
            server_id: self.server_id.clone(),
            metrics: self.metrics.snapshot(),
        };
        self.post(&endpoint, &report).await?;
        debug!(server_id = %self.server_id, "Reported metrics");
        Ok(())
    }

    /// POST one invocation log entry. No-op unless detailed logging is on.
    pub async fn send_invocation_log(&self, entry: &InvocationLogEntry) -> McpResult<()> {
        if !self.monitoring.enable_detailed_logging {
            return Ok(());
        }
        let Some(endpoint) = self.monitoring.logs_endpoint()? else {
            return Ok(());
        };
        self.post(&endpoint, entry).await
    }

    async fn post<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> McpResult<()> {
        let mut request = self.http.post(endpoint).json(body);
        if let Some(credential) = self.credentials.current() {
            request = request.bearer_auth(credential.token());
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }

    /// Start the periodic metrics reporter. Returns `None` without an endpoint.
    pub fn spawn_metrics_loop(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.monitoring.metrics_endpoint.as_ref()?;

        let reporter = Arc::clone(self);
        let period = self.monitoring.metrics_interval();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(server_id = %reporter.server_id, "Metrics reporter stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = reporter.report_metrics().await {
                            warn!(server_id = %reporter.server_id, error = %e, "Failed to report metrics");
                        }
                    }
                }
            }
        }))
    }

    /// Ship an invocation log entry in the background.
    pub fn log_invocation(self: &Arc<Self>, invocation: &ToolInvocation, cancel: &CancellationToken) {
        if !self.detailed_logging_enabled() {
            return;
        }

        let entry = InvocationLogEntry::new(&self.server_id, invocation);
        let reporter = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = reporter.send_invocation_log(&entry) => {
                    if let Err(e) = result {
                        warn!(
                            server_id = %reporter.server_id,
                            tool = %entry.tool_name,
                            error = %e,
                            "Failed to ship invocation log"
                        );
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        core::{config::AuthConfig, metrics::Outcome},
        principal::InvocationContext,
    };

    async fn reporter(server: &MockServer, detailed: bool) -> Arc<Reporter> {
        let metrics = Arc::new(McpMetrics::new());
        let credentials = Arc::new(CredentialManager::new(
            AuthConfig::Bearer {
                token: Some("tok".to_string()),
            },
            reqwest::Client::new(),
            Arc::clone(&metrics),
        ));
        credentials.authenticate().await.unwrap();

        let monitoring = MonitoringConfig {
            metrics_endpoint: Some(format!("{}/metrics", server.uri())),
            logs_endpoint: Some(format!("{}/logs", server.uri())),
            enable_detailed_logging: detailed,
            metrics_interval_secs: 1,
        };
        Arc::new(Reporter::new(
            reqwest::Client::new(),
            "search",
            monitoring,
            credentials,
            metrics,
        ))
    }

    fn invocation(success: bool) -> ToolInvocation {
        ToolInvocation {
            tool_name: "lookup".to_string(),
            arguments: json!({"q": "rust"}),
            context: InvocationContext::for_principal("u1"),
            started_at: Utc::now(),
            duration_ms: 12.5,
            success,
            result: None,
            error: (!success).then(|| "boom".to_string()),
        }
    }

    #[tokio::test]
    async fn test_report_metrics_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metrics"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = reporter(&server, false).await;
        reporter.metrics.record(Outcome::Success, 10.0);
        reporter.report_metrics().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["serverId"], "search");
        assert_eq!(body["metrics"]["totalRequests"], 1);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_report_metrics_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let reporter = reporter(&server, false).await;
        assert!(reporter.report_metrics().await.is_err());
    }

    #[tokio::test]
    async fn test_invocation_log_entry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logs"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let reporter = reporter(&server, true).await;
        let entry = InvocationLogEntry::new("search", &invocation(false));
        reporter.send_invocation_log(&entry).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["toolName"], "lookup");
        assert_eq!(body["principalId"], "u1");
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "boom");
        assert_eq!(body["durationMs"], 12.5);
    }

    #[tokio::test]
    async fn test_invocation_log_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let reporter = reporter(&server, false).await;
        assert!(!reporter.detailed_logging_enabled());
        reporter.log_invocation(&invocation(true), &CancellationToken::new());
        let entry = InvocationLogEntry::new("search", &invocation(true));
        reporter.send_invocation_log(&entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_loop_stops_on_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let reporter = reporter(&server, false).await;
        let cancel = CancellationToken::new();
        let handle = reporter.spawn_metrics_loop(cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(1300)).await;
        cancel.cancel();
        handle.await.unwrap();

        let sent = server.received_requests().await.unwrap().len();
        assert_eq!(sent, 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), sent);
    }

    #[test]
    fn test_no_loop_without_endpoint() {
        let metrics = Arc::new(McpMetrics::new());
        let credentials = Arc::new(CredentialManager::new(
            AuthConfig::Bearer { token: None },
            reqwest::Client::new(),
            Arc::clone(&metrics),
        ));
        let reporter = Arc::new(Reporter::new(
            reqwest::Client::new(),
            "search",
            MonitoringConfig::default(),
            credentials,
            metrics,
        ));
        assert!(reporter.spawn_metrics_loop(CancellationToken::new()).is_none());
    }
}
