//! Connection supervisor: state machine, reconnection and invocation facade.
//!
//! One [`Supervisor`] owns one [`Session`] and one [`ClientConfig`]. It is the
//! only component that transitions [`ConnectionStatus`], and it fans out
//! [`SupervisorEvent`]s to external consumers.
//!
//! ```text
//! Init ──connect──▶ Connecting ──ok──▶ Connected ──disconnect / transport closed──▶ Disconnected
//!                      │  ▲                │
//!                    fail │ timer        transport error
//!                      ▼  │                ▼
//!                    Error ──retry left──▶ ReconnectScheduled
//!                      └────exhausted────▶ Disconnected
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    capabilities::DiscoveredCapabilities,
    config::ClientConfig,
    credential::CredentialManager,
    events::{EventBus, SupervisorEvent},
    metrics::{McpMetrics, MetricsSnapshot},
    reconnect::ReconnectPolicy,
    reporting::Reporter,
    session::{CapabilityValidation, Session, SessionInfo},
    transport::{
        PromptDescriptor, ResourceDescriptor, RmcpTransport, ServerInfo, ToolDescriptor,
        Transport, TransportEvent,
    },
};
use crate::{
    error::{McpError, McpResult},
    principal::InvocationContext,
    rate_limit::RateLimiter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    #[default]
    Init,
    Connecting,
    Connected,
    Error,
    ReconnectScheduled,
    Disconnected,
}

/// Snapshot of the supervisor's view of the connection.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub server_id: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub authenticated: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub server: Option<ServerInfo>,
    pub capabilities: DiscoveredCapabilities,
    pub metrics: MetricsSnapshot,
}

/// Record of one completed tool invocation, as delivered to event listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: Value,
    #[serde(flatten)]
    pub context: InvocationContext,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured outcome returned by [`Supervisor::invoke_tool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: ClientConfig,
    session: Session,
    policy: ReconnectPolicy,
    events: EventBus,
    reporter: Arc<Reporter>,
    metrics: Arc<McpMetrics>,
    status: RwLock<ConnectionStatus>,
    attempts: AtomicU32,
    initialized: AtomicBool,
    /// Serializes connection attempts
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    /// Cancels tasks bound to the current connection
    connection_token: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor talking to the configured server through rmcp.
    pub fn new(config: ClientConfig) -> McpResult<Self> {
        let transport = Arc::new(RmcpTransport::new(config.server.clone()));
        Self::with_transport(config, transport)
    }

    /// Create a supervisor over an arbitrary transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> McpResult<Self> {
        let http = build_http_client(config.server.timeout())?;
        let metrics = Arc::new(McpMetrics::new());
        let credentials = Arc::new(CredentialManager::new(
            config.authentication.clone(),
            http.clone(),
            Arc::clone(&metrics),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(&config.security.rate_limiting));
        let session = Session::new(
            config.server.id.clone(),
            transport,
            Arc::clone(&credentials),
            rate_limiter,
            Arc::clone(&metrics),
            config.capabilities.clone(),
        );
        let reporter = Arc::new(Reporter::new(
            http,
            config.server.id.clone(),
            config.monitoring.clone(),
            credentials,
            Arc::clone(&metrics),
        ));

        let status = ConnectionStatus {
            server_id: config.server.id.clone(),
            ..Default::default()
        };

        Ok(Self {
            inner: Arc::new(SupervisorInner {
                policy: ReconnectPolicy::from(&config.server.retry_policy),
                config,
                session,
                events: EventBus::default(),
                reporter,
                metrics,
                status: RwLock::new(status),
                attempts: AtomicU32::new(0),
                initialized: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
                reconnect_task: Mutex::new(None),
                connection_token: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Current status, with a fresh metrics snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status_snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.read().connected
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        self.inner.session.credentials()
    }

    /// First connection. Equivalent to [`Supervisor::connect`].
    pub async fn initialize(&self) -> McpResult<()> {
        self.connect().await
    }

    /// Connect now, superseding any scheduled reconnect.
    ///
    /// On failure the error is returned and the retry policy decides whether
    /// another attempt is scheduled in the background.
    pub async fn connect(&self) -> McpResult<()> {
        self.inner.cancel_pending_reconnect();
        self.inner.connect().await
    }

    pub async fn disconnect(&self) -> McpResult<()> {
        self.inner.cancel_pending_reconnect();
        let _guard = self.inner.connect_lock.lock().await;

        self.inner.stop_connection_tasks();
        let result = self.inner.session.disconnect().await;
        if let Err(e) = &result {
            warn!(server_id = %self.inner.config.server.id, error = %e, "Error while disconnecting");
        }
        self.inner
            .settle_disconnected(Some("client disconnect".to_string()));
        result
    }

    /// Disconnect and cancel every background task owned by this supervisor.
    pub async fn shutdown(&self) -> McpResult<()> {
        let result = self.disconnect().await;
        self.inner.shutdown.cancel();
        result
    }

    /// Invoke a remote tool. Never fails: errors are captured in the result.
    pub async fn invoke_tool(
        &self,
        name: &str,
        arguments: Value,
        context: InvocationContext,
    ) -> ToolInvocationResult {
        let inner = &self.inner;
        let started_at = Utc::now();
        let start = Instant::now();

        let outcome = if self.is_connected() {
            inner.session.call_tool(name, arguments.clone(), &context).await
        } else {
            Err(McpError::NotConnected)
        };

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let timestamp = Utc::now();

        let (invocation, result) = match outcome {
            Ok(value) => {
                info!(
                    server_id = %inner.config.server.id,
                    tool = %name,
                    principal = %context.principal(),
                    duration_ms = duration_ms,
                    "Tool executed"
                );
                let invocation = ToolInvocation {
                    tool_name: name.to_string(),
                    arguments,
                    context,
                    started_at,
                    duration_ms,
                    success: true,
                    result: Some(value.clone()),
                    error: None,
                };
                let result = ToolInvocationResult {
                    success: true,
                    result: Some(value),
                    error: None,
                    duration_ms,
                    timestamp,
                };
                inner
                    .events
                    .emit(SupervisorEvent::ToolExecuted(invocation.clone()));
                (invocation, result)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    server_id = %inner.config.server.id,
                    tool = %name,
                    principal = %context.principal(),
                    error = %message,
                    "Tool invocation failed"
                );
                let invocation = ToolInvocation {
                    tool_name: name.to_string(),
                    arguments,
                    context,
                    started_at,
                    duration_ms,
                    success: false,
                    result: None,
                    error: Some(message.clone()),
                };
                let result = ToolInvocationResult {
                    success: false,
                    result: None,
                    error: Some(message),
                    duration_ms,
                    timestamp,
                };
                inner
                    .events
                    .emit(SupervisorEvent::ToolError(invocation.clone()));
                (invocation, result)
            }
        };

        inner
            .reporter
            .log_invocation(&invocation, &inner.reporting_token());
        result
    }

    pub async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        self.ensure_connected()?;
        self.inner.session.list_tools().await
    }

    pub async fn list_resources(&self) -> McpResult<Vec<ResourceDescriptor>> {
        self.ensure_connected()?;
        self.inner.session.list_resources().await
    }

    pub async fn list_prompts(&self) -> McpResult<Vec<PromptDescriptor>> {
        self.ensure_connected()?;
        self.inner.session.list_prompts().await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<Value> {
        self.ensure_connected()?;
        self.inner.session.read_resource(uri).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> McpResult<Value> {
        self.ensure_connected()?;
        self.inner.session.get_prompt(name, arguments).await
    }

    /// Cheap liveness probe; any failure reads as unhealthy.
    pub async fn health_check(&self) -> bool {
        match self.list_tools().await {
            Ok(_) => true,
            Err(e) => {
                debug!(server_id = %self.inner.config.server.id, error = %e, "Health check failed");
                false
            }
        }
    }

    fn ensure_connected(&self) -> McpResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(McpError::NotConnected)
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.cancel_pending_reconnect();
    }
}

impl SupervisorInner {
    fn server_id(&self) -> &str {
        &self.config.server.id
    }

    fn state(&self) -> ConnectionState {
        self.status.read().state
    }

    fn status_snapshot(&self) -> ConnectionStatus {
        let mut status = self.status.read().clone();
        status.reconnect_attempts = self.attempts.load(Ordering::SeqCst);
        status.metrics = self.metrics.snapshot();
        status
    }

    /// Apply `update` to the status and publish the result.
    fn update_status(&self, update: impl FnOnce(&mut ConnectionStatus)) {
        update(&mut self.status.write());
        self.events
            .emit(SupervisorEvent::StatusUpdated(Box::new(self.status_snapshot())));
    }

    fn cancel_pending_reconnect(&self) {
        if let Some(handle) = self.reconnect_task.lock().take() {
            handle.abort();
        }
    }

    fn reconnect(self: Arc<Self>) -> BoxFuture<'static, McpResult<()>> {
        Box::pin(async move { self.connect().await })
    }

    async fn connect(self: &Arc<Self>) -> McpResult<()> {
        let _guard = self.connect_lock.lock().await;

        if self.shutdown.is_cancelled() {
            return Err(McpError::ConnectionFailed(
                "supervisor has been shut down".to_string(),
            ));
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        info!(server_id = %self.server_id(), "Connecting to MCP server");
        self.update_status(|status| status.state = ConnectionState::Connecting);

        match self.session.initialize().await {
            Ok(info) => {
                self.on_connected(info);
                Ok(())
            }
            Err(e) => {
                self.on_connect_failed(&e);
                Err(e)
            }
        }
    }

    fn on_connected(self: &Arc<Self>, info: SessionInfo) {
        self.attempts.store(0, Ordering::SeqCst);

        let discovered = match &info.capabilities {
            CapabilityValidation::Validated(report) => report.discovered.clone(),
            CapabilityValidation::Failed(_) => DiscoveredCapabilities::default(),
        };
        let server = info.server.clone();
        self.update_status(|status| {
            status.state = ConnectionState::Connected;
            status.connected = true;
            status.authenticated = true;
            status.last_connected_at = Some(Utc::now());
            status.last_error = None;
            status.server = Some(server);
            status.capabilities = discovered;
        });

        self.start_connection_tasks();

        match info.capabilities {
            CapabilityValidation::Validated(report) => {
                for warning in report.warnings {
                    self.events.emit(SupervisorEvent::CapabilityWarning(warning));
                }
            }
            CapabilityValidation::Failed(message) => {
                self.events
                    .emit(SupervisorEvent::CapabilityValidationError { message });
            }
        }

        info!(
            server_id = %self.server_id(),
            remote_name = %info.server.name,
            remote_version = %info.server.version,
            "Connected to MCP server"
        );
        self.events.emit(SupervisorEvent::Connected {
            server: info.server,
        });

        if !self.initialized.swap(true, Ordering::SeqCst) {
            self.events.emit(SupervisorEvent::Initialized {
                server_id: self.server_id().to_string(),
            });
        }
    }

    fn on_connect_failed(self: &Arc<Self>, err: &McpError) {
        let message = err.to_string();
        error!(server_id = %self.server_id(), error = %message, "Failed to connect to MCP server");

        self.update_status(|status| {
            status.state = ConnectionState::Error;
            status.connected = false;
            status.authenticated = false;
            status.last_error = Some(message.clone());
        });
        self.events
            .emit(SupervisorEvent::ConnectionError { message });

        self.retry_or_settle(err.is_fatal());
    }

    /// From `Error`: schedule the next attempt, or give up.
    fn retry_or_settle(self: &Arc<Self>, fatal: bool) {
        let attempts = self.attempts.load(Ordering::SeqCst);
        if fatal || self.shutdown.is_cancelled() || !self.policy.should_retry(attempts) {
            if fatal {
                warn!(server_id = %self.server_id(), "Configuration error, not retrying");
            } else if self.policy.enabled {
                warn!(
                    server_id = %self.server_id(),
                    attempts = attempts,
                    "Reconnect attempts exhausted"
                );
            }
            let reason = self.status.read().last_error.clone();
            self.settle_disconnected(reason);
            return;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.policy.calculate_backoff(attempt);
        self.schedule_reconnect(attempt, delay);
    }

    fn schedule_reconnect(self: &Arc<Self>, attempt: u32, delay: Duration) {
        info!(
            server_id = %self.server_id(),
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.update_status(|status| status.state = ConnectionState::ReconnectScheduled);
        self.events.emit(SupervisorEvent::ReconnectScheduled {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Failures feed back into the state machine
            let _ = inner.reconnect().await;
        });

        // The previous handle, if any, belongs to the task now running
        *self.reconnect_task.lock() = Some(handle);
    }

    fn settle_disconnected(&self, reason: Option<String>) {
        self.stop_connection_tasks();
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.update_status(|status| {
            status.state = ConnectionState::Disconnected;
            status.connected = false;
            status.authenticated = false;
        });
        info!(server_id = %self.server_id(), reason = ?reason, "MCP connection closed");
        self.events.emit(SupervisorEvent::Disconnected { reason });
    }

    /// Start the transport-event listener and the metrics reporter.
    fn start_connection_tasks(self: &Arc<Self>) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.connection_token.lock().replace(token.clone()) {
            previous.cancel();
        }

        self.spawn_event_listener(token.clone());
        self.reporter.spawn_metrics_loop(token);
    }

    fn stop_connection_tasks(&self) {
        if let Some(token) = self.connection_token.lock().take() {
            token.cancel();
        }
    }

    /// Token for per-invocation log shipping.
    fn reporting_token(&self) -> CancellationToken {
        self.connection_token
            .lock()
            .clone()
            .unwrap_or_else(|| self.shutdown.clone())
    }

    fn spawn_event_listener(self: &Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.session.subscribe();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => received,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match received {
                    Ok(event) => inner.on_transport_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(server_id = %inner.server_id(), skipped = skipped, "Transport events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                debug!(server_id = %self.server_id(), "Transport reported connected");
            }
            TransportEvent::Notification { method, params } => {
                self.events
                    .emit(SupervisorEvent::Notification { method, params });
            }
            TransportEvent::Disconnected { reason } => {
                if self.state() != ConnectionState::Connected {
                    return;
                }
                warn!(server_id = %self.server_id(), reason = ?reason, "Transport disconnected");
                self.stop_connection_tasks();
                if let Err(e) = self.session.disconnect().await {
                    debug!(error = %e, "Error closing session after transport disconnect");
                }
                self.settle_disconnected(reason);
            }
            TransportEvent::Error { message } => {
                if self.state() != ConnectionState::Connected {
                    return;
                }
                error!(server_id = %self.server_id(), error = %message, "Transport error");
                self.stop_connection_tasks();
                self.update_status(|status| {
                    status.state = ConnectionState::Error;
                    status.connected = false;
                    status.authenticated = false;
                    status.last_error = Some(message.clone());
                });
                self.events.emit(SupervisorEvent::Error { message });
                self.retry_or_settle(false);
            }
        }
    }
}

/// HTTP client for the token and reporting endpoints.
fn build_http_client(timeout: Duration) -> McpResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .build()
        .map_err(|e| McpError::Config(format!("build HTTP client: {}", e)))
}
