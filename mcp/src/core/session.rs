//! Authenticated, rate-limited facade over a [`Transport`].
//!
//! Every operation first makes sure the credential is valid. Tool calls are
//! admitted by the per-principal rate limiter before any credential work, and
//! recorded in the metrics exactly once, whatever their outcome.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};
use tracing::{debug, warn};

use super::{
    capabilities::{CapabilityReport, CapabilityValidator},
    config::CapabilitiesConfig,
    credential::{Credential, CredentialManager},
    metrics::{McpMetrics, Outcome},
    transport::{
        PromptDescriptor, ResourceDescriptor, ServerInfo, ToolDescriptor, Transport,
        TransportEvent,
    },
};
use crate::{
    error::{McpError, McpResult},
    principal::InvocationContext,
    rate_limit::RateLimiter,
};

/// Result of the capability check run during [`Session::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityValidation {
    Validated(CapabilityReport),
    /// The listings could not be fetched; initialization still succeeded.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub server: ServerInfo,
    pub capabilities: CapabilityValidation,
}

pub struct Session {
    server_id: String,
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialManager>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<McpMetrics>,
    validator: CapabilityValidator,
    /// Credential the transport was last opened or refreshed with. Held across
    /// the refresh so concurrent callers apply a new credential once.
    applied: Mutex<Option<Arc<Credential>>>,
}

impl Session {
    pub fn new(
        server_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialManager>,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<McpMetrics>,
        expected: CapabilitiesConfig,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            transport,
            credentials,
            rate_limiter,
            metrics,
            validator: CapabilityValidator::new(expected),
            applied: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Transport connectivity events, forwarded unchanged.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport.subscribe()
    }

    /// Authenticate, connect, handshake, then validate capabilities.
    ///
    /// Capability problems never fail initialization; they are reported in
    /// the returned [`SessionInfo`].
    pub async fn initialize(&self) -> McpResult<SessionInfo> {
        let credential = self.credentials.authenticate().await?;
        self.transport.connect(&credential).await?;
        *self.applied.lock().await = Some(credential);

        let server = match self.transport.initialize().await {
            Ok(server) => server,
            Err(e) => {
                if let Err(close_err) = self.transport.disconnect().await {
                    debug!(error = %close_err, "Failed to close transport after handshake error");
                }
                *self.applied.lock().await = None;
                return Err(e);
            }
        };

        let capabilities = match self.validator.validate(self.transport.as_ref()).await {
            Ok(report) => CapabilityValidation::Validated(report),
            Err(e) => {
                warn!(server_id = %self.server_id, error = %e, "Capability validation failed");
                CapabilityValidation::Failed(e.to_string())
            }
        };

        Ok(SessionInfo {
            server,
            capabilities,
        })
    }

    /// Close the transport and drop the current credential.
    pub async fn disconnect(&self) -> McpResult<()> {
        let result = self.transport.disconnect().await;
        self.credentials.clear();
        *self.applied.lock().await = None;
        result
    }

    pub async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        self.authorize().await?;
        self.transport.list_tools().await
    }

    pub async fn list_resources(&self) -> McpResult<Vec<ResourceDescriptor>> {
        self.authorize().await?;
        self.transport.list_resources().await
    }

    pub async fn list_prompts(&self) -> McpResult<Vec<PromptDescriptor>> {
        self.authorize().await?;
        self.transport.list_prompts().await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<Value> {
        self.authorize().await?;
        self.transport.read_resource(uri).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> McpResult<Value> {
        let arguments = into_arguments(arguments)?;
        self.authorize().await?;
        self.transport.get_prompt(name, arguments).await
    }

    /// Call a remote tool on behalf of `context`'s principal.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        context: &InvocationContext,
    ) -> McpResult<Value> {
        let start = Instant::now();
        let result = self.call_tool_inner(name, arguments, context).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record(Outcome::from_success(result.is_ok()), duration_ms);
        result
    }

    async fn call_tool_inner(
        &self,
        name: &str,
        arguments: Value,
        context: &InvocationContext,
    ) -> McpResult<Value> {
        let principal = context.principal();
        if !self.rate_limiter.admit(&principal) {
            self.metrics.record_rate_limit_hit();
            warn!(
                server_id = %self.server_id,
                principal = %principal,
                tool = %name,
                "Rate limit exceeded"
            );
            return Err(McpError::RateLimitExceeded(format!(
                "principal '{}' exceeded {} requests per minute",
                principal,
                self.rate_limiter.capacity()
            )));
        }

        self.authorize().await?;
        let arguments = into_arguments(arguments)?;
        self.transport.call_tool(name, arguments).await
    }

    /// Ensure a valid credential and push a refreshed one down to the transport.
    async fn authorize(&self) -> McpResult<()> {
        let credential = self.credentials.ensure_valid().await?;
        let mut applied = self.applied.lock().await;
        let current = matches!(
            applied.as_ref(),
            Some(previous) if Arc::ptr_eq(previous, &credential)
        );
        if !current {
            self.transport.refresh_credential(&credential).await?;
            *applied = Some(credential);
        }
        Ok(())
    }
}

/// Tool and prompt arguments must be a JSON object, or null for none.
fn into_arguments(arguments: Value) -> McpResult<Option<Map<String, Value>>> {
    match arguments {
        Value::Object(map) => Ok(Some(map)),
        Value::Null => Ok(None),
        other => Err(McpError::InvalidArguments(format!(
            "expected a JSON object, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
