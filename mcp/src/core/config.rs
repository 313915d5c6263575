//! Client configuration types and loading.
//!
//! A configuration describes exactly one remote MCP server plus the policies
//! (authentication, retry, rate limiting, monitoring) the client applies to it.
//! String fields that name endpoints or secrets may contain `${NAME}`
//! placeholders, resolved against the process environment on load and again at
//! each use.

use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::LazyLock,
    time::Duration,
};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{McpError, McpResult};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Resolve `${NAME}` placeholders against the process environment.
pub fn resolve_env(value: &str) -> McpResult<String> {
    resolve_with(value, |name| std::env::var(name).ok())
}

pub(crate) fn resolve_with(
    value: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> McpResult<String> {
    let mut missing: Option<String> = None;
    let resolved = PLACEHOLDER.replace_all(value, |caps: &Captures<'_>| {
        let name = &caps[1];
        lookup(name).unwrap_or_else(|| {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        })
    });

    match missing {
        Some(name) => Err(McpError::Config(format!(
            "environment variable '{}' is not set",
            name
        ))),
        None => Ok(resolved.into_owned()),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub server: ServerConfig,

    pub authentication: AuthConfig,

    /// Capabilities the remote server is expected to expose
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Stable identifier, reported as `serverId`
    pub id: String,

    /// Human-readable name (defaults to `id`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Server URL, or the command to spawn for `stdio`
    pub endpoint: String,

    #[serde(default)]
    pub protocol: TransportProtocol,

    /// Command-line arguments (stdio only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Additional HTTP headers sent with every transport request
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Per-operation timeout (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,

    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl ServerConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Endpoint with placeholders resolved.
    pub fn endpoint(&self) -> McpResult<String> {
        resolve_env(&self.endpoint)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    #[serde(alias = "http")]
    Streamable,
    Sse,
    Stdio,
}

impl TransportProtocol {
    pub fn is_http(self) -> bool {
        matches!(self, TransportProtocol::Streamable | TransportProtocol::Sse)
    }
}

/// Reconnection policy.
///
/// delay(attempt) = initial_delay * backoff_multiplier^(attempt-1), capped at
/// max_delay.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Base delay (milliseconds)
    #[serde(default = "default_initial_delay")]
    pub initial_delay: u64,

    /// Upper bound on a single delay (milliseconds)
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Static bearer token
    Bearer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// OAuth2 client-credentials grant
    #[serde(rename = "oauth2", rename_all = "camelCase")]
    OAuth2 {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        required_scopes: Vec<String>,
    },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::Bearer { token } => f
                .debug_struct("Bearer")
                .field("token", &token.as_ref().map(|_| "****"))
                .finish(),
            AuthConfig::OAuth2 {
                token_endpoint,
                client_id,
                client_secret,
                required_scopes,
            } => f
                .debug_struct("OAuth2")
                .field("token_endpoint", token_endpoint)
                .field("client_id", client_id)
                .field("client_secret", &client_secret.as_ref().map(|_| "****"))
                .field("required_scopes", required_scopes)
                .finish(),
        }
    }
}

impl AuthConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthConfig::Bearer { .. } => "bearer",
            AuthConfig::OAuth2 { .. } => "oauth2",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesConfig {
    #[serde(default)]
    pub expected_tools: Vec<String>,

    /// Matched against resource URIs by substring
    #[serde(default)]
    pub expected_resources: Vec<String>,

    #[serde(default)]
    pub expected_prompts: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default)]
    pub rate_limiting: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Idle principals are swept once more than this many are tracked
    #[serde(default = "default_max_tracked_principals")]
    pub max_tracked_principals: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_endpoint: Option<String>,

    #[serde(default)]
    pub enable_detailed_logging: bool,

    /// Metrics reporting period (seconds)
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

impl MonitoringConfig {
    pub fn metrics_endpoint(&self) -> McpResult<Option<String>> {
        self.metrics_endpoint.as_deref().map(resolve_env).transpose()
    }

    pub fn logs_endpoint(&self) -> McpResult<Option<String>> {
        self.logs_endpoint.as_deref().map(resolve_env).transpose()
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_max_tracked_principals() -> usize {
    10_000
}

fn default_metrics_interval() -> u64 {
    60
}

// Default implementations
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            backoff_multiplier: default_backoff_multiplier(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
            max_tracked_principals: default_max_tracked_principals(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_endpoint: None,
            logs_endpoint: None,
            enable_detailed_logging: false,
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

impl ClientConfig {
    /// Load and validate configuration from a YAML (or JSON) file.
    pub async fn from_file(path: impl AsRef<Path>) -> McpResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> McpResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields and resolve every placeholder once.
    pub fn validate(&self) -> McpResult<()> {
        if self.server.id.trim().is_empty() {
            return Err(McpError::Config("server.id must not be empty".to_string()));
        }

        let endpoint = self.server.endpoint()?;
        if endpoint.trim().is_empty() {
            return Err(McpError::Config(
                "server.endpoint must not be empty".to_string(),
            ));
        }
        if self.server.protocol.is_http() {
            validate_http_url("server.endpoint", &endpoint)?;
        }
        for value in self.server.headers.values() {
            resolve_env(value)?;
        }

        let retry = &self.server.retry_policy;
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(McpError::Config(format!(
                "server.retryPolicy.backoffMultiplier must be >= 1.0, got {}",
                retry.backoff_multiplier
            )));
        }

        match &self.authentication {
            AuthConfig::Bearer { token } => {
                if let Some(token) = token {
                    resolve_env(token)?;
                }
            }
            AuthConfig::OAuth2 {
                token_endpoint,
                client_id,
                client_secret,
                ..
            } => {
                if let Some(endpoint) = token_endpoint {
                    validate_http_url("authentication.tokenEndpoint", &resolve_env(endpoint)?)?;
                }
                for value in [client_id, client_secret].into_iter().flatten() {
                    resolve_env(value)?;
                }
            }
        }

        let rate_limiting = &self.security.rate_limiting;
        if rate_limiting.enabled && rate_limiting.requests_per_minute == 0 {
            return Err(McpError::Config(
                "security.rateLimiting.requestsPerMinute must be > 0 when enabled".to_string(),
            ));
        }

        if let Some(url) = self.monitoring.metrics_endpoint()? {
            validate_http_url("monitoring.metricsEndpoint", &url)?;
        }
        if let Some(url) = self.monitoring.logs_endpoint()? {
            validate_http_url("monitoring.logsEndpoint", &url)?;
        }

        Ok(())
    }
}

fn validate_http_url(field: &str, value: &str) -> McpResult<()> {
    let url = url::Url::parse(value)
        .map_err(|e| McpError::Config(format!("{} is not a valid URL: {}", field, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(McpError::Config(format!(
            "{} has unsupported scheme '{}'",
            field, scheme
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    const MINIMAL: &str = r#"
server:
  id: "search"
  endpoint: "https://mcp.example.com/mcp"
authentication:
  type: bearer
  token: "static-token"
"#;

    #[test]
    fn test_yaml_minimal_config() {
        let config = ClientConfig::from_yaml_str(MINIMAL).expect("Failed to parse YAML");

        assert_eq!(config.server.id, "search");
        assert_eq!(config.server.display_name(), "search");
        assert_eq!(config.server.protocol, TransportProtocol::Streamable);
        assert_eq!(config.server.timeout(), Duration::from_secs(30));
        assert_eq!(config.server.retry_policy, RetryPolicy::default());
        assert!(config.security.rate_limiting.enabled);
        assert_eq!(config.security.rate_limiting.requests_per_minute, 60);
        assert!(config.capabilities.expected_tools.is_empty());
        assert!(config.monitoring.metrics_endpoint.is_none());
        assert_eq!(config.monitoring.metrics_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_yaml_full_config() {
        let yaml = r#"
server:
  id: "analytics"
  name: "Analytics MCP"
  endpoint: "https://mcp.example.com/sse"
  protocol: sse
  timeout: 5000
  headers:
    X-Tenant: "acme"
  retryPolicy:
    enabled: true
    maxRetries: 5
    backoffMultiplier: 1.5
    initialDelay: 250
authentication:
  type: oauth2
  tokenEndpoint: "https://auth.example.com/oauth/token"
  clientId: "client"
  clientSecret: "secret"
  requiredScopes: ["tools:read", "tools:call"]
capabilities:
  expectedTools: ["search", "summarize"]
  expectedResources: ["docs://"]
  expectedPrompts: ["triage"]
security:
  rateLimiting:
    enabled: true
    requestsPerMinute: 10
monitoring:
  metricsEndpoint: "https://metrics.example.com/ingest"
  logsEndpoint: "https://logs.example.com/ingest"
  enableDetailedLogging: true
"#;

        let config = ClientConfig::from_yaml_str(yaml).expect("Failed to parse YAML");

        assert_eq!(config.server.display_name(), "Analytics MCP");
        assert_eq!(config.server.protocol, TransportProtocol::Sse);
        assert_eq!(config.server.timeout(), Duration::from_millis(5000));
        assert_eq!(config.server.headers.get("X-Tenant").unwrap(), "acme");

        let retry = &config.server.retry_policy;
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.backoff_multiplier, 1.5);
        assert_eq!(retry.initial_delay, 250);
        assert_eq!(retry.max_delay, 60_000);

        match &config.authentication {
            AuthConfig::OAuth2 {
                token_endpoint,
                client_id,
                required_scopes,
                ..
            } => {
                assert_eq!(
                    token_endpoint.as_deref(),
                    Some("https://auth.example.com/oauth/token")
                );
                assert_eq!(client_id.as_deref(), Some("client"));
                assert_eq!(required_scopes, &["tools:read", "tools:call"]);
            }
            other => panic!("Expected OAuth2 auth, got {:?}", other),
        }

        assert_eq!(config.capabilities.expected_tools.len(), 2);
        assert_eq!(config.capabilities.expected_resources, vec!["docs://"]);
        assert_eq!(config.security.rate_limiting.requests_per_minute, 10);
        assert!(config.monitoring.enable_detailed_logging);
    }

    #[test]
    fn test_http_protocol_alias() {
        let yaml = MINIMAL.replace(
            "endpoint: \"https://mcp.example.com/mcp\"",
            "endpoint: \"https://mcp.example.com/mcp\"\n  protocol: http",
        );
        let config = ClientConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.server.protocol, TransportProtocol::Streamable);
    }

    #[test]
    fn test_stdio_endpoint_is_not_a_url() {
        let yaml = r#"
server:
  id: "local"
  endpoint: "mcp-server"
  protocol: stdio
  args: ["--verbose"]
authentication:
  type: bearer
  token: "t"
"#;
        let config = ClientConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.server.protocol, TransportProtocol::Stdio);
        assert_eq!(config.server.args, vec!["--verbose"]);
    }

    #[test]
    fn test_json_config_is_accepted() {
        let json = r#"{
            "server": {"id": "s", "endpoint": "http://localhost:3000/mcp"},
            "authentication": {"type": "bearer", "token": "t"}
        }"#;
        let config = ClientConfig::from_yaml_str(json).unwrap();
        assert_eq!(config.server.id, "s");
    }

    #[test]
    fn test_resolve_with_lookup() {
        let lookup = |name: &str| match name {
            "HOST" => Some("mcp.internal".to_string()),
            "PORT" => Some("8443".to_string()),
            _ => None,
        };

        assert_eq!(
            resolve_with("https://${HOST}:${PORT}/mcp", lookup).unwrap(),
            "https://mcp.internal:8443/mcp"
        );
        assert_eq!(resolve_with("no placeholders", lookup).unwrap(), "no placeholders");

        let err = resolve_with("Bearer ${MISSING_TOKEN}", lookup).unwrap_err();
        assert!(matches!(err, McpError::Config(ref msg) if msg.contains("MISSING_TOKEN")));
    }

    #[test]
    #[serial]
    fn test_env_substitution_on_load() {
        std::env::set_var("TOOLGATE_TEST_HOST", "mcp.example.org");
        std::env::set_var("TOOLGATE_TEST_TOKEN", "from-env");

        let yaml = r#"
server:
  id: "env"
  endpoint: "https://${TOOLGATE_TEST_HOST}/mcp"
authentication:
  type: bearer
  token: "${TOOLGATE_TEST_TOKEN}"
"#;
        let config = ClientConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.server.endpoint().unwrap(), "https://mcp.example.org/mcp");

        // Raw value keeps the placeholder; resolution happens again at use
        assert_eq!(config.server.endpoint, "https://${TOOLGATE_TEST_HOST}/mcp");

        std::env::remove_var("TOOLGATE_TEST_HOST");
        std::env::remove_var("TOOLGATE_TEST_TOKEN");
        assert!(config.server.endpoint().is_err());
    }

    #[test]
    #[serial]
    fn test_unresolved_placeholder_is_fatal() {
        std::env::remove_var("TOOLGATE_TEST_ABSENT");
        let yaml = r#"
server:
  id: "env"
  endpoint: "https://mcp.example.com/mcp"
authentication:
  type: bearer
  token: "${TOOLGATE_TEST_ABSENT}"
"#;
        let err = ClientConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("TOOLGATE_TEST_ABSENT"));
    }

    #[test]
    fn test_validation_errors() {
        let bad_scheme = MINIMAL.replace("https://mcp.example.com/mcp", "ftp://example.com");
        assert!(matches!(
            ClientConfig::from_yaml_str(&bad_scheme),
            Err(McpError::Config(_))
        ));

        let empty_id = MINIMAL.replace("id: \"search\"", "id: \"\"");
        assert!(matches!(
            ClientConfig::from_yaml_str(&empty_id),
            Err(McpError::Config(_))
        ));

        let zero_rate = format!(
            "{}\nsecurity:\n  rateLimiting:\n    requestsPerMinute: 0\n",
            MINIMAL
        );
        assert!(matches!(
            ClientConfig::from_yaml_str(&zero_rate),
            Err(McpError::Config(_))
        ));
    }

    #[test]
    fn test_missing_server_is_parse_error() {
        let err = ClientConfig::from_yaml_str("authentication:\n  type: bearer\n").unwrap_err();
        assert!(matches!(err, McpError::Yaml(_)));
    }

    #[test]
    fn test_auth_debug_redacts_secrets() {
        let bearer = AuthConfig::Bearer {
            token: Some("super-secret".to_string()),
        };
        let oauth = AuthConfig::OAuth2 {
            token_endpoint: Some("https://auth".to_string()),
            client_id: Some("client".to_string()),
            client_secret: Some("super-secret".to_string()),
            required_scopes: vec![],
        };

        for auth in [bearer, oauth] {
            let debug = format!("{:?}", auth);
            assert!(!debug.contains("super-secret"));
            assert!(debug.contains("****"));
        }
    }

    #[test]
    fn test_auth_kind_serde() {
        let auth: AuthConfig = serde_yaml::from_str("type: oauth2\nclientId: abc\n").unwrap();
        assert_eq!(auth.kind(), "oauth2");

        let serialized = serde_json::to_value(&auth).unwrap();
        assert_eq!(serialized["type"], "oauth2");
        assert_eq!(serialized["clientId"], "abc");
    }
}
