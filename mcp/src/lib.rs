//! Resilient Model Context Protocol (MCP) tool-invocation client.
//!
//! ## Modules
//!
//! - [`core`]: configuration, credentials, session, supervisor and transport
//! - [`rate_limit`]: per-principal sliding-window admission control
//! - [`principal`]: caller identity used for rate limiting and invocation logs
//!
//! A [`Supervisor`] owns one [`Session`] to one remote server. It keeps the
//! connection alive across credential expiry and transient failures, and
//! exposes a never-failing [`Supervisor::invoke_tool`] facade.

pub mod core;
pub mod error;
pub mod principal;
pub mod rate_limit;

pub use core::{
    AuthConfig, CapabilitiesConfig, CapabilityKind, CapabilityWarning, ClientConfig,
    ConnectionState, ConnectionStatus, Credential, CredentialKind, CredentialManager,
    DiscoveredCapabilities, McpMetrics, MetricsSnapshot, MonitoringConfig, PromptDescriptor,
    RateLimitConfig, ResourceDescriptor, RetryPolicy, RmcpTransport, SecurityConfig, ServerConfig,
    ServerInfo, Session, Supervisor, SupervisorEvent, ToolDescriptor, ToolInvocation,
    ToolInvocationResult, Transport, TransportEvent, TransportProtocol,
};

pub use error::{McpError, McpResult};
pub use principal::{InvocationContext, PrincipalId, SessionId};
pub use rate_limit::RateLimiter;
