//! Core MCP client infrastructure.

pub mod capabilities;
pub mod config;
pub mod credential;
pub mod events;
pub mod handler;
pub mod metrics;
pub mod reconnect;
pub mod reporting;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use capabilities::{
    CapabilityKind, CapabilityReport, CapabilityValidator, CapabilityWarning,
    DiscoveredCapabilities,
};
pub use config::{
    resolve_env, AuthConfig, CapabilitiesConfig, ClientConfig, MonitoringConfig, RateLimitConfig,
    RetryPolicy, SecurityConfig, ServerConfig, TransportProtocol,
};
pub use credential::{Credential, CredentialKind, CredentialManager, REFRESH_MARGIN};
pub use events::{EventBus, SupervisorEvent};
pub use handler::ForwardingClientHandler;
pub use metrics::{McpMetrics, MetricsSnapshot, Outcome};
pub use reconnect::ReconnectPolicy;
pub use reporting::{InvocationLogEntry, MetricsReport, Reporter};
pub use session::{CapabilityValidation, Session, SessionInfo};
pub use supervisor::{
    ConnectionState, ConnectionStatus, Supervisor, ToolInvocation, ToolInvocationResult,
};
pub use transport::{
    PromptDescriptor, ResourceDescriptor, RmcpTransport, ServerInfo, ToolDescriptor, Transport,
    TransportEvent,
};
