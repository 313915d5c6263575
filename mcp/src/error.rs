//! MCP client error types.
//!
//! Defines error variants for configuration, authentication, connection,
//! rate limiting and tool execution failures.

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to MCP server")]
    NotConnected,

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl McpError {
    /// Errors that no amount of reconnecting can fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, McpError::Config(_) | McpError::Yaml(_))
    }
}
