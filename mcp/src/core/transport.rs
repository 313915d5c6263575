//! Transport abstraction and its rmcp-backed implementation.
//!
//! The session layer talks to a [`Transport`]; framing, JSON-RPC and the MCP
//! handshake are the transport's job. [`RmcpTransport`] covers streamable
//! HTTP, SSE and stdio servers through the rmcp client.

use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use rmcp::{
    model::{CallToolRequestParam, GetPromptRequestParam, ReadResourceRequestParam},
    service::RunningService,
    RoleClient, ServiceError,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    config::{resolve_env, ServerConfig, TransportProtocol},
    credential::Credential,
    handler::ForwardingClientHandler,
};
use crate::error::{McpError, McpResult};

/// Connectivity events raised by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportEvent {
    Connected,
    Disconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        message: String,
    },
    Notification {
        method: String,
        params: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Remote server identity reported by the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Lower-layer connection to one MCP server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection, authenticating with `credential`.
    async fn connect(&self, credential: &Credential) -> McpResult<()>;

    /// Complete the protocol handshake and report the server identity.
    async fn initialize(&self) -> McpResult<ServerInfo>;

    async fn disconnect(&self) -> McpResult<()>;

    /// Apply a refreshed credential to an open connection.
    async fn refresh_credential(&self, _credential: &Credential) -> McpResult<()> {
        Ok(())
    }

    async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>>;

    async fn list_resources(&self) -> McpResult<Vec<ResourceDescriptor>>;

    async fn list_prompts(&self) -> McpResult<Vec<PromptDescriptor>>;

    async fn call_tool(&self, name: &str, arguments: Option<Map<String, Value>>)
        -> McpResult<Value>;

    async fn read_resource(&self, uri: &str) -> McpResult<Value>;

    async fn get_prompt(&self, name: &str, arguments: Option<Map<String, Value>>)
        -> McpResult<Value>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

type McpClient = RunningService<RoleClient, ForwardingClientHandler>;

const EVENT_CAPACITY: usize = 64;

/// [`Transport`] over the rmcp client.
///
/// rmcp performs the MCP handshake while establishing the service, so
/// `connect` completes it and `initialize` reads the negotiated server info.
pub struct RmcpTransport {
    server: ServerConfig,
    events: broadcast::Sender<TransportEvent>,
    client: RwLock<Option<Arc<McpClient>>>,
}

impl RmcpTransport {
    pub fn new(server: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            server,
            events,
            client: RwLock::new(None),
        }
    }

    fn client(&self) -> McpResult<Arc<McpClient>> {
        self.client.read().clone().ok_or(McpError::NotConnected)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Classify an rmcp service error, raising the matching transport event.
    fn service_error(&self, operation: &str, err: ServiceError) -> McpError {
        match err {
            ServiceError::TransportClosed => {
                self.emit(TransportEvent::Disconnected {
                    reason: Some("transport closed".to_string()),
                });
                McpError::Transport(format!("{}: transport closed", operation))
            }
            ServiceError::McpError(data) => {
                McpError::Transport(format!("{}: {}", operation, data.message))
            }
            other => {
                let message = format!("{}: {}", operation, other);
                self.emit(TransportEvent::Error {
                    message: message.clone(),
                });
                McpError::Transport(message)
            }
        }
    }

    async fn timed<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T, ServiceError>>,
    ) -> McpResult<T> {
        match tokio::time::timeout(self.server.timeout(), fut).await {
            Ok(result) => result.map_err(|e| self.service_error(operation, e)),
            Err(_) => Err(McpError::Timeout(format!(
                "{} exceeded {}ms",
                operation, self.server.timeout
            ))),
        }
    }

    async fn open(&self, credential: &Credential) -> McpResult<McpClient> {
        use rmcp::{
            transport::{
                sse_client::SseClientConfig,
                streamable_http_client::StreamableHttpClientTransportConfig, ConfigureCommandExt,
                SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
            },
            ServiceExt,
        };

        let endpoint = self.server.endpoint()?;
        let handler = ForwardingClientHandler::new(&self.server.id, self.events.clone());

        match self.server.protocol {
            TransportProtocol::Stdio => {
                let args = &self.server.args;
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(&endpoint).configure(|cmd| {
                        cmd.args(args).stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| McpError::Transport(format!("create stdio transport: {}", e)))?;

                handler.serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize stdio client: {}", e))
                })
            }

            TransportProtocol::Sse => {
                let http_client = build_http_client(credential, &self.server.headers)?;
                let sse_config = SseClientConfig {
                    sse_endpoint: endpoint.into(),
                    ..Default::default()
                };

                let transport = SseClientTransport::start_with_client(http_client, sse_config)
                    .await
                    .map_err(|e| McpError::ConnectionFailed(format!("create SSE transport: {}", e)))?;

                handler.serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize SSE client: {}", e))
                })
            }

            TransportProtocol::Streamable => {
                let http_client = build_http_client(credential, &self.server.headers)?;
                let cfg = StreamableHttpClientTransportConfig::with_uri(endpoint);
                let transport = StreamableHttpClientTransport::with_client(http_client, cfg);

                handler.serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize streamable client: {}", e))
                })
            }
        }
    }

    async fn close(client: Arc<McpClient>) {
        match Arc::try_unwrap(client) {
            Ok(client) => {
                if let Err(e) = client.cancel().await {
                    warn!(error = %e, "Error while closing MCP client");
                }
            }
            // In-flight calls still hold the client; it closes when they finish
            Err(_) => debug!("MCP client still in use, closing on last release"),
        }
    }
}

#[async_trait]
impl Transport for RmcpTransport {
    async fn connect(&self, credential: &Credential) -> McpResult<()> {
        info!(
            server_id = %self.server.id,
            protocol = ?self.server.protocol,
            "Connecting to MCP server"
        );

        let connect = self.open(credential);
        let client = tokio::time::timeout(self.server.timeout(), connect)
            .await
            .map_err(|_| {
                McpError::Timeout(format!("connect exceeded {}ms", self.server.timeout))
            })??;

        let previous = self.client.write().replace(Arc::new(client));
        if let Some(previous) = previous {
            Self::close(previous).await;
        }

        self.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn initialize(&self) -> McpResult<ServerInfo> {
        let client = self.client()?;
        let info = client
            .peer()
            .peer_info()
            .map(|info| ServerInfo {
                name: info.server_info.name.clone(),
                version: info.server_info.version.clone(),
            })
            .ok_or_else(|| McpError::ConnectionFailed("handshake did not complete".to_string()))?;

        info!(
            server_id = %self.server.id,
            remote_name = %info.name,
            remote_version = %info.version,
            "MCP handshake complete"
        );
        Ok(info)
    }

    async fn disconnect(&self) -> McpResult<()> {
        let client = self.client.write().take();
        if let Some(client) = client {
            Self::close(client).await;
            info!(server_id = %self.server.id, "Disconnected from MCP server");
        }
        Ok(())
    }

    async fn refresh_credential(&self, credential: &Credential) -> McpResult<()> {
        // HTTP transports bake the bearer token into the client; reopen with the new one
        if !self.server.protocol.is_http() || self.client.read().is_none() {
            return Ok(());
        }
        debug!(server_id = %self.server.id, "Reopening MCP connection with refreshed credential");
        let client = self.open(credential).await?;
        let previous = self.client.write().replace(Arc::new(client));
        if let Some(previous) = previous {
            Self::close(previous).await;
        }
        Ok(())
    }

    async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        let client = self.client()?;
        let tools = self.timed("list tools", client.peer().list_all_tools()).await?;
        Ok(tools
            .into_iter()
            .map(|tool| ToolDescriptor {
                name: tool.name.to_string(),
                description: tool.description.map(|d| d.to_string()),
                input_schema: Value::Object((*tool.input_schema).clone()),
            })
            .collect())
    }

    async fn list_resources(&self) -> McpResult<Vec<ResourceDescriptor>> {
        let client = self.client()?;
        let resources = self
            .timed("list resources", client.peer().list_all_resources())
            .await?;
        Ok(resources
            .into_iter()
            .map(|resource| ResourceDescriptor {
                uri: resource.raw.uri,
                name: resource.raw.name,
                mime_type: resource.raw.mime_type,
            })
            .collect())
    }

    async fn list_prompts(&self) -> McpResult<Vec<PromptDescriptor>> {
        let client = self.client()?;
        let prompts = self
            .timed("list prompts", client.peer().list_all_prompts())
            .await?;
        Ok(prompts
            .into_iter()
            .map(|prompt| PromptDescriptor {
                name: prompt.name,
                description: prompt.description,
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<Value> {
        let client = self.client()?;
        let request = CallToolRequestParam {
            name: Cow::Owned(name.to_string()),
            arguments,
        };

        let result = self
            .timed("call tool", client.call_tool(request))
            .await
            .map_err(|e| match e {
                McpError::Transport(msg) => McpError::ToolExecution(msg),
                other => other,
            })?;

        let is_error = result.is_error.unwrap_or(false);
        let value = serde_json::to_value(&result)
            .map_err(|e| McpError::Transport(format!("encode tool result: {}", e)))?;

        if is_error {
            return Err(McpError::ToolExecution(error_text(&value, name)));
        }
        Ok(value)
    }

    async fn read_resource(&self, uri: &str) -> McpResult<Value> {
        let client = self.client()?;
        let request = ReadResourceRequestParam {
            uri: uri.to_string(),
        };
        let result = self.timed("read resource", client.read_resource(request)).await?;
        serde_json::to_value(&result)
            .map_err(|e| McpError::Transport(format!("encode resource: {}", e)))
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<Value> {
        let client = self.client()?;
        let request = GetPromptRequestParam {
            name: name.to_string(),
            arguments,
        };
        let result = self.timed("get prompt", client.get_prompt(request)).await?;
        serde_json::to_value(&result)
            .map_err(|e| McpError::Transport(format!("encode prompt: {}", e)))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Build the HTTP client carrying the bearer credential and custom headers.
fn build_http_client(
    credential: &Credential,
    custom_headers: &HashMap<String, String>,
) -> McpResult<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::AUTHORIZATION,
        format!("Bearer {}", credential.token())
            .parse()
            .map_err(|e| McpError::Transport(format!("auth token: {}", e)))?,
    );

    for (key, value) in custom_headers {
        let value = resolve_env(value)?;
        headers.insert(
            reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| McpError::Transport(format!("header name: {}", e)))?,
            value
                .parse()
                .map_err(|e| McpError::Transport(format!("header value: {}", e)))?,
        );
    }

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .default_headers(headers)
        .build()
        .map_err(|e| McpError::Transport(format!("build HTTP client: {}", e)))
}

/// Text of an error tool result, joined from its text content blocks.
fn error_text(result: &Value, tool: &str) -> String {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if text.is_empty() {
        format!("tool '{}' reported an error", tool)
    } else {
        text
    }
}
