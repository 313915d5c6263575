//! Client handler that turns MCP server notifications into transport events.
//!
//! Implements RMCP's `ClientHandler` trait to forward:
//! - Tool/resource/prompt list change notifications
//! - Resource update, progress and cancellation notifications
//! - Server log messages (also mirrored into local tracing)

use std::sync::Arc;

use rmcp::{
    model::{
        CancelledNotificationParam, ClientInfo, LoggingLevel, LoggingMessageNotificationParam,
        ProgressNotificationParam, ResourceUpdatedNotificationParam,
    },
    service::NotificationContext,
    ClientHandler, RoleClient,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::transport::TransportEvent;

#[derive(Clone)]
pub struct ForwardingClientHandler {
    server_id: Arc<str>,
    client_info: ClientInfo,
    events: broadcast::Sender<TransportEvent>,
}

impl ForwardingClientHandler {
    pub fn new(server_id: impl AsRef<str>, events: broadcast::Sender<TransportEvent>) -> Self {
        let mut client_info = ClientInfo::default();
        client_info.client_info.name = "toolgate".to_string();
        client_info.client_info.version = env!("CARGO_PKG_VERSION").to_string();

        Self {
            server_id: Arc::from(server_id.as_ref()),
            client_info,
            events,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn forward(&self, method: &str, params: Value) {
        // No subscribers is fine; the supervisor only listens while connected
        let _ = self.events.send(TransportEvent::Notification {
            method: method.to_string(),
            params,
        });
    }
}

impl ClientHandler for ForwardingClientHandler {
    async fn on_cancelled(
        &self,
        params: CancelledNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        info!(
            server_id = %self.server_id,
            request_id = %params.request_id,
            reason = ?params.reason,
            "MCP server cancelled request"
        );
        self.forward(
            "notifications/cancelled",
            json!({ "requestId": params.request_id.to_string(), "reason": params.reason }),
        );
    }

    async fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        debug!(
            server_id = %self.server_id,
            token = ?params.progress_token,
            progress = %params.progress,
            total = ?params.total,
            "MCP server progress"
        );
        self.forward(
            "notifications/progress",
            serde_json::to_value(&params).unwrap_or(Value::Null),
        );
    }

    async fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        info!(server_id = %self.server_id, uri = %params.uri, "MCP server resource updated");
        self.forward("notifications/resources/updated", json!({ "uri": params.uri }));
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(server_id = %self.server_id, "MCP server resource list changed");
        self.forward("notifications/resources/list_changed", Value::Null);
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(server_id = %self.server_id, "MCP server tool list changed");
        self.forward("notifications/tools/list_changed", Value::Null);
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!(server_id = %self.server_id, "MCP server prompt list changed");
        self.forward("notifications/prompts/list_changed", Value::Null);
    }

    fn get_info(&self) -> ClientInfo {
        self.client_info.clone()
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        let logger = params.logger.as_deref().unwrap_or("mcp");

        match params.level {
            LoggingLevel::Emergency
            | LoggingLevel::Alert
            | LoggingLevel::Critical
            | LoggingLevel::Error => {
                error!(server_id = %self.server_id, logger = %logger, level = ?params.level, "MCP: {}", params.data);
            }
            LoggingLevel::Warning => {
                warn!(server_id = %self.server_id, logger = %logger, "MCP: {}", params.data);
            }
            LoggingLevel::Notice | LoggingLevel::Info => {
                info!(server_id = %self.server_id, logger = %logger, "MCP: {}", params.data);
            }
            LoggingLevel::Debug => {
                debug!(server_id = %self.server_id, logger = %logger, "MCP: {}", params.data);
            }
        }

        self.forward(
            "notifications/message",
            json!({ "level": params.level, "logger": logger, "data": params.data }),
        );
    }
}
