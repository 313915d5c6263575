//! Supervisor event fan-out.
//!
//! Event names and payload shapes are a public contract: logging, UI and
//! billing consumers match on the kebab-case `event` tag.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{
    capabilities::CapabilityWarning,
    supervisor::{ConnectionStatus, ToolInvocation},
    transport::ServerInfo,
};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SupervisorEvent {
    #[serde(rename_all = "camelCase")]
    Initialized { server_id: String },

    Connected { server: ServerInfo },

    Disconnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    Error { message: String },

    ConnectionError { message: String },

    #[serde(rename_all = "camelCase")]
    ReconnectScheduled { attempt: u32, delay_ms: u64 },

    ToolExecuted(ToolInvocation),

    ToolError(ToolInvocation),

    CapabilityWarning(CapabilityWarning),

    CapabilityValidationError { message: String },

    Notification { method: String, params: Value },

    StatusUpdated(Box<ConnectionStatus>),
}

impl SupervisorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorEvent::Initialized { .. } => "initialized",
            SupervisorEvent::Connected { .. } => "connected",
            SupervisorEvent::Disconnected { .. } => "disconnected",
            SupervisorEvent::Error { .. } => "error",
            SupervisorEvent::ConnectionError { .. } => "connection-error",
            SupervisorEvent::ReconnectScheduled { .. } => "reconnect-scheduled",
            SupervisorEvent::ToolExecuted(_) => "tool-executed",
            SupervisorEvent::ToolError(_) => "tool-error",
            SupervisorEvent::CapabilityWarning(_) => "capability-warning",
            SupervisorEvent::CapabilityValidationError { .. } => "capability-validation-error",
            SupervisorEvent::Notification { .. } => "notification",
            SupervisorEvent::StatusUpdated(_) => "status-updated",
        }
    }
}

/// Broadcast registry for [`SupervisorEvent`]s.
///
/// Slow subscribers lag and lose the oldest events rather than blocking the
/// supervisor.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SupervisorEvent) {
        // Sending only fails when nobody is subscribed
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::capabilities::CapabilityKind;

    #[test]
    fn test_event_tags() {
        let event = SupervisorEvent::ReconnectScheduled {
            attempt: 2,
            delay_ms: 2000,
        };
        assert_eq!(event.name(), "reconnect-scheduled");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "reconnect-scheduled", "attempt": 2, "delayMs": 2000})
        );

        let event = SupervisorEvent::CapabilityWarning(CapabilityWarning {
            kind: CapabilityKind::Tools,
            missing: vec!["search".to_string()],
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "capability-warning", "type": "tools", "missing": ["search"]})
        );
    }

    #[test]
    fn test_names_match_serialized_tags() {
        let events = vec![
            SupervisorEvent::Initialized {
                server_id: "s".to_string(),
            },
            SupervisorEvent::Disconnected { reason: None },
            SupervisorEvent::ConnectionError {
                message: "refused".to_string(),
            },
            SupervisorEvent::CapabilityValidationError {
                message: "boom".to_string(),
            },
            SupervisorEvent::StatusUpdated(Box::default()),
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["event"], event.name());
        }
    }

    #[tokio::test]
    async fn test_fan_out() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(SupervisorEvent::Error {
            message: "x".to_string(),
        });

        assert_eq!(a.recv().await.unwrap().name(), "error");
        assert_eq!(b.recv().await.unwrap().name(), "error");
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventBus::new(1).emit(SupervisorEvent::Disconnected { reason: None });
    }
}
