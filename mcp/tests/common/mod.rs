//! Common test utilities for supervisor and session tests

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::{
    sync::broadcast::{self, error::TryRecvError},
    time::Instant,
};
use toolgate_mcp::{
    ClientConfig, Credential, McpError, McpResult, PromptDescriptor, ResourceDescriptor,
    ServerInfo, SupervisorEvent, ToolDescriptor, Transport, TransportEvent,
};

#[derive(Default)]
struct Script {
    connect_failures: u32,
    listing_failure: bool,
    tool_failure: Option<String>,
    call_delays: VecDeque<Duration>,
    refresh_delay: Duration,
    tools: Vec<String>,
    resources: Vec<String>,
    prompts: Vec<String>,
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub name: String,
    pub arguments: Option<Map<String, Value>>,
}

/// In-memory [`Transport`] whose behavior is scripted by the test.
pub struct ScriptedTransport {
    events: broadcast::Sender<TransportEvent>,
    script: Mutex<Script>,
    connected: Mutex<bool>,
    connect_times: Mutex<Vec<Instant>>,
    connect_tokens: Mutex<Vec<String>>,
    refreshed_tokens: Mutex<Vec<String>>,
    calls: Mutex<Vec<RecordedCall>>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            script: Mutex::new(Script {
                tools: vec!["search".to_string(), "summarize".to_string()],
                resources: vec!["docs://handbook/intro".to_string()],
                prompts: vec!["triage".to_string()],
                ..Default::default()
            }),
            connected: Mutex::new(false),
            connect_times: Mutex::new(Vec::new()),
            connect_tokens: Mutex::new(Vec::new()),
            refreshed_tokens: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Make the next `n` connects fail (`u32::MAX` for all of them).
    pub fn fail_connects(&self, n: u32) {
        self.script.lock().connect_failures = n;
    }

    pub fn fail_listings(&self, fail: bool) {
        self.script.lock().listing_failure = fail;
    }

    pub fn fail_tools(&self, message: Option<&str>) {
        self.script.lock().tool_failure = message.map(str::to_string);
    }

    pub fn set_tools(&self, tools: &[&str]) {
        self.script.lock().tools = tools.iter().map(|t| t.to_string()).collect();
    }

    /// Durations of upcoming tool calls, consumed in order.
    pub fn set_call_delays(&self, delays_ms: &[u64]) {
        self.script.lock().call_delays = delays_ms.iter().map(|&ms| Duration::from_millis(ms)).collect();
    }

    /// How long each credential refresh takes.
    pub fn set_refresh_delay(&self, delay_ms: u64) {
        self.script.lock().refresh_delay = Duration::from_millis(delay_ms);
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().clone()
    }

    pub fn connect_tokens(&self) -> Vec<String> {
        self.connect_tokens.lock().clone()
    }

    pub fn refreshed_tokens(&self) -> Vec<String> {
        self.refreshed_tokens.lock().clone()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    fn ensure_connected(&self) -> McpResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(McpError::NotConnected)
        }
    }

    fn check_listing(&self) -> McpResult<()> {
        self.ensure_connected()?;
        if self.script.lock().listing_failure {
            return Err(McpError::Transport("listing unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, credential: &Credential) -> McpResult<()> {
        self.connect_times.lock().push(Instant::now());
        self.connect_tokens.lock().push(credential.token().to_string());

        {
            let mut script = self.script.lock();
            if script.connect_failures > 0 {
                if script.connect_failures != u32::MAX {
                    script.connect_failures -= 1;
                }
                return Err(McpError::ConnectionFailed("connection refused".to_string()));
            }
        }

        *self.connected.lock() = true;
        self.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn initialize(&self) -> McpResult<ServerInfo> {
        self.ensure_connected()?;
        Ok(ServerInfo {
            name: "scripted".to_string(),
            version: "1.0.0".to_string(),
        })
    }

    async fn disconnect(&self) -> McpResult<()> {
        *self.connected.lock() = false;
        Ok(())
    }

    async fn refresh_credential(&self, credential: &Credential) -> McpResult<()> {
        let delay = self.script.lock().refresh_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.refreshed_tokens
            .lock()
            .push(credential.token().to_string());
        Ok(())
    }

    async fn list_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        self.check_listing()?;
        Ok(self
            .script
            .lock()
            .tools
            .iter()
            .map(|name| ToolDescriptor {
                name: name.clone(),
                description: Some(format!("{} tool", name)),
                input_schema: json!({"type": "object"}),
            })
            .collect())
    }

    async fn list_resources(&self) -> McpResult<Vec<ResourceDescriptor>> {
        self.check_listing()?;
        Ok(self
            .script
            .lock()
            .resources
            .iter()
            .map(|uri| ResourceDescriptor {
                uri: uri.clone(),
                name: uri.rsplit('/').next().unwrap_or(uri).to_string(),
                mime_type: Some("text/markdown".to_string()),
            })
            .collect())
    }

    async fn list_prompts(&self) -> McpResult<Vec<PromptDescriptor>> {
        self.check_listing()?;
        Ok(self
            .script
            .lock()
            .prompts
            .iter()
            .map(|name| PromptDescriptor {
                name: name.clone(),
                description: None,
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<Value> {
        self.ensure_connected()?;
        self.calls.lock().push(RecordedCall {
            name: name.to_string(),
            arguments,
        });

        let (delay, failure) = {
            let mut script = self.script.lock();
            (
                script.call_delays.pop_front().unwrap_or_default(),
                script.tool_failure.clone(),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(message) => Err(McpError::ToolExecution(message)),
            None => Ok(json!({
                "content": [{"type": "text", "text": format!("{} ok", name)}],
                "isError": false
            })),
        }
    }

    async fn read_resource(&self, uri: &str) -> McpResult<Value> {
        self.ensure_connected()?;
        Ok(json!({"contents": [{"uri": uri, "text": "# Intro"}]}))
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResult<Value> {
        self.ensure_connected()?;
        Ok(json!({"description": name, "arguments": arguments}))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Build a bearer-authenticated config. `server_extra` is spliced into the
/// `server` block (indent two spaces); `extra` adds top-level sections.
#[allow(dead_code)]
pub fn config(server_extra: &str, extra: &str) -> ClientConfig {
    let yaml = format!(
        "server:\n  id: \"test-server\"\n  endpoint: \"http://localhost:9/mcp\"\n{}authentication:\n  type: bearer\n  token: \"test-token\"\n{}",
        server_extra, extra
    );
    ClientConfig::from_yaml_str(&yaml).expect("valid test config")
}

/// Wait for the next event named `name`, skipping others.
#[allow(dead_code)]
pub async fn wait_for(rx: &mut broadcast::Receiver<SupervisorEvent>, name: &str) -> SupervisorEvent {
    let wait = async {
        loop {
            let event = rx.recv().await.expect("event channel open");
            if event.name() == name {
                return event;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for '{}' event", name))
}

/// Everything currently buffered on the receiver.
#[allow(dead_code)]
pub fn drain(rx: &mut broadcast::Receiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    events
}

#[allow(dead_code)]
pub fn names(events: &[SupervisorEvent]) -> Vec<&'static str> {
    events.iter().map(SupervisorEvent::name).collect()
}
