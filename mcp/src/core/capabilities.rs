//! Capability drift detection between configuration and the remote server.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{config::CapabilitiesConfig, transport::Transport};
use crate::error::McpResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tools,
    Resources,
    Prompts,
}

/// Expected capabilities the server does not expose. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityWarning {
    #[serde(rename = "type")]
    pub kind: CapabilityKind,
    pub missing: Vec<String>,
}

/// Names discovered on the server: tool names, resource URIs, prompt names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredCapabilities {
    pub tools: Vec<String>,
    pub resources: Vec<String>,
    pub prompts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityReport {
    pub discovered: DiscoveredCapabilities,
    pub warnings: Vec<CapabilityWarning>,
}

pub struct CapabilityValidator {
    expected: CapabilitiesConfig,
}

impl CapabilityValidator {
    pub fn new(expected: CapabilitiesConfig) -> Self {
        Self { expected }
    }

    /// Fetch all three listings concurrently and diff them against the
    /// expected sets. A listing failure is returned as the error.
    pub async fn validate(&self, transport: &dyn Transport) -> McpResult<CapabilityReport> {
        let (tools, resources, prompts) = tokio::try_join!(
            transport.list_tools(),
            transport.list_resources(),
            transport.list_prompts(),
        )?;

        let tool_names: Vec<String> = tools.into_iter().map(|t| t.name).collect();
        let prompt_names: Vec<String> = prompts.into_iter().map(|p| p.name).collect();

        let mut warnings = Vec::new();

        let missing = find_missing(&self.expected.expected_tools, |name| {
            tool_names.iter().any(|t| t == name)
        });
        push_warning(&mut warnings, CapabilityKind::Tools, missing);

        // Resources tolerate URI prefixes: substring of a URI, or an exact name
        let missing = find_missing(&self.expected.expected_resources, |expected| {
            resources
                .iter()
                .any(|r| r.uri.contains(expected) || r.name == expected)
        });
        push_warning(&mut warnings, CapabilityKind::Resources, missing);

        let missing = find_missing(&self.expected.expected_prompts, |name| {
            prompt_names.iter().any(|p| p == name)
        });
        push_warning(&mut warnings, CapabilityKind::Prompts, missing);

        debug!(
            tools = tool_names.len(),
            resources = resources.len(),
            prompts = prompt_names.len(),
            warnings = warnings.len(),
            "Validated server capabilities"
        );

        Ok(CapabilityReport {
            discovered: DiscoveredCapabilities {
                tools: tool_names,
                resources: resources.into_iter().map(|r| r.uri).collect(),
                prompts: prompt_names,
            },
            warnings,
        })
    }
}

fn find_missing(expected: &[String], present: impl Fn(&str) -> bool) -> Vec<String> {
    expected
        .iter()
        .filter(|name| !present(name.as_str()))
        .cloned()
        .collect()
}

fn push_warning(warnings: &mut Vec<CapabilityWarning>, kind: CapabilityKind, missing: Vec<String>) {
    if missing.is_empty() {
        return;
    }
    warn!(kind = ?kind, missing = ?missing, "Expected capabilities missing on server");
    warnings.push(CapabilityWarning { kind, missing });
}
