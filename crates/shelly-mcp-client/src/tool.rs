// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! [`McpRemoteTool`] — adapts one tool advertised by an external MCP server
//! into shelly's [`Tool`] trait, so the agent loop can call it exactly like
//! a built-in.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, RawContent};
use rmcp::service::{RoleClient, RunningService};
use serde_json::Value;

use shelly_config::AgentMode;
use shelly_tools::{ApprovalPolicy, OutputCategory, Tool, ToolCall, ToolOutput, ToolOutputPart};

use crate::PassiveClientHandler;

/// A tool backed by a live MCP session. Every invocation round-trips through
/// `tools/call`; wire-level tool errors (`is_error: true` in the result) are
/// surfaced as [`ToolOutput::err`] rather than as a protocol-level failure,
/// matching how local tools report failure.
pub struct McpRemoteTool {
    service: Arc<RunningService<RoleClient, PassiveClientHandler>>,
    /// Exposed to the model as `<server>__<remote name>` to avoid collisions
    /// between servers that happen to name a tool the same thing.
    local_name: String,
    remote_name: String,
    description: String,
    input_schema: Value,
}

impl McpRemoteTool {
    pub fn new(
        service: Arc<RunningService<RoleClient, PassiveClientHandler>>,
        server_name: &str,
        tool: rmcp::model::Tool,
    ) -> Self {
        let remote_name = tool.name.to_string();
        let local_name = format!("{server_name}__{remote_name}");
        let description = tool.description.as_deref().unwrap_or("").to_string();
        let input_schema = Value::Object((*tool.input_schema).clone());
        Self { service, local_name, remote_name, description, input_schema }
    }
}

#[async_trait]
impl Tool for McpRemoteTool {
    fn name(&self) -> &str {
        &self.local_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.input_schema.clone()
    }

    fn default_policy(&self) -> ApprovalPolicy {
        // Remote tools are arbitrary code running on infrastructure we don't
        // control; never auto-approve them the way read-only built-ins are.
        ApprovalPolicy::Prompt
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Research, AgentMode::Plan, AgentMode::Agent]
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let arguments = match &call.args {
            Value::Object(map) => Some(map.clone()),
            Value::Null => None,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                Some(map)
            }
        };

        let params = CallToolRequestParams { name: self.remote_name.clone().into(), arguments };

        match self.service.call_tool(params).await {
            Ok(result) => {
                let parts: Vec<ToolOutputPart> = result
                    .content
                    .into_iter()
                    .filter_map(|item| match item.raw {
                        RawContent::Text(text) => Some(ToolOutputPart::Text(text.text)),
                        RawContent::Image(image) => {
                            Some(ToolOutputPart::Image(format!("data:{};base64,{}", image.mime_type, image.data)))
                        }
                        _ => None,
                    })
                    .collect();

                let output = if parts.is_empty() {
                    ToolOutput::ok(&call.id, String::new())
                } else {
                    ToolOutput::with_parts(&call.id, parts)
                };

                if result.is_error == Some(true) {
                    ToolOutput::err(&call.id, output.content)
                } else {
                    output
                }
            }
            Err(e) => ToolOutput::err(&call.id, format!("MCP call to '{}' failed: {e}", self.remote_name)),
        }
    }
}
