// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `shelly-mcp-client` — connects to external MCP tool servers and wraps
//! each advertised tool as a local [`shelly_tools::Tool`], so the agent loop
//! can call a remote server exactly like a built-in.
//!
//! Two transports are supported, matching the two shapes external servers
//! actually ship in the wild:
//!
//! - **stdio**: the server is a subprocess; requests/responses are
//!   line-delimited JSON-RPC over its stdin/stdout.
//! - **streamable HTTP**: the server is a long-lived HTTP endpoint, optionally
//!   gated behind OAuth (see [`oauth`]).
//!
//! ```text
//! McpClient::connect(&config)
//!       │  tools/list
//!       ▼
//! McpRemoteTool  (one per remote tool, name-prefixed by server)
//!       │  registered into
//!       ▼
//! ToolRegistry
//! ```

pub mod oauth;
pub mod tool;
pub mod transport;

pub use tool::McpRemoteTool;
pub use transport::{McpServerConfig, McpTransport};

use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::service::{RoleClient, RunningService};
use rmcp::ServiceExt;
use shelly_tools::ToolRegistry;
use tracing::info;

/// Minimal [`rmcp::ClientHandler`] — we never accept server-initiated
/// sampling or elicitation requests, so every method uses the trait default.
#[derive(Clone, Copy, Default)]
struct PassiveClientHandler;

impl rmcp::handler::client::ClientHandler for PassiveClientHandler {}

/// A live connection to one external MCP server.
pub struct McpClient {
    name: String,
    service: Arc<RunningService<RoleClient, PassiveClientHandler>>,
}

impl McpClient {
    /// Connect using the transport named in `config`, performing the MCP
    /// initialize handshake before returning.
    pub async fn connect(config: &McpServerConfig) -> Result<Self> {
        let service = match &config.transport {
            McpTransport::Stdio { command, args } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                let transport = rmcp::transport::TokioChildProcess::new(cmd)
                    .with_context(|| format!("failed to spawn MCP server '{command}'"))?;
                PassiveClientHandler
                    .serve(transport)
                    .await
                    .with_context(|| format!("MCP stdio handshake failed for '{}'", config.name))?
            }
            McpTransport::StreamableHttp { url, auth } => {
                let token = match auth {
                    Some(auth_cfg) => Some(crate::oauth::ensure_token(&config.name, auth_cfg).await?),
                    None => None,
                };
                let transport = transport::build_streamable_http(url, token.as_deref())?;
                PassiveClientHandler
                    .serve(transport)
                    .await
                    .with_context(|| format!("MCP HTTP handshake failed for '{}'", config.name))?
            }
        };
        Ok(Self { name: config.name.clone(), service: Arc::new(service) })
    }

    /// Enumerate the tools this server currently exposes.
    ///
    /// MCP's `tools/list` is paginated; we follow `next_cursor` until
    /// exhausted so a server that shards its tool list still yields every
    /// tool in one call.
    pub async fn list_tools(&self) -> Result<Vec<rmcp::model::Tool>> {
        let mut all = Vec::new();
        let mut cursor = None;
        loop {
            let params = cursor.take().map(|c| rmcp::model::PaginatedRequestParams { cursor: Some(c) });
            let page = self.service.list_tools(params).await.context("tools/list failed")?;
            all.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(all)
    }

    /// Register every tool this server exposes into `registry`.
    ///
    /// Each tool is registered under `"<server>__<remote name>"` so that two
    /// servers exposing the same remote tool name (e.g. two servers both
    /// offering `search`) never collide in the registry.
    pub async fn register_into(&self, registry: &mut ToolRegistry) -> Result<usize> {
        let tools = self.list_tools().await?;
        let count = tools.len();
        for tool in tools {
            registry.register(McpRemoteTool::new(self.service.clone(), &self.name, tool));
        }
        info!(server = %self.name, tools = count, "registered MCP server tools");
        Ok(count)
    }

    /// Gracefully end the session, telling the server to release any
    /// resources it held for us.
    pub async fn shutdown(self) -> Result<()> {
        match Arc::try_unwrap(self.service) {
            Ok(service) => service.cancel().await.context("MCP shutdown failed").map(|_| ()),
            // Other tools still hold a handle (e.g. outstanding calls) —
            // dropping our Arc lets the session end once they finish.
            Err(_) => Ok(()),
        }
    }
}
