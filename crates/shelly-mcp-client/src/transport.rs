// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Configuration for reaching one external MCP server, and the streamable
//! HTTP transport builder (the stdio transport needs no extra wiring beyond
//! [`rmcp::transport::TokioChildProcess`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One entry in the user's `mcp_servers` config list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Local name, used as the tool-name prefix (`<name>__<remote tool>`).
    pub name: String,
    #[serde(flatten)]
    pub transport: McpTransport,
}

/// How to reach a server: spawn it as a subprocess, or dial a long-lived
/// HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum McpTransport {
    /// Launch `command args...` and speak line-delimited JSON-RPC over its
    /// stdin/stdout. The child is killed when the connection is dropped.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Connect to a server implementing MCP's streamable-HTTP transport.
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<crate::oauth::OAuthConfig>,
    },
}

/// Build the streamable-HTTP client transport, attaching a bearer token when
/// one is available.
pub fn build_streamable_http(
    url: &str,
    bearer_token: Option<&str>,
) -> Result<rmcp::transport::StreamableHttpClientTransport<reqwest::Client>> {
    let mut builder = reqwest::Client::builder();
    if let Some(token) = bearer_token {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .context("invalid bearer token")?;
        value.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, value);
        builder = builder.default_headers(headers);
    }
    let client = builder.build().context("failed to build MCP HTTP client")?;
    Ok(rmcp::transport::StreamableHttpClientTransport::with_client(
        client,
        rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig::with_uri(url),
    ))
}
