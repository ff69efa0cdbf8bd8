// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fetches a URL and converts it to readable text, hardened against SSRF.
//!
//! Three layers close the usual escape hatches for a server-side fetcher
//! that a model can point anywhere:
//! 1. Pre-request: the hostname is resolved and every candidate address is
//!    checked against the private/loopback/link-local ranges; any match
//!    rejects the whole request.
//! 2. Connect-time: the request is pinned to the exact address that passed
//!    the check (via `reqwest::ClientBuilder::resolve`), so a second DNS
//!    answer returned between check and connect — the classic rebinding
//!    attack — can never be dialed.
//! 3. Redirects are followed manually, one hop at a time, re-running both
//!    checks on every `Location` target; nothing auto-follows.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::safety::SafetyKernel;
use crate::tool::{Tool, ToolCall, ToolOutput};

const DEFAULT_MAX_CHARS: usize = 50_000;
/// Hard cap on response body size, enforced while streaming so an
/// adversarial server can't exhaust memory with an unbounded reply.
const MAX_BODY_BYTES: usize = 1024 * 1024;
/// Total wall-clock budget for the whole fetch, including every redirect hop.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-connection dial timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: u8 = 5;

/// When constructed with [`WebFetchTool::guarded`], every host actually
/// contacted — the initial URL's and any redirect target's — is checked
/// against [`SafetyKernel`]'s domain trust list before it's dialed, exactly
/// as [`super::exec::ExecTool`] checks command trust before running.
#[derive(Default)]
pub struct WebFetchTool {
    kernel: Option<Arc<SafetyKernel>>,
}

impl WebFetchTool {
    pub fn guarded(kernel: Arc<SafetyKernel>) -> Self {
        Self { kernel: Some(kernel) }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str { "web_fetch" }

    fn description(&self) -> &str {
        "Fetch content from a URL and convert to readable text format.\n\n\
         ## Usage\n\
         - Fetch webpage content for analysis\n\
         - Extract text from HTML pages\n\
         - Retrieve documentation or reference material\n\
         - URL must be fully-formed and valid\n\n\
         ## Supported\n\
         - HTTP and HTTPS URLs\n\
         - HTML content conversion to markdown\n\
         - Text-based content\n\
         - Maximum 50,000 characters per request\n\n\
         ## Limitations\n\
         - No authentication support\n\
         - No binary content fetching\n\
         - No localhost or private IP access\n\
         - First request to a new domain prompts for approval; 'trust' remembers it\n\
         - Read-only (no requests with side effects)\n\n\
         ## When to Use\n\
         - Retrieve webpage content for analysis\n\
         - Extract information from documentation\n\
         - Get latest information from URLs\n\
         - Analyze web-based resources\n\n\
         ## When NOT to Use\n\
         - Private/authenticated content → not supported\n\
         - Binary files → use appropriate tool\n\
         - Localhost/internal IPs → use file system instead\n\n\
         ## Examples\n\
         <example>\n\
         Fetch documentation:\n\
         web_fetch: url=\"https://docs.example.com/api\"\n\
         </example>\n\
         <example>\n\
         Fetch with size limit:\n\
         web_fetch: url=\"https://example.com\", max_chars=10000\n\
         </example>\n\n\
         ## IMPORTANT\n\
         - Valid http/https URLs only\n\
         - Converts HTML to markdown automatically\n\
         - Content limited to 50,000 chars (configurable)\n\
         - No authentication or side effects\n\
         - Read-only operation"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to return (default 50000)"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Ask }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let url = match call.args.get("url").and_then(|v| v.as_str()) {
            Some(u) => u.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'url'"),
        };
        let max_chars = call.args.get("max_chars")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_CHARS as u64) as usize;

        debug!(url = %url, "web_fetch tool");

        match tokio::time::timeout(TOTAL_TIMEOUT, fetch_url(&url, max_chars, self.kernel.as_deref())).await {
            Ok(Ok(content)) => ToolOutput::ok(&call.id, content),
            Ok(Err(e)) => ToolOutput::err(&call.id, format!("fetch error: {e}")),
            Err(_) => ToolOutput::err(&call.id, "fetch error: total timeout exceeded".to_string()),
        }
    }
}

/// True for loopback, private, link-local and unspecified ranges — the
/// addresses a public-facing fetcher must never be allowed to dial.
fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10 carrier-grade NAT space, a common home for
                // internal cloud metadata endpoints.
                || (v4.octets()[0] == 100 && (64..=127).contains(&v4.octets()[1]))
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local addresses
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Resolve `host:port`, reject if resolution fails or any candidate address
/// is blocked, otherwise return the first safe address to pin the
/// connection to.
async fn resolve_safe(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| anyhow::anyhow!("DNS resolution failed for {host}: {e}"))?
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        anyhow::bail!("DNS resolution returned no addresses for {host}");
    }
    for addr in &addrs {
        if is_blocked_ip(addr.ip()) {
            anyhow::bail!("refusing to fetch {host}: resolves to a private/loopback address ({})", addr.ip());
        }
    }
    Ok(addrs[0])
}

fn default_port(url: &reqwest::Url) -> u16 {
    url.port_or_known_default().unwrap_or(443)
}

async fn fetch_url(
    url: &str,
    max_chars: usize,
    kernel: Option<&SafetyKernel>,
) -> anyhow::Result<String> {
    let mut current = reqwest::Url::parse(url).map_err(|e| anyhow::anyhow!("invalid URL: {e}"))?;

    for _ in 0..=MAX_REDIRECTS {
        let scheme = current.scheme();
        if scheme != "http" && scheme != "https" {
            anyhow::bail!("unsupported scheme: {scheme}");
        }
        let host = current.host_str().ok_or_else(|| anyhow::anyhow!("URL has no host"))?.to_string();
        let port = default_port(&current);

        if let Some(kernel) = kernel {
            kernel
                .authorize_domain(&host)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }

        let pinned = resolve_safe(&host, port).await?;

        let client = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent("shelly-agent/0.1")
            .resolve(&host, pinned)
            .build()?;

        let response = client.get(current.clone()).send().await?;

        if response.status().is_redirection() {
            let location = response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| anyhow::anyhow!("redirect response missing Location header"))?;
            current = current.join(location).map_err(|e| anyhow::anyhow!("invalid redirect target: {e}"))?;
            continue;
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        let body = read_capped_body(response).await?;

        let content = if content_type.contains("html") {
            html_to_text(&body)
        } else if content_type.contains("json") {
            match serde_json::from_str::<Value>(&body) {
                Ok(v) => serde_json::to_string_pretty(&v).unwrap_or(body),
                Err(_) => body,
            }
        } else {
            body
        };

        return Ok(if content.len() > max_chars {
            format!(
                "{}...[truncated at {max_chars} chars; total {} chars]",
                &content[..max_chars],
                content.len()
            )
        } else {
            content
        });
    }

    anyhow::bail!("too many redirects (max {MAX_REDIRECTS})")
}

/// Stream the body, stopping as soon as `MAX_BODY_BYTES` is exceeded rather
/// than buffering an arbitrarily large response first.
async fn read_capped_body(response: reqwest::Response) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);
        if buf.len() > MAX_BODY_BYTES {
            buf.truncate(MAX_BODY_BYTES);
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Convert HTML to plain text using html2text.
fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 100)
}
