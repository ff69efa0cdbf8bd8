// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! OAuth 2.1 authorization-code + PKCE flow for MCP servers that require a
//! bearer token (most hosted/remote servers behind the streamable-HTTP
//! transport do). Tokens are cached on disk under `~/.shelly/mcp_auth/` so
//! the browser round-trip only happens once per server.
//!
//! This is deliberately the minimal flow that remote MCP servers expect:
//! no client secret (public client, confidential auth isn't meaningful for a
//! CLI), PKCE `S256` challenge, and a short-lived localhost redirect
//! listener to catch the callback.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Static OAuth endpoints for one MCP server. Supplied by the user's config
/// (discovered once via the server's `/.well-known/oauth-authorization-server`
/// metadata, out of scope here — callers resolve that ahead of time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    /// Localhost port the CLI listens on for the redirect callback.
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_redirect_port() -> u16 {
    51823
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    /// Unix seconds; `None` means the token never expires (or the server
    /// didn't report a lifetime — treated conservatively as expired on
    /// every load so we always confirm liveness via refresh).
    expires_at: Option<u64>,
}

fn token_cache_path(server_name: &str) -> Result<PathBuf> {
    let base = dirs::home_dir().context("cannot resolve home directory for MCP token cache")?;
    Ok(base.join(".shelly").join("mcp_auth").join(format!("{server_name}.json")))
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Return a valid bearer token for `server_name`, running the browser
/// authorization flow if no cached token exists or refresh fails.
pub async fn ensure_token(server_name: &str, cfg: &OAuthConfig) -> Result<String> {
    let cache_path = token_cache_path(server_name)?;

    if let Some(cached) = load_cached(&cache_path) {
        let fresh = cached.expires_at.map(|exp| now_unix() + 60 < exp).unwrap_or(false);
        if fresh {
            return Ok(cached.access_token);
        }
        if let Some(refresh_token) = &cached.refresh_token {
            if let Ok(refreshed) = refresh(cfg, refresh_token).await {
                save_cached(&cache_path, &refreshed)?;
                return Ok(refreshed.access_token);
            }
            debug!(server = %server_name, "MCP token refresh failed, falling back to full authorization");
        }
    }

    let token = authorize_interactive(cfg).await?;
    save_cached(&cache_path, &token)?;
    Ok(token.access_token)
}

fn load_cached(path: &PathBuf) -> Option<CachedToken> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn save_cached(path: &PathBuf, token: &CachedToken) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create MCP token cache directory")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
        }
    }
    let data = serde_json::to_vec_pretty(token).context("failed to serialize MCP token")?;
    std::fs::write(path, data).context("failed to persist MCP token cache")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

/// Generate a PKCE verifier/challenge pair (`S256`, per RFC 7636).
fn generate_pkce_pair() -> (String, String) {
    let mut verifier_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut verifier_bytes);
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize());

    (verifier, challenge)
}

/// Run the full browser-based authorization-code + PKCE exchange.
///
/// Opens the system browser to `authorize_url`, listens on
/// `127.0.0.1:<redirect_port>` for the single callback request, then
/// exchanges the returned `code` for tokens at `token_url`.
async fn authorize_interactive(cfg: &OAuthConfig) -> Result<CachedToken> {
    let (verifier, challenge) = generate_pkce_pair();
    let mut state_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut state_bytes);
    let state = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(state_bytes);

    let redirect_uri = format!("http://127.0.0.1:{}/callback", cfg.redirect_port);
    let mut authorize = url::Url::parse(&cfg.authorize_url).context("invalid authorize_url")?;
    {
        let mut q = authorize.query_pairs_mut();
        q.append_pair("response_type", "code");
        q.append_pair("client_id", &cfg.client_id);
        q.append_pair("redirect_uri", &redirect_uri);
        q.append_pair("state", &state);
        q.append_pair("code_challenge", &challenge);
        q.append_pair("code_challenge_method", "S256");
        if !cfg.scopes.is_empty() {
            q.append_pair("scope", &cfg.scopes.join(" "));
        }
    }

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", cfg.redirect_port))
        .await
        .with_context(|| format!("failed to bind MCP OAuth redirect listener on port {}", cfg.redirect_port))?;

    info!(url = %authorize, "opening browser for MCP authorization");
    if webbrowser::open(authorize.as_str()).is_err() {
        info!("could not open a browser automatically; visit this URL to authorize: {authorize}");
    }

    let code = tokio::time::timeout(Duration::from_secs(300), receive_callback_code(&listener, &state))
        .await
        .context("timed out waiting for MCP authorization callback")??;

    exchange_code(cfg, &code, &verifier, &redirect_uri).await
}

/// Accept exactly one HTTP request on `listener`, parse `code`/`state` out
/// of its request line, and reply with a minimal confirmation page.
async fn receive_callback_code(listener: &tokio::net::TcpListener, expected_state: &str) -> Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut stream, _) = listener.accept().await.context("MCP OAuth callback accept failed")?;
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).await.context("MCP OAuth callback read failed")?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let request_line = request.lines().next().unwrap_or_default();
    let path = request_line.split_whitespace().nth(1).unwrap_or_default();

    let parsed = url::Url::parse(&format!("http://127.0.0.1{path}")).context("malformed OAuth callback path")?;
    let mut code = None;
    let mut state = None;
    for (k, v) in parsed.query_pairs() {
        match k.as_ref() {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            _ => {}
        }
    }

    let body = "<html><body>Authorization complete, you can close this tab.</body></html>";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;

    if state.as_deref() != Some(expected_state) {
        bail!("MCP OAuth callback state mismatch (possible CSRF)");
    }
    code.context("MCP OAuth callback missing 'code' parameter")
}

async fn exchange_code(cfg: &OAuthConfig, code: &str, verifier: &str, redirect_uri: &str) -> Result<CachedToken> {
    let client = reqwest::Client::new();
    let resp = client
        .post(&cfg.token_url)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &cfg.client_id),
            ("code_verifier", verifier),
        ])
        .send()
        .await
        .context("MCP token exchange request failed")?;
    parse_token_response(resp).await
}

async fn refresh(cfg: &OAuthConfig, refresh_token: &str) -> Result<CachedToken> {
    let client = reqwest::Client::new();
    let resp = client
        .post(&cfg.token_url)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &cfg.client_id),
        ])
        .send()
        .await
        .context("MCP token refresh request failed")?;
    parse_token_response(resp).await
}

#[derive(Deserialize)]
struct TokenResponseWire {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

async fn parse_token_response(resp: reqwest::Response) -> Result<CachedToken> {
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        bail!("MCP token endpoint returned {status}: {text}");
    }
    let wire: TokenResponseWire = resp.json().await.context("invalid token endpoint response")?;
    Ok(CachedToken {
        access_token: wire.access_token,
        refresh_token: wire.refresh_token,
        expires_at: wire.expires_in.map(|secs| now_unix() + secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_pair_challenge_is_derived_from_verifier() {
        let (verifier, challenge) = generate_pkce_pair();
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize());
        assert_eq!(challenge, expected);
    }

    #[test]
    fn pkce_pairs_are_not_repeated() {
        let (v1, c1) = generate_pkce_pair();
        let (v2, c2) = generate_pkce_pair();
        assert_ne!(v1, v2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn cached_token_round_trips_through_json() {
        let token = CachedToken {
            access_token: "abc123".to_string(),
            refresh_token: Some("refresh456".to_string()),
            expires_at: Some(1_700_000_000),
        };
        let json = serde_json::to_vec(&token).unwrap();
        let back: CachedToken = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.access_token, token.access_token);
        assert_eq!(back.expires_at, token.expires_at);
    }

    #[test]
    fn default_redirect_port_is_stable() {
        assert_eq!(default_redirect_port(), 51823);
    }
}
