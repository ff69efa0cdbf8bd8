// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use crate::{
    catalog::{InputModality, ModelCatalogEntry},
    CompletionRequest, ResponseEvent,
};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// Vendor rate-limit quota as reported in response headers.
///
/// Every field is `None` when the vendor didn't send the corresponding
/// header — callers should not assume any field is populated.
#[derive(Debug, Clone, Default)]
pub struct RateLimitQuota {
    pub remaining_requests: Option<u64>,
    pub remaining_tokens: Option<u64>,
    pub reset_requests: Option<Duration>,
    pub reset_tokens: Option<Duration>,
}

/// A distinguished HTTP 429 response, carrying whatever quota data the
/// vendor disclosed so the caller can schedule a retry.
#[derive(Debug, Clone)]
pub struct RateLimitError {
    pub provider: String,
    pub retry_after: Option<Duration>,
    pub quota: RateLimitQuota,
    pub body: String,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rate limit exceeded", self.provider)?;
        if let Some(ra) = self.retry_after {
            write!(f, " (retry after {}s)", ra.as_secs())?;
        }
        Ok(())
    }
}

impl std::error::Error for RateLimitError {}

/// Parse `retry-after` (seconds, per RFC 9110) from a generic header map.
pub fn parse_retry_after(get: impl Fn(&str) -> Option<String>) -> Option<Duration> {
    get("retry-after").and_then(|v| v.trim().parse::<u64>().ok()).map(Duration::from_secs)
}

/// Parse OpenAI-style `x-ratelimit-*` headers into a [`RateLimitQuota`].
pub fn parse_openai_style_quota(get: impl Fn(&str) -> Option<String>) -> RateLimitQuota {
    let parse_dur = |v: String| -> Option<Duration> {
        // OpenAI sends values like "6m0s" or "1s"; fall back to plain seconds.
        if let Ok(secs) = v.trim_end_matches('s').parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        None
    };
    RateLimitQuota {
        remaining_requests: get("x-ratelimit-remaining-requests").and_then(|v| v.parse().ok()),
        remaining_tokens: get("x-ratelimit-remaining-tokens").and_then(|v| v.parse().ok()),
        reset_requests: get("x-ratelimit-reset-requests").and_then(parse_dur),
        reset_tokens: get("x-ratelimit-reset-tokens").and_then(parse_dur),
    }
}

/// Parse Anthropic-style `anthropic-ratelimit-*` headers into a [`RateLimitQuota`].
pub fn parse_anthropic_style_quota(get: impl Fn(&str) -> Option<String>) -> RateLimitQuota {
    RateLimitQuota {
        remaining_requests: get("anthropic-ratelimit-requests-remaining").and_then(|v| v.parse().ok()),
        remaining_tokens: get("anthropic-ratelimit-tokens-remaining").and_then(|v| v.parse().ok()),
        reset_requests: None,
        reset_tokens: None,
    }
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// List all models available from this provider.
    ///
    /// The default implementation returns only the static catalog entries for
    /// this provider.  Override to perform a live API query (and then merge
    /// with the catalog for metadata enrichment).
    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        let provider = self.name();
        let entries = crate::catalog::static_catalog()
            .into_iter()
            .filter(|e| e.provider == provider)
            .collect();
        Ok(entries)
    }

    /// Maximum output tokens for this provider/model combination.
    ///
    /// Reads from the static catalog; returns `None` if the model is unknown.
    fn catalog_max_output_tokens(&self) -> Option<u32> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.max_output_tokens)
    }

    /// Context window size for this provider/model combination.
    ///
    /// Reads from the static catalog; returns `None` if the model is unknown.
    fn catalog_context_window(&self) -> Option<u32> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.context_window)
    }

    /// Query the live API for the actual context window in use.
    ///
    /// Default implementation returns `None` (no live probe available).
    /// Override in providers that expose a properties or info endpoint —
    /// e.g. llama.cpp-compatible servers expose `GET /props` which includes
    /// the loaded `n_ctx` value.
    ///
    /// Returns `Some(n_ctx)` when the probe succeeds, `None` otherwise.
    /// A `Some(0)` result is treated as "unknown" by callers.
    async fn probe_context_window(&self) -> Option<u32> {
        None
    }

    /// Input modalities supported by this provider/model combination.
    ///
    /// Reads from the static catalog.  Returns `[Text]` when the model is not
    /// found, to be conservative (avoid sending images to unknown models).
    fn input_modalities(&self) -> Vec<InputModality> {
        crate::catalog::lookup(self.name(), self.model_name())
            .map(|e| e.input_modalities)
            .unwrap_or_else(|| vec![InputModality::Text])
    }

    /// Returns `true` if this model supports image input.
    fn supports_images(&self) -> bool {
        self.input_modalities().contains(&InputModality::Image)
    }
}
