// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use shelly_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::safety::SafetyKernel;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Writes files to disk.
///
/// When constructed with [`WriteTool::guarded`], every write is routed
/// through the safety kernel: the target directory must be approved (prompt
/// coalesced across concurrent callers) and the content change itself must
/// be confirmed unless the session has already opted into bulk trust. Bare
/// `WriteTool::default()` skips gating — used for embeddings (tests, CI)
/// with no front-end to ask.
#[derive(Default)]
pub struct WriteTool {
    kernel: Option<Arc<SafetyKernel>>,
}

impl WriteTool {
    pub fn guarded(kernel: Arc<SafetyKernel>) -> Self {
        Self { kernel: Some(kernel) }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str { "write" }

    fn description(&self) -> &str {
        "Writes a file to the local filesystem. This tool will overwrite the existing file if \
         one exists at the provided path. ALWAYS prefer editing existing files with edit_file. \
         NEVER write new files unless explicitly required. \
         NEVER proactively create documentation or README files unless explicitly requested. \
         Creates parent directories automatically. \
         Set append=true to add to the end of an existing file instead of overwriting."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                },
                "append": {
                    "type": "boolean",
                    "description": "If true, append to existing content instead of overwriting (default false)"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Ask }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => {
                let args_preview = serde_json::to_string(&call.args)
                    .unwrap_or_else(|_| "null".to_string());
                return ToolOutput::err(
                    &call.id,
                    format!("missing required parameter 'path'. Received: {}", args_preview)
                );
            }
        };
        let content = match call.args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => {
                let args_preview = serde_json::to_string(&call.args)
                    .unwrap_or_else(|_| "null".to_string());
                return ToolOutput::err(
                    &call.id,
                    format!("missing required parameter 'content'. Received: {}", args_preview)
                );
            }
        };
        let should_append = call.args.get("append").and_then(|v| v.as_bool()).unwrap_or(false);

        debug!(path = %path, append = should_append, "write tool");

        let guarded_path = if let Some(kernel) = &self.kernel {
            match kernel.guard_path(&path).await {
                Ok(p) => p,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            }
        } else {
            std::path::PathBuf::from(&path)
        };

        if let Some(kernel) = &self.kernel {
            let old = tokio::fs::read_to_string(&guarded_path).await.unwrap_or_default();
            let new_full = if should_append { format!("{old}{content}") } else { content.clone() };
            let diff = similar::TextDiff::from_lines(&old, &new_full)
                .unified_diff()
                .header(&path, &path)
                .to_string();
            if let Err(e) = kernel.confirm_change(&guarded_path, &diff).await {
                return ToolOutput::err(&call.id, e.to_string());
            }
        }

        let _lock = if let Some(kernel) = &self.kernel {
            Some(kernel.lock(&guarded_path).await)
        } else {
            None
        };

        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }

        if should_append {
            use tokio::io::AsyncWriteExt;
            match tokio::fs::OpenOptions::new().append(true).create(true).open(&path).await {
                Ok(mut f) => {
                    let result = f.write_all(content.as_bytes()).await;
                    // Explicitly flush + shutdown to ensure all bytes reach the OS before
                    // the file handle is dropped (tokio::fs::File close is async on drop).
                    let _ = f.flush().await;
                    let _ = f.shutdown().await;
                    match result {
                        Ok(_) => ToolOutput::ok(&call.id, format!("appended {} bytes to {path}", content.len())),
                        Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
                    }
                }
                Err(e) => ToolOutput::err(&call.id, format!("open error: {e}")),
            }
        } else {
            match tokio::fs::write(&path, &content).await {
                Ok(_) => ToolOutput::ok(&call.id, format!("wrote {} bytes to {path}", content.len())),
                Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
            }
        }
    }
}
