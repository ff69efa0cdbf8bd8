// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Direct process execution — `{ command, args }` run without shell
//! interpolation, gated by per-program trust in the permission store.
//!
//! Unlike [`crate::builtin::shell::ShellTool`] and
//! [`crate::builtin::run_terminal_command::RunTerminalCommandTool`], which
//! hand a whole string to `sh -c` so the model can use pipes and globs, this
//! tool exists for the narrower case where a bare program name must be
//! trusted once and then run without any shell ever parsing its arguments —
//! the safety pattern in its most literal form.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info};

use crate::ask::{AskCallback, NotifyCallback};
use crate::coalesce::{PromptCoalescer, PromptOutcome, Role};
use crate::permission::PermissionStore;
use crate::policy::ApprovalPolicy;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

const OUTPUT_CAP_BYTES: usize = 1024 * 1024;

pub struct ExecTool {
    store: Arc<PermissionStore>,
    coalescer: PromptCoalescer,
    ask: Arc<dyn AskCallback>,
    notify: Arc<dyn NotifyCallback>,
    pub timeout_secs: u64,
}

impl ExecTool {
    pub fn new(
        store: Arc<PermissionStore>,
        ask: Arc<dyn AskCallback>,
        notify: Arc<dyn NotifyCallback>,
    ) -> Self {
        Self { store, coalescer: PromptCoalescer::new(), ask, notify, timeout_secs: 30 }
    }

    /// Resolve whether `program` may run, prompting (coalesced across
    /// concurrent callers asking about the same program) when untrusted.
    /// Returns `Ok(true)` if this specific invocation should persist trust.
    async fn authorize(&self, program: &str) -> Result<(), ToolOutput> {
        if self.store.is_command_trusted(program) {
            return Ok(());
        }

        let key = format!("cmd:{program}");
        match self.coalescer.join(&key) {
            Role::Leader => {
                let question = format!("Run untrusted command '{program}'?");
                let answer = self
                    .ask
                    .ask(&question, &["yes", "trust", "no"])
                    .await
                    .map_err(|e| ToolOutput::err("", format!("approval prompt failed: {e}")))?;

                let (ok, outcome) = match answer.to_ascii_lowercase().as_str() {
                    "trust" => {
                        let _ = self.store.trust_command(program);
                        (true, PromptOutcome::Trusted)
                    }
                    "yes" => (true, PromptOutcome::OneShot),
                    _ => (false, PromptOutcome::Denied),
                };
                self.coalescer.resolve(&key, outcome);
                if ok {
                    Ok(())
                } else {
                    Err(ToolOutput::err("", format!("permission denied: '{program}' not trusted")))
                }
            }
            Role::Follower(mut rx) => match rx.recv().await {
                Ok(PromptOutcome::Trusted) => Ok(()),
                Ok(PromptOutcome::Denied) => {
                    Err(ToolOutput::err("", format!("permission denied: '{program}' not trusted")))
                }
                Ok(PromptOutcome::OneShot) | Err(_) => {
                    Box::pin(self.authorize(program)).await
                }
            },
        }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str { "exec" }

    fn description(&self) -> &str {
        "Run a program directly with an explicit argument list — no shell parses the command \
         line, so quoting/globbing/pipes are never available. The program name is trusted \
         per-program (not per-argument); the first invocation of an untrusted program prompts \
         for approval."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Program name (resolved via PATH, no shell interpolation)"
                },
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Argument vector passed to the program"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Ask }
    fn output_category(&self) -> OutputCategory { OutputCategory::HeadTail }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let program = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'command' argument"),
        };
        let args: Vec<String> = call
            .args
            .get("args")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        if let Err(mut denial) = self.authorize(&program).await {
            denial.call_id = call.id.clone();
            return denial;
        }

        info!(program = %program, args = ?args, "trusted command execution");
        self.notify.notify(&format!("executing: {program} {}", args.join(" ")));

        debug!(program = %program, "exec tool");

        let mut cmd = Command::new(&program);
        cmd.args(&args);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_secs),
            cmd.output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = cap(&output.stdout);
                let stderr = cap(&output.stderr);
                if !stdout.is_empty() {
                    content.push_str(&stdout);
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&stderr);
                }
                if output.status.success() {
                    ToolOutput::ok(&call.id, content)
                } else {
                    let code = output.status.code().unwrap_or(-1);
                    ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
                }
            }
            Ok(Err(e)) => ToolOutput::err(&call.id, format!("spawn error: {e}")),
            Err(_) => ToolOutput::err(&call.id, format!("timeout after {}s", self.timeout_secs)),
        }
    }
}

fn cap(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if bytes.len() <= OUTPUT_CAP_BYTES {
        text.into_owned()
    } else {
        let truncated = String::from_utf8_lossy(&bytes[..OUTPUT_CAP_BYTES]).into_owned();
        format!("{truncated}...[truncated at {OUTPUT_CAP_BYTES} bytes]")
    }
}
