// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use libc;
use shelly_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

use super::state::GdbSessionState;

pub struct GdbStopTool {
    state: Arc<Mutex<GdbSessionState>>,
}

impl GdbStopTool {
    pub fn new(state: Arc<Mutex<GdbSessionState>>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for GdbStopTool {
    fn name(&self) -> &str {
        "gdb_stop"
    }

    fn description(&self) -> &str {
        "Stop the active GDB debugging session: disconnect gdb-multiarch and kill the \
         GDB server process (JLinkGDBServer, OpenOCD, etc.). \
         Always call this when done debugging to clean up background processes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        debug!("gdb_stop: tearing down session");

        let mut state = self.state.lock().await;

        if !state.has_server() && !state.has_client() {
            return ToolOutput::ok(&call.id, "No active GDB session to stop.");
        }

        // Send SIGTERM to the GDB process if we know its PID.
        // Avoid raw_console_cmd("quit"): when GDB exits immediately after receiving
        // "quit", its stderr closes with an empty read, triggering a panic in the
        // gdbmi worker's process_stderr() (usize underflow on len()-1 of empty buf).
        // SIGTERM lets GDB exit cleanly without us blocking on its response.
        if let Some(pid) = state.gdb_pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        // Brief pause to let GDB drain output before we drop it.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        state.clear().await;

        ToolOutput::ok(&call.id, "GDB session stopped. Server process killed.")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
