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

/// Deletes a single file.
///
/// When constructed with [`DeleteFileTool::guarded`], the deletion is routed
/// through the safety kernel the same way [`super::write_file::WriteTool`]
/// routes writes: the containing directory must be approved and the change
/// (content going to empty) confirmed before the file is removed. Bare
/// `DeleteFileTool::default()` skips gating for embeddings with no front-end
/// to ask.
#[derive(Default)]
pub struct DeleteFileTool {
    kernel: Option<Arc<SafetyKernel>>,
}

impl DeleteFileTool {
    pub fn guarded(kernel: Arc<SafetyKernel>) -> Self {
        Self { kernel: Some(kernel) }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file. Fails gracefully if not found. NEVER delete without explicit user request.\n\
         Permanent — no recovery. For directories use run_terminal_command with rm -r."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file to delete"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => {
                let args_preview =
                    serde_json::to_string(&call.args).unwrap_or_else(|_| "null".to_string());
                return ToolOutput::err(
                    &call.id,
                    format!(
                        "missing required parameter 'path'. Received: {}",
                        args_preview
                    ),
                );
            }
        };

        debug!(path = %path, "delete_file tool");

        let guarded_path = if let Some(kernel) = &self.kernel {
            match kernel.guard_path(&path).await {
                Ok(p) => p,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            }
        } else {
            std::path::PathBuf::from(&path)
        };

        // Refuse to delete directories
        let old_content = match tokio::fs::metadata(&guarded_path).await {
            Ok(m) if m.is_dir() => {
                return ToolOutput::err(
                    &call.id,
                    format!(
                        "{path} is a directory; use run_terminal_command with 'rm -rf' instead"
                    ),
                );
            }
            Err(e) => return ToolOutput::err(&call.id, format!("stat error: {e}")),
            Ok(_) => tokio::fs::read_to_string(&guarded_path).await.unwrap_or_default(),
        };

        if let Some(kernel) = &self.kernel {
            let diff = similar::TextDiff::from_lines(&old_content, "")
                .unified_diff()
                .header(&path, "/dev/null")
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

        match tokio::fs::remove_file(&path).await {
            Ok(_) => ToolOutput::ok(&call.id, format!("deleted {path}")),
            Err(e) => ToolOutput::err(&call.id, format!("delete error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::{Tool, ToolCall};

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "d1".into(),
            name: "delete_file".into(),
            args,
        }
    }

    #[tokio::test]
    async fn deletes_existing_file() {
        let path = {
            use std::sync::atomic::{AtomicU32, Ordering};
            static CTR: AtomicU32 = AtomicU32::new(0);
            let n = CTR.fetch_add(1, Ordering::Relaxed);
            format!("/tmp/shelly_delete_test_{}_{n}.txt", std::process::id())
        };
        std::fs::write(&path, "bye").unwrap();
        let t = DeleteFileTool::default();
        let out = t.execute(&call(json!({"path": path}))).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("deleted"));
    }

    #[tokio::test]
    async fn missing_file_is_error() {
        let t = DeleteFileTool::default();
        let out = t
            .execute(&call(json!({"path": "/tmp/shelly_no_such_delete_xyz.txt"})))
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn directory_is_error() {
        let t = DeleteFileTool::default();
        let out = t.execute(&call(json!({"path": "/tmp"}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("directory"));
    }

    #[tokio::test]
    async fn missing_file_path_is_error() {
        let t = DeleteFileTool::default();
        let out = t.execute(&call(json!({}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required parameter 'path'"));
    }

    #[test]
    fn only_available_in_agent_mode() {
        let t = DeleteFileTool::default();
        assert_eq!(t.modes(), &[AgentMode::Agent]);
    }

    #[tokio::test]
    async fn guarded_delete_prompts_for_directory_and_confirms_change() {
        use crate::ask::AutoApprove;
        use crate::permission::PermissionStore;
        use crate::safety::SafetyKernel;

        let dir = std::env::temp_dir().join(format!("shelly_guarded_delete_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = std::sync::Arc::new(PermissionStore::load(dir.join("permissions.json")).unwrap());
        let kernel = SafetyKernel::new(store.clone(), std::sync::Arc::new(AutoApprove), std::sync::Arc::new(crate::ask::NullNotify));

        let file = dir.join("a.txt");
        std::fs::write(&file, "bye").unwrap();

        let t = DeleteFileTool::guarded(kernel);
        let out = t.execute(&call(json!({"path": file.to_string_lossy()}))).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(store.is_dir_approved(&dir));
        assert!(!file.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn guarded_delete_denied_directory_does_not_touch_disk() {
        use crate::ask::AutoDeny;
        use crate::permission::PermissionStore;
        use crate::safety::SafetyKernel;

        let dir = std::env::temp_dir().join(format!("shelly_guarded_delete_deny_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = std::sync::Arc::new(PermissionStore::load(dir.join("permissions.json")).unwrap());
        let kernel = SafetyKernel::new(store, std::sync::Arc::new(AutoDeny), std::sync::Arc::new(crate::ask::NullNotify));

        let file = dir.join("b.txt");
        std::fs::write(&file, "still here").unwrap();

        let t = DeleteFileTool::guarded(kernel);
        let out = t.execute(&call(json!({"path": file.to_string_lossy()}))).await;
        assert!(out.is_error);
        assert!(file.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
