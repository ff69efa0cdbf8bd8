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

/// Applies a multi-file `*** Begin Patch ... *** End Patch` patch.
///
/// When constructed with [`ApplyPatchTool::guarded`], every file operation
/// inside the patch (add, delete, update) is routed through the safety
/// kernel in the order it appears in the patch — the same directory
/// approval and diff-confirmation sequence [`super::write_file::WriteTool`]
/// runs for a single file, repeated per path touched. Bare
/// `ApplyPatchTool::default()` skips gating for embeddings with no
/// front-end to ask.
#[derive(Default)]
pub struct ApplyPatchTool {
    kernel: Option<Arc<SafetyKernel>>,
}

impl ApplyPatchTool {
    pub fn guarded(kernel: Arc<SafetyKernel>) -> Self {
        Self { kernel: Some(kernel) }
    }
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str { "apply_patch" }

    fn description(&self) -> &str {
        "Apply a patch in the shelly patch format to modify, add, or delete files.\n\
         Format:\n\
         *** Begin Patch\n\
         *** Add File: path/to/new_file.rs\n\
         +content line 1\n\
         +content line 2\n\
         *** Delete File: path/to/old_file.rs\n\
         *** Update File: path/to/existing.rs\n\
         @@ context_line_1\n\
          context line (space prefix)\n\
         -removed line\n\
         +added line\n\
          context line\n\
         *** End Patch\n\
         Returns a summary of applied changes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "input": {
                    "type": "string",
                    "description": "The full patch text including *** Begin Patch and *** End Patch markers"
                }
            },
            "required": ["input"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Ask }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let input = match call.args.get("input").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'input'"),
        };

        debug!("apply_patch tool");

        match apply_patch(&input, self.kernel.as_ref()).await {
            Ok(summary) => ToolOutput::ok(&call.id, summary),
            Err(e) => ToolOutput::err(&call.id, format!("patch error: {e}")),
        }
    }
}

/// Guard one path through the safety kernel before a mutating patch
/// operation touches it: approve the containing directory, confirm the
/// content change (`old` → `new`, either may be empty for add/delete), then
/// return a lock guard the caller holds for the duration of the I/O.
async fn guard_op(
    kernel: &SafetyKernel,
    path: &str,
    old: &str,
    new: &str,
) -> anyhow::Result<crate::locker::PathGuard> {
    let guarded_path = kernel
        .guard_path(path)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let diff = similar::TextDiff::from_lines(old, new)
        .unified_diff()
        .header(path, path)
        .to_string();
    kernel
        .confirm_change(&guarded_path, &diff)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(kernel.lock(&guarded_path).await)
}

async fn apply_patch(input: &str, kernel: Option<&Arc<SafetyKernel>>) -> anyhow::Result<String> {
    let begin = "*** Begin Patch";
    let end = "*** End Patch";

    let start = input.find(begin)
        .ok_or_else(|| anyhow::anyhow!("'*** Begin Patch' not found"))?;
    let finish = input.find(end)
        .ok_or_else(|| anyhow::anyhow!("'*** End Patch' not found"))?;

    if finish <= start {
        anyhow::bail!("'*** End Patch' appears before '*** Begin Patch'");
    }

    let body = &input[start + begin.len()..finish];
    let mut summary_lines: Vec<String> = Vec::new();

    // Parse file operations
    let mut remaining = body;

    while !remaining.trim().is_empty() {
        remaining = remaining.trim_start_matches('\n');

        if remaining.starts_with("*** Add File: ") {
            let (path, rest) = parse_file_header(remaining, "*** Add File: ")?;
            let (content, rest2) = collect_add_content(rest);
            let _guard = if let Some(k) = kernel {
                Some(guard_op(k, &path, "", &content).await?)
            } else {
                None
            };
            // Create parent dirs
            if let Some(parent) = std::path::Path::new(&path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            tokio::fs::write(&path, &content).await?;
            summary_lines.push(format!("A {path}"));
            remaining = rest2;
        } else if remaining.starts_with("*** Delete File: ") {
            let (path, rest) = parse_file_header(remaining, "*** Delete File: ")?;
            let old_content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            let _guard = if let Some(k) = kernel {
                Some(guard_op(k, &path, &old_content, "").await?)
            } else {
                None
            };
            if tokio::fs::metadata(&path).await.is_ok() {
                tokio::fs::remove_file(&path).await?;
            }
            summary_lines.push(format!("D {path}"));
            remaining = rest;
        } else if remaining.starts_with("*** Update File: ") {
            let (path, rest) = parse_file_header(remaining, "*** Update File: ")?;
            let (hunks, rest2) = collect_hunks(rest);
            let file_content = tokio::fs::read_to_string(&path).await
                .map_err(|e| anyhow::anyhow!("cannot read {path}: {e}"))?;
            let new_content = apply_hunks(&file_content, &hunks)
                .map_err(|e| anyhow::anyhow!("hunk failed for {path}: {e}"))?;
            let _guard = if let Some(k) = kernel {
                Some(guard_op(k, &path, &file_content, &new_content).await?)
            } else {
                None
            };
            tokio::fs::write(&path, &new_content).await?;
            summary_lines.push(format!("M {path}"));
            remaining = rest2;
        } else {
            // Skip unknown lines
            let next_newline = remaining.find('\n').unwrap_or(remaining.len());
            remaining = &remaining[next_newline..];
        }
    }

    if summary_lines.is_empty() {
        Ok("(no changes applied)".to_string())
    } else {
        Ok(summary_lines.join("\n"))
    }
}

fn parse_file_header<'a>(s: &'a str, prefix: &str) -> anyhow::Result<(String, &'a str)> {
    let after_prefix = s.strip_prefix(prefix)
        .ok_or_else(|| anyhow::anyhow!("expected '{prefix}'"))?;
    let newline = after_prefix.find('\n').unwrap_or(after_prefix.len());
    let path = after_prefix[..newline].trim().to_string();
    let rest = &after_prefix[newline..];
    Ok((path, rest))
}

fn collect_add_content(s: &str) -> (String, &str) {
    let mut lines: Vec<String> = Vec::new();
    let mut remaining = s;

    loop {
        remaining = remaining.strip_prefix('\n').unwrap_or(remaining);
        if remaining.starts_with("*** ") || remaining.is_empty() {
            break;
        }
        let newline = remaining.find('\n').unwrap_or(remaining.len());
        let line = &remaining[..newline];
        if let Some(content) = line.strip_prefix('+') {
            lines.push(content.to_string());
        } else {
            lines.push(line.to_string());
        }
        remaining = &remaining[newline..];
    }

    let content = lines.join("\n");
    let content = if content.ends_with('\n') { content } else { format!("{content}\n") };
    (content, remaining)
}

#[derive(Debug)]
struct Hunk {
    /// Free-text label from the `@@ label` header, e.g. an enclosing function
    /// name. Descriptive only — never matched against file content.
    section_header: Option<String>,
    /// Lines starting with '-' (to remove) and '+' (to add) and ' ' (context)
    changes: Vec<(char, String)>,
}

fn collect_hunks(s: &str) -> (Vec<Hunk>, &str) {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut remaining = s;

    loop {
        remaining = remaining.strip_prefix('\n').unwrap_or(remaining);
        if remaining.starts_with("*** ") || remaining.is_empty() {
            break;
        }

        if remaining.starts_with("@@ ") {
            // Start of a new hunk header
            let newline = remaining.find('\n').unwrap_or(remaining.len());
            let header = remaining[3..newline].trim().to_string();
            remaining = &remaining[newline..];

            let section_header = if header.is_empty() { None } else { Some(header) };
            let mut changes: Vec<(char, String)> = Vec::new();

            // Collect hunk lines
            loop {
                remaining = remaining.strip_prefix('\n').unwrap_or(remaining);
                if remaining.starts_with("@@ ") || remaining.starts_with("*** ") || remaining.is_empty() {
                    break;
                }
                let newline = remaining.find('\n').unwrap_or(remaining.len());
                let line = &remaining[..newline];
                if let Some(rest) = line.strip_prefix('+') {
                    changes.push(('+', rest.to_string()));
                } else if let Some(rest) = line.strip_prefix('-') {
                    changes.push(('-', rest.to_string()));
                } else if let Some(rest) = line.strip_prefix(' ') {
                    changes.push((' ', rest.to_string()));
                }
                remaining = &remaining[newline..];
            }

            hunks.push(Hunk { section_header, changes });
        } else {
            let newline = remaining.find('\n').unwrap_or(remaining.len());
            remaining = &remaining[newline..];
        }
    }

    (hunks, remaining)
}

fn apply_hunks(content: &str, hunks: &[Hunk]) -> anyhow::Result<String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let had_trailing_newline = content.ends_with('\n');

    for hunk in hunks {
        let expected: Vec<&str> = hunk.changes.iter()
            .filter(|(c, _)| *c == '-' || *c == ' ')
            .map(|(_, l)| l.as_str())
            .collect();

        let start_pos = find_hunk_position(&lines, &expected).map_err(|e| {
            match &hunk.section_header {
                Some(h) => anyhow::anyhow!("hunk near '{h}': {e}"),
                None => anyhow::anyhow!("{e}"),
            }
        })?;

        // Build replacement
        let mut new_section: Vec<String> = Vec::new();
        let mut i = start_pos;
        for (ch, line) in &hunk.changes {
            match ch {
                ' ' => {
                    // Context line – advance
                    i += 1;
                    new_section.push(line.clone());
                }
                '-' => {
                    // Remove line
                    i += 1;
                }
                '+' => {
                    // Add line
                    new_section.push(line.clone());
                }
                _ => {}
            }
        }

        let end_pos = i;
        lines.splice(start_pos..end_pos, new_section);
    }

    let mut result = lines.join("\n");
    if had_trailing_newline {
        result.push('\n');
    }
    Ok(result)
}

/// Locate `expected` (the hunk's context + deletion lines, in order) in
/// `lines`. The sequence must appear exactly once: zero matches is a
/// not-found error, more than one is an ambiguity error reporting the
/// count — never resolved by picking the first or nearest occurrence.
fn find_hunk_position(lines: &[String], expected: &[&str]) -> Result<usize, String> {
    if expected.is_empty() {
        return Err("hunk has no context or deletion lines to locate".to_string());
    }
    let n = expected.len();
    if lines.len() < n {
        return Err(format!(
            "File has {} lines but hunk needs {} context/deletion lines.",
            lines.len(),
            n
        ));
    }

    let exact: Vec<usize> = (0..=(lines.len() - n))
        .filter(|&i| lines[i..i + n].iter().map(String::as_str).eq(expected.iter().copied()))
        .collect();

    match exact.len() {
        0 => Err("context not found: the hunk's lines do not appear in the file".to_string()),
        1 => Ok(exact[0]),
        count => Err(format!(
            "context matches {count} locations in the file; ambiguous. \
             Add more surrounding context to identify a unique match."
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::{Tool, ToolCall};

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "ap1".into(), name: "apply_patch".into(), args }
    }

    fn tmp_path(suffix: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        format!("/tmp/shelly_patch_test_{}_{n}{suffix}", std::process::id())
    }

    #[tokio::test]
    async fn add_new_file() {
        let path = tmp_path(".txt");
        let patch = format!(
            "*** Begin Patch\n*** Add File: {path}\n+hello\n+world\n*** End Patch\n"
        );
        let t = ApplyPatchTool::default();
        let out = t.execute(&call(json!({"input": patch}))).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains(&format!("A {path}")));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("hello"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn delete_file() {
        let path = tmp_path("_del.txt");
        std::fs::write(&path, "bye").unwrap();
        let patch = format!(
            "*** Begin Patch\n*** Delete File: {path}\n*** End Patch\n"
        );
        let t = ApplyPatchTool::default();
        let out = t.execute(&call(json!({"input": patch}))).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains(&format!("D {path}")));
        assert!(!std::path::Path::new(&path).exists());
    }

    #[tokio::test]
    async fn update_file_with_hunk() {
        let path = tmp_path("_upd.txt");
        std::fs::write(&path, "line1\nline2\nline3\n").unwrap();
        let patch = format!(
            "*** Begin Patch\n*** Update File: {path}\n@@ line1\n line1\n-line2\n+line2_updated\n line3\n*** End Patch\n"
        );
        let t = ApplyPatchTool::default();
        let out = t.execute(&call(json!({"input": patch}))).await;
        assert!(!out.is_error, "{}", out.content);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("line2_updated"));
        assert!(!content.contains("\nline2\n"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn update_file_ambiguous_context_fails_with_count() {
        let path = tmp_path("_dup.txt");
        std::fs::write(&path, "fn f() {\n    x = 1;\n}\n\nfn f() {\n    x = 1;\n}\n").unwrap();
        let patch = format!(
            "*** Begin Patch\n*** Update File: {path}\n@@ fn f\n fn f() {{\n-    x = 1;\n+    x = 2;\n }}\n*** End Patch\n"
        );
        let t = ApplyPatchTool::default();
        let out = t.execute(&call(json!({"input": patch}))).await;
        assert!(out.is_error, "ambiguous context must be rejected");
        assert!(
            out.content.contains("2 locations"),
            "error should report the match count: {}",
            out.content
        );
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "fn f() {\n    x = 1;\n}\n\nfn f() {\n    x = 1;\n}\n",
            "file must be unchanged on ambiguity"
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn update_file_context_not_found_is_error() {
        let path = tmp_path("_nf.txt");
        std::fs::write(&path, "line1\nline2\nline3\n").unwrap();
        let patch = format!(
            "*** Begin Patch\n*** Update File: {path}\n@@ missing\n-does_not_exist\n+x\n*** End Patch\n"
        );
        let t = ApplyPatchTool::default();
        let out = t.execute(&call(json!({"input": patch}))).await;
        assert!(out.is_error);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line1\nline2\nline3\n");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_input_is_error() {
        let t = ApplyPatchTool::default();
        let out = t.execute(&call(json!({}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing 'input'"));
    }

    #[tokio::test]
    async fn missing_begin_marker_is_error() {
        let t = ApplyPatchTool::default();
        let out = t.execute(&call(json!({"input": "no markers here"}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("not found"));
    }

    #[tokio::test]
    async fn guarded_add_prompts_for_directory_once_per_new_file() {
        use crate::ask::AutoApprove;
        use crate::permission::PermissionStore;
        use crate::safety::SafetyKernel;

        let dir = std::env::temp_dir().join(format!("shelly_guarded_patch_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = std::sync::Arc::new(PermissionStore::load(dir.join("permissions.json")).unwrap());
        let kernel = SafetyKernel::new(store.clone(), std::sync::Arc::new(AutoApprove), std::sync::Arc::new(crate::ask::NullNotify));

        let file = dir.join("new.txt");
        let patch = format!(
            "*** Begin Patch\n*** Add File: {}\n+hello\n*** End Patch\n",
            file.to_string_lossy()
        );
        let t = ApplyPatchTool::guarded(kernel);
        let out = t.execute(&call(json!({"input": patch}))).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(store.is_dir_approved(&dir));
        assert!(file.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn guarded_update_denied_directory_does_not_touch_disk() {
        use crate::ask::AutoDeny;
        use crate::permission::PermissionStore;
        use crate::safety::SafetyKernel;

        let dir = std::env::temp_dir().join(format!("shelly_guarded_patch_deny_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("existing.txt");
        std::fs::write(&file, "line1\nline2\nline3\n").unwrap();

        let store = std::sync::Arc::new(PermissionStore::load(dir.join("permissions.json")).unwrap());
        let kernel = SafetyKernel::new(store, std::sync::Arc::new(AutoDeny), std::sync::Arc::new(crate::ask::NullNotify));

        let patch = format!(
            "*** Begin Patch\n*** Update File: {}\n@@ line1\n line1\n-line2\n+line2_updated\n line3\n*** End Patch\n",
            file.to_string_lossy()
        );
        let t = ApplyPatchTool::guarded(kernel);
        let out = t.execute(&call(json!({"input": patch}))).await;
        assert!(out.is_error);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "line1\nline2\nline3\n");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
