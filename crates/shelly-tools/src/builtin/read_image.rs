// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput, ToolOutputPart};

pub struct ReadImageTool;

#[async_trait]
impl Tool for ReadImageTool {
    fn name(&self) -> &str {
        "read_image"
    }

    fn description(&self) -> &str {
        "Read an image and return it as a base64 data URL for visual analysis.\n\
         Supports: PNG, JPEG, GIF, WebP, BMP, TIFF. Auto-resized to max 2048×2048.\n\
         Note: read_file also handles images — use read_image when you want explicit control."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the image file"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path_str = match call.args.get("path").and_then(|v| v.as_str()) {
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

        debug!(path = %path_str, "read_image tool");

        // Validate extension before doing any I/O.
        let path = std::path::Path::new(&path_str);
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !shelly_image::is_image_extension(ext) {
            return ToolOutput::err(
                &call.id,
                format!(
                    "file does not appear to be an image (extension: .{ext}). \
                     Supported formats: png, jpg, jpeg, gif, webp, bmp, tiff."
                ),
            );
        }

        match shelly_image::load_image(path) {
            Ok(img) => {
                let data_url = img.into_data_url();
                ToolOutput::with_parts(
                    &call.id,
                    vec![
                        ToolOutputPart::Text(format!("Image loaded: {path_str}")),
                        ToolOutputPart::Image(data_url),
                    ],
                )
            }
            Err(e) => ToolOutput::err(&call.id, format!("failed to read image: {e}")),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
