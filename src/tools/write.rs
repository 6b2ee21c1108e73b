use std::path::Path;

use serde_json::json;
use similar::TextDiff;

use crate::client::ToolSpec;
use crate::store::AskKind;
use crate::task::TaskContext;
use crate::tools::{self, ToolResponse};

pub fn definition() -> ToolSpec {
    ToolSpec {
        name: "write_to_file".into(),
        description: "Write content to a file at the specified path. If the file exists, it will \
                      be overwritten with the provided content. If the file doesn't exist, it \
                      will be created. Always provide the full intended content of the file, \
                      without any truncation. This tool will automatically create any directories \
                      needed to write the file."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The path of the file to write to (relative to the current working directory)."
                },
                "content": {
                    "type": "string",
                    "description": "The full content to write to the file."
                }
            },
            "required": ["path", "content"]
        }),
    }
}

/// Overwrites show the user a diff against the current content; new files show
/// the content itself. Nothing touches disk until the ask is approved.
pub async fn execute(ctx: &TaskContext, input: &serde_json::Value) -> ToolResponse {
    let Some(rel_path) = tools::required_str(input, "path") else {
        return tools::missing_param(ctx, "write_to_file", "path");
    };
    let Some(content) = input.get("content").and_then(serde_json::Value::as_str) else {
        return tools::missing_param(ctx, "write_to_file", "content");
    };
    let abs_path = ctx.cwd.join(rel_path);

    let original = match std::fs::read_to_string(&abs_path) {
        Ok(existing) => Some(existing),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return ToolResponse::text(format!("Error writing file: {e}")),
    };

    // Keep the original's trailing newline when the replacement omits it.
    let content = if original.as_deref().is_some_and(|o| o.ends_with('\n'))
        && !content.ends_with('\n')
    {
        format!("{content}\n")
    } else {
        content.to_string()
    };
    let content = content.as_str();

    let payload = match &original {
        Some(existing) => {
            let diff = unified_diff(rel_path, existing, content);
            json!({ "tool": "editedExistingFile", "path": rel_path, "diff": diff })
        }
        None => json!({ "tool": "newFileCreated", "path": rel_path, "content": content }),
    };

    match ctx.gate.ask(AskKind::Tool, Some(payload.to_string())).await {
        Ok(outcome) if outcome.approved() => {}
        Ok(outcome) => return tools::deny_response(ctx, outcome),
        Err(_) => return ToolResponse::text(tools::TOOL_DENIED),
    }

    if let Err(e) = save(&abs_path, content) {
        return ToolResponse::text(format!("Error writing file: {e}"));
    }

    match original {
        Some(existing) => ToolResponse::text(format!(
            "Changes applied to {rel_path}:\n{}",
            unified_diff(rel_path, &existing, content)
        )),
        None => ToolResponse::text(format!("New file created and content written to {rel_path}")),
    }
}

fn save(abs_path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = abs_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // tmp + rename keeps a crash mid-write from truncating the target
    let tmp = abs_path.with_extension("pilot.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, abs_path)
}

fn unified_diff(rel_path: &str, before: &str, after: &str) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{rel_path}"), &format!("b/{rel_path}"))
        .to_string()
}
