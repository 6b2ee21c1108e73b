use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::client::ToolSpec;
use crate::store::{AskKind, SayKind};
use crate::task::TaskContext;
use crate::tools::{self, ToolResponse};

const RECURSIVE_LIMIT: usize = 1000;

/// Directories whose contents are build output or dependency trees; listing
/// them drowns the useful structure.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    "env",
    "venv",
    "target",
    "dist",
    "out",
    "bundle",
    "vendor",
    "tmp",
    "temp",
    "deps",
    "pkg",
];

pub fn top_level_definition() -> ToolSpec {
    ToolSpec {
        name: "list_files_top_level".into(),
        description: "List all files and directories at the top level of the specified \
                      directory. This should only be used for generic directories you don't \
                      necessarily need the nested structure of, like the Desktop."
            .into(),
        input_schema: path_schema("The path of the directory to list contents for (relative to the current working directory)."),
    }
}

pub fn recursive_definition() -> ToolSpec {
    ToolSpec {
        name: "list_files_recursive".into(),
        description: "Recursively list all files and directories within the specified directory. \
                      This provides a comprehensive view of the project structure, and can help \
                      you understand the organization of the codebase."
            .into(),
        input_schema: path_schema("The path of the directory to recursively list contents for (relative to the current working directory)."),
    }
}

fn path_schema(description: &str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "description": description }
        },
        "required": ["path"]
    })
}

pub async fn execute_top_level(ctx: &TaskContext, input: &serde_json::Value) -> ToolResponse {
    list(ctx, input, "list_files_top_level", "listFilesTopLevel", false).await
}

pub async fn execute_recursive(ctx: &TaskContext, input: &serde_json::Value) -> ToolResponse {
    list(ctx, input, "list_files_recursive", "listFilesRecursive", true).await
}

async fn list(
    ctx: &TaskContext,
    input: &serde_json::Value,
    tool_name: &str,
    payload_name: &str,
    recursive: bool,
) -> ToolResponse {
    let Some(rel_path) = tools::required_str(input, "path") else {
        return tools::missing_param(ctx, tool_name, "path");
    };
    let root = ctx.cwd.join(rel_path);

    let entries = if recursive { walk(&root, RECURSIVE_LIMIT) } else { read_level(&root) };
    let entries = match entries {
        Ok(entries) => entries,
        Err(e) => return ToolResponse::text(format!("Error listing files: {e}")),
    };
    let mut result = format_files_list(&root, &entries);
    if recursive && entries.len() >= RECURSIVE_LIMIT {
        result.push_str(
            "\n(File list truncated. Use this tool on specific subdirectories if you need to \
             explore further.)",
        );
    }

    let payload = json!({ "tool": payload_name, "path": rel_path, "content": result });
    if ctx.allows_read_only() {
        let _ = ctx.gate.say(SayKind::Tool, Some(payload.to_string()), None);
        return ToolResponse::text(result);
    }
    match ctx.gate.ask(AskKind::Tool, Some(payload.to_string())).await {
        Ok(outcome) if outcome.approved() => ToolResponse::text(result),
        Ok(outcome) => tools::deny_response(ctx, outcome),
        Err(_) => ToolResponse::text(tools::TOOL_DENIED),
    }
}

fn read_level(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    Ok(std::fs::read_dir(root)?.flatten().map(|e| e.path()).collect())
}

/// Breadth-first so shallow structure survives the cap on deep trees. Hidden
/// entries and dependency directories are skipped entirely.
fn walk(root: &Path, limit: usize) -> std::io::Result<Vec<PathBuf>> {
    let mut results = Vec::new();
    let mut queue = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            if results.len() >= limit {
                return Ok(results);
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if path.is_dir() {
                results.push(path.clone());
                if !IGNORED_DIRS.contains(&name.as_str()) {
                    queue.push_back(path);
                }
            } else {
                results.push(path);
            }
        }
    }
    Ok(results)
}

/// Sorted relative paths, one per line, directories marked with a trailing
/// slash.
fn format_files_list(root: &Path, entries: &[PathBuf]) -> String {
    let mut lines: Vec<String> = entries
        .iter()
        .map(|path| {
            let rel = path.strip_prefix(root).unwrap_or(path);
            let mut line = rel.to_string_lossy().to_string();
            if path.is_dir() {
                line.push('/');
            }
            line
        })
        .collect();
    lines.sort();
    if lines.is_empty() {
        "(Nothing found. Make sure the directory path is correct.)".to_string()
    } else {
        lines.join("\n")
    }
}
