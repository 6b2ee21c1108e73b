/// Top-level source definition scanning.
///
/// Line-oriented heuristics per language rather than a real parser; the goal
/// is a cheap structural overview (what lives where), not semantic accuracy.
use std::path::Path;

use serde_json::json;

use crate::client::ToolSpec;
use crate::store::{AskKind, SayKind};
use crate::task::TaskContext;
use crate::tools::{self, ToolResponse};

pub fn definition() -> ToolSpec {
    ToolSpec {
        name: "view_source_code_definitions_top_level".into(),
        description: "Parse all source code files at the top level of the specified directory to \
                      extract names of key elements like classes and functions. This tool \
                      provides quick insights into a codebase's high-level concepts and \
                      structure, which can be crucial for understanding the overall architecture."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The path of the directory to parse top level source code files for (relative to the current working directory)."
                }
            },
            "required": ["path"]
        }),
    }
}

pub async fn execute(ctx: &TaskContext, input: &serde_json::Value) -> ToolResponse {
    let Some(rel_path) = tools::required_str(input, "path") else {
        return tools::missing_param(ctx, "view_source_code_definitions_top_level", "path");
    };
    let root = ctx.cwd.join(rel_path);

    let result = match scan_directory(&root) {
        Ok(result) => result,
        Err(e) => return ToolResponse::text(format!("Error parsing source code definitions: {e}")),
    };

    let payload = json!({
        "tool": "viewSourceCodeDefinitionsTopLevel",
        "path": rel_path,
        "content": result
    });
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

fn scan_directory(root: &Path) -> std::io::Result<String> {
    let mut files: Vec<_> = std::fs::read_dir(root)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut sections = Vec::new();
    for path in files {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else { continue };
        let Some(matchers) = matchers_for(ext) else { continue };
        let Ok(source) = std::fs::read_to_string(&path) else { continue };
        let defs = extract_definitions(&source, matchers);
        if defs.is_empty() {
            continue;
        }
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        sections.push(format!("# {name}\n{}", defs.join("\n")));
    }

    if sections.is_empty() {
        Ok("No source code definitions found.".to_string())
    } else {
        Ok(sections.join("\n\n"))
    }
}

/// Keyword prefixes that open a definition at file scope in each language.
fn matchers_for(ext: &str) -> Option<&'static [&'static str]> {
    let matchers: &'static [&'static str] = match ext {
        "rs" => &[
            "fn ", "pub fn ", "pub(crate) fn ", "async fn ", "pub async fn ", "struct ",
            "pub struct ", "enum ", "pub enum ", "trait ", "pub trait ", "impl ", "mod ",
            "pub mod ",
        ],
        "py" => &["def ", "async def ", "class "],
        "js" | "jsx" | "ts" | "tsx" => &[
            "function ",
            "async function ",
            "export function ",
            "export async function ",
            "export default function ",
            "class ",
            "export class ",
            "export default class ",
            "export const ",
            "export interface ",
            "export type ",
            "interface ",
        ],
        "go" => &["func ", "type "],
        "java" | "cs" => &["public class ", "class ", "public interface ", "interface ", "enum "],
        "c" | "h" | "cpp" | "hpp" | "cc" => &["struct ", "typedef ", "class ", "enum "],
        "rb" => &["def ", "class ", "module "],
        _ => return None,
    };
    Some(matchers)
}

/// Lines starting (unindented) with a definition keyword, trimmed of the
/// trailing body opener.
fn extract_definitions(source: &str, matchers: &[&str]) -> Vec<String> {
    source
        .lines()
        .filter(|line| {
            !line.starts_with(char::is_whitespace)
                && matchers.iter().any(|m| line.starts_with(m))
        })
        .map(|line| line.trim_end_matches(['{', ':', ' ']).to_string())
        .collect()
}
