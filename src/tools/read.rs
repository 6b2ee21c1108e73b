use serde_json::json;

use crate::client::ToolSpec;
use crate::store::{AskKind, SayKind};
use crate::task::TaskContext;
use crate::tools::{self, ToolResponse};

pub fn definition() -> ToolSpec {
    ToolSpec {
        name: "read_file".into(),
        description: "Read the contents of a file at the specified path. Use this when you need \
                      to examine the contents of an existing file, for example to analyze code, \
                      review text files, or extract information from configuration files. Note \
                      that this tool returns the raw content as a string, which may not be \
                      suitable for binary files."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The path of the file to read (relative to the current working directory)."
                }
            },
            "required": ["path"]
        }),
    }
}

/// Reads first, asks second: the approval prompt shows the user exactly what
/// the model is about to receive.
pub async fn execute(ctx: &TaskContext, input: &serde_json::Value) -> ToolResponse {
    let Some(rel_path) = tools::required_str(input, "path") else {
        return tools::missing_param(ctx, "read_file", "path");
    };
    let abs_path = ctx.cwd.join(rel_path);

    let content = match std::fs::read_to_string(&abs_path) {
        Ok(content) => content,
        Err(e) => return ToolResponse::text(format!("Error reading file: {e}")),
    };

    let payload = json!({ "tool": "readFile", "path": rel_path, "content": content });
    if ctx.allows_read_only() {
        let _ = ctx.gate.say(SayKind::Tool, Some(payload.to_string()), None);
        return ToolResponse::text(content);
    }
    match ctx.gate.ask(AskKind::Tool, Some(payload.to_string())).await {
        Ok(outcome) if outcome.approved() => ToolResponse::text(content),
        Ok(outcome) => tools::deny_response(ctx, outcome),
        Err(_) => ToolResponse::text(tools::TOOL_DENIED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn approved_read_returns_file_content() {
        let ctx = TaskContext::for_tests();
        std::fs::write(ctx.cwd.join("notes.txt"), "remember the milk").unwrap();
        let out = execute(&ctx, &json!({ "path": "notes.txt" })).await;
        assert_eq!(out.text, "remember the milk");
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_error_not_a_crash() {
        let ctx = TaskContext::for_tests();
        let out = execute(&ctx, &json!({ "path": "nope.txt" })).await;
        assert!(out.text.starts_with("Error reading file:"));
    }

    #[tokio::test]
    async fn read_only_policy_notifies_instead_of_asking() {
        let ctx = TaskContext::for_tests_read_only();
        std::fs::write(ctx.cwd.join("notes.txt"), "remember the milk").unwrap();
        // the gate is manual; a raised ask would block here
        let out = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            execute(&ctx, &json!({ "path": "notes.txt" })),
        )
        .await
        .expect("read must not wait on an approval prompt");
        assert_eq!(out.text, "remember the milk");

        let ui = ctx.store.ui_messages();
        assert!(ui.iter().any(|m| m.is_say(SayKind::Tool)));
        assert!(ui.iter().all(|m| m.ask.is_none()));
    }

    #[tokio::test]
    async fn missing_path_parameter_is_retryable() {
        let ctx = TaskContext::for_tests();
        let out = execute(&ctx, &json!({})).await;
        assert!(out.text.contains("Missing value for required parameter 'path'"));
    }
}
