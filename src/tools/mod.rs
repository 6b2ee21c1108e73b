/// The fixed tool catalog and its dispatcher.
///
/// Every tool follows the same contract: pull its parameters out of the
/// model-supplied JSON, raise an approval ask where the operation has side
/// effects, and always come back with a `ToolResponse` for the model. Tool
/// failures are conversation content, not process errors. The sole exception
/// to "non-empty text" is attempt_completion, whose empty response is the
/// loop's termination signal.
use std::path::Path;

use serde_json::{Value, json};

use crate::client::ToolSpec;
use crate::command::{self, CommandResult};
use crate::store::{AskKind, SayKind};
use crate::task::TaskContext;

pub mod complete;
pub mod defs;
pub mod followup;
pub mod list;
pub mod read;
pub mod write;

pub const TOOL_DENIED: &str = "The user denied this operation.";

#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub text: String,
    pub images: Option<Vec<String>>,
}

impl ToolResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), images: None }
    }

    pub fn with_images(text: impl Into<String>, images: Option<Vec<String>>) -> Self {
        Self { text: text.into(), images }
    }
}

// ── Dispatch ───────────────────────────────────────────────────────────────────

pub async fn execute(ctx: &TaskContext, name: &str, input: &Value) -> ToolResponse {
    match name {
        "execute_command" => execute_command(ctx, input).await,
        "read_file" => read::execute(ctx, input).await,
        "write_to_file" => write::execute(ctx, input).await,
        "list_files_top_level" => list::execute_top_level(ctx, input).await,
        "list_files_recursive" => list::execute_recursive(ctx, input).await,
        "view_source_code_definitions_top_level" => defs::execute(ctx, input).await,
        "ask_followup_question" => followup::execute(ctx, input).await,
        "attempt_completion" => complete::execute(ctx, input).await,
        other => ToolResponse::text(format!("Unknown tool: {other}")),
    }
}

pub fn definitions(cwd: &Path) -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "execute_command".into(),
            description: format!(
                "Execute a CLI command on the system. Use this when you need to perform system \
                 operations or run specific commands to accomplish any step in the user's task. \
                 You must tailor your command to the user's system and provide a clear explanation \
                 of what the command does. Prefer to execute complex CLI commands over creating \
                 executable scripts, as they are more flexible and easier to run. Commands will be \
                 executed in the current working directory: {}",
                cwd.display()
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The CLI command to execute. This should be valid for the current operating system. Ensure the command is properly formatted and does not contain any harmful instructions."
                    }
                },
                "required": ["command"]
            }),
        },
        read::definition(),
        write::definition(),
        list::top_level_definition(),
        list::recursive_definition(),
        defs::definition(),
        followup::definition(),
        complete::definition(),
    ]
}

// ── execute_command handler ────────────────────────────────────────────────────

async fn execute_command(ctx: &TaskContext, input: &Value) -> ToolResponse {
    let Some(cmd) = required_str(input, "command") else {
        return missing_param(ctx, "execute_command", "command");
    };
    run_command(ctx, cmd, false).await
}

/// Shared by the execute_command tool and attempt_completion's optional
/// showcase command (which suppresses successful output).
pub async fn run_command(ctx: &TaskContext, cmd: &str, suppress_output: bool) -> ToolResponse {
    match ctx.gate.ask(AskKind::Command, Some(cmd.to_string())).await {
        Ok(outcome) if outcome.approved() => {}
        Ok(outcome) => {
            if let Some(text) = outcome.text.filter(|t| !t.is_empty()) {
                let _ = ctx.gate.say(
                    SayKind::UserFeedback,
                    Some(text.clone()),
                    outcome.images.clone(),
                );
                return ToolResponse::with_images(
                    generic_denied_feedback(&text, &ctx.cwd),
                    outcome.images,
                );
            }
            return ToolResponse::text(TOOL_DENIED);
        }
        Err(_) => return ToolResponse::text(TOOL_DENIED),
    }

    match command::run(ctx.gate.clone(), &ctx.registry, &ctx.cwd, cmd, suppress_output).await {
        CommandResult::Success(text) => ToolResponse::text(text),
        CommandResult::Failure(text) => ToolResponse::text(text),
    }
}

// ── Shared helpers ─────────────────────────────────────────────────────────────

pub fn required_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// The model omitted a required parameter. Tell the user, then hand the model
/// a retryable error as the tool result.
pub fn missing_param(ctx: &TaskContext, tool: &str, param: &str) -> ToolResponse {
    let _ = ctx.gate.say(
        SayKind::Error,
        Some(format!(
            "The model tried to use {tool} without value for required parameter '{param}'. \
             Retrying..."
        )),
        None,
    );
    ToolResponse::text(format!(
        "Error: Missing value for required parameter '{param}'. Please retry with complete \
         response."
    ))
}

/// Turn a non-approved ask outcome into the model-facing tool result. Typed
/// feedback is echoed to the UI log and wrapped for the model; a plain "no"
/// becomes the bare denial string.
pub fn deny_response(ctx: &TaskContext, outcome: crate::gate::AskOutcome) -> ToolResponse {
    match outcome.text.filter(|t| !t.is_empty()) {
        Some(text) => {
            let _ = ctx.gate.say(
                SayKind::UserFeedback,
                Some(text.clone()),
                outcome.images.clone(),
            );
            ToolResponse::with_images(denied_feedback(&text), outcome.images)
        }
        None => ToolResponse::text(TOOL_DENIED),
    }
}

pub fn denied_feedback(feedback: &str) -> String {
    format!(
        "The user denied this operation and provided the following feedback:\n<feedback>\n\
         {feedback}\n</feedback>"
    )
}

/// Denial feedback for operations with no file anchor; appends workspace
/// context so the model can reorient.
pub fn generic_denied_feedback(feedback: &str, cwd: &Path) -> String {
    format!("{}\n\n{}", denied_feedback(feedback), environment_details(cwd))
}

/// Workspace context attached to free-form user feedback. The original task
/// text gets the same treatment when a task starts or resumes.
pub fn environment_details(cwd: &Path) -> String {
    let listing = match std::fs::read_dir(cwd) {
        Ok(entries) => {
            let mut names: Vec<String> = entries
                .flatten()
                .map(|e| {
                    let mut name = e.file_name().to_string_lossy().to_string();
                    if e.path().is_dir() {
                        name.push('/');
                    }
                    name
                })
                .collect();
            names.sort();
            if names.is_empty() { "(empty)".to_string() } else { names.join(", ") }
        }
        Err(_) => "(inaccessible)".to_string(),
    };
    format!(
        "<potentially_relevant_details>\n# Current Working Directory: {}\n# Top-Level Contents: \
         {listing}\n</potentially_relevant_details>",
        cwd.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_complete_and_ordered() {
        let specs = definitions(Path::new("/tmp"));
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "execute_command",
                "read_file",
                "write_to_file",
                "list_files_top_level",
                "list_files_recursive",
                "view_source_code_definitions_top_level",
                "ask_followup_question",
                "attempt_completion",
            ]
        );
        for spec in &specs {
            assert_eq!(spec.input_schema["type"], "object");
        }
    }

    #[test]
    fn denial_feedback_wraps_text() {
        let out = denied_feedback("use pnpm instead");
        assert!(out.starts_with("The user denied this operation"));
        assert!(out.contains("<feedback>\nuse pnpm instead\n</feedback>"));
    }

    #[tokio::test]
    async fn unknown_tool_reports_its_name() {
        let ctx = TaskContext::for_tests();
        let out = execute(&ctx, "browse_web", &json!({})).await;
        assert_eq!(out.text, "Unknown tool: browse_web");
    }
}
