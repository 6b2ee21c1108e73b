use serde_json::json;

use crate::client::ToolSpec;
use crate::store::{AskKind, SayKind};
use crate::task::TaskContext;
use crate::tools::{self, ToolResponse};

pub fn definition() -> ToolSpec {
    ToolSpec {
        name: "attempt_completion".into(),
        description: "Once you've completed the task, use this tool to present the result to the \
                      user. They may respond with feedback if they are not satisfied with the \
                      result, which you can use to make improvements and try again. Optionally \
                      you may provide a CLI command to showcase the result of your work, but \
                      avoid commands that merely print text the user has already seen."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "The result of the task. Formulate this result in a way that is final and does not require further input from the user. Don't end your result with questions or offers for further assistance."
                },
                "command": {
                    "type": "string",
                    "description": "The CLI command to execute to show a live demo of the result to the user. For example, use 'open localhost:3000' to display a locally running development server. This should be valid for the current operating system."
                }
            },
            "required": ["result"]
        }),
    }
}

/// Present the result and wait for a verdict. An empty response text is the
/// termination signal the agent loop watches for; anything else is feedback
/// that sends the loop around again.
pub async fn execute(ctx: &TaskContext, input: &serde_json::Value) -> ToolResponse {
    let Some(result) = tools::required_str(input, "result") else {
        return tools::missing_param(ctx, "attempt_completion", "result");
    };
    let command = input.get("command").and_then(serde_json::Value::as_str);

    let mut ask_text = result.to_string();
    if let Some(cmd) = command.filter(|c| !c.is_empty()) {
        // Show the result first, then run the demo command; its output stream
        // is suppressed but a failure aborts the completion attempt.
        let _ = ctx.gate.say(SayKind::CompletionResult, Some(ask_text), None);
        let command_response = tools::run_command(ctx, cmd, true).await;
        if !command_response.text.is_empty() {
            return command_response;
        }
        // Completion text already shown; the verdict ask carries no repeat.
        ask_text = String::new();
    }

    match ctx.gate.ask(AskKind::CompletionResult, Some(ask_text)).await {
        // An aborted or superseded ask is not acceptance; a denial-shaped
        // result keeps the loop from fabricating a satisfied verdict.
        Err(_) => ToolResponse::text(tools::TOOL_DENIED),
        Ok(outcome) => match outcome.text.filter(|t| !t.is_empty()) {
            None => ToolResponse::text(""),
            Some(feedback) => {
                let _ = ctx.gate.say(
                    SayKind::UserFeedback,
                    Some(feedback.clone()),
                    outcome.images.clone(),
                );
                ToolResponse::with_images(
                    format!(
                        "The user is not pleased with the results. Use the feedback they provided \
                         to successfully complete the task, and then attempt completion again.\n\
                         <feedback>\n{feedback}\n</feedback>"
                    ),
                    outcome.images,
                )
            }
        },
    }
}
