use serde_json::json;

use crate::client::ToolSpec;
use crate::store::{AskKind, SayKind};
use crate::task::TaskContext;
use crate::tools::{self, ToolResponse};

pub fn definition() -> ToolSpec {
    ToolSpec {
        name: "ask_followup_question".into(),
        description: "Ask the user a question to gather additional information needed to \
                      complete the task. This tool should be used when you encounter ambiguities, \
                      need clarification, or require more details to proceed effectively. It \
                      allows for interactive problem-solving by enabling direct communication \
                      with the user. Use this tool judiciously to maintain a balance between \
                      gathering necessary information and avoiding excessive back-and-forth."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask the user. This should be a clear, specific question that addresses the information you need."
                }
            },
            "required": ["question"]
        }),
    }
}

pub async fn execute(ctx: &TaskContext, input: &serde_json::Value) -> ToolResponse {
    let Some(question) = tools::required_str(input, "question") else {
        return tools::missing_param(ctx, "ask_followup_question", "question");
    };

    match ctx.gate.ask(AskKind::Followup, Some(question.to_string())).await {
        Ok(outcome) => {
            let answer = outcome.text.unwrap_or_default();
            let _ = ctx.gate.say(
                SayKind::UserFeedback,
                Some(answer.clone()),
                outcome.images.clone(),
            );
            ToolResponse::with_images(format!("<answer>\n{answer}\n</answer>"), outcome.images)
        }
        Err(_) => ToolResponse::text(tools::TOOL_DENIED),
    }
}
