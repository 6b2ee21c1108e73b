/// The agent loop: send the conversation to the model, surface its text,
/// execute its tool calls, and feed the results back until the user accepts a
/// completion or a terminal condition ends the task.
///
/// Written as an explicit loop with a `StepOutcome` accumulator; each `step`
/// is one request/response round.
use anyhow::Result;
use serde_json::{Value, json};

use crate::client::{
    ContentBlock, ImageSource, ModelClient, ModelResponse, Turn, user_readable_request,
};
use crate::store::{AskKind, SayKind};
use crate::task::TaskContext;
use crate::tools::{self, ToolResponse};
use crate::trim;

/// Output token reserve carved out of the context window before trimming.
const MAX_OUTPUT_RESERVE: usize = 8192;

pub const COMPLETION_ACCEPTED: &str = "The user is satisfied with the result.";

const COMPLETION_ACK: &str =
    "I am pleased you are satisfied with the result. Do you have a new task for me?";

const REQUEST_LIMIT_FAILURE: &str =
    "Failure: I have reached the request limit for this task. Do you have a new task for me?";

const NO_RESPONSE_FAILURE: &str = "Failure: I did not have a response to provide.";

pub const NUDGE: &str = "If you have completed the user's task, use the attempt_completion tool. \
If you require additional information from the user, use the ask_followup_question tool. \
Otherwise, if you have not completed the task and do not need additional information, then \
proceed with the next step of the task. (This is an automated message, so do not respond to it \
conversationally.)";

// ── System prompt ──────────────────────────────────────────────────────────────

pub fn system_prompt(ctx: &TaskContext) -> String {
    let mut prompt = format!(
        "You are Pilot, a highly skilled software developer with extensive knowledge in many \
programming languages, frameworks, design patterns, and best practices. You accomplish tasks \
for the user using the tools available to you.

====

CAPABILITIES

- You can execute CLI commands, read and write files, list directory contents, and inspect the \
top-level source code definitions of a directory. These tools let you explore an existing \
project, make targeted changes, and verify your work.
- You do not have the ability to browse the web or install software outside of CLI commands.

====

RULES

- Your current working directory is: {cwd}. All file paths you provide must be relative to this \
directory, and all commands run from it. You cannot cd elsewhere; compose commands accordingly.
- Before editing a file you have not seen in this conversation, read it first so your write \
contains the complete intended content. write_to_file overwrites the whole file; never truncate \
or elide content with placeholders.
- When executing commands, explain what the command does. Prefer non-interactive flags; the user \
can send input to a running command's stdin, but do not rely on it.
- Do not ask for more information than necessary. When you need clarification you cannot infer, \
use ask_followup_question; otherwise use your tools to find the answer yourself.
- Your goal is to accomplish the task, not to hold a conversation. Do not end responses with \
open questions or offers of further help.
- Once the task is done, present the outcome with attempt_completion. Its result must be final; \
the user may respond with feedback you can use to make improvements and try again.

====

OBJECTIVE

Accomplish the given task iteratively: break it down into clear steps, work through them one at \
a time using at most one tool per message, and let each tool result inform the next step. When \
the task is complete, use attempt_completion to present the result.

====

SYSTEM INFORMATION

Operating System: {os}
Default Shell: sh
Current Working Directory: {cwd}",
        cwd = ctx.cwd.display(),
        os = std::env::consts::OS,
    );

    if let Some(custom) = ctx.custom_instructions.as_deref().filter(|c| !c.trim().is_empty()) {
        prompt.push_str(&format!(
            "\n\n====\n\nUSER'S CUSTOM INSTRUCTIONS\n\nThe following additional instructions are \
             provided by the user. They should be followed and given precedence in case of \
             conflicts with previous instructions, but in a way that does not interfere with the \
             TOOL USE guidelines.\n\n{custom}"
        ));
    }
    prompt
}

// ── The loop ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum StepOutcome {
    /// The task reached a terminal turn (completion accepted, limit denied,
    /// or an unrecoverable request failure).
    Terminated,
    /// Content for the next request (tool results, or a nudge).
    Continue(Vec<ContentBlock>),
}

/// Drive steps until the task terminates.
pub async fn run(
    ctx: &TaskContext,
    client: &dyn ModelClient,
    initial: Vec<ContentBlock>,
) -> Result<()> {
    let mut user_content = initial;
    loop {
        match step(ctx, client, user_content).await? {
            StepOutcome::Terminated => return Ok(()),
            StepOutcome::Continue(next) => user_content = next,
        }
    }
}

/// One request/response round.
pub async fn step(
    ctx: &TaskContext,
    client: &dyn ModelClient,
    user_content: Vec<ContentBlock>,
) -> Result<StepOutcome> {
    ctx.check_aborted()?;

    ctx.store.push_turn(Turn::user(user_content.clone()));

    if ctx.request_count() >= ctx.max_requests {
        let outcome = ctx
            .gate
            .ask(
                AskKind::RequestLimitReached,
                Some(format!(
                    "Pilot has reached the maximum number of requests for this task ({}). Would \
                     you like to reset the count and allow it to proceed?",
                    ctx.max_requests
                )),
            )
            .await;
        match outcome {
            Ok(o) if o.approved() => ctx.reset_request_count(),
            _ => {
                ctx.store.push_turn(Turn::assistant_text(REQUEST_LIMIT_FAILURE));
                return Ok(StepOutcome::Terminated);
            }
        }
    }

    let _ = ctx.gate.say(
        SayKind::ApiReqStarted,
        Some(json!({ "request": user_readable_request(&user_content) }).to_string()),
        None,
    );

    let response = match request_with_retries(ctx, client).await? {
        Some(response) => response,
        None => return Ok(StepOutcome::Terminated),
    };
    ctx.bump_request_count();

    let cost = ctx.record_usage(&response.usage, &client.model().prices);
    let _ = ctx.gate.say(
        SayKind::ApiReqFinished,
        Some(
            json!({
                "tokensIn": response.usage.input_tokens,
                "tokensOut": response.usage.output_tokens,
                "cacheWrites": response.usage.cache_write_tokens,
                "cacheReads": response.usage.cache_read_tokens,
                "cost": cost,
            })
            .to_string(),
        ),
        None,
    );

    ctx.check_aborted()?;

    if response.content.is_empty() {
        let _ = ctx.gate.say(
            SayKind::Error,
            Some(
                "Unexpected API Response: The language model did not provide any assistant \
                 messages. This may indicate an issue with the API or the model's output."
                    .to_string(),
            ),
            None,
        );
        ctx.store.push_turn(Turn::assistant_text(NO_RESPONSE_FAILURE));
        return Ok(StepOutcome::Continue(vec![ContentBlock::text(NUDGE)]));
    }

    ctx.store.push_turn(Turn::assistant(response.content.clone()));

    // attempt_completion runs after every other tool so its verdict sees the
    // round's side effects.
    let mut tool_results: Vec<ContentBlock> = Vec::new();
    let mut completion: Option<(String, Value)> = None;
    let mut used_tool = false;
    for block in &response.content {
        match block {
            ContentBlock::Text { text } => {
                let _ = ctx.gate.say(SayKind::Text, Some(text.clone()), None);
            }
            ContentBlock::ToolUse { id, name, input } => {
                used_tool = true;
                if name == "attempt_completion" && completion.is_none() {
                    completion = Some((id.clone(), input.clone()));
                } else {
                    let response = tools::execute(ctx, name, input).await;
                    tool_results.push(into_tool_result(id, response));
                }
            }
            _ => {}
        }
    }

    if let Some((id, input)) = completion {
        let response = tools::execute(ctx, "attempt_completion", &input).await;
        if response.text.is_empty() {
            tool_results.push(ContentBlock::tool_result(id, COMPLETION_ACCEPTED));
            ctx.store.push_turn(Turn::user(tool_results));
            ctx.store.push_turn(Turn::assistant_text(COMPLETION_ACK));
            return Ok(StepOutcome::Terminated);
        }
        tool_results.push(into_tool_result(&id, response));
    }

    if !used_tool {
        tool_results.push(ContentBlock::text(NUDGE));
    }
    Ok(StepOutcome::Continue(tool_results))
}

/// Call the model, offering a retry ask on failure. `None` means the user
/// declined to retry and the task must terminate.
async fn request_with_retries(
    ctx: &TaskContext,
    client: &dyn ModelClient,
) -> Result<Option<ModelResponse>> {
    let system = system_prompt(ctx);
    let tool_specs = tools::definitions(&ctx.cwd);
    let fixed = trim::estimate_tokens(&system) + trim::estimate_tools(&tool_specs);
    let budget = (client.model().context_window as usize).saturating_sub(MAX_OUTPUT_RESERVE);

    loop {
        // Re-snapshot each attempt; the history only grows between retries.
        let turns = ctx.store.turns();
        let window = trim::trim(&turns, fixed, budget);

        match client.create_message(&system, window, &tool_specs).await {
            Ok(response) => return Ok(Some(response)),
            Err(e) => {
                tracing::warn!("model request failed: {e:#}");
                match ctx.gate.ask(AskKind::ApiReqFailed, Some(format!("{e:#}"))).await {
                    Ok(o) if o.approved() => {
                        let _ = ctx.gate.say(SayKind::ApiReqRetried, None, None);
                    }
                    _ => return Ok(None),
                }
            }
        }
    }
}

fn into_tool_result(tool_use_id: &str, response: ToolResponse) -> ContentBlock {
    let mut content = vec![ContentBlock::text(response.text)];
    for url in response.images.unwrap_or_default() {
        if let Some(source) = ImageSource::from_data_url(&url) {
            content.push(ContentBlock::Image { source });
        }
    }
    ContentBlock::ToolResult { tool_use_id: tool_use_id.to_string(), content }
}
