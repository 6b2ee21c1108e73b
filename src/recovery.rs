/// Repairing a task that was interrupted mid-flight.
///
/// Both logs can end on a half-finished exchange: a request event with no
/// response, a tool call with no result, a user turn the model never saw.
/// These functions are pure; the driver applies their output to the store
/// before restarting the loop.
use std::path::Path;

use anyhow::{Result, bail};

use crate::client::{ContentBlock, Role, Turn};
use crate::store::{AskKind, SayKind, UiMessage};

pub const INTERRUPTED_TOOL_RESULT: &str =
    "Task was interrupted before this tool call could be completed.";

// ── UI log repair ──────────────────────────────────────────────────────────────

/// Drop stale trailing events: resume prompts from earlier resumptions, and a
/// final api_req_started that never got its api_req_finished.
pub fn repair_ui(mut messages: Vec<UiMessage>) -> Vec<UiMessage> {
    while messages
        .last()
        .is_some_and(|m| m.is_ask(AskKind::ResumeTask) || m.is_ask(AskKind::ResumeCompletedTask))
    {
        messages.pop();
    }

    let last_started = messages.iter().rposition(|m| m.is_say(SayKind::ApiReqStarted));
    let last_finished = messages.iter().rposition(|m| m.is_say(SayKind::ApiReqFinished));
    if let Some(started) = last_started
        && last_finished.is_none_or(|finished| started > finished)
    {
        messages.remove(started);
    }
    messages
}

/// A completed task resumes differently (the user may just want a follow-up),
/// so the prompt kind depends on how the log ended.
pub fn resume_ask_kind(messages: &[UiMessage]) -> AskKind {
    match messages.last() {
        Some(m) if m.is_ask(AskKind::CompletionResult) || m.is_say(SayKind::CompletionResult) => {
            AskKind::ResumeCompletedTask
        }
        _ => AskKind::ResumeTask,
    }
}

// ── Turn history repair ────────────────────────────────────────────────────────

pub struct RepairedHistory {
    pub turns: Vec<Turn>,
    /// Content that must open the next request: recovered tool results for
    /// the model's unanswered tool calls, plus any non-text blocks of a
    /// popped user turn.
    pub pending_content: Vec<ContentBlock>,
    /// Text of a popped user turn; folded into the resumption notice rather
    /// than re-sent as its own block.
    pub previous_text: Option<String>,
}

/// Restore the tool_use/tool_result pairing invariant at the tail of the
/// history. A trailing user turn is popped and re-sent (the model never saw
/// it); a trailing assistant turn keeps its place and every unanswered tool
/// call gets a synthesized interruption result.
pub fn repair_turns(mut turns: Vec<Turn>) -> Result<RepairedHistory> {
    let last_role = match turns.last() {
        Some(last) => last.role,
        None => bail!("no conversation history to resume from"),
    };

    match last_role {
        Role::Assistant => {
            let pending: Vec<ContentBlock> = turns
                .last()
                .map(|t| {
                    t.content
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::ToolUse { id, .. } => Some(ContentBlock::tool_result(
                                id.clone(),
                                INTERRUPTED_TOOL_RESULT,
                            )),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(RepairedHistory { turns, pending_content: pending, previous_text: None })
        }
        Role::User => {
            let Some(popped) = turns.pop() else { unreachable!() };
            let tool_use_ids: Vec<String> = turns
                .last()
                .filter(|t| t.role == Role::Assistant)
                .map(|t| {
                    t.content
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();

            let mut texts: Vec<String> = Vec::new();
            let mut pending: Vec<ContentBlock> = Vec::new();
            for block in popped.content {
                match block {
                    ContentBlock::Text { text } => texts.push(text),
                    block => pending.push(block),
                }
            }
            for id in tool_use_ids {
                let answered = pending.iter().any(|b| {
                    matches!(b, ContentBlock::ToolResult { tool_use_id, .. } if *tool_use_id == id)
                });
                if !answered {
                    pending.push(ContentBlock::tool_result(id, INTERRUPTED_TOOL_RESULT));
                }
            }
            let previous_text =
                if texts.is_empty() { None } else { Some(texts.join("\n")) };
            Ok(RepairedHistory { turns, pending_content: pending, previous_text })
        }
    }
}

// ── Resumption message ─────────────────────────────────────────────────────────

pub fn ago_text(task_ts_ms: i64, now_ms: i64) -> String {
    let seconds = ((now_ms - task_ts_ms) / 1000).max(0);
    match seconds {
        0..60 => "just now".to_string(),
        60..3600 => format!("{} minutes ago", seconds / 60),
        3600..86400 => format!("{} hours ago", seconds / 3600),
        _ => format!("{} days ago", seconds / 86400),
    }
}

/// The single text block appended after any recovered tool results.
pub fn resumption_notice(
    ago: &str,
    cwd: &Path,
    previous_message: Option<&str>,
    feedback: Option<&str>,
) -> String {
    let mut notice = format!(
        "Task resumption: This autonomous coding task was interrupted {ago}. It may or may not \
         be complete, so please reassess the task context. Be aware that the project state may \
         have changed since then. The current working directory is now '{}'. If the task has not \
         been completed, retry the last step before interruption and proceed with completing the \
         task.",
        cwd.display()
    );
    if let Some(previous) = previous_message.filter(|p| !p.is_empty()) {
        notice.push_str(&format!(
            "\n\nThe last message before the interruption, which the model never received:\n\
             <previous_message>\n{previous}\n</previous_message>"
        ));
    }
    if let Some(feedback) = feedback.filter(|f| !f.is_empty()) {
        notice.push_str(&format!(
            "\n\nNew instructions for task continuation:\n<user_feedback>\n{feedback}\n\
             </user_feedback>"
        ));
    }
    notice
}
