/// Per-task wiring and the start/resume drivers.
///
/// `TaskContext` owns everything one task needs: working directory, store,
/// approval gate, running-process registry, request budget, and usage totals.
/// A process-wide generation counter marks older contexts stale when a new
/// task starts, so a still-running loop from a replaced task winds down at
/// its next checkpoint instead of racing the new one.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};

use crate::agent;
use crate::client::{ContentBlock, ImageSource, ModelClient, Role, Usage};
use crate::command::ProcessRegistry;
use crate::config::Settings;
use crate::cost::{ModelPrices, UsageTotals};
use crate::gate::{ApprovalGate, Response};
use crate::recovery;
use crate::store::{ConversationStore, SayKind, UiMessage};
use crate::tools;
use tokio::sync::mpsc;

pub struct TaskContext {
    pub cwd: PathBuf,
    pub store: Arc<ConversationStore>,
    pub gate: Arc<ApprovalGate>,
    pub registry: ProcessRegistry,
    pub max_requests: u32,
    pub custom_instructions: Option<String>,
    read_only_allowed: bool,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    aborted: Arc<AtomicBool>,
    request_count: AtomicU32,
    totals: Mutex<UsageTotals>,
    events: Mutex<Option<mpsc::UnboundedReceiver<UiMessage>>>,
}

impl TaskContext {
    pub fn new(
        cwd: PathBuf,
        store: Arc<ConversationStore>,
        settings: &Settings,
        max_requests: u32,
        custom_instructions: Option<String>,
        generation_counter: Arc<AtomicU64>,
    ) -> Self {
        let generation = generation_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let aborted = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(ApprovalGate::new(
            store.clone(),
            events_tx,
            !settings.require_manual_confirmation,
            aborted.clone(),
        ));
        Self {
            cwd,
            store,
            gate,
            registry: ProcessRegistry::default(),
            max_requests,
            custom_instructions,
            read_only_allowed: settings.always_allow_read_only,
            generation,
            current_generation: generation_counter,
            aborted,
            request_count: AtomicU32::new(0),
            totals: Mutex::new(UsageTotals::default()),
            events: Mutex::new(Some(events_rx)),
        }
    }

    /// Hand the UI event stream to the frontend. Single handoff per task.
    pub fn take_events(&self) -> mpsc::UnboundedReceiver<UiMessage> {
        self.events
            .lock()
            .unwrap()
            .take()
            .expect("UI event stream already taken")
    }

    fn is_stale(&self) -> bool {
        self.generation != self.current_generation.load(Ordering::SeqCst)
    }

    /// Non-mutating tools skip the approval prompt when this policy is on.
    pub fn allows_read_only(&self) -> bool {
        self.read_only_allowed
    }

    /// Checked at every loop suspension point.
    pub fn check_aborted(&self) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) || self.is_stale() {
            bail!("task {} aborted", self.store.task_id);
        }
        Ok(())
    }

    /// Stop the task: fail pending asks and terminate any running process.
    pub fn abort(&self) {
        self.gate.abort();
        self.registry.terminate();
    }

    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn bump_request_count(&self) {
        self.request_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reset_request_count(&self) {
        self.request_count.store(0, Ordering::SeqCst);
    }

    pub fn record_usage(&self, usage: &Usage, prices: &ModelPrices) -> f64 {
        self.totals.lock().unwrap().add(usage, prices)
    }

    pub fn usage_totals(&self) -> UsageTotals {
        *self.totals.lock().unwrap()
    }
}

// ── Drivers ────────────────────────────────────────────────────────────────────

/// Start a fresh task: record the task text as the first UI event, build the
/// opening request, and run the loop to termination.
pub async fn start_task(
    ctx: &TaskContext,
    client: &dyn ModelClient,
    task: &str,
    images: Option<Vec<String>>,
) -> Result<()> {
    ctx.gate.say(SayKind::Task, Some(task.to_string()), images.clone())?;

    let mut content = vec![ContentBlock::text(format!(
        "<task>\n{task}\n</task>\n\n{}",
        tools::environment_details(&ctx.cwd)
    ))];
    for url in images.unwrap_or_default() {
        if let Some(source) = ImageSource::from_data_url(&url) {
            content.push(ContentBlock::Image { source });
        }
    }
    agent::run(ctx, client, content).await
}

/// Resume a persisted task: repair both logs, confirm with the user, and feed
/// the recovered content back into the loop.
pub async fn resume_task(ctx: &TaskContext, client: &dyn ModelClient) -> Result<()> {
    let ui = recovery::repair_ui(ctx.store.ui_messages());
    ctx.store.overwrite_ui(ui.clone());

    // Elapsed time since the interruption, not since the task was created.
    let interrupted_ts = ui
        .last()
        .map(|m| m.ts)
        .unwrap_or_else(|| ctx.store.task_id.parse().unwrap_or(0));
    let ago = recovery::ago_text(interrupted_ts, chrono::Utc::now().timestamp_millis());
    let ask_kind = recovery::resume_ask_kind(&ui);
    let outcome = ctx
        .gate
        .ask(ask_kind, Some(format!("This task was interrupted {ago}. Resume it?")))
        .await?;
    if outcome.response == Response::No {
        return Ok(());
    }
    let feedback = outcome.text.filter(|t| !t.is_empty());
    if let Some(feedback) = &feedback {
        let _ = ctx.gate.say(
            SayKind::UserFeedback,
            Some(feedback.clone()),
            outcome.images.clone(),
        );
    }

    let repaired = recovery::repair_turns(ctx.store.turns())?;
    ctx.store.overwrite_turns(repaired.turns);

    let mut content = repaired.pending_content;
    let notice = recovery::resumption_notice(
        &ago,
        &ctx.cwd,
        repaired.previous_text.as_deref(),
        feedback.as_deref(),
    );
    content.push(ContentBlock::text(format!(
        "{notice}\n\n{}",
        tools::environment_details(&ctx.cwd)
    )));
    for url in outcome.images.unwrap_or_default() {
        if let Some(source) = ImageSource::from_data_url(&url) {
            content.push(ContentBlock::Image { source });
        }
    }
    agent::run(ctx, client, content).await
}

/// Seed text for auto-continue mode: the original task plus the previous
/// attempt's final status update.
pub fn continuation_task(store: &ConversationStore) -> Option<String> {
    let task = store.task_text()?;
    let update = store.turns().iter().rev().find_map(|t| {
        if t.role != Role::Assistant {
            return None;
        }
        t.content.iter().find_map(|b| match b {
            ContentBlock::Text { text } => Some(text.clone()),
            _ => None,
        })
    });
    Some(match update {
        Some(update) => format!(
            "{task}\n\nThis task was attempted before. The previous attempt ended with the \
             following update:\n<previous_update>\n{update}\n</previous_update>\nContinue the \
             work from where it left off."
        ),
        None => task,
    })
}

// ── Test wiring ────────────────────────────────────────────────────────────────

#[cfg(test)]
impl TaskContext {
    pub fn for_tests() -> Self {
        Self::for_tests_with(
            Settings { require_manual_confirmation: false, ..Default::default() },
            u32::MAX,
        )
    }

    pub fn for_tests_manual() -> Self {
        Self::for_tests_with(Settings::default(), u32::MAX)
    }

    pub fn for_tests_manual_with_limit(max_requests: u32) -> Self {
        Self::for_tests_with(Settings::default(), max_requests)
    }

    pub fn for_tests_read_only() -> Self {
        Self::for_tests_with(
            Settings { always_allow_read_only: true, ..Default::default() },
            u32::MAX,
        )
    }

    fn for_tests_with(settings: Settings, max_requests: u32) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = tmp.path().to_path_buf();
        // Leaked on purpose: the context outlives this helper.
        std::mem::forget(tmp);
        let store =
            Arc::new(ConversationStore::create(&cwd.join(".pilot-tasks"), "1700000000000").unwrap());
        Self::new(cwd, store, &settings, max_requests, None, Arc::new(AtomicU64::new(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ModelInfo, ModelResponse, ToolSpec, Turn};
    use crate::store::AskKind;
    use async_trait::async_trait;
    use serde_json::json;

    /// Approves every completion immediately.
    struct CompletingClient {
        info: ModelInfo,
    }

    impl CompletingClient {
        fn new() -> Self {
            Self {
                info: ModelInfo {
                    id: "fake".into(),
                    context_window: 200_000,
                    prices: ModelPrices::default(),
                },
            }
        }
    }

    #[async_trait]
    impl ModelClient for CompletingClient {
        fn model(&self) -> &ModelInfo {
            &self.info
        }

        async fn create_message(
            &self,
            _system: &str,
            _turns: &[Turn],
            _tools: &[ToolSpec],
        ) -> Result<ModelResponse> {
            Ok(ModelResponse {
                content: vec![ContentBlock::ToolUse {
                    id: "c1".into(),
                    name: "attempt_completion".into(),
                    input: json!({ "result": "done" }),
                }],
                usage: Usage::default(),
            })
        }
    }

    #[tokio::test]
    async fn start_task_records_task_event_and_wraps_text() {
        let ctx = TaskContext::for_tests();
        start_task(&ctx, &CompletingClient::new(), "fix the bug", None)
            .await
            .unwrap();

        let ui = ctx.store.ui_messages();
        assert!(ui[0].is_say(SayKind::Task));
        assert_eq!(ui[0].text.as_deref(), Some("fix the bug"));

        let turns = ctx.store.turns();
        match &turns[0].content[0] {
            ContentBlock::Text { text } => {
                assert!(text.starts_with("<task>\nfix the bug\n</task>"));
                assert!(text.contains("potentially_relevant_details"));
            }
            other => panic!("wrong block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_repairs_both_logs_and_pairs_orphaned_tool_calls() {
        let ctx = TaskContext::for_tests();
        ctx.store.push_ui(UiMessage::say(1, SayKind::Task, Some("task".into()), None));
        ctx.store.push_ui(UiMessage::say(2, SayKind::ApiReqStarted, None, None));
        ctx.store.push_turn(Turn::user(vec![ContentBlock::text("<task>\ntask\n</task>")]));
        ctx.store.push_turn(Turn::assistant(vec![ContentBlock::ToolUse {
            id: "t9".into(),
            name: "read_file".into(),
            input: json!({ "path": "x" }),
        }]));

        resume_task(&ctx, &CompletingClient::new()).await.unwrap();

        // The dangling request event was dropped before new events appended.
        let ui = ctx.store.ui_messages();
        assert!(!ui[1].is_say(SayKind::ApiReqStarted) || ui[1].ts > 2);

        // Pairing invariant: the orphaned tool call got exactly one result.
        let turns = ctx.store.turns();
        let results: Vec<&ContentBlock> = turns[2]
            .content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
            .collect();
        assert_eq!(results.len(), 1);
        match results[0] {
            ContentBlock::ToolResult { tool_use_id, content } => {
                assert_eq!(tool_use_id, "t9");
                match &content[0] {
                    ContentBlock::Text { text } => {
                        assert_eq!(text, recovery::INTERRUPTED_TOOL_RESULT)
                    }
                    other => panic!("wrong block: {other:?}"),
                }
            }
            other => panic!("wrong block: {other:?}"),
        }
        // And the resumption notice rode along in the same turn, with
        // workspace context appended.
        assert!(turns[2].content.iter().any(|b| matches!(
            b,
            ContentBlock::Text { text } if text.starts_with("Task resumption:")
                && text.contains("potentially_relevant_details")
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resume_prompt_measures_from_the_interruption() {
        let ctx = TaskContext::for_tests_manual();
        // The store id dates the task days back; the log's last event is fresh.
        let now = chrono::Utc::now().timestamp_millis();
        ctx.store.push_ui(UiMessage::say(now - 30_000, SayKind::Task, Some("task".into()), None));
        ctx.store.push_turn(Turn::user(vec![ContentBlock::text("task")]));

        let gate = ctx.gate.clone();
        let mut rx = ctx.take_events();
        let responder = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if msg.is_ask(AskKind::ResumeTask) {
                    gate.resolve(Response::No, None, None);
                }
            }
        });
        resume_task(&ctx, &CompletingClient::new()).await.unwrap();
        responder.abort();

        let ask = ctx
            .store
            .ui_messages()
            .into_iter()
            .find(|m| m.is_ask(AskKind::ResumeTask))
            .unwrap();
        assert!(ask.text.as_deref().unwrap().contains("just now"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resume_feedback_is_echoed_and_folded() {
        let ctx = TaskContext::for_tests_manual();
        ctx.store.push_ui(UiMessage::say(1, SayKind::Task, Some("task".into()), None));
        ctx.store.push_turn(Turn::user(vec![ContentBlock::text("task")]));
        ctx.store.push_turn(Turn::assistant_text("working"));

        let gate = ctx.gate.clone();
        let mut rx = ctx.take_events();
        let responder = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if msg.is_ask(AskKind::ResumeTask) {
                    gate.resolve(Response::Message, Some("focus on tests".into()), None);
                } else if msg.is_ask(AskKind::CompletionResult) {
                    gate.resolve(Response::Yes, None, None);
                }
            }
        });
        resume_task(&ctx, &CompletingClient::new()).await.unwrap();
        responder.abort();

        let ui = ctx.store.ui_messages();
        assert!(ui.iter().any(|m| m.is_say(SayKind::UserFeedback)
            && m.text.as_deref() == Some("focus on tests")));

        let turns = ctx.store.turns();
        assert!(turns[2].content.iter().any(|b| matches!(
            b,
            ContentBlock::Text { text }
                if text.contains("<user_feedback>\nfocus on tests\n</user_feedback>")
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn declined_resume_does_nothing() {
        let ctx = TaskContext::for_tests_manual();
        ctx.store.push_turn(Turn::user(vec![ContentBlock::text("task")]));

        let gate = ctx.gate.clone();
        let mut rx = ctx.take_events();
        let responder = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if msg.is_ask(AskKind::ResumeTask) {
                    gate.resolve(Response::No, None, None);
                }
            }
        });
        resume_task(&ctx, &CompletingClient::new()).await.unwrap();
        responder.abort();

        assert_eq!(ctx.store.turns().len(), 1);
    }

    #[test]
    fn new_task_makes_older_context_stale() {
        let counter = Arc::new(AtomicU64::new(0));
        let first = {
            let ctx = TaskContext::for_tests();
            // rebuild with the shared counter
            TaskContext::new(
                ctx.cwd.clone(),
                ctx.store.clone(),
                &Settings::default(),
                10,
                None,
                counter.clone(),
            )
        };
        assert!(first.check_aborted().is_ok());

        let second = TaskContext::new(
            first.cwd.clone(),
            first.store.clone(),
            &Settings::default(),
            10,
            None,
            counter,
        );
        assert!(first.check_aborted().is_err());
        assert!(second.check_aborted().is_ok());
    }

    #[test]
    fn continuation_text_includes_last_assistant_update() {
        let ctx = TaskContext::for_tests();
        ctx.store.push_ui(UiMessage::say(1, SayKind::Task, Some("build it".into()), None));
        ctx.store.push_turn(Turn::user(vec![ContentBlock::text("x")]));
        ctx.store.push_turn(Turn::assistant_text("halfway there"));

        let seed = continuation_task(&ctx.store).unwrap();
        assert!(seed.starts_with("build it"));
        assert!(seed.contains("<previous_update>\nhalfway there\n</previous_update>"));
    }
}
