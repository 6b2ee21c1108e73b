/// Durable conversation state for one task.
///
/// Two parallel logs, both append-only in normal operation:
/// - the model-turn history (what the API sees), `api_conversation_history.json`
/// - the UI event log (what the user sees), `ui_messages.json`
///
/// Each file is overwritten wholesale on every mutation so a killed process
/// loses at most the in-flight append. Recovery repairs the rest (recovery.rs).
use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::client::Turn;

// ── UI event log types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    RequestLimitReached,
    Followup,
    Command,
    CommandOutput,
    CompletionResult,
    Tool,
    ApiReqFailed,
    ResumeTask,
    ResumeCompletedTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Task,
    Error,
    ApiReqStarted,
    ApiReqFinished,
    Text,
    CompletionResult,
    UserFeedback,
    ApiReqRetried,
    CommandOutput,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiMessageType {
    Ask,
    Say,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiMessage {
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: UiMessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<AskKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub say: Option<SayKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl UiMessage {
    pub fn ask(ts: i64, kind: AskKind, text: Option<String>) -> Self {
        Self { ts, kind: UiMessageType::Ask, ask: Some(kind), say: None, text, images: None }
    }

    pub fn say(ts: i64, kind: SayKind, text: Option<String>, images: Option<Vec<String>>) -> Self {
        Self { ts, kind: UiMessageType::Say, ask: None, say: Some(kind), text, images }
    }

    pub fn is_ask(&self, kind: AskKind) -> bool {
        self.ask == Some(kind)
    }

    pub fn is_say(&self, kind: SayKind) -> bool {
        self.say == Some(kind)
    }
}

// ── Data directory helpers ─────────────────────────────────────────────────────

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(std::env::var("HOME").unwrap_or_default()).join(".local/share")
        })
        .join("pilot")
}

pub fn tasks_root() -> PathBuf {
    data_dir().join("tasks")
}

/// List persisted task ids, newest first (ids are millisecond timestamps).
pub fn list_tasks(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !root.exists() {
        return Ok(vec![]);
    }
    let mut entries: Vec<_> = std::fs::read_dir(root)?
        .flatten()
        .filter(|e| e.path().is_dir())
        .collect();
    entries.sort_by_key(|e| Reverse(e.file_name()));
    Ok(entries
        .iter()
        .map(|e| (e.file_name().to_string_lossy().to_string(), e.path()))
        .collect())
}

// ── Store ──────────────────────────────────────────────────────────────────────

const TURNS_FILE: &str = "api_conversation_history.json";
const UI_FILE: &str = "ui_messages.json";

pub struct ConversationStore {
    pub task_id: String,
    dir: PathBuf,
    turns: Mutex<Vec<Turn>>,
    ui: Mutex<Vec<UiMessage>>,
}

impl ConversationStore {
    /// Create a fresh store for a new task (empty logs, directory created).
    pub fn create(tasks_root: &Path, task_id: &str) -> Result<Self> {
        let dir = tasks_root.join(task_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create task dir {}", dir.display()))?;
        Ok(Self {
            task_id: task_id.to_string(),
            dir,
            turns: Mutex::new(Vec::new()),
            ui: Mutex::new(Vec::new()),
        })
    }

    /// Load a persisted task. Missing files are treated as empty logs.
    pub fn load(tasks_root: &Path, task_id: &str) -> Result<Self> {
        let dir = tasks_root.join(task_id);
        let turns = read_json_vec(&dir.join(TURNS_FILE))?;
        let ui = read_json_vec(&dir.join(UI_FILE))?;
        Ok(Self {
            task_id: task_id.to_string(),
            dir,
            turns: Mutex::new(turns),
            ui: Mutex::new(ui),
        })
    }

    // ── Model-turn history ──────────────────────────────────────────────────

    pub fn push_turn(&self, turn: Turn) {
        let snapshot = {
            let mut turns = self.turns.lock().unwrap();
            turns.push(turn);
            turns.clone()
        };
        self.persist(TURNS_FILE, &snapshot);
    }

    pub fn overwrite_turns(&self, new_turns: Vec<Turn>) {
        let snapshot = {
            let mut turns = self.turns.lock().unwrap();
            *turns = new_turns;
            turns.clone()
        };
        self.persist(TURNS_FILE, &snapshot);
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns.lock().unwrap().clone()
    }

    // ── UI event log ────────────────────────────────────────────────────────

    pub fn push_ui(&self, message: UiMessage) {
        let snapshot = {
            let mut ui = self.ui.lock().unwrap();
            ui.push(message);
            ui.clone()
        };
        self.persist(UI_FILE, &snapshot);
    }

    pub fn overwrite_ui(&self, new_ui: Vec<UiMessage>) {
        let snapshot = {
            let mut ui = self.ui.lock().unwrap();
            *ui = new_ui;
            ui.clone()
        };
        self.persist(UI_FILE, &snapshot);
    }

    pub fn ui_messages(&self) -> Vec<UiMessage> {
        self.ui.lock().unwrap().clone()
    }

    /// The task's originating text, always the first UI event.
    pub fn task_text(&self) -> Option<String> {
        self.ui.lock().unwrap().first().and_then(|m| m.text.clone())
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// A failed save must not kill the task; the in-memory state stays
    /// authoritative and the next append retries the full write.
    fn persist<T: Serialize>(&self, file: &str, value: &[T]) {
        let path = self.dir.join(file);
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!("failed to save {}: {e}", path.display());
                }
            }
            Err(e) => tracing::warn!("failed to serialize {}: {e}", path.display()),
        }
    }
}

fn read_json_vec<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ContentBlock;

    #[test]
    fn turns_survive_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConversationStore::create(tmp.path(), "1700000000000").unwrap();
        store.push_turn(Turn::user(vec![ContentBlock::text("hello")]));
        store.push_turn(Turn::assistant_text("hi"));

        let reloaded = ConversationStore::load(tmp.path(), "1700000000000").unwrap();
        let turns = reloaded.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, crate::client::Role::User);
    }

    #[test]
    fn ui_log_round_trips_with_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConversationStore::create(tmp.path(), "1").unwrap();
        store.push_ui(UiMessage::say(1, SayKind::Task, Some("list files".into()), None));
        store.push_ui(UiMessage::ask(2, AskKind::Command, Some("ls".into())));

        let reloaded = ConversationStore::load(tmp.path(), "1").unwrap();
        let ui = reloaded.ui_messages();
        assert_eq!(ui.len(), 2);
        assert!(ui[0].is_say(SayKind::Task));
        assert!(ui[1].is_ask(AskKind::Command));
        assert_eq!(reloaded.task_text().as_deref(), Some("list files"));
    }

    #[test]
    fn list_tasks_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        ConversationStore::create(tmp.path(), "1700000000001").unwrap();
        ConversationStore::create(tmp.path(), "1700000000009").unwrap();
        ConversationStore::create(tmp.path(), "1700000000005").unwrap();
        let ids: Vec<String> = list_tasks(tmp.path())
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["1700000000009", "1700000000005", "1700000000001"]);
    }

    #[test]
    fn missing_files_load_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("42")).unwrap();
        let store = ConversationStore::load(tmp.path(), "42").unwrap();
        assert!(store.turns().is_empty());
        assert!(store.ui_messages().is_empty());
    }
}
