/// Human-in-the-loop approval gate.
///
/// `ask` records a prompt in the UI event log and suspends until the external
/// UI responds; `say` is the fire-and-forget counterpart. Every ask/say bumps
/// a shared monotonic timestamp, and a pending ask whose timestamp is no
/// longer the latest resolves with `GateError::Superseded` instead of hanging.
/// That models overlapping prompts (command-output asks can arrive faster
/// than the user can answer) and guarantees the loop never blocks on a stale
/// prompt.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::store::{AskKind, ConversationStore, SayKind, UiMessage};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("task aborted")]
    Aborted,
    #[error("ask was superseded by a newer message")]
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Yes,
    No,
    Message,
}

#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub response: Response,
    pub text: Option<String>,
    pub images: Option<Vec<String>>,
}

impl AskOutcome {
    pub fn yes() -> Self {
        Self { response: Response::Yes, text: Some(String::new()), images: Some(vec![]) }
    }

    pub fn approved(&self) -> bool {
        self.response == Response::Yes
    }
}

struct Pending {
    ts: i64,
    outcome: Option<AskOutcome>,
}

struct GateState {
    last_message_ts: i64,
    pending: Option<Pending>,
}

pub struct ApprovalGate {
    store: Arc<ConversationStore>,
    state: Mutex<GateState>,
    changed: watch::Sender<u64>,
    events_tx: mpsc::UnboundedSender<UiMessage>,
    auto_approve: AtomicBool,
    aborted: Arc<AtomicBool>,
}

impl ApprovalGate {
    pub fn new(
        store: Arc<ConversationStore>,
        events_tx: mpsc::UnboundedSender<UiMessage>,
        auto_approve: bool,
        aborted: Arc<AtomicBool>,
    ) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            store,
            state: Mutex::new(GateState { last_message_ts: 0, pending: None }),
            changed,
            events_tx,
            auto_approve: AtomicBool::new(auto_approve),
            aborted,
        }
    }

    pub fn auto_approves(&self) -> bool {
        self.auto_approve.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Mark the task aborted and wake every waiter so pending asks fail fast.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.changed.send_modify(|v| *v += 1);
    }

    /// Raise a question and suspend until the UI answers, the ask is
    /// superseded by a newer ask/say, or the task aborts.
    pub async fn ask(&self, kind: AskKind, text: Option<String>) -> Result<AskOutcome, GateError> {
        if self.is_aborted() {
            return Err(GateError::Aborted);
        }

        let ts = {
            let mut state = self.state.lock().unwrap();
            let ts = next_ts(&mut state);
            state.pending = Some(Pending { ts, outcome: None });
            ts
        };
        let message = UiMessage::ask(ts, kind, text);
        self.store.push_ui(message.clone());
        let _ = self.events_tx.send(message);
        // wake any older waiter so it observes the newer timestamp
        self.changed.send_modify(|v| *v += 1);

        if self.auto_approve.load(Ordering::SeqCst) {
            let mut state = self.state.lock().unwrap();
            if state.pending.as_ref().is_some_and(|p| p.ts == ts) {
                state.pending = None;
            }
            return Ok(AskOutcome::yes());
        }

        let mut rx = self.changed.subscribe();
        loop {
            {
                if self.is_aborted() {
                    return Err(GateError::Aborted);
                }
                let mut state = self.state.lock().unwrap();
                if state.last_message_ts != ts {
                    // A newer ask/say took over; only clear pending if it is still ours.
                    if state.pending.as_ref().is_some_and(|p| p.ts == ts) {
                        state.pending = None;
                    }
                    return Err(GateError::Superseded);
                }
                if let Some(pending) = state.pending.as_mut()
                    && pending.ts == ts
                    && let Some(outcome) = pending.outcome.take()
                {
                    state.pending = None;
                    return Ok(outcome);
                }
            }
            if rx.changed().await.is_err() {
                return Err(GateError::Aborted);
            }
        }
    }

    /// One-way notification. Bumps the timestamp (superseding any pending ask),
    /// records the event, and returns immediately.
    pub fn say(
        &self,
        kind: SayKind,
        text: Option<String>,
        images: Option<Vec<String>>,
    ) -> Result<(), GateError> {
        if self.is_aborted() {
            return Err(GateError::Aborted);
        }
        let ts = {
            let mut state = self.state.lock().unwrap();
            next_ts(&mut state)
        };
        let message = UiMessage::say(ts, kind, text, images);
        self.store.push_ui(message.clone());
        let _ = self.events_tx.send(message);
        self.changed.send_modify(|v| *v += 1);
        Ok(())
    }

    /// Called by the external UI with the user's answer. A response with no
    /// pending ask (or for an already-superseded one) is dropped.
    pub fn resolve(&self, response: Response, text: Option<String>, images: Option<Vec<String>>) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(pending) = state.pending.as_mut()
                && pending.outcome.is_none()
            {
                pending.outcome = Some(AskOutcome { response, text, images });
            } else {
                return;
            }
        }
        self.changed.send_modify(|v| *v += 1);
    }
}

/// Millisecond wall clock, forced strictly monotonic so back-to-back messages
/// within the same millisecond still supersede correctly.
fn next_ts(state: &mut GateState) -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let ts = now.max(state.last_message_ts + 1);
    state.last_message_ts = ts;
    ts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gate(auto: bool) -> (Arc<ApprovalGate>, mpsc::UnboundedReceiver<UiMessage>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ConversationStore::create(tmp.path(), "1").unwrap());
        // Leak the tempdir so the store outlives this helper.
        std::mem::forget(tmp);
        let (tx, rx) = mpsc::unbounded_channel();
        let aborted = Arc::new(AtomicBool::new(false));
        (Arc::new(ApprovalGate::new(store, tx, auto, aborted)), rx)
    }

    #[tokio::test]
    async fn auto_approve_resolves_immediately() {
        let (gate, _rx) = gate(true);
        let outcome = gate.ask(AskKind::Command, Some("ls".into())).await.unwrap();
        assert!(outcome.approved());
    }

    #[tokio::test]
    async fn response_unblocks_waiting_ask() {
        let (gate, _rx) = gate(false);
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ask(AskKind::Tool, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.resolve(Response::Message, Some("use a different path".into()), None);
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome.response, Response::Message);
        assert_eq!(outcome.text.as_deref(), Some("use a different path"));
    }

    #[tokio::test]
    async fn newer_message_supersedes_pending_ask() {
        let (gate, _rx) = gate(false);
        let first = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ask(AskKind::CommandOutput, Some("chunk 1".into())).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.say(SayKind::CommandOutput, Some("chunk 2".into()), None).unwrap();
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, GateError::Superseded));
    }

    #[tokio::test]
    async fn second_ask_supersedes_first() {
        let (gate, _rx) = gate(false);
        let first = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ask(AskKind::CommandOutput, Some("a".into())).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ask(AskKind::CommandOutput, Some("b".into())).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(first.await.unwrap().unwrap_err(), GateError::Superseded));
        gate.resolve(Response::Yes, None, None);
        assert!(second.await.unwrap().unwrap().approved());
    }

    #[tokio::test]
    async fn abort_fails_pending_and_future_asks() {
        let (gate, _rx) = gate(false);
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ask(AskKind::Followup, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.abort();
        assert!(matches!(waiter.await.unwrap().unwrap_err(), GateError::Aborted));
        assert!(matches!(
            gate.ask(AskKind::Followup, None).await.unwrap_err(),
            GateError::Aborted
        ));
        assert!(gate.say(SayKind::Text, None, None).is_err());
    }
}
