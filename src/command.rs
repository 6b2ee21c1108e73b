/// Streaming subprocess control for the execute_command tool.
///
/// The command runs through `sh -c` in its own process group, cwd'd to the
/// workspace root. Stdout chunks are offered to the approval gate as
/// command_output asks: "yes" means stop (SIGINT to the whole group, since
/// dev-server commands fan out children), a typed message is piped to the
/// process's stdin. A SIGINT-caused exit is a normal termination whose result
/// text notes the process is no longer running; any other failure surfaces as
/// an error result.
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};

use crate::gate::{ApprovalGate, Response};
use crate::store::{AskKind, SayKind};

pub const INTERRUPT_NOTE: &str = "\n====\nUser terminated command process via SIGINT. \
This is not an error. Please continue with your task, but keep in mind that the command \
is no longer running. For example, if this command was used to start a server for a react \
app, the server is no longer running and you cannot open a browser to view it anymore.";

// ── Running-process registry ───────────────────────────────────────────────────

/// At most one live process group per task. Cleared on exit by any path;
/// `terminate` is the abort hook.
#[derive(Default)]
pub struct ProcessRegistry {
    pgid: Mutex<Option<i32>>,
}

impl ProcessRegistry {
    fn set(&self, pgid: i32) {
        *self.pgid.lock().unwrap() = Some(pgid);
    }

    fn clear(&self) {
        *self.pgid.lock().unwrap() = None;
    }

    pub fn is_running(&self) -> bool {
        self.pgid.lock().unwrap().is_some()
    }

    /// SIGTERM the whole process group, if any.
    pub fn terminate(&self) {
        if let Some(pgid) = *self.pgid.lock().unwrap() {
            signal_group(pgid, libc::SIGTERM);
        }
    }
}

fn signal_group(pgid: i32, signal: i32) {
    unsafe {
        libc::kill(-pgid, signal);
    }
}

// ── Execution ──────────────────────────────────────────────────────────────────

pub enum CommandResult {
    /// Formatted output text, or empty when output is suppressed.
    Success(String),
    /// Error text to hand back to the model.
    Failure(String),
}

/// Run an already-approved command to completion. `suppress_output` is the
/// attempt_completion variant: a completion command's output is not re-fed to
/// the model, only its failure (if any) is.
pub async fn run(
    gate: Arc<ApprovalGate>,
    registry: &ProcessRegistry,
    cwd: &Path,
    command: &str,
    suppress_output: bool,
) -> CommandResult {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let message = format!("Error executing command:\n{e}");
            let _ = gate.say(SayKind::Error, Some(message.clone()), None);
            return CommandResult::Failure(message);
        }
    };

    let pgid = child.id().map(|id| id as i32).unwrap_or(0);
    registry.set(pgid);

    let stdin = Arc::new(tokio::sync::Mutex::new(child.stdin.take()));
    let interrupted = Arc::new(AtomicBool::new(false));
    let output = Arc::new(Mutex::new(String::new()));
    let errors = Arc::new(Mutex::new(String::new()));

    let stdout_task = {
        let gate = gate.clone();
        let stdin = stdin.clone();
        let interrupted = interrupted.clone();
        let output = output.clone();
        let mut pipe = child.stdout.take();
        tokio::spawn(async move {
            let Some(pipe) = pipe.as_mut() else { return };
            let mut buf = [0u8; 4096];
            loop {
                match pipe.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        output.lock().unwrap().push_str(&chunk);
                        // Offered, not awaited: the listener keeps draining
                        // stdout while the user decides.
                        tokio::spawn(offer_chunk(
                            gate.clone(),
                            stdin.clone(),
                            interrupted.clone(),
                            pgid,
                            chunk,
                        ));
                    }
                }
            }
        })
    };

    let stderr_task = {
        let errors = errors.clone();
        let mut pipe = child.stderr.take();
        tokio::spawn(async move {
            let Some(pipe) = pipe.as_mut() else { return };
            let mut buf = [0u8; 4096];
            loop {
                match pipe.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => errors
                        .lock()
                        .unwrap()
                        .push_str(&String::from_utf8_lossy(&buf[..n])),
                }
            }
        })
    };

    let status = child.wait().await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    // Give in-flight chunk asks a moment to land so UI ordering holds.
    tokio::time::sleep(Duration::from_millis(100)).await;
    registry.clear();

    let was_interrupted = interrupted.load(Ordering::SeqCst) || exited_by_sigint(&status);

    let mut result = output.lock().unwrap().clone();
    if was_interrupted {
        let _ = gate.say(SayKind::CommandOutput, Some("\nUser exited command...".into()), None);
        result.push_str(INTERRUPT_NOTE);
    } else {
        let failed = match &status {
            Ok(s) => !s.success(),
            Err(_) => true,
        };
        if failed {
            let detail = match &status {
                Ok(s) => {
                    let stderr = errors.lock().unwrap().clone();
                    if stderr.trim().is_empty() {
                        format!("command exited with {s}")
                    } else {
                        stderr
                    }
                }
                Err(e) => e.to_string(),
            };
            let message = format!("Error executing command:\n{detail}");
            let _ = gate.say(SayKind::Error, Some(message.clone()), None);
            return CommandResult::Failure(message);
        }
    }

    if suppress_output {
        return CommandResult::Success(String::new());
    }
    CommandResult::Success(format!("Command Output:\n{result}"))
}

/// One stdout chunk's interaction loop. A "yes" stops the process group; a
/// typed message goes to stdin and the ask is re-armed with an empty
/// placeholder so the UI keeps the control visible without a redundant line.
/// Superseded or aborted asks end the loop silently.
async fn offer_chunk(
    gate: Arc<ApprovalGate>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    interrupted: Arc<AtomicBool>,
    pgid: i32,
    chunk: String,
) {
    if gate.auto_approves() {
        // A synthetic "yes" must not be read as an interrupt request; surface
        // the chunk as a notification instead of a prompt.
        let _ = gate.say(SayKind::CommandOutput, Some(chunk), None);
        return;
    }

    let mut line = chunk;
    loop {
        match gate.ask(AskKind::CommandOutput, Some(line)).await {
            Ok(outcome) if outcome.response == Response::Yes => {
                interrupted.store(true, Ordering::SeqCst);
                signal_group(pgid, libc::SIGINT);
                return;
            }
            Ok(outcome) => {
                if let Some(text) = outcome.text
                    && let Some(pipe) = stdin.lock().await.as_mut()
                {
                    let _ = pipe.write_all(format!("{text}\n").as_bytes()).await;
                    let _ = pipe.flush().await;
                }
                line = String::new();
            }
            Err(_) => return,
        }
    }
}

fn exited_by_sigint(status: &std::io::Result<std::process::ExitStatus>) -> bool {
    use std::os::unix::process::ExitStatusExt;
    matches!(status, Ok(s) if s.signal() == Some(libc::SIGINT))
}
