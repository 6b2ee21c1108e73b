/// pilot, an autonomous terminal coding agent with human-in-the-loop
/// approvals. This file is the outer shell: CLI parsing, config resolution,
/// and the terminal frontend that renders UI events and answers asks.
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

mod agent;
mod client;
mod command;
mod config;
mod cost;
mod gate;
mod recovery;
mod store;
mod task;
mod tools;
mod trim;

use crate::client::HttpClient;
use crate::config::{Overrides, Settings};
use crate::gate::{ApprovalGate, Response};
use crate::store::{AskKind, ConversationStore, SayKind, UiMessage, UiMessageType};
use crate::task::TaskContext;

#[derive(Parser, Debug)]
#[command(name = "pilot", version, about = "Autonomous coding agent for your terminal")]
struct Cli {
    /// The task to accomplish. Omit it and pass --resume to continue the most
    /// recent task.
    task: Option<String>,

    /// Resume the most recent persisted task.
    #[arg(long)]
    resume: bool,

    /// Configuration profile to use.
    #[arg(long)]
    profile: Option<String>,

    /// Model endpoint base URL.
    #[arg(long, env = "PILOT_ENDPOINT")]
    endpoint: Option<String>,

    /// Model identifier.
    #[arg(long, env = "PILOT_MODEL")]
    model: Option<String>,

    /// API key. Falls back to the profile's api_key_env variable.
    #[arg(long, env = "PILOT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Maximum model requests per task before asking to continue.
    #[arg(long)]
    max_requests: Option<u32>,

    /// Approve all asks automatically (unattended mode). Persisted.
    #[arg(long, short = 'y')]
    yes: bool,

    /// Require manual confirmation again (undoes --yes). Persisted.
    #[arg(long, conflicts_with = "yes")]
    confirm: bool,

    /// Let read-only tools (reads, listings, definition scans) run without
    /// asking; writes and commands still require approval. Persisted.
    #[arg(long)]
    allow_read_only: bool,

    /// Seed a fresh continuation task whenever one finishes. Persisted.
    #[arg(long)]
    auto_continue: bool,

    /// Working directory for the task (defaults to the current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Write the default config file and exit.
    #[arg(long)]
    init_config: bool,

    /// List persisted tasks and exit.
    #[arg(long)]
    tasks: bool,
}

enum NextRun {
    Fresh(String),
    Resume(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pilot=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.init_config {
        return init_config();
    }
    if cli.tasks {
        return print_tasks();
    }

    let config_file = config::load_config_file(&config::config_path())?;
    let resolved = config::resolve(
        &config_file,
        &Overrides {
            profile: cli.profile.clone(),
            endpoint: cli.endpoint.clone(),
            model: cli.model.clone(),
            api_key: cli.api_key.clone(),
            max_requests: cli.max_requests,
        },
    )?;

    let data_dir = store::data_dir();
    let mut settings = Settings::load(&data_dir);
    if cli.yes || cli.confirm || cli.allow_read_only || cli.auto_continue {
        if cli.yes {
            settings.require_manual_confirmation = false;
        }
        if cli.confirm {
            settings.require_manual_confirmation = true;
        }
        if cli.allow_read_only {
            settings.always_allow_read_only = true;
        }
        if cli.auto_continue {
            settings.auto_start_task = true;
        }
        settings.save(&data_dir)?;
    }

    let cwd = match cli.cwd {
        Some(dir) => dir
            .canonicalize()
            .with_context(|| format!("invalid working directory {}", dir.display()))?,
        None => std::env::current_dir()?,
    };

    let mut http = HttpClient::new(resolved.endpoint.clone(), resolved.model.clone());
    if let Some(key) = resolved.api_key.clone() {
        http.set_api_key(key);
    } else {
        tracing::warn!("no api key configured; requests will likely be rejected");
    }

    let tasks_root = store::tasks_root();
    let generation = Arc::new(AtomicU64::new(0));

    let mut next = if cli.resume {
        let (id, _) = store::list_tasks(&tasks_root)?
            .into_iter()
            .next()
            .context("no persisted tasks to resume")?;
        NextRun::Resume(id)
    } else {
        match cli.task.clone() {
            Some(task) => NextRun::Fresh(task),
            None => bail!("provide a task, or pass --resume"),
        }
    };

    loop {
        let store = match &next {
            NextRun::Fresh(_) => {
                let id = chrono::Utc::now().timestamp_millis().to_string();
                Arc::new(ConversationStore::create(&tasks_root, &id)?)
            }
            NextRun::Resume(id) => Arc::new(ConversationStore::load(&tasks_root, id)?),
        };

        let ctx = Arc::new(TaskContext::new(
            cwd.clone(),
            store.clone(),
            &settings,
            resolved.max_requests,
            resolved.custom_instructions.clone(),
            generation.clone(),
        ));

        let frontend = tokio::spawn(frontend_loop(ctx.gate.clone(), ctx.take_events()));
        let interrupt = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!();
                    tracing::info!("interrupt received, aborting task");
                    ctx.abort();
                }
            })
        };

        let result = match &next {
            NextRun::Fresh(task) => task::start_task(&ctx, &http, task, None).await,
            NextRun::Resume(_) => task::resume_task(&ctx, &http).await,
        };

        interrupt.abort();
        // let the frontend drain queued events before tearing it down
        tokio::time::sleep(Duration::from_millis(200)).await;
        frontend.abort();

        if let Err(e) = &result {
            eprintln!("task ended: {e:#}");
        }
        let totals = ctx.usage_totals();
        println!(
            "\ntokens: {} in / {} out (cache: {} written, {} read), cost: ${:.4}",
            totals.input_tokens,
            totals.output_tokens,
            totals.cache_write_tokens,
            totals.cache_read_tokens,
            totals.cost
        );

        if !settings.auto_start_task || result.is_err() {
            break;
        }
        match task::continuation_task(&store) {
            Some(seed) => next = NextRun::Fresh(seed),
            None => break,
        }
    }
    Ok(())
}

// ── Terminal frontend ──────────────────────────────────────────────────────────

/// Render every UI event; for asks in manual mode, read one line from stdin
/// and hand the interpretation back to the gate. A late answer to a
/// superseded ask is simply dropped by the gate.
async fn frontend_loop(gate: Arc<ApprovalGate>, mut events: mpsc::UnboundedReceiver<UiMessage>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(msg) = events.recv().await {
        match msg.kind {
            UiMessageType::Say => render_say(&msg),
            UiMessageType::Ask => {
                render_ask(&msg);
                if gate.auto_approves() {
                    continue;
                }
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                let (response, text) = interpret_answer(msg.ask, line.trim());
                gate.resolve(response, text, None);
            }
        }
    }
}

fn interpret_answer(kind: Option<AskKind>, line: &str) -> (Response, Option<String>) {
    match line {
        // for a running command, plain enter means "keep going"
        "" if kind == Some(AskKind::CommandOutput) => (Response::Message, None),
        "" | "y" | "yes" => (Response::Yes, None),
        "n" | "no" => (Response::No, None),
        other => (Response::Message, Some(other.to_string())),
    }
}

fn render_say(msg: &UiMessage) {
    let text = msg.text.as_deref().unwrap_or("");
    match msg.say {
        Some(SayKind::Task) => println!("task: {text}"),
        Some(SayKind::Text) => println!("\n{text}"),
        Some(SayKind::Error) => eprintln!("error: {text}"),
        Some(SayKind::CompletionResult) => println!("\n== completion ==\n{text}"),
        Some(SayKind::CommandOutput) => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        Some(SayKind::ApiReqStarted) => {
            println!("[request sent]");
        }
        Some(SayKind::ApiReqFinished) => {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(text) {
                println!(
                    "[tokens: {} in / {} out, ${:.4}]",
                    v["tokensIn"].as_u64().unwrap_or(0),
                    v["tokensOut"].as_u64().unwrap_or(0),
                    v["cost"].as_f64().unwrap_or(0.0)
                );
            }
        }
        Some(SayKind::ApiReqRetried) => println!("[retrying request]"),
        Some(SayKind::Tool) => println!("{text}"),
        Some(SayKind::UserFeedback) | None => {}
    }
}

fn render_ask(msg: &UiMessage) {
    let text = msg.text.as_deref().unwrap_or("");
    match msg.ask {
        Some(AskKind::Command) => {
            println!("\npilot wants to run:\n  $ {text}");
            prompt("approve? [y/n/feedback]");
        }
        Some(AskKind::CommandOutput) => {
            if !text.is_empty() {
                print!("{text}");
            }
            prompt("[enter: keep running | y: stop | text: send to stdin]");
        }
        Some(AskKind::Tool) => {
            render_tool_payload(text);
            prompt("approve? [y/n/feedback]");
        }
        Some(AskKind::Followup) => {
            println!("\npilot asks: {text}");
            prompt("answer");
        }
        Some(AskKind::CompletionResult) => {
            if !text.is_empty() {
                println!("\n== completion ==\n{text}");
            }
            prompt("accept? [y/feedback]");
        }
        Some(AskKind::ApiReqFailed) => {
            println!("\nrequest failed: {text}");
            prompt("retry? [y/n]");
        }
        Some(AskKind::RequestLimitReached) => {
            println!("\n{text}");
            prompt("continue? [y/n]");
        }
        Some(AskKind::ResumeTask) | Some(AskKind::ResumeCompletedTask) => {
            println!("\n{text}");
            prompt("resume? [y/n/new instructions]");
        }
        None => {}
    }
}

/// Tool asks carry a JSON payload describing the pending operation.
fn render_tool_payload(raw: &str) {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(raw) else {
        println!("{raw}");
        return;
    };
    let path = v["path"].as_str().unwrap_or("?");
    match v["tool"].as_str() {
        Some("readFile") => println!("\npilot wants to read {path}"),
        Some("editedExistingFile") => {
            println!("\npilot wants to edit {path}:\n{}", v["diff"].as_str().unwrap_or(""))
        }
        Some("newFileCreated") => {
            println!("\npilot wants to create {path}:\n{}", v["content"].as_str().unwrap_or(""))
        }
        Some("listFilesTopLevel") => println!("\npilot wants to list {path}"),
        Some("listFilesRecursive") => println!("\npilot wants to recursively list {path}"),
        Some("viewSourceCodeDefinitionsTopLevel") => {
            println!("\npilot wants to scan source definitions in {path}")
        }
        _ => println!("{raw}"),
    }
}

fn prompt(label: &str) {
    print!("{label} > ");
    let _ = std::io::stdout().flush();
}

// ── One-shot subcommand-ish flags ──────────────────────────────────────────────

fn init_config() -> Result<()> {
    let path = config::config_path();
    if path.exists() {
        bail!("config already exists at {}", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    std::fs::write(&path, config::DEFAULT_CONFIG_TOML)
        .with_context(|| format!("cannot write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn print_tasks() -> Result<()> {
    let tasks = store::list_tasks(&store::tasks_root())?;
    if tasks.is_empty() {
        println!("no persisted tasks");
        return Ok(());
    }
    for (id, _) in tasks {
        let store = ConversationStore::load(&store::tasks_root(), &id)?;
        let mut text = store.task_text().unwrap_or_default().replace('\n', " ");
        if text.chars().count() > 72 {
            text = format!("{}...", text.chars().take(72).collect::<String>());
        }
        println!("{id}  {text}");
    }
    Ok(())
}
