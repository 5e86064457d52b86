//! Interactive terminal chat on top of the Duet conversation controller.

mod commands;

use anyhow::{Context, bail};
use clap::Parser;
use commands::{HELP, Input, SessionRef, SlashCommand, parse_input};
use duet_rs::{apply_env_api_keys, init_logging};
use duet_rs_config::DuetConfig;
use duet_rs_core::{
    ConversationController, EventBus, TurnOutcome, TurnStatus, build_adapters, build_state_store,
};
use duet_rs_protocol::{ChatSnapshot, DispatchMode, ImageRef, Message, Role, SessionId};
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// Command-line options for the chat client.
#[derive(Parser)]
#[command(name = "duet", version)]
struct Cli {
    /// Optional path to a duet.json5 config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Dispatch mode: `auto` or an adapter id
    #[arg(long)]
    mode: Option<String>,
    /// Context window size override
    #[arg(long)]
    window: Option<usize>,
    /// Keep sessions in memory only
    #[arg(long)]
    no_persist: bool,
}

/// Entry point for the Duet chat client.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    info!(
        "starting duet (config_set={}, mode_set={}, window_set={}, no_persist={})",
        cli.config.is_some(),
        cli.mode.is_some(),
        cli.window.is_some(),
        cli.no_persist
    );
    let mut config = if let Some(path) = cli.config.as_ref() {
        info!("loading config from path: {}", path.display());
        DuetConfig::load_from_path(path).context("failed to load config")?
    } else {
        let cwd = std::env::current_dir().context("cwd")?;
        info!("loading layered config from cwd: {}", cwd.display());
        let layered = DuetConfig::load_layered(&cwd).context("failed to load layered config")?;
        debug!("layered config loaded (layers={})", layered.layers.len());
        layered.config
    };
    apply_env_api_keys(&mut config);
    if let Some(mode) = cli.mode.as_ref() {
        config.dispatch.mode = mode.clone();
    }
    if let Some(window) = cli.window {
        config.context.window_size = window;
    }
    if cli.no_persist {
        config.sessions.enabled = false;
    }
    config.validate().context("invalid configuration")?;

    let adapters = build_adapters(&config).context("failed to build adapters")?;
    if adapters.is_empty() {
        bail!("no model configured: set GEMINI_API_KEY or HUGGINGFACE_API_KEY");
    }
    let store = build_state_store(&config.sessions).context("failed to open session store")?;
    let events = EventBus::default();
    spawn_event_logger(&events);
    let controller = ConversationController::from_config(&config, adapters, store)
        .context("failed to build controller")?
        .with_event_sink(Arc::new(events.clone()));
    controller
        .initialize()
        .await
        .context("failed to load sessions")?;

    println!(
        "duet ready (adapters: {}, mode: {}). /help for commands.",
        controller.adapter_ids().join(", "),
        controller.snapshot().mode
    );
    print_history(&controller.snapshot());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt(&controller.snapshot());
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let input = match parse_input(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };
        match handle_input(&controller, input).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(err) => println!("error: {err}"),
        }
    }

    controller.shutdown().await;
    info!("duet stopped");
    Ok(())
}

/// Log controller events; the prompt renders from snapshots instead.
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => debug!(
                    "controller event (session_id={}, payload={:?})",
                    event.session_id, event.payload
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("event logger lagged (skipped={})", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Handle one input line and return true when the client should exit.
async fn handle_input(controller: &ConversationController, input: Input) -> anyhow::Result<bool> {
    let command = match input {
        Input::Message(text) => {
            let outcome = controller.send_message(text, Vec::new()).await?;
            print_outcome(&outcome);
            return Ok(false);
        }
        Input::Command(command) => command,
    };
    match command {
        SlashCommand::Help => println!("{HELP}"),
        SlashCommand::Quit => return Ok(true),
        SlashCommand::New => {
            let session = controller.create_new_chat_session().await?;
            println!("started chat {}", session.id);
        }
        SlashCommand::Sessions => print_sessions(&controller.snapshot()),
        SlashCommand::Switch(target) => {
            let session_id = resolve_session(&controller.snapshot(), &target)?;
            controller.switch_to_chat_session(session_id).await?;
            print_history(&controller.snapshot());
        }
        SlashCommand::Delete(target) => {
            let session_id = resolve_session(&controller.snapshot(), &target)?;
            controller.delete_chat_session(session_id).await?;
            println!("deleted chat {session_id}");
        }
        SlashCommand::Rename(title) => {
            let session_id = active_session(&controller.snapshot())?;
            controller.rename_chat_session(session_id, &title).await?;
        }
        SlashCommand::Retry => {
            let outcome = controller.retry_last_message().await?;
            print_outcome(&outcome);
        }
        SlashCommand::Edit { index, text } => {
            let message_id = user_message(&controller.snapshot(), index)?.id;
            let outcome = controller.edit_message(message_id, text).await?;
            print_outcome(&outcome);
        }
        SlashCommand::Mode(mode) => {
            controller.set_dispatch_mode(mode.clone()).await?;
            match mode {
                DispatchMode::Auto => println!("mode: auto"),
                DispatchMode::Single(adapter_id) => println!("mode: {adapter_id} only"),
            }
        }
        SlashCommand::Image { path, text } => {
            if !path.is_file() {
                bail!("no such image: {}", path.display());
            }
            let outcome = controller
                .send_message(text, vec![ImageRef::file(path)])
                .await?;
            print_outcome(&outcome);
        }
        SlashCommand::History => print_history(&controller.snapshot()),
        SlashCommand::ClearError => controller.clear_error().await,
    }
    Ok(false)
}

fn resolve_session(snapshot: &ChatSnapshot, target: &SessionRef) -> anyhow::Result<SessionId> {
    match target {
        SessionRef::Id(id) => Ok(*id),
        SessionRef::Index(index) => snapshot
            .chat_sessions
            .get(index - 1)
            .map(|session| session.id)
            .with_context(|| format!("no chat at position {index}")),
    }
}

fn active_session(snapshot: &ChatSnapshot) -> anyhow::Result<SessionId> {
    snapshot
        .current_session
        .as_ref()
        .map(|session| session.id)
        .context("no active chat")
}

fn user_message(snapshot: &ChatSnapshot, index: usize) -> anyhow::Result<&Message> {
    snapshot
        .current_messages
        .iter()
        .filter(|message| message.role == Role::User)
        .nth(index - 1)
        .with_context(|| format!("no message of yours at position {index}"))
}

fn prompt(snapshot: &ChatSnapshot) {
    if let Some(error) = snapshot.error.as_deref() {
        println!("[!] {error}");
    }
    let title = snapshot
        .current_session
        .as_ref()
        .map(|session| session.title.as_str())
        .unwrap_or("-");
    print!("{title}> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn print_outcome(outcome: &TurnOutcome) {
    match &outcome.status {
        TurnStatus::Completed(message) => print_message(message),
        TurnStatus::Failed(message) => {
            print_message(message);
            println!("    (use /retry to try again)");
        }
        TurnStatus::Cancelled => println!("(turn cancelled)"),
    }
    if !outcome.persisted {
        println!("    (not saved yet; will retry on the next change)");
    }
}

fn print_message(message: &Message) {
    match message.role {
        Role::User => {
            let images = if message.image_refs.is_empty() {
                String::new()
            } else {
                format!(" [{} image(s)]", message.image_refs.len())
            };
            println!("you: {}{images}", message.text);
        }
        Role::Assistant if message.is_failed() => {
            println!(
                "assistant failed: {}",
                message.error.as_deref().unwrap_or("unknown error")
            );
        }
        Role::Assistant => {
            let model = message.model_used.as_deref().unwrap_or("?");
            println!("{model}: {}", message.text);
        }
    }
}

fn print_history(snapshot: &ChatSnapshot) {
    for message in &snapshot.current_messages {
        print_message(message);
    }
}

fn print_sessions(snapshot: &ChatSnapshot) {
    let active = snapshot.current_session.as_ref().map(|session| session.id);
    for (index, session) in snapshot.chat_sessions.iter().enumerate() {
        let marker = if Some(session.id) == active { "*" } else { " " };
        println!(
            "{marker}{:>3}. {} ({} messages, updated {}) {}",
            index + 1,
            session.title,
            session.message_count,
            session.last_updated_at.format("%Y-%m-%d %H:%M"),
            session.id
        );
    }
}
