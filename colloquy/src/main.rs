//! Colloquy demo: drives one conversation against an in-process service.
//!
//! Lines typed on stdin are sent as user messages. Slash commands act on
//! the conversation or simulate the other side:
//!
//! ```text
//! /more             load the next older page
//! /catchup          fetch everything newer than the newest message
//! /resend           resend the newest failed message
//! /agent <text>     the agent answers
//! /typing           the agent starts typing
//! /read             acknowledge the newest agent message
//! /offline          drop the network
//! /online           bring the network back
//! /quit             exit
//! ```
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/colloquy/config.toml`).

use std::io;
use std::path::Path;
use std::sync::{Arc, Weak};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_appender::non_blocking::WorkerGuard;

use colloquy::chat::history::{FileStore, HistoryWarning, InMemoryStore, MessageStore};
use colloquy::chat::{ChatEvent, MessagesManager};
use colloquy::config::{CliArgs, ClientConfig};
use colloquy::reachability::{ConnectionObserver, PathStatus, ReachabilityMonitor};
use colloquy::transport::loopback::LoopbackService;
use colloquy_proto::message::{Message, MessageType, SendStatus};

type Manager<S> = MessagesManager<LoopbackService, S>;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(api_version = %config.api_version.path(), "colloquy starting");

    let result = match config.store_path.clone() {
        Some(path) => match FileStore::open(&path).await {
            Ok(store) => run(store, &config).await,
            Err(e) => {
                eprintln!(
                    "Warning: cannot open {}: {e}; keeping history in memory",
                    path.display()
                );
                run(InMemoryStore::new(), &config).await
            }
        },
        None => run(InMemoryStore::new(), &config).await,
    };

    tracing::info!("colloquy exiting");
    result
}

/// Initialize file-based logging.
///
/// Logs go to a file so they don't interleave with the conversation on
/// stdout. The returned [`WorkerGuard`] must be held until shutdown.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("colloquy.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

struct ConnectionPrinter;

impl ConnectionObserver for ConnectionPrinter {
    fn did_update_connection(&self, connected: bool) {
        println!("* {}", if connected { "online" } else { "offline" });
    }
}

async fn run<S: MessageStore + 'static>(store: S, config: &ClientConfig) -> io::Result<()> {
    let service = Arc::new(LoopbackService::new(config.api_version));
    service.set_agent(1, "Ada");
    service.set_welcome(Some("Welcome! An agent will be with you shortly.".to_string()));
    service.push_agent_message("Hello, how can I help?", now_secs());

    let (path_tx, monitor) = ReachabilityMonitor::channel(PathStatus::Satisfied);
    let monitor = Arc::new(monitor);
    let printer = Arc::new(ConnectionPrinter);
    let weak: Weak<ConnectionPrinter> = Arc::downgrade(&printer);
    monitor.set_delegate(weak);
    monitor.start();

    let (manager, mut events, mut warnings) = MessagesManager::new(
        Arc::clone(&service),
        store,
        Arc::clone(&monitor),
        config.chat_config(),
    );
    let manager = Arc::new(manager);

    match manager.load_cached_data().await {
        Ok(n) if n > 0 => println!("* restored {n} messages"),
        Ok(_) => {}
        Err(e) => eprintln!("Warning: cached history unavailable: {e}"),
    }
    if let Err(e) = manager.handle_load_messages().await {
        println!("* initial load failed: {e}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(line.trim(), &manager, &service, &path_tx).await {
                    break;
                }
            }
            Some(event) = events.recv() => print_event(&event),
            Some(warning) = warnings.recv() => print_warning(&warning),
        }
    }

    let retried = manager.history().flush_pending().await;
    if retried > 0 {
        tracing::info!(retried, "flushed queued history writes");
    }
    monitor.stop();
    drain(&mut events, &mut warnings);
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line<S: MessageStore + 'static>(
    line: &str,
    manager: &Arc<Manager<S>>,
    service: &LoopbackService,
    path: &watch::Sender<PathStatus>,
) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return false,
        "/more" => match manager.handle_load_more().await {
            Ok(Some(outcome)) => println!("* {} older messages", outcome.added),
            Ok(None) => println!("* nothing older"),
            Err(e) => println!("* load failed: {e}"),
        },
        "/catchup" => match manager.handle_catch_up().await {
            Ok(outcome) => println!("* {} new messages", outcome.added),
            Err(e) => println!("* catch-up failed: {e}"),
        },
        "/resend" => {
            let failed = manager
                .messages()
                .await
                .into_iter()
                .find(|m| m.send_status == SendStatus::Failed)
                .and_then(|m| m.local_id);
            match failed {
                Some(id) => report_send(manager.resend(id).await),
                None => println!("* nothing to resend"),
            }
        }
        "/agent" => {
            let id = service.push_agent_message(rest, now_secs());
            if let Some(message) = service.pushed(id) {
                manager.handle_new_message(message).await;
            }
        }
        "/typing" => manager.handle_agent_began_typing().await,
        "/read" => {
            let newest_agent = manager
                .messages()
                .await
                .into_iter()
                .find(|m| m.message_type == MessageType::Agent)
                .and_then(|m| m.remote_id);
            if let Some(id) = newest_agent {
                manager.handle_message_read(id).await;
            }
        }
        "/offline" => {
            service.set_offline(true);
            let _ = path.send(PathStatus::Unsatisfied);
        }
        "/online" => {
            service.set_offline(false);
            let _ = path.send(PathStatus::Satisfied);
        }
        _ => {
            manager.user_did_type();
            report_send(manager.send_message(line).await);
        }
    }
    true
}

fn report_send(result: Result<Message, colloquy::chat::ChatError>) {
    match result {
        Ok(message) if message.send_status == SendStatus::Failed => {
            println!("* not delivered, /resend to try again");
        }
        Ok(_) => {}
        Err(e) => println!("* {e}"),
    }
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::SetSections(sections) => {
            for section in sections {
                println!("--- {} ---", section.day);
                for message in &section.messages {
                    println!("{}", render(message));
                }
            }
        }
        ChatEvent::Add { message, .. } => println!("{}", render(message)),
        ChatEvent::Update { message, .. } => println!("~ {}", render(message)),
        ChatEvent::AgentTyping(true) => println!("* agent is typing..."),
        ChatEvent::AgentTyping(false) => {}
        ChatEvent::Loading { older, active } => {
            tracing::debug!(older, active, "loading");
        }
        ChatEvent::Sticky(Some(text)) => println!("[pinned] {text}"),
        ChatEvent::Welcome(Some(text)) => println!("[welcome] {text}"),
        ChatEvent::Sticky(None) | ChatEvent::Welcome(None) => {}
        ChatEvent::QuickReplies(Some(replies)) => println!("[replies] {}", replies.join(" | ")),
        ChatEvent::QuickReplies(None) => {}
        ChatEvent::Notice(text) => println!("! {text}"),
    }
}

fn print_warning(warning: &HistoryWarning) {
    eprintln!("Warning: history write failed: {warning:?}");
}

fn drain(events: &mut mpsc::Receiver<ChatEvent>, warnings: &mut mpsc::Receiver<HistoryWarning>) {
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    while let Ok(warning) = warnings.try_recv() {
        print_warning(&warning);
    }
}

fn render(message: &Message) -> String {
    let who = match message.message_type {
        MessageType::User => "you",
        MessageType::Agent => "agent",
        _ => "system",
    };
    let status = match message.send_status {
        SendStatus::Pending => " (sending)",
        SendStatus::Failed => " (failed)",
        SendStatus::Success => "",
    };
    let body = message.message.as_deref().unwrap_or("[attachment]");
    format!(
        "{} {who}: {body}{status}",
        message.time.to_datetime().format("%H:%M")
    )
}

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}
