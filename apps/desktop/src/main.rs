use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    types::escape_html, ChatSession, ClientError, ComposeDraft, HttpMessageStore, Notice,
    SessionEvent, WsConnector,
};
use futures::StreamExt;
use shared::domain::{ConversationId, MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::load_settings;

#[derive(Parser, Debug)]
#[command(about = "Terminal chat client")]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    /// Conversation to open right after the initial sync.
    #[arg(long)]
    conversation: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Open(ConversationId),
    Older,
    Read,
    Refresh,
    Search(String),
    Delete(MessageId),
    Quit,
    Text(String),
    Empty,
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Text(line.to_string());
    };

    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    match name {
        "open" => rest
            .parse()
            .map(|id| Input::Open(ConversationId(id)))
            .unwrap_or_else(|_| Input::Invalid("usage: /open <conversation id>".into())),
        "delete" => rest
            .parse()
            .map(|id| Input::Delete(MessageId(id)))
            .unwrap_or_else(|_| Input::Invalid("usage: /delete <message id>".into())),
        "search" if !rest.is_empty() => Input::Search(rest.to_string()),
        "search" => Input::Invalid("usage: /search <text>".into()),
        "older" => Input::Older,
        "read" => Input::Read,
        "refresh" => Input::Refresh,
        "quit" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command /{other}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if args.user_id.is_some() {
        settings.user_id = args.user_id;
    }
    let user_id = UserId(
        settings
            .user_id
            .context("no user id: pass --user-id or set APP__USER_ID")?,
    );

    let mut store = HttpMessageStore::new(settings.server_url.clone());
    if let Some(token) = &settings.auth_token {
        store = store.with_auth_token(token.clone());
    }
    let connector = WsConnector::for_server(&settings.server_url, user_id)?;
    let session = ChatSession::start(
        settings.engine_config(),
        user_id,
        Arc::new(connector),
        Arc::new(store),
    );
    let printer = tokio::spawn(print_events(session.event_stream()));

    session.connect().await?;
    for conversation in session.initial_sync().await? {
        println!(
            "#{} {} ({} unread)",
            conversation.id, conversation.display_name, conversation.unread_count
        );
    }

    let mut active = None;
    if let Some(id) = args.conversation {
        open(&session, ConversationId(id)).await?;
        active = Some(ConversationId(id));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let outcome = match parse_input(&line) {
            Input::Quit => break,
            Input::Empty => Ok(()),
            Input::Invalid(reason) => {
                eprintln!("{reason}");
                Ok(())
            }
            Input::Open(id) => {
                let opened = open(&session, id).await;
                if opened.is_ok() {
                    active = Some(id);
                }
                opened
            }
            Input::Refresh => session.refresh_conversations().await.map(|_| ()),
            Input::Delete(message_id) => session.delete_message(message_id).await,
            input => match active {
                Some(conversation_id) => {
                    run_in_conversation(&session, conversation_id, input).await
                }
                None => {
                    eprintln!("open a conversation first: /open <id>");
                    Ok(())
                }
            },
        };

        match outcome {
            Ok(()) => {}
            Err(ClientError::ConnectionLost { .. }) => break,
            Err(err) => eprintln!("error: {err}"),
        }
    }

    session.shutdown().await;
    printer.abort();
    Ok(())
}

async fn open(session: &ChatSession, conversation_id: ConversationId) -> Result<(), ClientError> {
    let loaded = session.select_conversation(conversation_id).await?;
    for message in session.messages(conversation_id).await? {
        println!("  {}: {}", message.sender_id, message.escaped_content());
    }
    debug!(conversation_id = conversation_id.0, loaded, "desktop: history loaded");
    session.mark_read(conversation_id).await
}

async fn run_in_conversation(
    session: &ChatSession,
    conversation_id: ConversationId,
    input: Input,
) -> Result<(), ClientError> {
    match input {
        Input::Text(text) => session
            .send(ComposeDraft::text(conversation_id, text))
            .await
            .map(|_| ()),
        Input::Older => {
            let added = session.load_older(conversation_id).await?;
            println!("loaded {added} older messages");
            Ok(())
        }
        Input::Read => session.mark_read(conversation_id).await,
        Input::Search(query) => {
            for hit in session.search_messages(conversation_id, &query).await? {
                println!(
                    "  [{:.2}] {}: {}",
                    hit.score,
                    hit.message.sender_id,
                    escape_html(&hit.message.content)
                );
            }
            Ok(())
        }
        other => {
            debug!(?other, "desktop: input not handled in a conversation");
            Ok(())
        }
    }
}

async fn print_events(mut events: BroadcastStream<SessionEvent>) {
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => render(&event),
            Err(err) => warn!("desktop: event feed lagged: {err}"),
        }
    }
}

fn render(event: &SessionEvent) {
    match event {
        SessionEvent::MessageInserted(message) => println!(
            "[#{}] {}: {}",
            message.conversation_id,
            message.sender_id,
            message.escaped_content()
        ),
        SessionEvent::MessageStatusChanged { key, status } => {
            debug!(?key, ?status, "desktop: delivery status changed");
        }
        SessionEvent::TypingChanged {
            conversation_id,
            user_ids,
        } if !user_ids.is_empty() => {
            let names: Vec<String> = user_ids.iter().map(ToString::to_string).collect();
            println!("[#{conversation_id}] typing: {}", names.join(", "));
        }
        SessionEvent::ConnectionChanged {
            status,
            reconnect_attempts,
        } => println!("connection: {status:?} (attempt {reconnect_attempts})"),
        SessionEvent::ConnectionLost { attempts } => {
            eprintln!("connection lost after {attempts} attempts; restart to continue")
        }
        SessionEvent::Notification(Notice::ProtocolError(fault)) => {
            eprintln!("server error: {fault}")
        }
        SessionEvent::Notification(Notice::UploadFailed {
            conversation_id,
            reason,
        }) => eprintln!("[#{conversation_id}] upload failed: {reason}"),
        _ => {}
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
