use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{ArgGroup, Parser, Subcommand};
use forum_chat_core::api::{HttpChatService, SendDestination, SendRequest};
use forum_chat_core::transport::{
    Inbound, ReconnectPolicy, Transport, TransportConfig, TransportEvent,
};
use forum_chat_core::{
    ChatService, ContentKind, Conversation, ConversationId, ConversationKind, Message, UserId,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "forumchat")]
#[command(about = "Forum chat CLI for poking a live chat service")]
struct Cli {
    /// REST base URL of the chat service
    #[arg(long, env = "FORUMCHAT_API_URL", default_value = "https://forum.example.com/api")]
    api_url: String,

    /// WebSocket endpoint (userId is appended)
    #[arg(long, env = "FORUMCHAT_WS_URL", default_value = "wss://forum.example.com/ws")]
    ws_url: String,

    /// Bearer token for both REST and the WebSocket upgrade
    #[arg(long, env = "FORUMCHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Acting user id
    #[arg(long, env = "FORUMCHAT_USER")]
    user: Option<String>,

    /// HTTP timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the user's conversations
    Conversations,

    /// Fetch one page of a conversation's history (newest first)
    Messages {
        #[arg(long)]
        conversation: String,

        /// Page number, starting at 1
        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 30)]
        limit: u32,
    },

    /// Send a message to a conversation, a user or a group
    #[command(group(
        ArgGroup::new("destination")
            .required(true)
            .args(["conversation", "to", "group"]),
    ))]
    Send {
        #[arg(long)]
        conversation: Option<String>,

        /// Recipient user id; the service creates the conversation if needed
        #[arg(long)]
        to: Option<String>,

        #[arg(long)]
        group: Option<String>,

        #[arg(long, default_value = "")]
        text: String,

        /// text | image | video | file
        #[arg(long, default_value = "text")]
        kind: String,

        /// Attachment URL (repeatable)
        #[arg(long)]
        resource: Vec<String>,
    },

    /// Mark a conversation as read
    MarkRead {
        #[arg(long)]
        conversation: String,
    },

    /// Soft-delete a message
    Delete {
        #[arg(long)]
        message: String,
    },

    /// Print normalized inbound frames as JSON lines (runs until --timeout)
    Listen {
        /// Timeout in seconds (0 = run forever)
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.cmd {
        Command::Conversations => cmd_conversations(&cli).await,
        Command::Messages {
            conversation,
            page,
            limit,
        } => cmd_messages(&cli, conversation, *page, *limit).await,
        Command::Send {
            conversation,
            to,
            group,
            text,
            kind,
            resource,
        } => {
            let destination = match (conversation, to, group) {
                (Some(id), _, _) => SendDestination::Conversation(ConversationId::new(id.trim())),
                (_, Some(user), _) => SendDestination::User(UserId::new(user.trim())),
                (_, _, Some(group)) => SendDestination::Group(group.trim().to_string()),
                _ => return Err(anyhow!("one of --conversation, --to or --group is required")),
            };
            cmd_send(&cli, destination, text, kind, resource).await
        }
        Command::MarkRead { conversation } => cmd_mark_read(&cli, conversation).await,
        Command::Delete { message } => cmd_delete(&cli, message).await,
        Command::Listen { timeout } => cmd_listen(&cli, *timeout).await,
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn service(cli: &Cli) -> anyhow::Result<HttpChatService> {
    HttpChatService::new(
        &cli.api_url,
        cli.token.clone(),
        Duration::from_secs(cli.timeout_secs.max(1)),
    )
    .context("create http client")
}

fn require_user(cli: &Cli) -> anyhow::Result<UserId> {
    cli.user
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(UserId::new)
        .ok_or_else(|| anyhow!("--user (or FORUMCHAT_USER) is required"))
}

fn print(v: serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(&v).unwrap_or_else(|_| v.to_string())
    );
}

fn message_json(m: &Message) -> serde_json::Value {
    json!({
        "id": m.id.to_string(),
        "conversation_id": m.conversation_id,
        "from_user_id": m.from_user_id,
        "kind": m.kind,
        "text": m.body.text,
        "resource_urls": m.body.resource_urls,
        "created_at": m.created_at.to_rfc3339(),
    })
}

fn conversation_json(c: &Conversation) -> serde_json::Value {
    let kind = match &c.kind {
        ConversationKind::Private => "private",
        ConversationKind::Group { .. } => "group",
        ConversationKind::Assistant => "assistant",
    };
    json!({
        "id": c.id,
        "kind": kind,
        "group_id": c.group_id(),
        "title": c.title,
        "participant_ids": c.participant_ids,
        "unread_count": c.unread_count,
        "last_message": c.last_message.as_ref().map(|p| json!({
            "text": p.text,
            "at": p.at.to_rfc3339(),
            "message_id": p.message_id,
        })),
    })
}

fn inbound_json(inbound: &Inbound) -> serde_json::Value {
    match inbound {
        Inbound::Message(env) => json!({
            "type": "message",
            "id": env.id,
            "conversation_id": env.conversation_id,
            "from_user_id": env.from_user_id,
            "kind": env.kind,
            "text": env.message,
            "resource_urls": env.resource_urls,
            "created_at": env.created_at.to_rfc3339(),
        }),
        Inbound::Deleted(notice) => json!({
            "type": "message-deleted",
            "conversation_id": notice.conversation_id,
            "message_id": notice.message_id,
            "is_latest": notice.is_latest,
        }),
        Inbound::MarkedRead {
            conversation_id,
            viewer_id,
        } => json!({
            "type": "conversation-marked-read",
            "conversation_id": conversation_id,
            "viewer_id": viewer_id,
        }),
        Inbound::Opaque(raw) => json!({
            "type": "opaque",
            "raw": raw,
        }),
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

async fn cmd_conversations(cli: &Cli) -> anyhow::Result<()> {
    let conversations = service(cli)?
        .conversations()
        .await
        .context("fetch conversations")?;
    print(json!({
        "conversations": conversations.iter().map(conversation_json).collect::<Vec<_>>(),
    }));
    Ok(())
}

async fn cmd_messages(cli: &Cli, conversation: &str, page: u32, limit: u32) -> anyhow::Result<()> {
    let conversation_id = ConversationId::new(conversation.trim());
    let page = service(cli)?
        .messages(&conversation_id, page.max(1), limit.max(1))
        .await
        .with_context(|| format!("fetch messages of {conversation_id}"))?;
    print(json!({
        "conversation_id": conversation_id,
        "page": page.page,
        "limit": page.limit,
        "has_more": page.has_more,
        "messages": page.messages.iter().map(message_json).collect::<Vec<_>>(),
    }));
    Ok(())
}

async fn cmd_send(
    cli: &Cli,
    destination: SendDestination,
    text: &str,
    kind: &str,
    resources: &[String],
) -> anyhow::Result<()> {
    if text.trim().is_empty() && resources.is_empty() {
        return Err(anyhow!("nothing to send: give --text or --resource"));
    }
    let kind = ContentKind::parse(kind);
    if kind == ContentKind::Deleted {
        return Err(anyhow!("cannot send a deleted message"));
    }
    let request = SendRequest::new(destination, text.to_string(), kind, resources.to_vec());
    let message = service(cli)?
        .send_message(request)
        .await
        .context("send message")?;
    print(message_json(&message));
    Ok(())
}

async fn cmd_mark_read(cli: &Cli, conversation: &str) -> anyhow::Result<()> {
    let conversation_id = ConversationId::new(conversation.trim());
    service(cli)?
        .mark_as_read(&conversation_id)
        .await
        .with_context(|| format!("mark {conversation_id} as read"))?;
    print(json!({ "conversation_id": conversation_id, "marked_read": true }));
    Ok(())
}

async fn cmd_delete(cli: &Cli, message: &str) -> anyhow::Result<()> {
    let message_id = message.trim();
    service(cli)?
        .delete_message(message_id)
        .await
        .with_context(|| format!("delete message {message_id}"))?;
    print(json!({ "message_id": message_id, "deleted": true }));
    Ok(())
}

async fn cmd_listen(cli: &Cli, timeout: u64) -> anyhow::Result<()> {
    let config = TransportConfig {
        ws_url: cli.ws_url.clone(),
        viewer_id: require_user(cli)?,
        token: cli.token.clone(),
        policy: ReconnectPolicy::default(),
    };
    let endpoint = config.endpoint().context("websocket url")?;
    tracing::info!(%endpoint, "listening");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<TransportEvent>();
    let transport = Transport::new(
        config,
        tokio::runtime::Handle::current(),
        Arc::new(move |event: TransportEvent| {
            let _ = tx.send(event);
        }),
    );
    transport.connect();

    let deadline =
        (timeout > 0).then(|| tokio::time::Instant::now() + Duration::from_secs(timeout));
    loop {
        let event = match deadline {
            Some(dl) => match tokio::time::timeout_at(dl, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => break, // timeout
            },
            None => match rx.recv().await {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            TransportEvent::Frame(inbound) => println!("{}", inbound_json(&inbound)),
            TransportEvent::Error { message } => tracing::warn!(%message, "transport error"),
            TransportEvent::CircuitOpen { failures, .. } => {
                tracing::warn!(failures, "too many failed connection attempts");
            }
            other => tracing::info!(event = ?other, "transport"),
        }
    }

    transport.disconnect();
    Ok(())
}
