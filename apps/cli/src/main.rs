use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use shared::domain::{ChatId, UserId};
use storage::Storage;
use sync_core::{
    load_config, CryptoGateway, EngineEvent, PassthroughCrypto, SealedCrypto, SessionIdentity,
    SyncEngine, WsTransport,
};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    username: String,
    /// Session token obtained from the login flow.
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value = "sqlite://./data/client.db")]
    database_url: String,
    /// Skip the message cipher (for plaintext development relays).
    #[arg(long)]
    plaintext: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sync_core=debug"));
    fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut config = load_config();
    if let Some(server_url) = args.server_url {
        config.server_url = server_url;
    }

    let storage = Storage::new(&args.database_url).await?;
    let user_id = UserId::from(args.user_id.as_str());
    storage.upsert_user(&user_id, &args.username, None).await?;

    let crypto: Arc<dyn CryptoGateway> = if args.plaintext {
        Arc::new(PassthroughCrypto)
    } else {
        Arc::new(SealedCrypto)
    };
    let identity = SessionIdentity {
        user_id,
        username: args.username,
        token: args.token,
    };
    let engine = SyncEngine::with_storage(
        config,
        identity,
        Arc::new(WsTransport),
        storage,
        crypto,
    );

    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::StateChanged(state) => println!("* session {state:?}"),
                EngineEvent::MessagePending { message } => println!("(sending) {}", message.content),
                EngineEvent::MessageReceived { message } => {
                    println!("[{}] {}: {}", message.chat_id, message.sender_id, message.content);
                }
                EngineEvent::MessageFailed { message_id, error } => {
                    println!("! send {message_id} failed: {error}");
                }
                EngineEvent::RoomJoined { chat_id } => println!("* joined {chat_id}"),
                EngineEvent::ReconcileSettled { unconfirmed } => {
                    println!("* membership reconciled ({unconfirmed} unconfirmed)");
                }
                EngineEvent::Typing {
                    chat_id,
                    user_id,
                    is_typing,
                } => {
                    if is_typing {
                        println!("* {user_id} is typing in {chat_id}");
                    }
                }
                EngineEvent::AuthFailed { reason } => println!("! authentication failed: {reason}"),
                EngineEvent::ConnectionLost => {
                    println!("! reconnect attempts exhausted, restart to reconnect");
                }
                EngineEvent::Error(error) => println!("! {error}"),
            }
        }
    });

    engine.connect().await?;

    // One send per line: `<chat-id> <message>`. Sends work while offline too;
    // they flush on the next ready session.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        let Some((chat, text)) = line.split_once(' ') else {
            println!("usage: <chat-id> <message> (or /quit)");
            continue;
        };
        let chat_id = ChatId::from(chat);
        if let Err(err) = engine.send_message(&chat_id, text).await {
            println!("! {err}");
        }
    }

    engine.disconnect().await;
    Ok(())
}
