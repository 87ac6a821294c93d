//! Realtime chat terminal client - Entry Point
//!
//! Joins a channel, prints its messages as they change and sends every
//! line typed on stdin.
//!
//! Usage: `chat_sync [channel] [--local]`
//!
//! Commands: `/join <channel>`, `/delete <message-id>`, `/retry <message-id>`,
//! `/reconnect`, `/reload`, `/offline`, `/online`, `/quit`.

use std::env;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chat_sync::{
    ChatClient, ChatConfig, ConnectionState, Delivery, MemoryBackend, Message, MessageId, Services,
    StaticAuth, UserId,
};

/// Channel joined when none is given
const DEFAULT_CHANNEL: &str = "general";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_sync=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_sync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let local = args.iter().any(|a| a == "--local");
    let channel = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .cloned()
        .unwrap_or_else(|| DEFAULT_CHANNEL.to_string());

    let config = ChatConfig::from_env();
    let services = if local {
        info!("Using the in-memory backend");
        let user = config.user_id.unwrap_or_default();
        Services::in_memory(MemoryBackend::new(), StaticAuth::signed_in(user))
    } else {
        info!("Using backend at {}", config.backend_url);
        Services::remote(&config)?
    };

    let client = ChatClient::spawn(services, &config);
    tokio::spawn(print_updates(client.clone()));

    let identity = client.select_channel(&channel).await?;
    info!("Joined {}", identity);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = run_command(&client, line).await {
            warn!("{}", e);
        }
    }

    info!("Bye");
    Ok(())
}

async fn run_command(client: &ChatClient, line: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "/join" => {
            let identity = client.select_channel(arg).await?;
            println!("-- now in {}", identity);
        }
        "/delete" => client.delete_message(arg.parse::<MessageId>()?).await?,
        "/retry" => {
            client.retry_message(arg.parse::<MessageId>()?).await?;
        }
        "/reconnect" => print_connection(&client.reconnect().await?),
        "/reload" => client.reload_history().await?,
        "/offline" => print_connection(&client.network_changed(false).await?),
        "/online" => print_connection(&client.network_changed(true).await?),
        _ if command.starts_with('/') => println!("-- unknown command {}", command),
        _ => {
            client.notify_typing().await.ok();
            if let Err(failure) = client.send_message(line).await {
                error!("{}", failure);
                println!("-- {}", failure.error.user_message());
            }
        }
    }
    Ok(())
}

/// Reprint the channel whenever messages, typing or the connection change
async fn print_updates(client: ChatClient) {
    let mut views = client.views();
    loop {
        tokio::select! {
            changed = views.messages.changed() => {
                if changed.is_err() {
                    break;
                }
                let messages = views.messages.borrow_and_update().clone();
                print_messages(&messages);
            }
            changed = views.connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = views.connection.borrow_and_update().clone();
                print_connection(&state);
            }
            changed = views.typing.changed() => {
                if changed.is_err() {
                    break;
                }
                let typing = views.typing.borrow_and_update().clone();
                print_typing(&typing);
            }
        }
    }
}

fn print_messages(messages: &[Message]) {
    println!("----");
    for message in messages {
        let marker = match message.delivery {
            Delivery::Pending => " (sending)",
            Delivery::Failed => " (failed)",
            Delivery::Sent => "",
        };
        println!(
            "[{}] {}: {}{}  #{}",
            message.created_at.format("%H:%M"),
            message.display_name(),
            message.content,
            marker,
            message.id
        );
    }
}

fn print_connection(state: &ConnectionState) {
    if state.is_exhausted() {
        println!("-- offline, type /reconnect to try again");
    } else {
        println!("-- connection {:?}", state.phase);
    }
}

fn print_typing(users: &[UserId]) {
    match users.len() {
        0 => {}
        1 => println!("-- someone is typing..."),
        n => println!("-- {} people are typing...", n),
    }
}
