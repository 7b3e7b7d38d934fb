// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BlueChat Desktop console

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluechat_desktop::bluetooth::RfcommTransport;
use bluechat_desktop::config::Config;
use bluechat_desktop::storage::{ConversationStore, FileProfileStore, SqliteStore};
use bluechat_desktop::{ConnectEvent, Connector, MessageEvent, PrepareEvent};

const HELP: &str = "commands: connect <addr> | accept | reject | disconnect | \
                    send <text> | list | read <addr> | delete <addr> | quit";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bluechat_desktop=info".parse()?),
        )
        .init();

    info!("Starting BlueChat Desktop v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Initialize storage
    let store = Arc::new(SqliteStore::new(&config.data_dir)?);
    let profiles = Arc::new(FileProfileStore::new(&config.data_dir, config.default_profile())?);
    info!("Storage initialized in {:?}", config.data_dir);

    let transport = RfcommTransport::new(config.bluetooth.rfcomm_channel).await?;
    transport.set_name(&config.bluetooth.device_name).await?;

    let connector = Connector::spawn(transport, store, profiles, config.session());

    let _prepare = connector.subscribe_prepare(Arc::new(|event: &PrepareEvent| match event {
        PrepareEvent::Prepared => println!("* ready for connections"),
        PrepareEvent::Error(reason) => println!("* bluetooth unavailable: {}", reason),
    }));
    let _connect = connector.subscribe_connect(Arc::new(|event: &ConnectEvent| match event {
        ConnectEvent::ConnectedIn(c) => {
            println!("* {} ({}) wants to chat; accept or reject", c.display_name, c.address)
        }
        ConnectEvent::ConnectedOut(c) => println!("* connected to {}", c.display_name),
        other => println!("* {}", other.name()),
    }));
    let _messages = connector.subscribe_message(Arc::new(|event: &MessageEvent| match event {
        MessageEvent::Received(m) => println!("< {}", m.payload.preview()),
        MessageEvent::Failed(m) => println!("! not delivered: {}", m.payload.preview()),
        _ => {}
    }));

    connector.prepare().await?;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                if !run_command(&connector, line.trim()).await {
                    info!("Quit requested");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = connector.stop().await {
        warn!("Stop failed: {}", e);
    }
    info!("BlueChat Desktop stopped");
    Ok(())
}

/// Run one console command. Returns false on quit.
async fn run_command(connector: &Connector, line: &str) -> bool {
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    let result = match command {
        "" => Ok(()),
        "connect" if !argument.is_empty() => connector.connect(argument).await,
        "accept" => connector.accept_connection().await,
        "reject" => connector.reject_connection().await,
        "disconnect" => connector.send_disconnect_request().await,
        "send" => connector.send_message(argument).await.map(|_| ()),
        "list" => {
            list_conversations(connector.conversations().as_ref());
            Ok(())
        }
        "read" if !argument.is_empty() => {
            if let Err(e) = connector.mark_read(argument).await {
                error!("Failed to mark conversation read: {}", e);
            }
            Ok(())
        }
        "delete" if !argument.is_empty() => {
            if let Err(e) = connector.remove_conversation(argument).await {
                error!("Failed to delete conversation: {}", e);
            }
            Ok(())
        }
        "quit" | "exit" => return false,
        _ => {
            println!("{}", HELP);
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

fn list_conversations(store: &dyn ConversationStore) {
    match store.list_all_with_latest_message() {
        Ok(conversations) if conversations.is_empty() => println!("no conversations"),
        Ok(conversations) => {
            for (conversation, latest) in conversations {
                let marker = if conversation.unread { "*" } else { " " };
                let preview = latest.map(|m| m.payload.preview()).unwrap_or_default();
                println!(
                    "{} {:<20} {} {}",
                    marker, conversation.display_name, conversation.address, preview
                );
            }
        }
        Err(e) => error!("Failed to list conversations: {}", e),
    }
}
