//! PeerCall Konsole
//!
//! Befehle (eine Zeile pro Befehl):
//! - `peers` - bekannte Peers anzeigen
//! - `call <id>` / `accept <id>` / `deny <id>` / `hangup <id>`
//! - `quit`

use anyhow::Context;
use peercall::{CallEvent, ClientConfig, ClientEvent, ClientHandle, Identity};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peercall::init_logging();

    let config = ClientConfig::from_env().context("invalid configuration")?;
    let client = peercall::connect(config)
        .await
        .context("failed to connect to signaling relay")?;

    println!("Your token: {}", client.identity());
    println!("Commands: peers | call <id> | accept <id> | deny <id> | hangup <id> | quit");

    spawn_printer(&client);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };

        if command == "quit" {
            break;
        }

        if let Err(e) = run_command(&client, command, parts.next()).await {
            println!("! {:#}", e);
        }
    }

    client.shutdown().await.context("shutdown failed")?;
    Ok(())
}

async fn run_command(
    client: &ClientHandle,
    command: &str,
    argument: Option<&str>,
) -> anyhow::Result<()> {
    if command == "peers" {
        let peers = client.roster().await?;
        if peers.is_empty() {
            println!("(no peers online)");
        }
        for peer in peers {
            println!("  {}", peer);
        }
        return Ok(());
    }

    let peer: Identity = argument
        .with_context(|| format!("usage: {} <id>", command))?
        .parse()?;

    match command {
        "call" => client.initiate_call(&peer).await?,
        "accept" => client.accept_incoming_call(&peer).await?,
        "deny" => client.deny_incoming_call(&peer).await?,
        "hangup" => client.hangup(&peer).await?,
        other => anyhow::bail!("unknown command '{}'", other),
    }
    Ok(())
}

/// Gibt Client- und Call-Events auf der Konsole aus
fn spawn_printer(client: &ClientHandle) {
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Some(event) = peercall::next_event(&mut events).await {
            match event {
                ClientEvent::Ready => println!("* connected"),
                ClientEvent::Disconnected { reason } => {
                    println!("* disconnected ({})", reason.unwrap_or_default())
                }
                ClientEvent::RosterChanged(peers) => println!("* {} peer(s) online", peers.len()),
            }
        }
    });

    let mut calls = client.subscribe_calls();
    tokio::spawn(async move {
        while let Some(event) = peercall::next_event(&mut calls).await {
            match event {
                CallEvent::IncomingCall { peer, .. } => {
                    println!("* incoming call from {} (accept {0} / deny {0})", peer)
                }
                CallEvent::StateChanged { peer, phase } => println!("* {}: {}", peer, phase),
                CallEvent::RemoteMedia { peer, tracks } => {
                    let kinds: Vec<String> = tracks.iter().map(|t| t.kind.to_string()).collect();
                    println!("* media from {}: {}", peer, kinds.join(", "))
                }
                CallEvent::Closed { peer, reason } => {
                    println!("* call with {} ended: {:?}", peer, reason)
                }
            }
        }
    });
}
