/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Connects to a relay as `RINGLINK_USER_ID` and logs what the change feed delivers.
//!
//!   dev_call_watch                 follow the feed
//!   dev_call_watch details <id>    print one call and exit
//!   dev_call_watch signals         print pending signals and exit

use ringlink_core::config::ClientConfig;
use ringlink_core::relay_client::RelayClient;
use ringlink_protocol::RelayEvent;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = match std::env::var("RINGLINK_CONFIG") {
        Ok(path) => ClientConfig::from_json_file(std::path::Path::new(&path))?,
        Err(_) => ClientConfig::from_env()?,
    };
    let client = RelayClient::new(&cfg)?;
    info!(user = %cfg.user_id, relay = %cfg.relay_base(), "watcher starting");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("details") => {
            let id = args.get(1).ok_or_else(|| anyhow::anyhow!("usage: dev_call_watch details <call_id>"))?;
            let details = client.call_details(Uuid::parse_str(id)?).await?;
            println!("{}", serde_json::to_string_pretty(&details)?);
            return Ok(());
        }
        Some("signals") => {
            let signals = client.poll_signals(0, 100).await?;
            println!("{}", serde_json::to_string_pretty(&signals)?);
            return Ok(());
        }
        Some(other) => anyhow::bail!("unknown command {other}"),
        None => {}
    }

    let cancel = CancellationToken::new();
    let mut feed = client.subscribe(0, cancel.clone());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = feed.recv() => {
                let Some(ev) = ev else { break };
                match &ev {
                    RelayEvent::Invitation(inv) => info!(call_id = %inv.call_id, caller = %inv.caller_id, "invitation"),
                    RelayEvent::CallState(c) => info!(call_id = %c.call_id, status = c.status.as_str(), "call state"),
                    RelayEvent::Signal(s) => info!(call_id = %s.call_id, seq = s.seq, kind = s.signal_type.as_str(), "signal"),
                    RelayEvent::Participant(p) => info!(call_id = %p.call_id, user = %p.user_id, status = p.status.as_str(), "participant"),
                }
            }
        }
    }
    cancel.cancel();
    info!("watcher stopped");
    Ok(())
}
