/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod api;
mod config;
mod error;
mod feed;
mod ledger;
mod limiter;
mod notify;
mod service;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::AppState;
use crate::feed::ChangeFeed;
use crate::ledger::Ledger;
use crate::limiter::RateLimiter;
use crate::notify::{Bridges, FeedBridge, NotificationBridge, WebhookBridge};
use crate::service::CallService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().context("log directive")?),
        )
        .init();

    let cfg = Arc::new(config::load_config()?);
    let ledger = Ledger::open(&cfg.db_path, &cfg.db_synchronous, cfg.db_busy_timeout_ms)?;
    let feed = ChangeFeed::new(cfg.feed_capacity);

    let mut bridges: Vec<Arc<dyn NotificationBridge>> = vec![Arc::new(FeedBridge::new(feed.clone()))];
    if let Some(url) = cfg.webhook_url.clone() {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()
            .context("build http client")?;
        info!(%url, "notification webhook enabled");
        bridges.push(Arc::new(WebhookBridge::new(http, url, cfg.webhook_token.clone())));
    }
    let bridge: Arc<dyn NotificationBridge> = Arc::new(Bridges::new(bridges));

    let service = CallService::new(ledger.clone(), feed.clone(), bridge);
    let state = AppState {
        cfg: cfg.clone(),
        service: service.clone(),
        ledger: ledger.clone(),
        feed,
        limiter: Arc::new(RateLimiter::new()),
    };

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(run_sweeper(cfg.clone(), service, ledger, shutdown.clone()));

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    info!("ringlink_relay listening on http://{}", cfg.bind);

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
                _ = serve_shutdown.cancelled() => {}
            }
        })
        .await
        .context("serve")?;

    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}

/// Ring timeout and signal retention housekeeping.
async fn run_sweeper(
    cfg: Arc<config::RelayConfig>,
    service: CallService,
    ledger: Ledger,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.sweep_interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        if cfg.ring_timeout_secs > 0 {
            match service.sweep_unanswered(cfg.ring_timeout_secs).await {
                Ok(0) => {}
                Ok(n) => info!(missed = n, "unanswered calls expired"),
                Err(e) => error!("ring timeout sweep failed: {e}"),
            }
        }
        if cfg.signal_ttl_secs > 0 {
            match ledger.cleanup_signals(cfg.signal_ttl_secs).await {
                Ok(0) => {}
                Ok(n) => info!(deleted = n, "expired signals removed"),
                Err(e) => error!("signal cleanup failed: {e:#}"),
            }
        }
    }
}
