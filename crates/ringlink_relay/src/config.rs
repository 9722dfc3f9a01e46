/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub db_synchronous: String,
    pub db_busy_timeout_ms: u64,
    pub admin_token: Option<String>,
    pub trust_proxy_headers: bool,
    pub max_body_bytes: usize,
    pub rate_limit_call_per_min: u32,
    pub rate_limit_subscribe_per_min: u32,
    pub rate_limit_admin_per_min: u32,
    /// Calls left `ringing` longer than this become `missed`. 0 disables the sweep.
    pub ring_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Retention for `call_signals` rows. 0 keeps them forever.
    pub signal_ttl_secs: u64,
    pub feed_capacity: usize,
    /// How far back a (re)connecting or lagged subscriber is told about finished calls.
    pub resync_window_secs: u64,
    pub poll_limit_max: u32,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub http_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8790)),
            db_path: PathBuf::from("ringlink_relay.db"),
            db_synchronous: "NORMAL".to_string(),
            db_busy_timeout_ms: 5_000,
            admin_token: None,
            trust_proxy_headers: false,
            max_body_bytes: 256 * 1024,
            rate_limit_call_per_min: 600,
            rate_limit_subscribe_per_min: 60,
            rate_limit_admin_per_min: 30,
            ring_timeout_secs: 45,
            sweep_interval_secs: 10,
            signal_ttl_secs: 0,
            feed_capacity: 1024,
            resync_window_secs: 3_600,
            poll_limit_max: 200,
            webhook_url: None,
            webhook_token: None,
            http_timeout_secs: 10,
        }
    }
}

pub fn load_config() -> Result<RelayConfig> {
    let d = RelayConfig::default();
    let bind = match std::env::var("RINGLINK_RELAY_BIND") {
        Ok(v) => v.parse::<SocketAddr>().context("RINGLINK_RELAY_BIND invalid")?,
        Err(_) => d.bind,
    };
    let db_path = std::env::var("RINGLINK_RELAY_DB")
        .map(PathBuf::from)
        .unwrap_or(d.db_path);
    let db_synchronous = std::env::var("RINGLINK_RELAY_DB_SYNCHRONOUS")
        .ok()
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| matches!(s.as_str(), "OFF" | "NORMAL" | "FULL" | "EXTRA"))
        .unwrap_or(d.db_synchronous);
    let admin_token = non_empty_env("RINGLINK_RELAY_ADMIN_TOKEN");
    let trust_proxy_headers = std::env::var("RINGLINK_RELAY_TRUST_PROXY_HEADERS")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let webhook_url = non_empty_env("RINGLINK_RELAY_WEBHOOK_URL").map(|s| s.trim_end_matches('/').to_string());
    let webhook_token = non_empty_env("RINGLINK_RELAY_WEBHOOK_TOKEN");

    Ok(RelayConfig {
        bind,
        db_path,
        db_synchronous,
        db_busy_timeout_ms: env_or("RINGLINK_RELAY_DB_BUSY_TIMEOUT_MS", d.db_busy_timeout_ms).clamp(100, 60_000),
        admin_token,
        trust_proxy_headers,
        max_body_bytes: env_or("RINGLINK_RELAY_MAX_BODY_BYTES", d.max_body_bytes).max(64 * 1024),
        rate_limit_call_per_min: env_or("RINGLINK_RELAY_RATE_LIMIT_CALL_PER_MIN", d.rate_limit_call_per_min).max(1),
        rate_limit_subscribe_per_min: env_or(
            "RINGLINK_RELAY_RATE_LIMIT_SUBSCRIBE_PER_MIN",
            d.rate_limit_subscribe_per_min,
        )
        .max(1),
        rate_limit_admin_per_min: env_or("RINGLINK_RELAY_RATE_LIMIT_ADMIN_PER_MIN", d.rate_limit_admin_per_min).max(1),
        ring_timeout_secs: env_or("RINGLINK_RELAY_RING_TIMEOUT_SECS", d.ring_timeout_secs),
        sweep_interval_secs: env_or("RINGLINK_RELAY_SWEEP_INTERVAL_SECS", d.sweep_interval_secs).max(1),
        signal_ttl_secs: env_or("RINGLINK_RELAY_SIGNAL_TTL_SECS", d.signal_ttl_secs),
        feed_capacity: env_or("RINGLINK_RELAY_FEED_CAPACITY", d.feed_capacity).clamp(16, 65_536),
        resync_window_secs: env_or("RINGLINK_RELAY_RESYNC_WINDOW_SECS", d.resync_window_secs).clamp(60, 7 * 86_400),
        poll_limit_max: env_or("RINGLINK_RELAY_POLL_LIMIT_MAX", d.poll_limit_max).clamp(1, 1_000),
        webhook_url,
        webhook_token,
        http_timeout_secs: env_or("RINGLINK_RELAY_HTTP_TIMEOUT_SECS", d.http_timeout_secs).clamp(1, 120),
    })
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
