/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Fixed one-minute window rate limiting per client IP and bucket.

use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::Mutex;

use crate::config::RelayConfig;
use crate::ledger::now_ms;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bucket {
    Call,
    Subscribe,
    Admin,
}

impl Bucket {
    fn as_str(self) -> &'static str {
        match self {
            Bucket::Call => "call",
            Bucket::Subscribe => "subscribe",
            Bucket::Admin => "admin",
        }
    }

    pub fn per_minute(self, cfg: &RelayConfig) -> u32 {
        match self {
            Bucket::Call => cfg.rate_limit_call_per_min,
            Bucket::Subscribe => cfg.rate_limit_subscribe_per_min,
            Bucket::Admin => cfg.rate_limit_admin_per_min,
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    inner: Mutex<HashMap<String, WindowCounter>>,
}

#[derive(Clone, Copy)]
struct WindowCounter {
    window_start_ms: i64,
    count: u32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check(&self, ip: &str, bucket: Bucket, per_minute: u32) -> bool {
        self.check_at(ip, bucket, per_minute, now_ms()).await
    }

    async fn check_at(&self, ip: &str, bucket: Bucket, per_minute: u32, now: i64) -> bool {
        let key = format!("{}:{ip}", bucket.as_str());
        let mut map = self.inner.lock().await;

        // Bound memory: prune entries inactive for more than two minutes.
        if map.len() > 10_000 {
            let cutoff = now - 120_000;
            map.retain(|_, v| v.window_start_ms >= cutoff);
        }

        let win = map.entry(key).or_insert(WindowCounter {
            window_start_ms: now,
            count: 0,
        });
        if now - win.window_start_ms > 60_000 {
            win.window_start_ms = now;
            win.count = 0;
        }
        if win.count.saturating_add(1) > per_minute {
            return false;
        }
        win.count = win.count.saturating_add(1);
        true
    }
}

pub fn client_ip(cfg: &RelayConfig, peer: &SocketAddr, headers: &HeaderMap) -> String {
    if !cfg.trust_proxy_headers {
        return peer.ip().to_string();
    }

    // Only safe behind a reverse proxy that overwrites these headers.
    if let Some(ip) = headers
        .get("X-Real-IP")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_ip_str)
    {
        return ip;
    }
    if let Some(ip) = headers
        .get("Forwarded")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_forwarded_for_ip)
    {
        return ip;
    }
    if let Some(v) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = v.split(',').map(|s| s.trim()).find_map(parse_ip_str) {
            return ip;
        }
    }

    peer.ip().to_string()
}

fn parse_ip_str(s: &str) -> Option<String> {
    let s = s.trim().trim_matches('"');
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip.to_string());
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr.ip().to_string());
    }
    let s = s.trim_start_matches('[').trim_end_matches(']');
    s.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

fn parse_forwarded_for_ip(forwarded: &str) -> Option<String> {
    // Forwarded: for=...;proto=https;host=...
    for part in forwarded.split([';', ',']) {
        let part = part.trim();
        if !part.to_ascii_lowercase().starts_with("for=") {
            continue;
        }
        let raw = part.split_once('=')?.1.trim();
        return parse_ip_str(raw);
    }
    None
}
