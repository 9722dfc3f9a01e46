/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use uuid::Uuid;

#[derive(Clone, Debug, serde::Deserialize)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `https://relay.example.org`.
    pub relay_url: String,
    /// Bearer credential issued out of band for `user_id`.
    pub token: String,
    pub user_id: Uuid,
    /// STUN/TURN urls handed to the peer transport.
    pub ice_urls: Option<Vec<String>>,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
    pub http_timeout_secs: Option<u64>,
    /// Attempts for idempotent relay operations (1..=5).
    pub retry_attempts: Option<u32>,
    /// Upper bound for the subscription reconnect backoff.
    pub reconnect_max_secs: Option<u64>,
}

impl ClientConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: ClientConfig = serde_json::from_str(text).context("parse client config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_json(&text)
    }

    /// `RINGLINK_RELAY_URL`, `RINGLINK_TOKEN`, `RINGLINK_USER_ID` and optional
    /// `RINGLINK_ICE_URLS` (comma separated), `RINGLINK_ICE_USERNAME`, `RINGLINK_ICE_CREDENTIAL`.
    pub fn from_env() -> Result<Self> {
        let relay_url = required_env("RINGLINK_RELAY_URL")?;
        let token = required_env("RINGLINK_TOKEN")?;
        let user_id = Uuid::parse_str(&required_env("RINGLINK_USER_ID")?).context("RINGLINK_USER_ID invalid")?;
        let ice_urls = non_empty_env("RINGLINK_ICE_URLS").map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        });
        let cfg = ClientConfig {
            relay_url,
            token,
            user_id,
            ice_urls,
            ice_username: non_empty_env("RINGLINK_ICE_USERNAME"),
            ice_credential: non_empty_env("RINGLINK_ICE_CREDENTIAL"),
            http_timeout_secs: non_empty_env("RINGLINK_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            retry_attempts: None,
            reconnect_max_secs: None,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let url = self.relay_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow!("relay_url must be http(s): {url}"));
        }
        if self.token.trim().is_empty() {
            return Err(anyhow!("token is empty"));
        }
        Ok(())
    }

    pub fn relay_base(&self) -> String {
        self.relay_url.trim().trim_end_matches('/').to_string()
    }

    pub fn http_timeout_secs(&self) -> u64 {
        self.http_timeout_secs.unwrap_or(15).clamp(1, 120)
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.unwrap_or(3).clamp(1, 5)
    }

    pub fn reconnect_max_secs(&self) -> u64 {
        self.reconnect_max_secs.unwrap_or(30).clamp(1, 300)
    }
}

fn required_env(key: &str) -> Result<String> {
    non_empty_env(key).ok_or_else(|| anyhow!("{key} not set"))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
