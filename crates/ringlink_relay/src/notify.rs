/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Notification bridge: where "invitation created" and "call state changed" go.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ringlink_http::{send_retrying, Backoff};
use ringlink_protocol::{CallStateChanged, InvitationEvent, RelayEvent};
use std::sync::Arc;
use tracing::warn;

use crate::feed::ChangeFeed;

#[async_trait]
pub trait NotificationBridge: Send + Sync {
    async fn invitation_created(&self, invitee: &str, ev: &InvitationEvent) -> Result<()>;
    async fn call_state_changed(&self, participants: &[String], ev: &CallStateChanged) -> Result<()>;
}

/// Pushes both events to connected clients through the change feed.
pub struct FeedBridge {
    feed: ChangeFeed,
}

impl FeedBridge {
    pub fn new(feed: ChangeFeed) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl NotificationBridge for FeedBridge {
    async fn invitation_created(&self, invitee: &str, ev: &InvitationEvent) -> Result<()> {
        self.feed
            .publish(vec![invitee.to_string()], RelayEvent::Invitation(ev.clone()));
        Ok(())
    }

    async fn call_state_changed(&self, participants: &[String], ev: &CallStateChanged) -> Result<()> {
        self.feed
            .publish(participants.to_vec(), RelayEvent::CallState(ev.clone()));
        Ok(())
    }
}

/// Forwards events to an external push service. Delivery runs in the background so a
/// slow or failing endpoint never holds up the call operation.
pub struct WebhookBridge {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookBridge {
    pub fn new(http: reqwest::Client, url: String, token: Option<String>) -> Self {
        Self { http, url, token }
    }

    fn post_in_background(&self, body: serde_json::Value) {
        let http = self.http.clone();
        let url = self.url.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let res = send_retrying(
                || {
                    let req = http.post(&url).json(&body);
                    match &token {
                        Some(t) => req.bearer_auth(t),
                        None => req,
                    }
                },
                3,
                Backoff::default(),
            )
            .await;
            match res {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(%url, status = %resp.status(), "notification webhook rejected event"),
                Err(e) => warn!(%url, "notification webhook failed: {e:#}"),
            }
        });
    }
}

#[async_trait]
impl NotificationBridge for WebhookBridge {
    async fn invitation_created(&self, invitee: &str, ev: &InvitationEvent) -> Result<()> {
        self.post_in_background(serde_json::json!({
            "kind": "invitation",
            "to_user_id": invitee,
            "invitation": ev,
        }));
        Ok(())
    }

    async fn call_state_changed(&self, participants: &[String], ev: &CallStateChanged) -> Result<()> {
        self.post_in_background(serde_json::json!({
            "kind": "call_state",
            "participants": participants,
            "change": ev,
        }));
        Ok(())
    }
}

/// Fans out to every configured bridge; one failing bridge does not stop the others.
pub struct Bridges {
    inner: Vec<Arc<dyn NotificationBridge>>,
}

impl Bridges {
    pub fn new(inner: Vec<Arc<dyn NotificationBridge>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl NotificationBridge for Bridges {
    async fn invitation_created(&self, invitee: &str, ev: &InvitationEvent) -> Result<()> {
        let mut failed = 0usize;
        for b in &self.inner {
            if let Err(e) = b.invitation_created(invitee, ev).await {
                warn!(call_id=%ev.call_id, "invitation bridge failed: {e:#}");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(anyhow!("{failed} notification bridge(s) failed"));
        }
        Ok(())
    }

    async fn call_state_changed(&self, participants: &[String], ev: &CallStateChanged) -> Result<()> {
        let mut failed = 0usize;
        for b in &self.inner {
            if let Err(e) = b.call_state_changed(participants, ev).await {
                warn!(call_id=%ev.call_id, "call state bridge failed: {e:#}");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(anyhow!("{failed} notification bridge(s) failed"));
        }
        Ok(())
    }
}
