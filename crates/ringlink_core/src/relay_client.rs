/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ringlink_http::{send_retrying, Backoff};
use ringlink_protocol::{
    CallDetailsResponse, CallKind, CreateCallResponse, ErrorBody, ErrorCategory, RelayEvent, RelayRequest,
    SendSignalResponse, SignalRecord, SignalType, SignalsPollResponse,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;

#[derive(Debug, thiserror::Error)]
pub enum RelayClientError {
    #[error("authentication failed")]
    Unauthenticated,
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("resource not found")]
    NotFound,
    #[error("temporarily unavailable")]
    Unavailable,
    #[error("relay unreachable: {0:#}")]
    Transport(#[from] anyhow::Error),
}

impl From<ErrorCategory> for RelayClientError {
    fn from(c: ErrorCategory) -> Self {
        match c {
            ErrorCategory::AuthenticationFailed => RelayClientError::Unauthenticated,
            ErrorCategory::InvalidParameters => RelayClientError::InvalidParameters,
            ErrorCategory::NotFound => RelayClientError::NotFound,
            ErrorCategory::Unavailable => RelayClientError::Unavailable,
        }
    }
}

pub type RelayClientResult<T> = std::result::Result<T, RelayClientError>;

/// The five relay operations, as seen by a session.
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn create_call(
        &self,
        kind: CallKind,
        target_user_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> RelayClientResult<CreateCallResponse>;
    async fn join_call(&self, call_id: Uuid) -> RelayClientResult<()>;
    async fn send_signal(
        &self,
        call_id: Uuid,
        target_user_id: Uuid,
        signal_type: SignalType,
        signal_data: serde_json::Value,
    ) -> RelayClientResult<SendSignalResponse>;
    async fn end_call(&self, call_id: Uuid) -> RelayClientResult<()>;
    async fn reject_call(&self, call_id: Uuid) -> RelayClientResult<()>;
}

#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base: String,
    token: String,
    attempts: u32,
    reconnect_max: Duration,
}

impl RelayClient {
    pub fn new(cfg: &ClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs()))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base: cfg.relay_base(),
            token: cfg.token.trim().to_string(),
            attempts: cfg.retry_attempts(),
            reconnect_max: Duration::from_secs(cfg.reconnect_max_secs()),
        })
    }

    async fn post_action<T: serde::de::DeserializeOwned>(&self, req: &RelayRequest) -> RelayClientResult<T> {
        // Creating a call or a signal twice is visible to the other side; only the
        // idempotent actions are retried.
        let attempts = match req {
            RelayRequest::CreateCall { .. } | RelayRequest::SendSignal { .. } => 1,
            _ => self.attempts,
        };
        let url = format!("{}/call", self.base);
        let resp = send_retrying(
            || self.http.post(&url).bearer_auth(&self.token).json(req),
            attempts,
            Backoff::default(),
        )
        .await
        .map_err(anyhow::Error::from)?;
        decode(resp).await
    }

    pub async fn call_details(&self, call_id: Uuid) -> RelayClientResult<CallDetailsResponse> {
        let url = format!("{}/calls/{call_id}", self.base);
        let resp = self.get(&url).await?;
        decode(resp).await
    }

    pub async fn poll_signals(&self, after_seq: i64, limit: u32) -> RelayClientResult<Vec<SignalRecord>> {
        let url = format!("{}/signals?after={after_seq}&limit={limit}", self.base);
        let resp = self.get(&url).await?;
        let body: SignalsPollResponse = decode(resp).await?;
        Ok(body.signals)
    }

    async fn get(&self, url: &str) -> RelayClientResult<reqwest::Response> {
        let resp = send_retrying(|| self.http.get(url).bearer_auth(&self.token), self.attempts, Backoff::default())
            .await
            .map_err(anyhow::Error::from)?;
        Ok(resp)
    }

    fn subscribe_url(&self, after_seq: i64) -> String {
        let ws_base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base.clone()
        };
        format!(
            "{ws_base}/subscribe?after={after_seq}&token={}",
            urlencoding::encode(&self.token)
        )
    }

    /// Keeps a change-feed subscription open until `cancel` fires, reconnecting with
    /// backoff and resuming after the last signal seen.
    pub fn subscribe(&self, after_seq: i64, cancel: CancellationToken) -> mpsc::Receiver<RelayEvent> {
        let (tx, rx) = mpsc::channel(256);
        let this = self.clone();
        tokio::spawn(async move {
            let mut cursor = after_seq;
            let reconnect = Backoff::new(Duration::from_secs(1), this.reconnect_max);
            let mut failures = 0u32;
            loop {
                match this.run_subscription(&mut cursor, &tx, &cancel).await {
                    Ok(()) => failures = 0,
                    Err(e) => warn!(cursor, "relay subscription dropped: {e:#}"),
                }
                if cancel.is_cancelled() || tx.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = reconnect.sleep(failures) => {}
                }
                failures = failures.saturating_add(1);
            }
            debug!("relay subscription stopped");
        });
        rx
    }

    async fn run_subscription(
        &self,
        cursor: &mut i64,
        tx: &mpsc::Sender<RelayEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(self.subscribe_url(*cursor))
            .await
            .context("connect subscription")?;
        info!(after = *cursor, "relay subscription connected");
        let (mut ws_tx, mut ws_rx) = ws.split();

        let mut ping = tokio::time::interval(Duration::from_secs(15));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    ws_tx.send(tungstenite::Message::Ping(Vec::new())).await?;
                }
                msg = ws_rx.next() => {
                    let Some(msg) = msg else { return Err(anyhow!("relay closed the subscription")) };
                    let text = match msg? {
                        tungstenite::Message::Text(t) => t,
                        tungstenite::Message::Ping(p) => {
                            let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                            continue;
                        }
                        tungstenite::Message::Close(_) => return Err(anyhow!("relay closed the subscription")),
                        _ => continue,
                    };
                    let ev: RelayEvent = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("bad relay event json: {e}");
                            continue;
                        }
                    };
                    if let RelayEvent::Signal(s) = &ev {
                        if s.seq <= *cursor {
                            continue;
                        }
                        *cursor = s.seq;
                    }
                    if tx.send(ev).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> RelayClientResult<T> {
    let status = resp.status();
    let text = resp.text().await.map_err(|e| RelayClientError::Transport(e.into()))?;
    if status.is_success() {
        return serde_json::from_str(&text)
            .with_context(|| format!("parse relay response ({status})"))
            .map_err(RelayClientError::Transport);
    }
    let category = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|b| ErrorCategory::from_message(&b.error));
    match category {
        Some(c) => Err(c.into()),
        None => Err(RelayClientError::Transport(anyhow!("relay error {status}: {text}"))),
    }
}

#[derive(serde::Deserialize)]
struct Ack {
    #[allow(dead_code)]
    success: bool,
}

#[async_trait]
impl RelayApi for RelayClient {
    async fn create_call(
        &self,
        kind: CallKind,
        target_user_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> RelayClientResult<CreateCallResponse> {
        self.post_action(&RelayRequest::CreateCall {
            call_type: kind,
            target_user_id,
            conversation_id,
        })
        .await
    }

    async fn join_call(&self, call_id: Uuid) -> RelayClientResult<()> {
        self.post_action::<Ack>(&RelayRequest::JoinCall { call_id }).await?;
        Ok(())
    }

    async fn send_signal(
        &self,
        call_id: Uuid,
        target_user_id: Uuid,
        signal_type: SignalType,
        signal_data: serde_json::Value,
    ) -> RelayClientResult<SendSignalResponse> {
        self.post_action(&RelayRequest::SendSignal {
            call_id,
            target_user_id,
            signal_type,
            signal_data,
        })
        .await
    }

    async fn end_call(&self, call_id: Uuid) -> RelayClientResult<()> {
        self.post_action::<Ack>(&RelayRequest::EndCall { call_id }).await?;
        Ok(())
    }

    async fn reject_call(&self, call_id: Uuid) -> RelayClientResult<()> {
        self.post_action::<Ack>(&RelayRequest::RejectCall { call_id }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> RelayClient {
        let cfg = ClientConfig::from_json(&format!(
            r#"{{"relay_url":"{url}","token":"a b&c","user_id":"6f1c1f5e-4a43-4d6f-9d38-0e9a2d7f3b11"}}"#
        ))
        .unwrap();
        RelayClient::new(&cfg).unwrap()
    }

    #[test]
    fn subscribe_url_switches_scheme_and_encodes_token() {
        assert_eq!(
            client("https://relay.example.org/").subscribe_url(7),
            "wss://relay.example.org/subscribe?after=7&token=a%20b%26c"
        );
        assert!(client("http://127.0.0.1:8790").subscribe_url(0).starts_with("ws://127.0.0.1:8790/"));
    }

    #[test]
    fn categories_map_to_client_errors() {
        assert!(matches!(
            RelayClientError::from(ErrorCategory::NotFound),
            RelayClientError::NotFound
        ));
        assert!(matches!(
            RelayClientError::from(ErrorCategory::AuthenticationFailed),
            RelayClientError::Unauthenticated
        ));
    }
}
