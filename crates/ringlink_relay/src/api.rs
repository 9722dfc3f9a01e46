/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use ringlink_protocol::{
    CallStateChanged, CallStatus, ParticipantStatus, RelayEvent, RelayRequest, SignalsPollResponse,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::feed::{ChangeFeed, FeedRecv, FeedSubscription};
use crate::ledger::{now_ms, Ledger};
use crate::limiter::{client_ip, Bucket, RateLimiter};
use crate::service::{invitation_event, CallService};

static REQ_ID: AtomicU64 = AtomicU64::new(1);

const WS_PING_SECS: u64 = 20;
const MIN_TOKEN_LEN: usize = 16;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<RelayConfig>,
    pub service: CallService,
    pub ledger: Ledger,
    pub feed: ChangeFeed,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(state: AppState) -> Router {
    let max_body = state.cfg.max_body_bytes;
    Router::new()
        .route("/call", post(call_action))
        .route("/calls/:id", get(call_details))
        .route("/signals", get(poll_signals))
        .route("/subscribe", get(subscribe_ws))
        .route("/admin/identities", post(admin_create_identity))
        .route("/healthz", get(healthz))
        .layer(axum::extract::DefaultBodyLimit::max(max_body))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let request_id = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("req");
                info_span!(
                    "http",
                    method = %req.method(),
                    uri = %req.uri().path(),
                    request_id = %request_id
                )
            }),
        )
        .layer(from_fn(ensure_request_id))
        .with_state(state)
}

fn next_request_id() -> String {
    let id = REQ_ID.fetch_add(1, Ordering::Relaxed);
    format!("req-{id}")
}

async fn ensure_request_id(mut req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let headers = req.headers_mut();
    if headers.get("x-request-id").is_none() {
        headers.insert(
            "x-request-id",
            HeaderValue::from_str(&next_request_id()).unwrap_or_else(|_| HeaderValue::from_static("req")),
        );
    }
    next.run(req).await
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let v = headers.get("Authorization")?.to_str().ok()?.trim();
    let v = v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer "))?;
    let v = v.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

/// Resolves the caller from the bearer credential. Runs before any body parsing.
async fn authenticate(state: &AppState, headers: &HeaderMap, query_token: Option<&str>) -> RelayResult<String> {
    let token = bearer_token(headers)
        .or_else(|| query_token.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string))
        .ok_or(RelayError::Unauthenticated)?;
    state
        .ledger
        .resolve_token(&token)
        .await?
        .ok_or(RelayError::Unauthenticated)
}

async fn rate_limit(state: &AppState, peer: &SocketAddr, headers: &HeaderMap, bucket: Bucket) -> RelayResult<()> {
    let ip = client_ip(&state.cfg, peer, headers);
    if state.limiter.check(&ip, bucket, bucket.per_minute(&state.cfg)).await {
        Ok(())
    } else {
        warn!(%ip, ?bucket, "rate limited");
        Err(RelayError::RateLimited)
    }
}

async fn call_action(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> RelayResult<Json<serde_json::Value>> {
    rate_limit(&state, &peer, &headers, Bucket::Call).await?;
    let caller = authenticate(&state, &headers, None).await?;
    let req: RelayRequest = serde_json::from_slice(&body)
        .map_err(|e| RelayError::Validation(format!("malformed request: {e}")))?;
    let out = state.service.handle(&caller, req).await?;
    Ok(Json(out))
}

async fn call_details(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> RelayResult<Response> {
    rate_limit(&state, &peer, &headers, Bucket::Call).await?;
    let caller = authenticate(&state, &headers, None).await?;
    let call_id = Uuid::parse_str(id.trim()).map_err(|_| RelayError::Validation("bad call id".to_string()))?;
    let resp = state.service.call_details(&caller, call_id).await?;
    Ok(Json(resp).into_response())
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    after: Option<i64>,
    limit: Option<u32>,
}

async fn poll_signals(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<PollQuery>,
) -> RelayResult<Json<SignalsPollResponse>> {
    rate_limit(&state, &peer, &headers, Bucket::Call).await?;
    let caller = authenticate(&state, &headers, None).await?;
    let limit = q
        .limit
        .unwrap_or(state.cfg.poll_limit_max)
        .clamp(1, state.cfg.poll_limit_max);
    let signals = state
        .service
        .poll_signals(&caller, q.after.unwrap_or(0), limit)
        .await?;
    Ok(Json(SignalsPollResponse {
        success: true,
        signals,
    }))
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    after: Option<i64>,
    token: Option<String>,
}

async fn subscribe_ws(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> RelayResult<Response> {
    rate_limit(&state, &peer, &headers, Bucket::Subscribe).await?;
    let user = authenticate(&state, &headers, q.token.as_deref()).await?;
    let after = q.after.unwrap_or(0).max(0);
    // Subscribe before the upgrade so nothing published during the handshake is missed.
    let sub = state.feed.subscribe(&user);
    Ok(ws.on_upgrade(move |socket| run_subscription(state, sub, after, socket)))
}

async fn run_subscription(state: AppState, sub: FeedSubscription, after: i64, socket: WebSocket) {
    let user = sub.user_id().to_string();
    info!(%user, after, "subscriber connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<RelayEvent>(64);
    let pump = tokio::spawn(pump_subscription(state, sub, after, tx));
    let mut ping = tokio::time::interval(Duration::from_secs(WS_PING_SECS));
    ping.tick().await;

    loop {
        tokio::select! {
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                let json = match serde_json::to_string(&ev) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(%user, "serialize event failed: {e}");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(rx);
    match pump.await {
        Ok(Err(e)) => warn!(%user, "subscription ended with error: {e}"),
        Err(e) => warn!(%user, "subscription task failed: {e}"),
        Ok(Ok(())) => {}
    }
    info!(%user, "subscriber disconnected");
}

/// Feeds one subscriber: current call state and the stored signal backlog after
/// `last_seq`, then live events.
///
/// Signals are always re-read from the ledger on notification, so the subscriber sees its
/// signals in strictly increasing `seq` order without duplicates even when concurrent
/// writers publish out of order. Call state is re-read on connect and after a lag, since
/// the feed does not keep it.
pub(crate) async fn pump_subscription(
    state: AppState,
    mut sub: FeedSubscription,
    mut last_seq: i64,
    out: mpsc::Sender<RelayEvent>,
) -> RelayResult<()> {
    let user = sub.user_id().to_string();
    let open = resync_calls(&state, &user, &out).await?
        && deliver_signals(&state, &user, &mut last_seq, &out).await?;
    if !open {
        return Ok(());
    }
    loop {
        let item = tokio::select! {
            _ = out.closed() => return Ok(()),
            item = sub.recv() => item,
        };
        let open = match item {
            FeedRecv::Event(RelayEvent::Signal(_)) => deliver_signals(&state, &user, &mut last_seq, &out).await?,
            FeedRecv::Event(ev) => out.send(ev).await.is_ok(),
            FeedRecv::Lagged(n) => {
                warn!(%user, skipped = n, "subscriber lagged, resyncing from the ledger");
                resync_calls(&state, &user, &out).await?
                    && deliver_signals(&state, &user, &mut last_seq, &out).await?
            }
            FeedRecv::Closed => false,
        };
        if !open {
            return Ok(());
        }
    }
}

/// Replays the subscriber's live and recently finished calls: an invitation for calls still
/// ringing on its side, a state change for the rest. Receivers treat both as idempotent.
async fn resync_calls(state: &AppState, user: &str, out: &mpsc::Sender<RelayEvent>) -> RelayResult<bool> {
    let window_ms = (state.cfg.resync_window_secs as i64).saturating_mul(1000);
    let since = now_ms().saturating_sub(window_ms);
    let calls = state.ledger.calls_to_resync(user, since).await?;
    for (call, mine) in calls {
        let ev = if call.status == CallStatus::Ringing && mine == ParticipantStatus::Ringing {
            RelayEvent::Invitation(invitation_event(&call))
        } else {
            RelayEvent::CallState(CallStateChanged {
                call_id: call.id.clone(),
                status: call.status,
                changed_at_ms: call.ended_at_ms.or(call.started_at_ms).unwrap_or(call.created_at_ms),
            })
        };
        if out.send(ev).await.is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn deliver_signals(
    state: &AppState,
    user: &str,
    last_seq: &mut i64,
    out: &mpsc::Sender<RelayEvent>,
) -> RelayResult<bool> {
    let limit = state.cfg.poll_limit_max;
    loop {
        let batch = state.service.poll_signals(user, *last_seq, limit).await?;
        let full = batch.len() as u32 >= limit;
        for s in batch {
            *last_seq = (*last_seq).max(s.seq);
            if out.send(RelayEvent::Signal(s)).await.is_err() {
                return Ok(false);
            }
        }
        if !full {
            return Ok(true);
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateIdentityReq {
    user_id: Uuid,
    /// Generated when absent.
    token: Option<String>,
}

async fn admin_create_identity(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> RelayResult<Response> {
    rate_limit(&state, &peer, &headers, Bucket::Admin).await?;
    let Some(expected) = state.cfg.admin_token.as_deref() else {
        return Err(RelayError::Unauthenticated);
    };
    if bearer_token(&headers).as_deref() != Some(expected) {
        warn!(ip=%client_ip(&state.cfg, &peer, &headers), "admin auth failed");
        return Err(RelayError::Unauthenticated);
    }
    let req: CreateIdentityReq =
        serde_json::from_slice(&body).map_err(|e| RelayError::Validation(format!("malformed request: {e}")))?;
    let token = match req.token.as_deref().map(str::trim) {
        Some(t) if t.len() < MIN_TOKEN_LEN => {
            return Err(RelayError::Validation("token too short".to_string()));
        }
        Some(t) => t.to_string(),
        None => random_token(),
    };
    if state.ledger.resolve_token(&token).await?.is_some() {
        return Err(RelayError::Validation("token already registered".to_string()));
    }
    let user_id = req.user_id.to_string();
    state.ledger.insert_identity(&user_id, &token).await?;
    info!(%user_id, "identity registered");
    // The token is only ever returned here; the ledger keeps its hash.
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "user_id": user_id, "token": token })),
    )
        .into_response())
}

fn random_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.ledger.health_check().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            warn!("health check failed: {e:#}");
            (StatusCode::SERVICE_UNAVAILABLE, "db unavailable").into_response()
        }
    }
}
