/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Routes relay feed events to per-call sessions and keeps a single call holding the
//! capture devices at a time.

use ringlink_protocol::{CallKind, RelayEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::CallEvent;
use crate::session::{spawn_session, SessionDeps, SessionError, SessionHandle, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("another call is using the media devices")]
    Busy,
    #[error("unknown call {0}")]
    UnknownCall(Uuid),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, SessionHandle>,
    /// The call whose session holds the microphone/camera.
    media_owner: Option<Uuid>,
    /// An outgoing call still acquiring media or creating the call.
    placing: Option<SessionHandle>,
}

#[derive(Clone)]
pub struct CallManager {
    deps: SessionDeps,
    inner: Arc<Mutex<Inner>>,
    cancel: CancellationToken,
}

impl CallManager {
    /// Starts routing `feed` (usually [`crate::relay_client::RelayClient::subscribe`])
    /// until `cancel` fires.
    pub fn start(deps: SessionDeps, feed: mpsc::Receiver<RelayEvent>, cancel: CancellationToken) -> Self {
        let this = Self {
            deps,
            inner: Arc::new(Mutex::new(Inner::default())),
            cancel,
        };
        let session_events = this.deps.events.subscribe();
        tokio::spawn(this.clone().run(feed, session_events));
        this
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.deps.events.subscribe()
    }

    async fn run(self, mut feed: mpsc::Receiver<RelayEvent>, mut session_events: broadcast::Receiver<CallEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                ev = feed.recv() => {
                    let Some(ev) = ev else {
                        info!("relay feed closed");
                        break;
                    };
                    self.route(ev).await;
                }
                ev = session_events.recv() => match ev {
                    Ok(CallEvent::StateChanged { call_id: Some(id), state, .. })
                        if matches!(state, SessionState::Ended | SessionState::Idle) =>
                    {
                        self.forget(id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "call events lagged, reconciling sessions");
                        let this = self.clone();
                        tokio::spawn(async move { this.reconcile().await });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        let sessions: Vec<SessionHandle> = {
            let mut inner = self.inner.lock().await;
            inner.media_owner = None;
            inner.placing.take().into_iter().chain(inner.sessions.drain().map(|(_, h)| h)).collect()
        };
        for h in sessions {
            h.end().await;
        }
        debug!("call manager stopped");
    }

    async fn route(&self, ev: RelayEvent) {
        match ev {
            RelayEvent::Invitation(inv) => {
                let Ok(call_id) = Uuid::parse_str(&inv.call_id) else {
                    warn!(call_id = %inv.call_id, "invitation with malformed call id");
                    return;
                };
                if self.inner.lock().await.sessions.contains_key(&call_id) {
                    debug!(%call_id, "duplicate invitation");
                    return;
                }
                let handle = spawn_session(self.deps.clone());
                if let Err(e) = handle.receive_invitation(inv.clone()).await {
                    warn!(%call_id, "invitation not accepted by session: {e}");
                    return;
                }
                self.inner.lock().await.sessions.insert(call_id, handle);
                info!(%call_id, caller = %inv.caller_id, "incoming call");
                let _ = self.deps.events.send(CallEvent::incoming(inv));
            }
            RelayEvent::Signal(sig) => match self.lookup(&sig.call_id).await {
                Some(h) => h.signal(sig).await,
                None => warn!(call_id = %sig.call_id, seq = sig.seq, "signal for unknown call"),
            },
            RelayEvent::CallState(change) => {
                if let Some(h) = self.lookup(&change.call_id).await {
                    h.call_status(change.status).await;
                }
            }
            RelayEvent::Participant(_) => {}
        }
    }

    /// Releases sessions that ended without this router seeing their final state.
    async fn reconcile(&self) {
        let handles: Vec<(Uuid, SessionHandle)> = {
            let inner = self.inner.lock().await;
            inner.sessions.iter().map(|(id, h)| (*id, h.clone())).collect()
        };
        for (call_id, h) in handles {
            let finished = match h.snapshot().await {
                Ok(snap) => matches!(snap.state, SessionState::Ended | SessionState::Idle),
                Err(_) => true,
            };
            if finished {
                self.forget(call_id).await;
            }
        }
    }

    async fn lookup(&self, call_id: &str) -> Option<SessionHandle> {
        let id = Uuid::parse_str(call_id).ok()?;
        self.inner.lock().await.sessions.get(&id).cloned()
    }

    async fn forget(&self, call_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if inner.sessions.remove(&call_id).is_some() {
            debug!(%call_id, "call session released");
        }
        if inner.media_owner == Some(call_id) {
            inner.media_owner = None;
        }
    }

    pub async fn place_call(
        &self,
        kind: CallKind,
        target_user_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> Result<Uuid, ManagerError> {
        let handle = {
            let mut inner = self.inner.lock().await;
            if inner.placing.is_some() || inner.media_owner.is_some() {
                return Err(ManagerError::Busy);
            }
            let h = spawn_session(self.deps.clone());
            inner.placing = Some(h.clone());
            h
        };

        let started = handle.start_outgoing(kind, target_user_id, conversation_id).await;
        let call_id = {
            let mut inner = self.inner.lock().await;
            inner.placing = None;
            let call_id = started?;
            inner.sessions.insert(call_id, handle.clone());
            inner.media_owner = Some(call_id);
            call_id
        };

        if let Err(e) = handle.send_offer().await {
            self.forget(call_id).await;
            return Err(e.into());
        }
        info!(%call_id, target = %target_user_id, "outgoing call placed");
        Ok(call_id)
    }

    /// Abandons an outgoing call that has not been created yet.
    pub async fn cancel_placing(&self) {
        let placing = self.inner.lock().await.placing.take();
        if let Some(h) = placing {
            h.end().await;
        }
    }

    pub async fn accept(&self, call_id: Uuid) -> Result<(), ManagerError> {
        let handle = {
            let mut inner = self.inner.lock().await;
            let h = inner
                .sessions
                .get(&call_id)
                .cloned()
                .ok_or(ManagerError::UnknownCall(call_id))?;
            if inner.placing.is_some() || inner.media_owner.is_some_and(|owner| owner != call_id) {
                return Err(ManagerError::Busy);
            }
            inner.media_owner = Some(call_id);
            h
        };
        if let Err(e) = handle.accept().await {
            let mut inner = self.inner.lock().await;
            if inner.media_owner == Some(call_id) {
                inner.media_owner = None;
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn reject(&self, call_id: Uuid) -> Result<(), ManagerError> {
        self.session(call_id)
            .await
            .ok_or(ManagerError::UnknownCall(call_id))?
            .reject()
            .await?;
        self.forget(call_id).await;
        Ok(())
    }

    pub async fn end(&self, call_id: Uuid) -> Result<(), ManagerError> {
        let handle = self.session(call_id).await.ok_or(ManagerError::UnknownCall(call_id))?;
        handle.end().await;
        self.forget(call_id).await;
        Ok(())
    }

    pub async fn session(&self, call_id: Uuid) -> Option<SessionHandle> {
        self.inner.lock().await.sessions.get(&call_id).cloned()
    }

    pub async fn active_calls(&self) -> Vec<Uuid> {
        self.inner.lock().await.sessions.keys().copied().collect()
    }
}
