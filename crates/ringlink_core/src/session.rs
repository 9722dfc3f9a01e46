/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! One call, from either side.
//!
//! A [`CallSession`] owns the local tracks, the peer transport and the candidate buffer
//! of a single call. It is driven from a single task (see [`spawn_session`]), so every
//! operation sees a consistent state without locks.

use ringlink_protocol::{CallKind, CallStatus, InvitationEvent, SignalRecord, SignalType};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::candidate_buffer::CandidateBuffer;
use crate::events::CallEvent;
use crate::media::{CameraFacing, LocalTrack, MediaDevices, TrackKind};
use crate::relay_client::{RelayApi, RelayClientError};
use crate::transport::{
    IceCandidate, PeerTransport, RemoteTrackInfo, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Calling,
    Ringing,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Receiver,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("media unavailable: {0}")]
    Media(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Relay(#[from] RelayClientError),
    #[error("transport: {0}")]
    Transport(String),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

fn transport_err(e: anyhow::Error) -> SessionError {
    SessionError::Transport(format!("{e:#}"))
}

/// Signal payloads arrive either as a JSON object or as a string holding one.
fn decode_signal<T: serde::de::DeserializeOwned>(data: &serde_json::Value) -> serde_json::Result<T> {
    match data {
        serde_json::Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    }
}

#[derive(Clone)]
pub struct SessionDeps {
    pub relay: Arc<dyn RelayApi>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub events: broadcast::Sender<CallEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub call_id: Option<Uuid>,
    pub state: SessionState,
    pub role: Option<Role>,
    pub kind: CallKind,
    pub remote_user: Option<Uuid>,
    pub muted: bool,
    pub video_off: bool,
    pub screen_sharing: bool,
    pub camera_facing: CameraFacing,
    pub remote_tracks: Vec<RemoteTrackInfo>,
}

pub struct CallSession {
    deps: SessionDeps,
    state: SessionState,
    role: Option<Role>,
    call_id: Option<Uuid>,
    kind: CallKind,
    remote_user: Option<Uuid>,

    local_audio: Option<Arc<LocalTrack>>,
    local_video: Option<Arc<LocalTrack>>,
    camera_facing: CameraFacing,
    screen_sharing: bool,
    muted: bool,
    video_off: bool,

    transport: Option<Arc<dyn PeerTransport>>,
    transport_tx: mpsc::Sender<TransportEvent>,
    buffer: CandidateBuffer,
    pending_offer: Option<SessionDescription>,
    offer_sent: bool,
    remote_applied: bool,
    remote_tracks: Vec<RemoteTrackInfo>,

    cancel: CancellationToken,
    end_sent: bool,
}

impl CallSession {
    /// The receiver carries whatever the transport reports; feed it back through
    /// [`Self::handle_transport_event`].
    pub fn new(deps: SessionDeps, cancel: CancellationToken) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (transport_tx, transport_rx) = mpsc::channel(128);
        let session = Self {
            deps,
            state: SessionState::Idle,
            role: None,
            call_id: None,
            kind: CallKind::Voice,
            remote_user: None,
            local_audio: None,
            local_video: None,
            camera_facing: CameraFacing::Front,
            screen_sharing: false,
            muted: false,
            video_off: false,
            transport: None,
            transport_tx,
            buffer: CandidateBuffer::new(),
            pending_offer: None,
            offer_sent: false,
            remote_applied: false,
            remote_tracks: Vec::new(),
            cancel,
            end_sent: false,
        };
        (session, transport_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn call_id(&self) -> Option<Uuid> {
        self.call_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call_id: self.call_id,
            state: self.state,
            role: self.role,
            kind: self.kind,
            remote_user: self.remote_user,
            muted: self.muted,
            video_off: self.video_off,
            screen_sharing: self.screen_sharing,
            camera_facing: self.camera_facing,
            remote_tracks: self.remote_tracks.clone(),
        }
    }

    fn emit(&self, ev: CallEvent) {
        // No listeners is fine.
        let _ = self.deps.events.send(ev);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!(call_id = ?self.call_id, from = ?self.state, to = ?state, "call session state");
        self.state = state;
        self.emit(CallEvent::state(self.call_id, state));
    }

    async fn cancellable<T>(
        &self,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> SessionResult<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            r = fut => r.map_err(|e| SessionError::Media(format!("{e:#}"))),
        }
    }

    async fn acquire_call_media(&self, kind: CallKind) -> SessionResult<(Arc<LocalTrack>, Option<Arc<LocalTrack>>)> {
        let audio = self.cancellable(self.deps.devices.open_microphone()).await?;
        let video = match kind {
            CallKind::Voice => None,
            CallKind::Video => match self.cancellable(self.deps.devices.open_camera(self.camera_facing)).await {
                Ok(v) => Some(v),
                Err(e) => {
                    audio.stop();
                    return Err(e);
                }
            },
        };
        Ok((audio, video))
    }

    fn install_media(&mut self, audio: Arc<LocalTrack>, video: Option<Arc<LocalTrack>>) {
        audio.set_enabled(!self.muted);
        if let Some(v) = &video {
            v.set_enabled(!self.video_off);
        }
        self.local_audio = Some(audio);
        self.local_video = video;
    }

    fn release_media(&mut self) {
        for track in [self.local_audio.take(), self.local_video.take()].into_iter().flatten() {
            track.stop();
        }
        self.screen_sharing = false;
    }

    async fn build_transport(&mut self) -> SessionResult<()> {
        let t = self
            .deps
            .transports
            .create(self.transport_tx.clone())
            .await
            .map_err(transport_err)?;
        for track in [self.local_audio.clone(), self.local_video.clone()].into_iter().flatten() {
            if let Err(e) = t.add_track(track).await {
                let _ = t.close().await;
                return Err(transport_err(e));
            }
        }
        self.transport = Some(t);
        Ok(())
    }

    async fn teardown(&mut self) {
        self.release_media();
        if let Some(t) = self.transport.take() {
            if let Err(e) = t.close().await {
                debug!(call_id = ?self.call_id, "transport close: {e:#}");
            }
        }
        self.buffer.clear();
        self.pending_offer = None;
        self.remote_applied = false;
    }

    /// Acquires media, creates the call on the relay and prepares the transport.
    /// Nothing is created remotely when media acquisition fails.
    pub async fn start_outgoing(
        &mut self,
        kind: CallKind,
        target_user_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> SessionResult<Uuid> {
        if self.state != SessionState::Idle || self.role.is_some() {
            return Err(SessionError::InvalidState("session already in use"));
        }
        let (audio, video) = self.acquire_call_media(kind).await?;
        self.kind = kind;
        self.install_media(audio, video);

        let created = match self
            .deps
            .relay
            .create_call(kind, Some(target_user_id), conversation_id)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                self.release_media();
                return Err(e.into());
            }
        };
        let call_id = match Uuid::parse_str(&created.call.id) {
            Ok(id) => id,
            Err(e) => {
                self.release_media();
                let bad = anyhow::anyhow!("relay returned call id {:?}: {e}", created.call.id);
                return Err(RelayClientError::Transport(bad).into());
            }
        };
        self.call_id = Some(call_id);
        self.role = Some(Role::Initiator);
        self.remote_user = Some(target_user_id);

        if let Err(e) = self.build_transport().await {
            warn!(%call_id, "transport setup failed: {e}");
            self.abort_outgoing().await;
            return Err(e);
        }
        self.set_state(SessionState::Calling);
        Ok(call_id)
    }

    async fn abort_outgoing(&mut self) {
        if let Some(call_id) = self.call_id {
            if !self.end_sent {
                self.end_sent = true;
                if let Err(e) = self.deps.relay.end_call(call_id).await {
                    warn!(%call_id, "end-call after failed setup: {e}");
                }
            }
        }
        self.teardown().await;
        self.set_state(SessionState::Idle);
        self.call_id = None;
        self.role = None;
        self.remote_user = None;
        self.offer_sent = false;
        self.end_sent = false;
    }

    pub async fn send_offer(&mut self) -> SessionResult<()> {
        if self.state != SessionState::Calling || self.role != Some(Role::Initiator) {
            return Err(SessionError::InvalidState("offer needs an outgoing call"));
        }
        if self.offer_sent {
            return Err(SessionError::InvalidState("offer already sent"));
        }
        let (Some(call_id), Some(remote), Some(t)) = (self.call_id, self.remote_user, self.transport.clone()) else {
            return Err(SessionError::InvalidState("outgoing call not set up"));
        };

        let result = async {
            let offer = t.create_offer().await.map_err(transport_err)?;
            let data = serde_json::to_value(&offer).map_err(|e| SessionError::Transport(e.to_string()))?;
            self.deps
                .relay
                .send_signal(call_id, remote, SignalType::Offer, data)
                .await?;
            Ok::<_, SessionError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.offer_sent = true;
                debug!(%call_id, "offer sent");
                Ok(())
            }
            Err(e) => {
                warn!(%call_id, "sending offer failed: {e}");
                self.abort_outgoing().await;
                Err(e)
            }
        }
    }

    pub async fn receive_invitation(&mut self, invitation: &InvitationEvent) -> SessionResult<()> {
        if self.state != SessionState::Idle || self.role.is_some() {
            return Err(SessionError::InvalidState("session already in use"));
        }
        let call_id =
            Uuid::parse_str(&invitation.call_id).map_err(|_| SessionError::InvalidState("malformed invitation"))?;
        let caller =
            Uuid::parse_str(&invitation.caller_id).map_err(|_| SessionError::InvalidState("malformed invitation"))?;
        self.call_id = Some(call_id);
        self.role = Some(Role::Receiver);
        self.remote_user = Some(caller);
        self.kind = invitation.call_type;
        self.set_state(SessionState::Ringing);
        Ok(())
    }

    /// On a media failure the call keeps ringing so the user can retry or reject.
    pub async fn accept(&mut self) -> SessionResult<()> {
        if self.state != SessionState::Ringing || self.role != Some(Role::Receiver) {
            return Err(SessionError::InvalidState("no incoming call to accept"));
        }
        if self.transport.is_some() {
            return Err(SessionError::InvalidState("call already accepted"));
        }
        let Some(call_id) = self.call_id else {
            return Err(SessionError::InvalidState("no incoming call to accept"));
        };

        let (audio, video) = self.acquire_call_media(self.kind).await?;
        if let Err(e) = self.deps.relay.join_call(call_id).await {
            for t in std::iter::once(audio).chain(video) {
                t.stop();
            }
            return Err(e.into());
        }
        self.install_media(audio, video);

        if let Err(e) = self.build_transport().await {
            warn!(%call_id, "transport setup failed: {e}");
            self.emit(CallEvent::error(Some(call_id), e.to_string()));
            self.end().await;
            return Err(e);
        }
        if let Some(offer) = self.pending_offer.take() {
            self.answer_offer(offer).await?;
        }
        Ok(())
    }

    pub async fn reject(&mut self) -> SessionResult<()> {
        if self.state != SessionState::Ringing || self.role != Some(Role::Receiver) || self.transport.is_some() {
            return Err(SessionError::InvalidState("no incoming call to reject"));
        }
        let Some(call_id) = self.call_id else {
            return Err(SessionError::InvalidState("no incoming call to reject"));
        };
        self.deps.relay.reject_call(call_id).await?;
        self.end_sent = true;
        self.finish().await;
        Ok(())
    }

    /// Safe from any state and any number of times. Tells the relay at most once.
    pub async fn end(&mut self) {
        self.cancel.cancel();
        if self.state == SessionState::Ended {
            return;
        }
        if let Some(call_id) = self.call_id {
            if !self.end_sent {
                self.end_sent = true;
                if let Err(e) = self.deps.relay.end_call(call_id).await {
                    warn!(%call_id, "end-call failed: {e}");
                }
            }
        }
        self.finish().await;
    }

    async fn finish(&mut self) {
        self.cancel.cancel();
        self.teardown().await;
        self.set_state(SessionState::Ended);
    }

    /// The relay reported a status for this call. Terminal ones end the session without
    /// echoing an end-call back.
    pub async fn handle_call_status(&mut self, status: CallStatus) {
        if !status.is_terminal() || self.state == SessionState::Ended {
            return;
        }
        info!(call_id = ?self.call_id, status = status.as_str(), "call finished remotely");
        self.end_sent = true;
        self.finish().await;
    }

    pub async fn handle_signal(&mut self, signal: &SignalRecord) -> SessionResult<()> {
        if self.state == SessionState::Ended {
            debug!(seq = signal.seq, "signal after end, ignoring");
            return Ok(());
        }
        if Uuid::parse_str(&signal.call_id).ok() != self.call_id || self.call_id.is_none() {
            warn!(seq = signal.seq, call_id = %signal.call_id, "signal for another call");
            return Ok(());
        }

        match signal.signal_type {
            SignalType::Offer => {
                if self.role != Some(Role::Receiver) {
                    return Err(SessionError::InvalidState("offer received by the calling side"));
                }
                if self.pending_offer.is_some() || self.remote_applied {
                    return Err(SessionError::InvalidState("duplicate offer"));
                }
                let offer: SessionDescription = decode_signal(&signal.signal_data)
                    .map_err(|e| SessionError::Transport(format!("bad offer: {e}")))?;
                if self.transport.is_none() {
                    self.pending_offer = Some(offer);
                    return Ok(());
                }
                self.answer_offer(offer).await
            }
            SignalType::Answer => {
                if self.role != Some(Role::Initiator) || !self.offer_sent {
                    return Err(SessionError::InvalidState("answer without an offer"));
                }
                if self.remote_applied {
                    return Err(SessionError::InvalidState("duplicate answer"));
                }
                let answer: SessionDescription = decode_signal(&signal.signal_data)
                    .map_err(|e| SessionError::Transport(format!("bad answer: {e}")))?;
                let Some(t) = self.transport.clone() else {
                    return Err(SessionError::InvalidState("outgoing call not set up"));
                };
                t.set_remote_description(answer).await.map_err(transport_err)?;
                self.mark_remote_applied().await;
                Ok(())
            }
            SignalType::IceCandidate => {
                let candidate: IceCandidate = match decode_signal(&signal.signal_data) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(seq = signal.seq, "dropping malformed candidate: {e}");
                        return Ok(());
                    }
                };
                if let Some(c) = self.buffer.offer(candidate) {
                    self.apply_candidate(c).await;
                }
                Ok(())
            }
        }
    }

    /// A receiver that cannot answer has no way to connect, so any failure ends the call.
    async fn answer_offer(&mut self, offer: SessionDescription) -> SessionResult<()> {
        let Err(e) = self.apply_offer(offer).await else {
            return Ok(());
        };
        warn!(call_id = ?self.call_id, "answering the offer failed: {e}");
        self.emit(CallEvent::error(self.call_id, e.to_string()));
        self.end().await;
        Err(e)
    }

    async fn apply_offer(&mut self, offer: SessionDescription) -> SessionResult<()> {
        let (Some(call_id), Some(remote), Some(t)) = (self.call_id, self.remote_user, self.transport.clone()) else {
            return Err(SessionError::InvalidState("incoming call not accepted"));
        };
        t.set_remote_description(offer).await.map_err(transport_err)?;
        self.mark_remote_applied().await;
        let answer = t.create_answer().await.map_err(transport_err)?;
        let data = serde_json::to_value(&answer).map_err(|e| SessionError::Transport(e.to_string()))?;
        self.deps
            .relay
            .send_signal(call_id, remote, SignalType::Answer, data)
            .await?;
        debug!(%call_id, "answer sent");
        Ok(())
    }

    async fn mark_remote_applied(&mut self) {
        self.remote_applied = true;
        self.buffer.mark_remote_ready();
        for c in self.buffer.drain_if_ready() {
            self.apply_candidate(c).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        let Some(t) = &self.transport else { return };
        if let Err(e) = t.add_ice_candidate(candidate).await {
            warn!(call_id = ?self.call_id, "remote candidate rejected: {e:#}");
        }
    }

    pub async fn handle_transport_event(&mut self, ev: TransportEvent) {
        if self.state == SessionState::Ended {
            return;
        }
        match ev {
            TransportEvent::LocalCandidate(c) => {
                let (Some(call_id), Some(remote)) = (self.call_id, self.remote_user) else {
                    return;
                };
                let data = match serde_json::to_value(&c) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("local candidate encode: {e}");
                        return;
                    }
                };
                if let Err(e) = self
                    .deps
                    .relay
                    .send_signal(call_id, remote, SignalType::IceCandidate, data)
                    .await
                {
                    warn!(%call_id, "relaying local candidate failed: {e}");
                }
            }
            TransportEvent::StateChanged(s) => match s {
                TransportState::Connected => {
                    if matches!(self.state, SessionState::Calling | SessionState::Ringing) {
                        self.set_state(SessionState::Connected);
                    }
                }
                TransportState::Failed | TransportState::Closed => {
                    warn!(call_id = ?self.call_id, state = ?s, "transport lost, ending call");
                    self.emit(CallEvent::error(self.call_id, format!("connection {s:?}").to_lowercase()));
                    self.end().await;
                }
                TransportState::Disconnected => {
                    info!(call_id = ?self.call_id, "transport disconnected, waiting for recovery");
                }
                TransportState::New | TransportState::Connecting => {
                    debug!(call_id = ?self.call_id, state = ?s, "transport state");
                }
            },
            TransportEvent::RemoteTrack(info) => {
                self.remote_tracks.push(info.clone());
                self.emit(CallEvent::remote_track(self.call_id, info));
            }
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(a) = &self.local_audio {
            a.set_enabled(!muted);
        }
    }

    pub fn toggle_mute(&mut self) -> bool {
        self.set_muted(!self.muted);
        self.muted
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_off = !enabled;
        if let Some(v) = &self.local_video {
            if !self.screen_sharing {
                v.set_enabled(enabled);
            }
        }
    }

    fn live_video_transport(&self) -> SessionResult<Arc<dyn PeerTransport>> {
        if self.kind != CallKind::Video {
            return Err(SessionError::InvalidState("not a video call"));
        }
        if !matches!(
            self.state,
            SessionState::Calling | SessionState::Ringing | SessionState::Connected
        ) {
            return Err(SessionError::InvalidState("no active call"));
        }
        self.transport
            .clone()
            .ok_or(SessionError::InvalidState("call not set up"))
    }

    /// Replaces the outbound video in place and stops what it replaced.
    async fn swap_video(&mut self, t: &Arc<dyn PeerTransport>, next: Arc<LocalTrack>) -> SessionResult<()> {
        if let Err(e) = t.replace_track(TrackKind::Video, next.clone()).await {
            next.stop();
            return Err(transport_err(e));
        }
        if let Some(old) = self.local_video.replace(next) {
            old.stop();
        }
        Ok(())
    }

    /// While sharing the screen only the preference is recorded; it applies when the
    /// camera comes back.
    pub async fn flip_camera(&mut self) -> SessionResult<CameraFacing> {
        let t = self.live_video_transport()?;
        let facing = self.camera_facing.opposite();
        if !self.screen_sharing {
            let cam = self.cancellable(self.deps.devices.open_camera(facing)).await?;
            cam.set_enabled(!self.video_off);
            self.swap_video(&t, cam).await?;
        }
        self.camera_facing = facing;
        Ok(facing)
    }

    pub async fn start_screen_share(&mut self) -> SessionResult<()> {
        let t = self.live_video_transport()?;
        if self.screen_sharing {
            return Err(SessionError::InvalidState("already sharing"));
        }
        let display = self.cancellable(self.deps.devices.open_display()).await?;
        self.swap_video(&t, display).await?;
        self.screen_sharing = true;
        info!(call_id = ?self.call_id, "screen share started");
        Ok(())
    }

    pub async fn stop_screen_share(&mut self) -> SessionResult<()> {
        if !self.screen_sharing {
            return Ok(());
        }
        let t = self.live_video_transport()?;
        let cam = self
            .cancellable(self.deps.devices.open_camera(self.camera_facing))
            .await?;
        cam.set_enabled(!self.video_off);
        self.swap_video(&t, cam).await?;
        self.screen_sharing = false;
        info!(call_id = ?self.call_id, "screen share stopped");
        Ok(())
    }

    /// The OS ended the display capture; go back to the camera.
    pub async fn on_display_revoked(&mut self) {
        if !self.screen_sharing {
            return;
        }
        info!(call_id = ?self.call_id, "screen capture revoked");
        if let Err(e) = self.stop_screen_share().await {
            warn!(call_id = ?self.call_id, "camera restore failed: {e}");
            if let Some(display) = self.local_video.take() {
                display.stop();
            }
            self.screen_sharing = false;
            self.emit(CallEvent::error(self.call_id, format!("camera unavailable: {e}")));
        }
    }

    /// Fires when the display capture ends, while sharing.
    pub fn display_watch(&self) -> Option<watch::Receiver<bool>> {
        if !self.screen_sharing {
            return None;
        }
        self.local_video.as_ref().map(|t| t.ended_watch())
    }
}

enum Command {
    StartOutgoing {
        kind: CallKind,
        target: Uuid,
        conversation: Option<Uuid>,
        reply: oneshot::Sender<SessionResult<Uuid>>,
    },
    SendOffer(oneshot::Sender<SessionResult<()>>),
    ReceiveInvitation(Box<InvitationEvent>, oneshot::Sender<SessionResult<()>>),
    Accept(oneshot::Sender<SessionResult<()>>),
    Reject(oneshot::Sender<SessionResult<()>>),
    Signal(Box<SignalRecord>),
    CallStatus(CallStatus),
    SetMuted(bool, oneshot::Sender<()>),
    ToggleMute(oneshot::Sender<bool>),
    SetVideoEnabled(bool, oneshot::Sender<()>),
    FlipCamera(oneshot::Sender<SessionResult<CameraFacing>>),
    StartScreenShare(oneshot::Sender<SessionResult<()>>),
    StopScreenShare(oneshot::Sender<SessionResult<()>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    End(oneshot::Sender<()>),
}

impl CallSession {
    async fn dispatch(&mut self, cmd: Command) {
        match cmd {
            Command::StartOutgoing {
                kind,
                target,
                conversation,
                reply,
            } => {
                let _ = reply.send(self.start_outgoing(kind, target, conversation).await);
            }
            Command::SendOffer(reply) => {
                let _ = reply.send(self.send_offer().await);
            }
            Command::ReceiveInvitation(inv, reply) => {
                let _ = reply.send(self.receive_invitation(&inv).await);
            }
            Command::Accept(reply) => {
                let _ = reply.send(self.accept().await);
            }
            Command::Reject(reply) => {
                let _ = reply.send(self.reject().await);
            }
            Command::Signal(sig) => {
                if let Err(e) = self.handle_signal(&sig).await {
                    warn!(call_id = ?self.call_id, seq = sig.seq, "signal not applied: {e}");
                    self.emit(CallEvent::error(self.call_id, e.to_string()));
                }
            }
            Command::CallStatus(status) => self.handle_call_status(status).await,
            Command::SetMuted(m, reply) => {
                self.set_muted(m);
                let _ = reply.send(());
            }
            Command::ToggleMute(reply) => {
                let _ = reply.send(self.toggle_mute());
            }
            Command::SetVideoEnabled(on, reply) => {
                self.set_video_enabled(on);
                let _ = reply.send(());
            }
            Command::FlipCamera(reply) => {
                let _ = reply.send(self.flip_camera().await);
            }
            Command::StartScreenShare(reply) => {
                let _ = reply.send(self.start_screen_share().await);
            }
            Command::StopScreenShare(reply) => {
                let _ = reply.send(self.stop_screen_share().await);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::End(reply) => {
                self.end().await;
                let _ = reply.send(());
            }
        }
    }
}

async fn display_revoked(rx: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    if *rx.borrow_and_update() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow_and_update() {
            return;
        }
    }
    // Sender gone means the track is gone too.
}

/// Cheap to clone. Dropping every handle ends the session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

pub fn spawn_session(deps: SessionDeps) -> SessionHandle {
    let cancel = CancellationToken::new();
    let (mut session, mut transport_rx) = CallSession::new(deps, cancel.clone());
    let (tx, mut rx) = mpsc::channel::<Command>(64);

    tokio::spawn(async move {
        let mut display: Option<watch::Receiver<bool>> = None;
        loop {
            tokio::select! {
                biased;
                Some(ev) = transport_rx.recv() => session.handle_transport_event(ev).await,
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    session.dispatch(cmd).await;
                }
                _ = display_revoked(&mut display) => session.on_display_revoked().await,
            }
            display = session.display_watch();
        }
        session.end().await;
        debug!(call_id = ?session.call_id(), "call session task stopped");
    });

    SessionHandle { tx, cancel }
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> SessionResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::InvalidState("session closed"))?;
        rx.await.map_err(|_| SessionError::InvalidState("session closed"))
    }

    pub async fn start_outgoing(
        &self,
        kind: CallKind,
        target: Uuid,
        conversation: Option<Uuid>,
    ) -> SessionResult<Uuid> {
        self.request(|reply| Command::StartOutgoing {
            kind,
            target,
            conversation,
            reply,
        })
        .await?
    }

    pub async fn send_offer(&self) -> SessionResult<()> {
        self.request(Command::SendOffer).await?
    }

    pub async fn receive_invitation(&self, invitation: InvitationEvent) -> SessionResult<()> {
        self.request(|reply| Command::ReceiveInvitation(Box::new(invitation), reply))
            .await?
    }

    pub async fn accept(&self) -> SessionResult<()> {
        self.request(Command::Accept).await?
    }

    pub async fn reject(&self) -> SessionResult<()> {
        self.request(Command::Reject).await?
    }

    pub async fn signal(&self, signal: SignalRecord) {
        if self.tx.send(Command::Signal(Box::new(signal))).await.is_err() {
            debug!("signal for a closed session");
        }
    }

    pub async fn call_status(&self, status: CallStatus) {
        let _ = self.tx.send(Command::CallStatus(status)).await;
    }

    pub async fn set_muted(&self, muted: bool) -> SessionResult<()> {
        self.request(|reply| Command::SetMuted(muted, reply)).await
    }

    pub async fn toggle_mute(&self) -> SessionResult<bool> {
        self.request(Command::ToggleMute).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> SessionResult<()> {
        self.request(|reply| Command::SetVideoEnabled(enabled, reply)).await
    }

    pub async fn flip_camera(&self) -> SessionResult<CameraFacing> {
        self.request(Command::FlipCamera).await?
    }

    pub async fn start_screen_share(&self) -> SessionResult<()> {
        self.request(Command::StartScreenShare).await?
    }

    pub async fn stop_screen_share(&self) -> SessionResult<()> {
        self.request(Command::StopScreenShare).await?
    }

    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Interrupts a pending media acquisition, then ends the call.
    pub async fn end(&self) {
        self.cancel.cancel();
        let _ = self.request(Command::End).await;
    }
}
