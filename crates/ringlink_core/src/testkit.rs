/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-memory stand-ins for the relay, the capture devices and the peer transport.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ringlink_protocol::{
    CallKind, CallRecord, CallStatus, CreateCallResponse, ParticipantRecord, ParticipantStatus, SendSignalResponse,
    SignalRecord, SignalType,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::events::CallEvent;
use crate::media::{CameraFacing, LocalTrack, MediaDevices, TrackKind, TrackSource};
use crate::relay_client::{RelayApi, RelayClientError, RelayClientResult};
use crate::session::SessionDeps;
use crate::transport::{
    IceCandidate, PeerTransport, SdpKind, SessionDescription, TransportEvent, TransportFactory,
};

struct HubCall {
    status: CallStatus,
    participants: HashMap<Uuid, ParticipantStatus>,
}

/// Shared state behind every [`MemoryRelay`] client.
#[derive(Default)]
pub struct Hub {
    calls: Mutex<HashMap<Uuid, HubCall>>,
    outbox: Mutex<HashMap<Uuid, Vec<SignalRecord>>>,
    seq: AtomicI64,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>, user: Uuid) -> Arc<MemoryRelay> {
        Arc::new(MemoryRelay {
            hub: self.clone(),
            user,
            ops: Mutex::new(Vec::new()),
            fail: Mutex::new(HashSet::new()),
        })
    }

    /// Signals addressed to `user`, oldest first; removes them.
    pub fn take_signals(&self, user: Uuid) -> Vec<SignalRecord> {
        self.outbox.lock().unwrap().remove(&user).unwrap_or_default()
    }

    pub fn status(&self, call_id: Uuid) -> Option<CallStatus> {
        self.calls.lock().unwrap().get(&call_id).map(|c| c.status)
    }
}

pub struct MemoryRelay {
    hub: Arc<Hub>,
    user: Uuid,
    ops: Mutex<Vec<String>>,
    fail: Mutex<HashSet<&'static str>>,
}

impl MemoryRelay {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.ops.lock().unwrap().iter().filter(|o| o.as_str() == op).count()
    }

    pub fn fail_on(&self, action: &'static str) {
        self.fail.lock().unwrap().insert(action);
    }

    fn record(&self, op: String, action: &'static str) -> RelayClientResult<()> {
        self.ops.lock().unwrap().push(op);
        if self.fail.lock().unwrap().contains(action) {
            return Err(RelayClientError::Unavailable);
        }
        Ok(())
    }

    fn with_call<T>(
        &self,
        call_id: Uuid,
        f: impl FnOnce(&mut HubCall) -> RelayClientResult<T>,
    ) -> RelayClientResult<T> {
        let mut calls = self.hub.calls.lock().unwrap();
        let call = calls.get_mut(&call_id).ok_or(RelayClientError::NotFound)?;
        if !call.participants.contains_key(&self.user) {
            return Err(RelayClientError::NotFound);
        }
        f(call)
    }
}

#[async_trait]
impl RelayApi for MemoryRelay {
    async fn create_call(
        &self,
        kind: CallKind,
        target_user_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> RelayClientResult<CreateCallResponse> {
        self.record("create-call".to_string(), "create-call")?;
        let id = Uuid::new_v4();
        let mut participants = HashMap::new();
        participants.insert(self.user, ParticipantStatus::Joined);
        if let Some(t) = target_user_id {
            participants.insert(t, ParticipantStatus::Ringing);
        }
        self.hub.calls.lock().unwrap().insert(
            id,
            HubCall {
                status: CallStatus::Ringing,
                participants: participants.clone(),
            },
        );
        Ok(CreateCallResponse {
            success: true,
            call: CallRecord {
                id: id.to_string(),
                caller_id: self.user.to_string(),
                call_type: kind,
                conversation_id: conversation_id.map(|c| c.to_string()),
                status: CallStatus::Ringing,
                created_at_ms: 0,
                started_at_ms: None,
                ended_at_ms: None,
            },
            participants: participants
                .into_iter()
                .map(|(user, status)| ParticipantRecord {
                    call_id: id.to_string(),
                    user_id: user.to_string(),
                    status,
                    joined_at_ms: None,
                    left_at_ms: None,
                })
                .collect(),
        })
    }

    async fn join_call(&self, call_id: Uuid) -> RelayClientResult<()> {
        self.record("join-call".to_string(), "join-call")?;
        let user = self.user;
        self.with_call(call_id, |c| {
            if c.status.is_terminal() {
                return Err(RelayClientError::InvalidParameters);
            }
            c.participants.insert(user, ParticipantStatus::Joined);
            c.status = CallStatus::Ongoing;
            Ok(())
        })
    }

    async fn send_signal(
        &self,
        call_id: Uuid,
        target_user_id: Uuid,
        signal_type: SignalType,
        signal_data: serde_json::Value,
    ) -> RelayClientResult<SendSignalResponse> {
        self.record(format!("send-signal:{}", signal_type.as_str()), "send-signal")?;
        self.with_call(call_id, |c| {
            if c.status.is_terminal() {
                return Err(RelayClientError::InvalidParameters);
            }
            if !c.participants.contains_key(&target_user_id) {
                return Err(RelayClientError::NotFound);
            }
            Ok(())
        })?;
        let seq = self.hub.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = SignalRecord {
            seq,
            id: Uuid::new_v4().to_string(),
            call_id: call_id.to_string(),
            from_user_id: self.user.to_string(),
            to_user_id: target_user_id.to_string(),
            signal_type,
            signal_data,
            created_at_ms: 0,
        };
        let id = record.id.clone();
        self.hub
            .outbox
            .lock()
            .unwrap()
            .entry(target_user_id)
            .or_default()
            .push(record);
        Ok(SendSignalResponse { success: true, id, seq })
    }

    async fn end_call(&self, call_id: Uuid) -> RelayClientResult<()> {
        self.record("end-call".to_string(), "end-call")?;
        let user = self.user;
        self.with_call(call_id, |c| {
            c.participants.insert(user, ParticipantStatus::Left);
            if !c.status.is_terminal() {
                c.status = CallStatus::Ended;
            }
            Ok(())
        })
    }

    async fn reject_call(&self, call_id: Uuid) -> RelayClientResult<()> {
        self.record("reject-call".to_string(), "reject-call")?;
        let user = self.user;
        self.with_call(call_id, |c| {
            if c.status.is_terminal() {
                return Err(RelayClientError::InvalidParameters);
            }
            c.participants.insert(user, ParticipantStatus::Rejected);
            if c.participants.values().all(|s| *s != ParticipantStatus::Ringing) {
                c.status = CallStatus::Rejected;
            }
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct FakeDevices {
    pub fail_microphone: AtomicBool,
    pub fail_camera: AtomicBool,
    /// Microphone acquisition never completes (a permission prompt nobody answers).
    pub hang: AtomicBool,
    opened: Mutex<Vec<Arc<LocalTrack>>>,
}

impl FakeDevices {
    pub fn opened(&self) -> Vec<Arc<LocalTrack>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn last_display(&self) -> Option<Arc<LocalTrack>> {
        self.opened()
            .into_iter()
            .rev()
            .find(|t| t.source() == TrackSource::Display)
    }

    fn open(&self, kind: TrackKind, source: TrackSource) -> Arc<LocalTrack> {
        let t = LocalTrack::new(kind, source);
        self.opened.lock().unwrap().push(t.clone());
        t
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open_microphone(&self) -> Result<Arc<LocalTrack>> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_microphone.load(Ordering::SeqCst) {
            return Err(anyhow!("microphone permission denied"));
        }
        Ok(self.open(TrackKind::Audio, TrackSource::Microphone))
    }

    async fn open_camera(&self, facing: CameraFacing) -> Result<Arc<LocalTrack>> {
        if self.fail_camera.load(Ordering::SeqCst) {
            return Err(anyhow!("camera busy"));
        }
        Ok(self.open(TrackKind::Video, TrackSource::Camera(facing)))
    }

    async fn open_display(&self) -> Result<Arc<LocalTrack>> {
        Ok(self.open(TrackKind::Video, TrackSource::Display))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    AddTrack(TrackKind, String),
    ReplaceTrack(TrackKind, String),
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

pub struct FakeTransport {
    events: mpsc::Sender<TransportEvent>,
    ops: Mutex<Vec<TransportOp>>,
    pub fail_offer: AtomicBool,
}

impl FakeTransport {
    pub fn ops(&self) -> Vec<TransportOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                TransportOp::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.ops().contains(&TransportOp::Close)
    }

    /// Raises an event the way the real transport's callbacks would.
    pub async fn emit(&self, ev: TransportEvent) {
        let _ = self.events.send(ev).await;
    }

    fn push(&self, op: TransportOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        self.push(TransportOp::AddTrack(track.kind(), track.id().to_string()));
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Arc<LocalTrack>) -> Result<()> {
        self.push(TransportOp::ReplaceTrack(kind, track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.push(TransportOp::CreateOffer);
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(anyhow!("no codecs"));
        }
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 offer".to_string(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.push(TransportOp::CreateAnswer);
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 answer".to_string(),
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.push(TransportOp::SetRemote(desc.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.starts_with("bad") {
            return Err(anyhow!("unparseable candidate"));
        }
        self.push(TransportOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.push(TransportOp::Close);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransports {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    pub fail_offer: AtomicBool,
}

impl FakeTransports {
    pub fn last(&self) -> Arc<FakeTransport> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport created")
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl TransportFactory for FakeTransports {
    async fn create(&self, events: mpsc::Sender<TransportEvent>) -> Result<Arc<dyn PeerTransport>> {
        let t = Arc::new(FakeTransport {
            events,
            ops: Mutex::new(Vec::new()),
            fail_offer: AtomicBool::new(self.fail_offer.load(Ordering::SeqCst)),
        });
        self.created.lock().unwrap().push(t.clone());
        Ok(t)
    }
}

pub struct Kit {
    pub deps: SessionDeps,
    pub devices: Arc<FakeDevices>,
    pub transports: Arc<FakeTransports>,
    pub events: broadcast::Receiver<CallEvent>,
}

pub fn kit(relay: Arc<dyn RelayApi>) -> Kit {
    let devices = Arc::new(FakeDevices::default());
    let transports = Arc::new(FakeTransports::default());
    let (events_tx, events) = broadcast::channel(256);
    Kit {
        deps: SessionDeps {
            relay,
            devices: devices.clone(),
            transports: transports.clone(),
            events: events_tx,
        },
        devices,
        transports,
        events,
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
