/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! [`PeerTransport`] on top of the `webrtc` crate.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::ClientConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::transport::{
    IceCandidate, PeerTransport, RemoteTrackInfo, SdpKind, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};

const STREAM_ID: &str = "ringlink";

/// Receives every RTP packet of every remote track; playback is up to the app.
pub type RemoteRtpSink = Arc<dyn Fn(&RemoteTrackInfo, webrtc::rtp::packet::Packet) + Send + Sync>;

fn build_ice_servers(cfg: &ClientConfig) -> Vec<RTCIceServer> {
    let urls = cfg.ice_urls.clone().unwrap_or_default();
    if urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls,
        username: cfg.ice_username.clone().unwrap_or_default(),
        credential: cfg.ice_credential.clone().unwrap_or_default(),
        ..Default::default()
    }]
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn map_state(s: RTCPeerConnectionState) -> Option<TransportState> {
    match s {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => bail!("rollback descriptions are not supported"),
    };
    rtc.context("parse remote sdp")
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => bail!("local description without a type"),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

fn to_rtc_candidate(c: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

fn from_rtc_candidate(c: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

#[derive(Clone)]
pub struct WebrtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
    remote_sink: Option<RemoteRtpSink>,
}

impl WebrtcTransportFactory {
    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self {
            ice_servers: build_ice_servers(cfg),
            remote_sink: None,
        }
    }

    pub fn with_remote_sink(mut self, sink: RemoteRtpSink) -> Self {
        self.remote_sink = Some(sink);
        self
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().context("register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media).context("register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await
            .context("new peer connection")?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl TransportFactory for WebrtcTransportFactory {
    async fn create(&self, events: mpsc::Sender<TransportEvent>) -> Result<Arc<dyn PeerTransport>> {
        let pc = self.new_peer_connection().await?;

        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    // None marks the end of gathering.
                    let Some(cand) = cand else { return };
                    match cand.to_json() {
                        Ok(init) => {
                            let _ = events.send(TransportEvent::LocalCandidate(from_rtc_candidate(init))).await;
                        }
                        Err(e) => warn!("local candidate to_json failed: {e:#}"),
                    }
                })
            }));
        }
        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    if let Some(s) = map_state(st) {
                        let _ = events.send(TransportEvent::StateChanged(s)).await;
                    }
                })
            }));
        }
        {
            let events = events.clone();
            let sink = self.remote_sink.clone();
            pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let events = events.clone();
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Unspecified => return,
                    };
                    let info = RemoteTrackInfo { id: track.id(), kind };
                    let _ = events.send(TransportEvent::RemoteTrack(info.clone())).await;
                    // Keep reading so the receive buffers never stall.
                    tokio::spawn(async move {
                        while let Ok((packet, _)) = track.read_rtp().await {
                            if let Some(sink) = &sink {
                                sink(&info, packet);
                            }
                        }
                        debug!(track = %info.id, "remote track ended");
                    });
                })
            }));
        }

        Ok(Arc::new(WebrtcTransport {
            pc,
            outbound: Mutex::new(HashMap::new()),
        }))
    }
}

struct Outbound {
    sender: Arc<RTCRtpSender>,
    forwarder: JoinHandle<()>,
}

pub struct WebrtcTransport {
    pc: Arc<RTCPeerConnection>,
    outbound: Mutex<HashMap<TrackKind, Outbound>>,
}

/// Copies samples from `local` into `out` while the track is enabled, until it stops.
fn spawn_forwarder(local: Arc<LocalTrack>, out: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    let mut samples = local.subscribe_samples();
    let mut ended = local.ended_watch();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                r = ended.changed() => {
                    if r.is_err() || *ended.borrow() {
                        break;
                    }
                }
                s = samples.recv() => match s {
                    Ok(s) => {
                        if !local.is_enabled() {
                            continue;
                        }
                        let sample = Sample {
                            data: s.data,
                            duration: s.duration,
                            ..Default::default()
                        };
                        if let Err(e) = out.write_sample(&sample).await {
                            debug!(track = %local.id(), "write sample: {e:#}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(track = %local.id(), skipped = n, "sample forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn static_track_for(local: &LocalTrack) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        codec_for(local.kind()),
        local.id().to_string(),
        STREAM_ID.to_string(),
    ))
}

#[async_trait]
impl PeerTransport for WebrtcTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let mut outbound = self.outbound.lock().await;
        if outbound.contains_key(&track.kind()) {
            bail!("a {:?} track is already attached", track.kind());
        }
        let rtp_track = static_track_for(&track);
        let sender = self
            .pc
            .add_track(rtp_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("add track")?;

        // RTCP has to be drained for the interceptors to work.
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let forwarder = spawn_forwarder(track.clone(), rtp_track);
        outbound.insert(track.kind(), Outbound { sender, forwarder });
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Arc<LocalTrack>) -> Result<()> {
        if track.kind() != kind {
            bail!("cannot send a {:?} track as {:?}", track.kind(), kind);
        }
        let mut outbound = self.outbound.lock().await;
        let Some(slot) = outbound.get_mut(&kind) else {
            bail!("no {kind:?} track to replace");
        };
        let rtp_track = static_track_for(&track);
        slot.sender
            .replace_track(Some(rtp_track.clone() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .context("replace track")?;
        slot.forwarder.abort();
        slot.forwarder = spawn_forwarder(track, rtp_track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.context("create offer")?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .context("set local offer")?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.context("create answer")?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .context("set local answer")?;
        from_rtc_description(&answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let rtc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .context("set remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|e| anyhow!("add ice candidate: {e}"))
    }

    async fn close(&self) -> Result<()> {
        for (_, o) in self.outbound.lock().await.drain() {
            o.forwarder.abort();
        }
        self.pc.close().await.context("close peer connection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;

    fn cfg(json: &str) -> ClientConfig {
        ClientConfig::from_json(json).unwrap()
    }

    #[test]
    fn ice_servers_only_when_configured() {
        let base = r#""relay_url":"http://127.0.0.1:8790","token":"t","user_id":"6f1c1f5e-4a43-4d6f-9d38-0e9a2d7f3b11""#;
        assert!(build_ice_servers(&cfg(&format!("{{{base}}}"))).is_empty());

        let with_turn = cfg(&format!(
            r#"{{{base},"ice_urls":["turn:turn.example.org:3478"],"ice_username":"u","ice_credential":"p"}}"#
        ));
        let servers = build_ice_servers(&with_turn);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "u");
    }

    #[test]
    fn rollback_and_unspecified_are_refused() {
        assert!(to_rtc_description(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .is_err());
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(map_state(RTCPeerConnectionState::Failed), Some(TransportState::Failed));
    }

    #[test]
    fn candidates_keep_every_field() {
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        assert_eq!(from_rtc_candidate(to_rtc_candidate(c.clone())), c);
    }

    #[tokio::test]
    async fn offer_carries_the_attached_audio() {
        let factory = WebrtcTransportFactory::from_config(&cfg(
            r#"{"relay_url":"http://127.0.0.1:8790","token":"t","user_id":"6f1c1f5e-4a43-4d6f-9d38-0e9a2d7f3b11"}"#,
        ));
        let (tx, _rx) = mpsc::channel(64);
        let t = factory.create(tx).await.unwrap();
        let mic = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone);
        t.add_track(mic.clone()).await.unwrap();
        assert!(t.add_track(mic).await.is_err());

        let offer = t.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.to_lowercase().contains("opus"));
        t.close().await.unwrap();
    }
}
