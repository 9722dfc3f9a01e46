/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The peer transport seam. The session drives negotiation through [`PeerTransport`]
//! and hears back through [`TransportEvent`]s on a channel it owns.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::media::{LocalTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Same JSON shape as a browser `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// Same JSON shape as a browser `RTCIceCandidateInit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrackInfo),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()>;
    /// Swaps the outbound track of `kind` in place, without renegotiation.
    async fn replace_track(&self, kind: TrackKind, track: Arc<LocalTrack>) -> Result<()>;
    /// Creates an offer and sets it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;
    /// Creates an answer and sets it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: mpsc::Sender<TransportEvent>) -> Result<Arc<dyn PeerTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_shaped_json() {
        let c: IceCandidate = serde_json::from_value(serde_json::json!({
            "candidate": "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
        assert!(c.username_fragment.is_none());

        let d = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&d).unwrap(),
            serde_json::json!({ "type": "offer", "sdp": "v=0" })
        );
    }
}
