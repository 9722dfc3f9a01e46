/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use ringlink_protocol::InvitationEvent;
use serde::Serialize;
use uuid::Uuid;

use crate::session::SessionState;
use crate::transport::RemoteTrackInfo;

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What the app layer (call screen, ringtone, notifications) listens to.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallEvent {
    Incoming {
        ts_ms: u64,
        invitation: InvitationEvent,
    },
    StateChanged {
        ts_ms: u64,
        call_id: Option<Uuid>,
        state: SessionState,
    },
    RemoteTrack {
        ts_ms: u64,
        call_id: Option<Uuid>,
        track: RemoteTrackInfo,
    },
    Error {
        ts_ms: u64,
        call_id: Option<Uuid>,
        message: String,
    },
}

impl CallEvent {
    pub fn incoming(invitation: InvitationEvent) -> Self {
        CallEvent::Incoming {
            ts_ms: now_ms_u64(),
            invitation,
        }
    }

    pub fn state(call_id: Option<Uuid>, state: SessionState) -> Self {
        CallEvent::StateChanged {
            ts_ms: now_ms_u64(),
            call_id,
            state,
        }
    }

    pub fn remote_track(call_id: Option<Uuid>, track: RemoteTrackInfo) -> Self {
        CallEvent::RemoteTrack {
            ts_ms: now_ms_u64(),
            call_id,
            track,
        }
    }

    pub fn error(call_id: Option<Uuid>, message: impl Into<String>) -> Self {
        CallEvent::Error {
            ts_ms: now_ms_u64(),
            call_id,
            message: message.into(),
        }
    }
}
