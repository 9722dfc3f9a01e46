/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types shared by the signaling relay and its clients.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound for the serialized `signalData` of a single signal.
pub const MAX_SIGNAL_DATA_BYTES: usize = 50 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Voice => "voice",
            CallKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "voice" => Some(CallKind::Voice),
            "video" => Some(CallKind::Video),
            _ => None,
        }
    }
}

/// Status of a call row. Only moves forward: `ringing -> ongoing -> ended`,
/// `ringing -> rejected` or `ringing -> missed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Ongoing,
    Ended,
    Rejected,
    Missed,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Ongoing => "ongoing",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
            CallStatus::Missed => "missed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ringing" => Some(CallStatus::Ringing),
            "ongoing" => Some(CallStatus::Ongoing),
            "ended" => Some(CallStatus::Ended),
            "rejected" => Some(CallStatus::Rejected),
            "missed" => Some(CallStatus::Missed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Rejected | CallStatus::Missed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Invited,
    Ringing,
    Joined,
    Left,
    Rejected,
}

impl ParticipantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantStatus::Invited => "invited",
            ParticipantStatus::Ringing => "ringing",
            ParticipantStatus::Joined => "joined",
            ParticipantStatus::Left => "left",
            ParticipantStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invited" => Some(ParticipantStatus::Invited),
            "ringing" => Some(ParticipantStatus::Ringing),
            "joined" => Some(ParticipantStatus::Joined),
            "left" => Some(ParticipantStatus::Left),
            "rejected" => Some(ParticipantStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice-candidate")]
    IceCandidate,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::IceCandidate => "ice-candidate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offer" => Some(SignalType::Offer),
            "answer" => Some(SignalType::Answer),
            "ice-candidate" => Some(SignalType::IceCandidate),
            _ => None,
        }
    }
}

/// One request to `POST /call`, discriminated by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RelayRequest {
    #[serde(rename_all = "camelCase")]
    CreateCall {
        call_type: CallKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
    },
    #[serde(rename_all = "camelCase")]
    JoinCall { call_id: Uuid },
    #[serde(rename_all = "camelCase")]
    SendSignal {
        call_id: Uuid,
        target_user_id: Uuid,
        signal_type: SignalType,
        signal_data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    EndCall { call_id: Uuid },
    #[serde(rename_all = "camelCase")]
    RejectCall { call_id: Uuid },
}

impl RelayRequest {
    pub fn action(&self) -> &'static str {
        match self {
            RelayRequest::CreateCall { .. } => "create-call",
            RelayRequest::JoinCall { .. } => "join-call",
            RelayRequest::SendSignal { .. } => "send-signal",
            RelayRequest::EndCall { .. } => "end-call",
            RelayRequest::RejectCall { .. } => "reject-call",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub caller_id: String,
    pub call_type: CallKind,
    pub conversation_id: Option<String>,
    pub status: CallStatus,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub ended_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub call_id: String,
    pub user_id: String,
    pub status: ParticipantStatus,
    pub joined_at_ms: Option<i64>,
    pub left_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub seq: i64,
    pub id: String,
    pub call_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub signal_type: SignalType,
    pub signal_data: serde_json::Value,
    pub created_at_ms: i64,
}

/// "Invitation created": delivered to the invitee and the notification bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationEvent {
    pub call_id: String,
    pub caller_id: String,
    pub call_type: CallKind,
    pub conversation_id: Option<String>,
    pub title: String,
    pub body: String,
}

/// "Call state changed": delivered to every participant of the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStateChanged {
    pub call_id: String,
    pub status: CallStatus,
    pub changed_at_ms: i64,
}

/// Messages pushed on the `/subscribe` change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    Invitation(InvitationEvent),
    CallState(CallStateChanged),
    Signal(SignalRecord),
    Participant(ParticipantRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCallResponse {
    pub success: bool,
    pub call: CallRecord,
    pub participants: Vec<ParticipantRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSignalResponse {
    pub success: bool,
    pub id: String,
    pub seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDetailsResponse {
    pub success: bool,
    pub call: CallRecord,
    pub participants: Vec<ParticipantRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsPollResponse {
    pub success: bool,
    pub signals: Vec<SignalRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// The closed set of failure categories a client is ever told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    AuthenticationFailed,
    InvalidParameters,
    NotFound,
    Unavailable,
}

impl ErrorCategory {
    pub fn message(self) -> &'static str {
        match self {
            ErrorCategory::AuthenticationFailed => "authentication failed",
            ErrorCategory::InvalidParameters => "invalid parameters",
            ErrorCategory::NotFound => "resource not found",
            ErrorCategory::Unavailable => "temporarily unavailable",
        }
    }

    pub fn from_message(s: &str) -> Option<Self> {
        match s {
            "authentication failed" => Some(ErrorCategory::AuthenticationFailed),
            "invalid parameters" => Some(ErrorCategory::InvalidParameters),
            "resource not found" => Some(ErrorCategory::NotFound),
            "temporarily unavailable" => Some(ErrorCategory::Unavailable),
            _ => None,
        }
    }
}
