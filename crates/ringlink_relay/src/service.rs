/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The five call operations: validation, authorization, ledger mutation, fan-out.

use ringlink_protocol::{
    CallDetailsResponse, CallKind, CallRecord, CallStateChanged, CreateCallResponse, InvitationEvent,
    RelayEvent, RelayRequest, SendSignalResponse, SignalRecord, SignalType, MAX_SIGNAL_DATA_BYTES,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::feed::ChangeFeed;
use crate::ledger::{now_ms, CallTransition, Ledger, Mutation};
use crate::notify::NotificationBridge;

#[derive(Clone)]
pub struct CallService {
    ledger: Ledger,
    feed: ChangeFeed,
    bridge: Arc<dyn NotificationBridge>,
}

impl CallService {
    pub fn new(ledger: Ledger, feed: ChangeFeed, bridge: Arc<dyn NotificationBridge>) -> Self {
        Self { ledger, feed, bridge }
    }

    /// Dispatches one `POST /call` request for an authenticated caller.
    pub async fn handle(&self, caller: &str, req: RelayRequest) -> RelayResult<serde_json::Value> {
        let action = req.action();
        let out = match req {
            RelayRequest::CreateCall {
                call_type,
                target_user_id,
                conversation_id,
            } => {
                let resp = self
                    .create_call(caller, call_type, target_user_id, conversation_id)
                    .await?;
                to_json(&resp)?
            }
            RelayRequest::JoinCall { call_id } => {
                self.join_call(caller, call_id).await?;
                serde_json::json!({ "success": true })
            }
            RelayRequest::SendSignal {
                call_id,
                target_user_id,
                signal_type,
                signal_data,
            } => {
                let resp = self
                    .send_signal(caller, call_id, target_user_id, signal_type, signal_data)
                    .await?;
                to_json(&resp)?
            }
            RelayRequest::EndCall { call_id } => {
                self.end_call(caller, call_id).await?;
                serde_json::json!({ "success": true })
            }
            RelayRequest::RejectCall { call_id } => {
                self.reject_call(caller, call_id).await?;
                serde_json::json!({ "success": true })
            }
        };
        info!(%caller, %action, "call action handled");
        Ok(out)
    }

    pub async fn create_call(
        &self,
        caller: &str,
        kind: CallKind,
        target_user_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> RelayResult<CreateCallResponse> {
        let target = target_user_id.map(|u| u.to_string());
        if target.as_deref() == Some(caller) {
            return Err(RelayError::Validation("cannot call yourself".to_string()));
        }
        let conversation = conversation_id.map(|u| u.to_string());

        let created = self
            .ledger
            .create_call(caller, kind, target.as_deref(), conversation.as_deref())
            .await?;

        if let Some(invitee) = target.as_deref() {
            let ev = invitation_event(&created.call);
            if let Err(e) = self.bridge.invitation_created(invitee, &ev).await {
                warn!(call_id=%created.call.id, "invitation notification failed: {e:#}");
            }
        }

        info!(call_id=%created.call.id, %caller, kind=%kind.as_str(), "call created");
        Ok(CreateCallResponse {
            success: true,
            call: created.call,
            participants: created.participants,
        })
    }

    pub async fn join_call(&self, caller: &str, call_id: Uuid) -> RelayResult<()> {
        let outcome = self.ledger.join_call(&call_id.to_string(), caller).await?;
        let transition = applied(outcome)?;
        self.fan_out(&transition).await;
        Ok(())
    }

    pub async fn end_call(&self, caller: &str, call_id: Uuid) -> RelayResult<()> {
        let outcome = self.ledger.end_call(&call_id.to_string(), caller).await?;
        let transition = applied(outcome)?;
        self.fan_out(&transition).await;
        Ok(())
    }

    pub async fn reject_call(&self, caller: &str, call_id: Uuid) -> RelayResult<()> {
        let outcome = self.ledger.reject_call(&call_id.to_string(), caller).await?;
        let transition = applied(outcome)?;
        self.fan_out(&transition).await;
        Ok(())
    }

    pub async fn send_signal(
        &self,
        caller: &str,
        call_id: Uuid,
        target_user_id: Uuid,
        signal_type: SignalType,
        signal_data: serde_json::Value,
    ) -> RelayResult<SendSignalResponse> {
        let target = target_user_id.to_string();
        if target == caller {
            return Err(RelayError::Validation("cannot signal yourself".to_string()));
        }
        validate_signal_data(&signal_data)?;

        let outcome = self
            .ledger
            .insert_signal(&call_id.to_string(), caller, &target, signal_type, signal_data)
            .await?;
        let signal = applied(outcome)?;
        let resp = SendSignalResponse {
            success: true,
            id: signal.id.clone(),
            seq: signal.seq,
        };
        self.feed
            .publish(vec![signal.to_user_id.clone()], RelayEvent::Signal(signal));
        Ok(resp)
    }

    /// Call record and participant rows, visible to participants only.
    pub async fn call_details(&self, caller: &str, call_id: Uuid) -> RelayResult<CallDetailsResponse> {
        let call_id = call_id.to_string();
        if self.ledger.participant_status(&call_id, caller).await?.is_none() {
            return Err(RelayError::NotFound);
        }
        let call = self.ledger.get_call(&call_id).await?.ok_or(RelayError::NotFound)?;
        let participants = self.ledger.list_participants(&call_id).await?;
        Ok(CallDetailsResponse {
            success: true,
            call,
            participants,
        })
    }

    pub async fn poll_signals(&self, caller: &str, after_seq: i64, limit: u32) -> RelayResult<Vec<SignalRecord>> {
        Ok(self.ledger.list_signals_after(caller, after_seq.max(0), limit).await?)
    }

    /// Marks calls nobody answered within `timeout_secs` as missed and tells the participants.
    pub async fn sweep_unanswered(&self, timeout_secs: u64) -> RelayResult<usize> {
        let cutoff = now_ms().saturating_sub((timeout_secs as i64).saturating_mul(1000));
        let swept = self.ledger.sweep_unanswered(cutoff).await?;
        let n = swept.len();
        for (call, participants) in swept {
            info!(call_id=%call.id, "call missed after ring timeout");
            let ev = CallStateChanged {
                call_id: call.id.clone(),
                status: call.status,
                changed_at_ms: call.ended_at_ms.unwrap_or_else(now_ms),
            };
            if let Err(e) = self.bridge.call_state_changed(&participants, &ev).await {
                warn!(call_id=%call.id, "call state notification failed: {e:#}");
            }
        }
        Ok(n)
    }

    async fn fan_out(&self, t: &CallTransition) {
        self.feed.publish(
            t.participant_ids.clone(),
            RelayEvent::Participant(t.participant.clone()),
        );
        if !t.status_changed {
            return;
        }
        info!(call_id=%t.call.id, status=%t.call.status.as_str(), "call status changed");
        let ev = CallStateChanged {
            call_id: t.call.id.clone(),
            status: t.call.status,
            changed_at_ms: now_ms(),
        };
        if let Err(e) = self.bridge.call_state_changed(&t.participant_ids, &ev).await {
            warn!(call_id=%t.call.id, "call state notification failed: {e:#}");
        }
    }
}

/// Invitation payload for a ringing call, as delivered to the invitee.
pub(crate) fn invitation_event(call: &CallRecord) -> InvitationEvent {
    InvitationEvent {
        call_id: call.id.clone(),
        caller_id: call.caller_id.clone(),
        call_type: call.call_type,
        conversation_id: call.conversation_id.clone(),
        title: match call.call_type {
            CallKind::Voice => "Incoming voice call".to_string(),
            CallKind::Video => "Incoming video call".to_string(),
        },
        body: format!("{} is calling you", call.caller_id),
    }
}

fn applied<T>(m: Mutation<T>) -> RelayResult<T> {
    match m {
        Mutation::Applied(v) => Ok(v),
        Mutation::NotParticipant => Err(RelayError::NotFound),
        Mutation::InvalidState(why) => Err(RelayError::InvalidState(why.to_string())),
    }
}

fn validate_signal_data(data: &serde_json::Value) -> RelayResult<()> {
    if !(data.is_object() || data.is_string()) {
        return Err(RelayError::Validation("signalData must be an object or string".to_string()));
    }
    let size = serde_json::to_vec(data)
        .map_err(|e| RelayError::Validation(format!("signalData: {e}")))?
        .len();
    if size >= MAX_SIGNAL_DATA_BYTES {
        return Err(RelayError::Validation(format!("signalData too large ({size} bytes)")));
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(v: &T) -> RelayResult<serde_json::Value> {
    serde_json::to_value(v).map_err(|e| RelayError::Internal(e.into()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::feed::FeedRecv;
    use crate::ledger::test_support::temp_ledger;
    use crate::notify::FeedBridge;
    use ringlink_protocol::{CallStatus, ParticipantStatus};

    pub(crate) fn service() -> (CallService, ChangeFeed) {
        let feed = ChangeFeed::new(256);
        let bridge = Arc::new(FeedBridge::new(feed.clone()));
        (CallService::new(temp_ledger(), feed.clone(), bridge), feed)
    }

    fn uid() -> Uuid {
        Uuid::new_v4()
    }

    fn call_uuid(resp: &CreateCallResponse) -> Uuid {
        Uuid::parse_str(&resp.call.id).unwrap()
    }

    async fn status_of(svc: &CallService, call: Uuid) -> CallStatus {
        svc.ledger.get_call(&call.to_string()).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn create_call_invites_target() {
        let (svc, feed) = service();
        let (a, b) = (uid(), uid());
        let mut b_feed = feed.subscribe(&b.to_string());

        let resp = svc
            .create_call(&a.to_string(), CallKind::Voice, Some(b), None)
            .await
            .unwrap();
        assert_eq!(resp.call.status, CallStatus::Ringing);
        assert_eq!(resp.participants[1].status, ParticipantStatus::Ringing);

        match b_feed.recv().await {
            FeedRecv::Event(RelayEvent::Invitation(inv)) => {
                assert_eq!(inv.call_id, resp.call.id);
                assert_eq!(inv.caller_id, a.to_string());
                assert_eq!(inv.call_type, CallKind::Voice);
            }
            _ => panic!("expected invitation"),
        }
    }

    #[tokio::test]
    async fn calling_yourself_is_a_validation_error() {
        let (svc, _) = service();
        let a = uid();
        let err = svc
            .create_call(&a.to_string(), CallKind::Voice, Some(a), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn all_invitees_rejecting_rejects_the_call() {
        let (svc, _) = service();
        let (a, b, c) = (uid(), uid(), uid());
        let resp = svc
            .create_call(&a.to_string(), CallKind::Video, Some(b), None)
            .await
            .unwrap();
        let call = call_uuid(&resp);
        // Second invitee added directly: the relay API only invites one target per call.
        {
            let call_id = call.to_string();
            let c = c.to_string();
            svc.ledger
                .with_test_conn(move |conn| {
                    conn.execute(
                        "INSERT INTO call_participants(call_id, user_id, status) VALUES (?1, ?2, 'ringing')",
                        rusqlite::params![call_id, c],
                    )?;
                    Ok(())
                })
                .await
                .unwrap();
        }

        svc.reject_call(&b.to_string(), call).await.unwrap();
        assert_eq!(status_of(&svc, call).await, CallStatus::Ringing);
        svc.reject_call(&c.to_string(), call).await.unwrap();
        assert_eq!(status_of(&svc, call).await, CallStatus::Rejected);
    }

    #[tokio::test]
    async fn a_joined_invitee_keeps_the_call_from_being_rejected() {
        let (svc, _) = service();
        let (a, b, c) = (uid(), uid(), uid());
        let resp = svc
            .create_call(&a.to_string(), CallKind::Voice, Some(b), None)
            .await
            .unwrap();
        let call = call_uuid(&resp);
        {
            let call_id = call.to_string();
            let c = c.to_string();
            svc.ledger
                .with_test_conn(move |conn| {
                    conn.execute(
                        "INSERT INTO call_participants(call_id, user_id, status) VALUES (?1, ?2, 'ringing')",
                        rusqlite::params![call_id, c],
                    )?;
                    Ok(())
                })
                .await
                .unwrap();
        }

        svc.join_call(&b.to_string(), call).await.unwrap();
        svc.reject_call(&c.to_string(), call).await.unwrap();
        assert_eq!(status_of(&svc, call).await, CallStatus::Ongoing);
        let err = svc.reject_call(&b.to_string(), call).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidState(_)));
    }

    #[tokio::test]
    async fn reject_notifies_the_caller() {
        let (svc, feed) = service();
        let (a, b) = (uid(), uid());
        let resp = svc
            .create_call(&a.to_string(), CallKind::Video, Some(b), None)
            .await
            .unwrap();
        let call = call_uuid(&resp);
        let mut a_feed = feed.subscribe(&a.to_string());

        svc.reject_call(&b.to_string(), call).await.unwrap();

        let mut saw_rejected = false;
        for _ in 0..2 {
            if let FeedRecv::Event(RelayEvent::CallState(ev)) = a_feed.recv().await {
                assert_eq!(ev.call_id, resp.call.id);
                saw_rejected = ev.status == CallStatus::Rejected;
            }
        }
        assert!(saw_rejected);
    }

    #[tokio::test]
    async fn outsiders_cannot_touch_a_call() {
        let (svc, _) = service();
        let (a, b, mallory) = (uid(), uid(), uid());
        let resp = svc
            .create_call(&a.to_string(), CallKind::Voice, Some(b), None)
            .await
            .unwrap();
        let call = call_uuid(&resp);
        let m = mallory.to_string();

        assert!(matches!(svc.join_call(&m, call).await, Err(RelayError::NotFound)));
        assert!(matches!(svc.end_call(&m, call).await, Err(RelayError::NotFound)));
        assert!(matches!(svc.reject_call(&m, call).await, Err(RelayError::NotFound)));
        assert!(matches!(
            svc.send_signal(&m, call, a, SignalType::Offer, serde_json::json!({ "sdp": "v=0" }))
                .await,
            Err(RelayError::NotFound)
        ));
        assert!(matches!(svc.call_details(&m, call).await, Err(RelayError::NotFound)));

        // Same answer for a call that does not exist at all.
        assert!(matches!(svc.join_call(&m, uid()).await, Err(RelayError::NotFound)));
        assert_eq!(status_of(&svc, call).await, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn oversized_or_scalar_signal_data_is_refused_before_the_ledger() {
        let (svc, _) = service();
        let (a, b) = (uid(), uid());
        let resp = svc
            .create_call(&a.to_string(), CallKind::Voice, Some(b), None)
            .await
            .unwrap();
        let call = call_uuid(&resp);

        let big = "x".repeat(MAX_SIGNAL_DATA_BYTES);
        let err = svc
            .send_signal(&a.to_string(), call, b, SignalType::Offer, serde_json::json!({ "sdp": big }))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        let err = svc
            .send_signal(&a.to_string(), call, b, SignalType::Offer, serde_json::json!(42))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        assert!(svc.poll_signals(&b.to_string(), 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn relayed_signals_reach_only_the_target() {
        let (svc, feed) = service();
        let (a, b) = (uid(), uid());
        let resp = svc
            .create_call(&a.to_string(), CallKind::Voice, Some(b), None)
            .await
            .unwrap();
        let call = call_uuid(&resp);
        let mut b_feed = feed.subscribe(&b.to_string());

        let sent = svc
            .send_signal(
                &a.to_string(),
                call,
                b,
                SignalType::Offer,
                serde_json::json!({ "type": "offer", "sdp": "v=0" }),
            )
            .await
            .unwrap();

        match b_feed.recv().await {
            FeedRecv::Event(RelayEvent::Signal(s)) => {
                assert_eq!(s.seq, sent.seq);
                assert_eq!(s.from_user_id, a.to_string());
                assert_eq!(s.signal_type, SignalType::Offer);
            }
            _ => panic!("expected signal"),
        }
        assert!(svc.poll_signals(&a.to_string(), 0, 10).await.unwrap().is_empty());
        assert_eq!(svc.poll_signals(&b.to_string(), 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn join_then_end_walks_the_status_forward() {
        let (svc, _) = service();
        let (a, b) = (uid(), uid());
        let resp = svc
            .create_call(&a.to_string(), CallKind::Voice, Some(b), None)
            .await
            .unwrap();
        let call = call_uuid(&resp);

        svc.join_call(&b.to_string(), call).await.unwrap();
        assert_eq!(status_of(&svc, call).await, CallStatus::Ongoing);
        svc.end_call(&b.to_string(), call).await.unwrap();
        assert_eq!(status_of(&svc, call).await, CallStatus::Ended);
        svc.end_call(&a.to_string(), call).await.unwrap();

        let details = svc.call_details(&a.to_string(), call).await.unwrap();
        assert!(details.call.ended_at_ms.is_some());
        assert!(details
            .participants
            .iter()
            .all(|p| p.status == ParticipantStatus::Left));
        assert!(matches!(
            svc.send_signal(&a.to_string(), call, b, SignalType::IceCandidate, serde_json::json!({}))
                .await,
            Err(RelayError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn sweep_misses_stale_calls_and_notifies() {
        let (svc, feed) = service();
        let (a, b) = (uid(), uid());
        let resp = svc
            .create_call(&a.to_string(), CallKind::Voice, Some(b), None)
            .await
            .unwrap();
        let mut a_feed = feed.subscribe(&a.to_string());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(svc.sweep_unanswered(0).await.unwrap(), 1);
        match a_feed.recv().await {
            FeedRecv::Event(RelayEvent::CallState(ev)) => {
                assert_eq!(ev.call_id, resp.call.id);
                assert_eq!(ev.status, CallStatus::Missed);
            }
            _ => panic!("expected missed notification"),
        }
    }
}
