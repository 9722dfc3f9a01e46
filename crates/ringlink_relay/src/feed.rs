/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-process change feed: typed ledger row changes fanned out to per-user subscribers.

use ringlink_protocol::RelayEvent;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug)]
struct FeedItem {
    recipients: Vec<String>,
    event: RelayEvent,
}

#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<Arc<FeedItem>>,
}

pub enum FeedRecv {
    Event(RelayEvent),
    /// The subscriber fell behind and `n` items were dropped; it must resync from the ledger.
    Lagged(u64),
    Closed,
}

pub struct FeedSubscription {
    user_id: String,
    rx: broadcast::Receiver<Arc<FeedItem>>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn publish(&self, recipients: Vec<String>, event: RelayEvent) {
        if recipients.is_empty() {
            return;
        }
        // No live subscriber is not an error: the ledger keeps signals for replay.
        let _ = self.tx.send(Arc::new(FeedItem { recipients, event }));
    }

    pub fn subscribe(&self, user_id: &str) -> FeedSubscription {
        FeedSubscription {
            user_id: user_id.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl FeedSubscription {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next event addressed to this subscriber's user.
    pub async fn recv(&mut self) -> FeedRecv {
        loop {
            match self.rx.recv().await {
                Ok(item) => {
                    if item.recipients.iter().any(|r| r == &self.user_id) {
                        return FeedRecv::Event(item.event.clone());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => return FeedRecv::Lagged(n),
                Err(broadcast::error::RecvError::Closed) => return FeedRecv::Closed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringlink_protocol::{CallStateChanged, CallStatus};

    fn state_event(call_id: &str) -> RelayEvent {
        RelayEvent::CallState(CallStateChanged {
            call_id: call_id.to_string(),
            status: CallStatus::Ended,
            changed_at_ms: 1,
        })
    }

    #[tokio::test]
    async fn delivers_only_to_listed_recipients() {
        let feed = ChangeFeed::new(16);
        let mut alice = feed.subscribe("alice");
        let mut bob = feed.subscribe("bob");

        feed.publish(vec!["bob".to_string()], state_event("c1"));
        feed.publish(vec!["alice".to_string(), "bob".to_string()], state_event("c2"));

        match alice.recv().await {
            FeedRecv::Event(RelayEvent::CallState(ev)) => assert_eq!(ev.call_id, "c2"),
            _ => panic!("alice should only see c2"),
        }
        for expected in ["c1", "c2"] {
            match bob.recv().await {
                FeedRecv::Event(RelayEvent::CallState(ev)) => assert_eq!(ev.call_id, expected),
                _ => panic!("bob should see {expected}"),
            }
        }
    }

    #[tokio::test]
    async fn reports_lag_instead_of_silently_skipping() {
        let feed = ChangeFeed::new(16);
        let mut slow = feed.subscribe("bob");
        for i in 0..40 {
            feed.publish(vec!["bob".to_string()], state_event(&format!("c{i}")));
        }
        assert!(matches!(slow.recv().await, FeedRecv::Lagged(_)));
    }
}
