/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Holds remote ICE candidates that arrive before the remote description is applied.

use std::collections::VecDeque;
use tracing::warn;

use crate::transport::IceCandidate;

pub const MAX_PENDING_CANDIDATES: usize = 256;

#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
    remote_ready: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        if self.queue.len() >= MAX_PENDING_CANDIDATES {
            self.queue.pop_front();
            warn!(max = MAX_PENDING_CANDIDATES, "candidate buffer full, dropped oldest");
        }
        self.queue.push_back(candidate);
    }

    /// Returns the candidate for immediate use once the remote description is applied;
    /// otherwise keeps it.
    pub fn offer(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_ready {
            return Some(candidate);
        }
        self.enqueue(candidate);
        None
    }

    pub fn mark_remote_ready(&mut self) {
        self.remote_ready = true;
    }

    /// Everything queued, in arrival order. Empty until [`Self::mark_remote_ready`].
    pub fn drain_if_ready(&mut self) -> Vec<IceCandidate> {
        if !self.remote_ready {
            return Vec::new();
        }
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.remote_ready = false;
    }
}
