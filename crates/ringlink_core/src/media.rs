/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Local capture tracks and the device seam that produces them.
//!
//! Capture itself lives in the embedding app: it implements [`MediaDevices`] and pushes
//! encoded samples into the [`LocalTrack`]s it hands out. The session only toggles,
//! swaps and stops tracks.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    Front,
    Back,
}

impl CameraFacing {
    pub fn opposite(self) -> Self {
        match self {
            CameraFacing::Front => CameraFacing::Back,
            CameraFacing::Back => CameraFacing::Front,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera(CameraFacing),
    Display,
}

#[derive(Debug, Clone)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    samples: broadcast::Sender<MediaSample>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> Arc<Self> {
        let (ended, _) = watch::channel(false);
        let (samples, _) = broadcast::channel(64);
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source,
            enabled: AtomicBool::new(true),
            ended,
            samples,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Disabled tracks stay attached but their samples are not sent.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Releases the capture. Also how a device reports an OS-level revoke.
    pub fn stop(&self) {
        self.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    pub fn ended_watch(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    /// Called by the capture side for every encoded frame. Returns false once stopped.
    pub fn push_sample(&self, data: Bytes, duration: Duration) -> bool {
        if self.is_ended() {
            return false;
        }
        let _ = self.samples.send(MediaSample { data, duration });
        true
    }

    pub fn subscribe_samples(&self) -> broadcast::Receiver<MediaSample> {
        self.samples.subscribe()
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self) -> Result<Arc<LocalTrack>>;
    async fn open_camera(&self, facing: CameraFacing) -> Result<Arc<LocalTrack>>;
    /// Screen or window capture.
    async fn open_display(&self) -> Result<Arc<LocalTrack>>;
}
