/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Client side of ringlink: call sessions, candidate buffering, the relay client and
//! the device-level call manager.

pub mod candidate_buffer;
pub mod config;
pub mod events;
pub mod manager;
pub mod media;
pub mod relay_client;
pub mod session;
pub mod transport;
pub mod webrtc_transport;

#[cfg(test)]
pub(crate) mod testkit;
