/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Outbound HTTP retry policy shared by the relay client and the relay's webhooks.

use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

const MAX_ATTEMPTS: u32 = 5;

/// Doubling delay schedule, capped, with up to `jitter` added on each sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub first: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5))
    }
}

impl Backoff {
    pub const fn new(first: Duration, cap: Duration) -> Self {
        Self {
            first,
            cap,
            jitter: Duration::from_millis(200),
        }
    }

    /// Delay before retry `n` (0-based), jitter excluded.
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.min(30)).unwrap_or(u32::MAX);
        self.first.saturating_mul(factor).min(self.cap)
    }

    pub async fn sleep(&self, n: u32) {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        tokio::time::sleep(self.delay(n) + Duration::from_millis(extra)).await;
    }
}

/// Throttling and server faults are worth another attempt; any other status is final.
pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Sends the request produced by `build`, at most `attempts` times (1 to 5).
///
/// Connection errors and retryable statuses are retried after `backoff`. Whatever the
/// last attempt produced is returned, so callers still see a final 503 as a response.
pub async fn send_retrying<F>(mut build: F, attempts: u32, backoff: Backoff) -> reqwest::Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let attempts = attempts.clamp(1, MAX_ATTEMPTS);
    let mut n = 0;
    loop {
        let last = n + 1 >= attempts;
        match build().send().await {
            Ok(resp) if last || !is_retryable(resp.status()) => return Ok(resp),
            Err(e) if last => return Err(e),
            Ok(resp) => debug!(status = %resp.status(), attempt = n + 1, "retryable status"),
            Err(e) => debug!(attempt = n + 1, "request failed: {e}"),
        }
        backoff.sleep(n).await;
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const QUICK: Backoff = Backoff {
        first: Duration::from_millis(1),
        cap: Duration::from_millis(5),
        jitter: Duration::ZERO,
    };

    /// Answers each connection with the next status from `statuses`, repeating the last.
    async fn serve(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                let i = seen.fetch_add(1, Ordering::SeqCst);
                let status = statuses[i.min(statuses.len() - 1)];
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let reply = format!("HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{addr}/"), hits)
    }

    #[test]
    fn only_throttling_and_server_faults_are_retryable() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let b = Backoff::new(Duration::from_millis(200), Duration::from_secs(1));
        assert_eq!(b.delay(0), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(800));
        assert_eq!(b.delay(3), Duration::from_secs(1));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let (url, hits) = serve(vec![503, 500, 204]).await;
        let http = reqwest::Client::new();
        let resp = send_retrying(|| http.post(&url), 5, QUICK).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn final_attempt_returns_the_failing_response() {
        let (url, hits) = serve(vec![503]).await;
        let http = reqwest::Client::new();
        let resp = send_retrying(|| http.get(&url), 2, QUICK).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hits) = serve(vec![400, 204]).await;
        let http = reqwest::Client::new();
        let resp = send_retrying(|| http.get(&url), 5, QUICK).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
