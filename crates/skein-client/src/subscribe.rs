//! Follows one thread's event stream over HTTP, reconnecting until it ends.

use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use reqwest::header::ACCEPT;
use tokio_util::sync::CancellationToken;

use skein_core::ids::ThreadId;
use skein_core::wire::decode_line;

use crate::error::{ClientError, Result};
use crate::session::{ConsumerSession, SessionUpdate};

#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    pub base_url: String,
    /// Sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9091".to_string(),
            token: None,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
            max_attempts: Some(20),
        }
    }
}

/// How one connection ended.
enum Pass {
    Finished,
    Resync,
    Ended,
}

pub struct Subscriber {
    client: reqwest::Client,
    config: SubscriberConfig,
}

impl Subscriber {
    pub fn new(config: SubscriberConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    pub fn events_url(&self, thread_id: &ThreadId, last_sequence: Option<u64>) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match last_sequence {
            Some(seq) => format!("{base}/threads/{thread_id}/events?last_sequence={seq}"),
            None => format!("{base}/threads/{thread_id}/events"),
        }
    }

    /// Exponential backoff with jitter: `base * 2^attempt`, capped, then
    /// spread by `± jitter_factor`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.base_delay.as_millis() as f64 * 2f64.powi(attempt.min(16) as i32);
        let capped = exp.min(self.config.max_delay.as_millis() as f64);
        let spread = capped * self.config.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Stream into `session` until the thread finishes.
    ///
    /// Reconnects pass the session's last applied sequence; after a gap the
    /// session is reset and the next connection resyncs from a snapshot.
    /// `on_update` sees every offered frame's outcome.
    pub async fn follow<F>(&self, session: &mut ConsumerSession, cancel: &CancellationToken, mut on_update: F) -> Result<()>
    where
        F: FnMut(&ConsumerSession, SessionUpdate),
    {
        let mut attempt = 0u32;
        loop {
            let last_sequence = session.last_sequence();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                r = self.stream_once(session, last_sequence, &mut on_update, &mut attempt) => r,
            };
            match result {
                Ok(Pass::Finished) => {
                    tracing::info!(thread_id = %session.thread_id(), last_sequence = session.last_sequence(), "thread finished");
                    return Ok(());
                }
                Ok(Pass::Resync) => {
                    session.prepare_resync();
                    continue;
                }
                Ok(Pass::Ended) => {
                    tracing::info!(thread_id = %session.thread_id(), "stream closed before the thread finished");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(thread_id = %session.thread_id(), attempt, error = %e, "stream failed");
                }
            }

            attempt += 1;
            if self.config.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(ClientError::RetriesExhausted { attempts: attempt });
            }
            let delay = self.retry_delay(attempt - 1);
            tracing::debug!(delay_ms = delay.as_millis() as u64, attempt, "reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn stream_once<F>(
        &self,
        session: &mut ConsumerSession,
        last_sequence: Option<u64>,
        on_update: &mut F,
        attempt: &mut u32,
    ) -> Result<Pass>
    where
        F: FnMut(&ConsumerSession, SessionUpdate),
    {
        let url = self.events_url(session.thread_id(), last_sequence);
        let mut request = self.client.get(&url).header(ACCEPT, "application/x-ndjson");
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(url = %url, "stream connected");

        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if let Some(pass) = handle_line(session, &line, on_update, attempt) {
                    return Ok(pass);
                }
            }
        }
        if !buf.is_empty() {
            if let Some(pass) = handle_line(session, &buf, on_update, attempt) {
                return Ok(pass);
            }
        }
        Ok(Pass::Ended)
    }
}

fn handle_line<F>(session: &mut ConsumerSession, line: &[u8], on_update: &mut F, attempt: &mut u32) -> Option<Pass>
where
    F: FnMut(&ConsumerSession, SessionUpdate),
{
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "skipping non-utf8 line");
            return None;
        }
    };
    let frame = match decode_line(text) {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed line");
            return None;
        }
    };
    let update = session.apply_streamed(frame);
    if matches!(update, SessionUpdate::Applied(_)) {
        *attempt = 0;
    }
    on_update(session, update);
    match update {
        SessionUpdate::ResyncRequired { .. } => Some(Pass::Resync),
        _ if session.is_finished() => Some(Pass::Finished),
        _ => None,
    }
}
