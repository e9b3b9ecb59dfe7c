//! Hybrid polling of the metrics endpoints: fast while a thread is active,
//! slow while idle.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use skein_core::ids::ThreadId;
use skein_core::usage::{AggregatedMetrics, ExecutionMetrics};

use crate::error::{ClientError, Result};

pub const FAST_INTERVAL: Duration = Duration::from_secs(2);
pub const SLOW_INTERVAL: Duration = Duration::from_secs(15);

#[async_trait]
pub trait MetricsSource: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    async fn fetch(&self) -> Result<Self::Output>;
}

/// Fetches JSON from one metrics endpoint.
pub struct HttpMetricsSource<T> {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    _output: PhantomData<fn() -> T>,
}

impl<T> HttpMetricsSource<T> {
    fn new(url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
            _output: PhantomData,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl HttpMetricsSource<ExecutionMetrics> {
    pub fn thread(base_url: &str, thread_id: &ThreadId, token: Option<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        Self::new(format!("{base}/threads/{thread_id}/metrics"), token)
    }
}

impl HttpMetricsSource<AggregatedMetrics> {
    pub fn global(base_url: &str, token: Option<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        Self::new(format!("{base}/metrics"), token)
    }
}

#[async_trait]
impl<T> MetricsSource for HttpMetricsSource<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Output = T;

    async fn fetch(&self) -> Result<T> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
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
        Ok(response.json().await?)
    }
}

/// Latest poll result. A failed fetch keeps the last good value.
#[derive(Clone, Debug)]
pub struct PollState<T> {
    pub value: Option<T>,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub fetches: u64,
}

impl<T> Default for PollState<T> {
    fn default() -> Self {
        Self {
            value: None,
            last_error: None,
            last_success: None,
            fetches: 0,
        }
    }
}

/// One cancellable polling task, keyed by `(interval, enabled)`.
///
/// [`update`](Self::update) restarts the task only when that key changes.
pub struct HybridPoller<S: MetricsSource> {
    source: Arc<S>,
    fast: Duration,
    slow: Duration,
    state: Arc<watch::Sender<PollState<S::Output>>>,
    key: Option<(Duration, bool)>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
    restarts: u64,
}

impl<S: MetricsSource> HybridPoller<S> {
    pub fn new(source: S) -> Self {
        Self::with_intervals(source, FAST_INTERVAL, SLOW_INTERVAL)
    }

    pub fn with_intervals(source: S, fast: Duration, slow: Duration) -> Self {
        let (tx, _) = watch::channel(PollState::default());
        Self {
            source: Arc::new(source),
            fast,
            slow,
            state: Arc::new(tx),
            key: None,
            task: None,
            restarts: 0,
        }
    }

    /// Recompute the cadence. `active` picks the fast interval.
    pub fn update(&mut self, active: bool, enabled: bool) {
        let interval = if active { self.fast } else { self.slow };
        let key = (interval, enabled);
        if self.key == Some(key) {
            return;
        }
        self.key = Some(key);
        self.stop_task();
        if !enabled {
            tracing::debug!("metrics polling disabled");
            return;
        }
        self.restarts += 1;
        tracing::debug!(interval_ms = interval.as_millis() as u64, "metrics polling (re)started");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.source),
            Arc::clone(&self.state),
            interval,
            cancel.clone(),
        ));
        self.task = Some((cancel, handle));
    }

    pub fn interval(&self) -> Option<Duration> {
        self.key.filter(|(_, enabled)| *enabled).map(|(interval, _)| interval)
    }

    /// How many times a polling task was started.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn latest(&self) -> PollState<S::Output> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState<S::Output>> {
        self.state.subscribe()
    }

    pub fn stop(&mut self) {
        self.key = None;
        self.stop_task();
    }

    fn stop_task(&mut self) {
        if let Some((cancel, _handle)) = self.task.take() {
            cancel.cancel();
        }
    }
}

impl<S: MetricsSource> Drop for HybridPoller<S> {
    fn drop(&mut self) {
        self.stop_task();
    }
}

async fn poll_loop<S: MetricsSource>(
    source: Arc<S>,
    state: Arc<watch::Sender<PollState<S::Output>>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = source.fetch() => r,
        };
        match result {
            Ok(value) => state.send_modify(|s| {
                s.value = Some(value);
                s.last_error = None;
                s.last_success = Some(Utc::now());
                s.fetches += 1;
            }),
            Err(e) => {
                tracing::warn!(error = %e, "metrics poll failed, keeping last value");
                state.send_modify(|s| {
                    s.last_error = Some(e.to_string());
                    s.fetches += 1;
                });
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
