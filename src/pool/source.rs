use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::BlockAddress;
use crate::error::NetworkError;

/// Transport that turns a block address into the block's bytes.
pub trait BlockSource: Send + Sync {
    fn fetch(&self, address: &BlockAddress) -> Result<Vec<u8>, NetworkError>;
}

/// Fetches `GET <base_url>/<address>` and expects exactly the address's size.
pub struct HttpSource {
    base_url: String,
    client: reqwest::Client,
    handle: Handle,
    timeout: Duration,
    cancel: CancellationToken,
}

/// Upper bound on the up-front body allocation; larger blocks grow as they arrive.
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

impl HttpSource {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// `handle` drives the requests; `fetch` must be called off the runtime's
    /// worker threads (e.g. from `spawn_blocking`).
    pub fn new(
        base_url: impl Into<String>,
        handle: Handle,
        cancel: CancellationToken,
    ) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| NetworkError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
            handle,
            timeout: Self::DEFAULT_TIMEOUT,
            cancel,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url_for(&self, address: &BlockAddress) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), address.as_str())
    }

    async fn get(
        &self,
        url: &str,
        address: &BlockAddress,
        expected: u64,
    ) -> Result<Vec<u8>, NetworkError> {
        let mut resp = self.client.get(url).send().await.map_err(reqwest_error)?;
        if !resp.status().is_success() {
            return Err(NetworkError::Status {
                status: resp.status().as_u16(),
            });
        }
        let wrong_length = |actual: u64| NetworkError::ShortBody {
            address: address.to_string(),
            expected,
            actual,
        };
        if let Some(declared) = resp.content_length() {
            if declared != expected {
                return Err(wrong_length(declared));
            }
        }

        // Never buffer more than one byte past the block size.
        let mut body = Vec::with_capacity(expected.min(MAX_PREALLOC) as usize);
        while let Some(chunk) = resp.chunk().await.map_err(reqwest_error)? {
            if body.len() as u64 + chunk.len() as u64 > expected {
                return Err(wrong_length(body.len() as u64 + chunk.len() as u64));
            }
            body.extend_from_slice(&chunk);
        }
        if body.len() as u64 != expected {
            return Err(wrong_length(body.len() as u64));
        }
        Ok(body)
    }
}

impl BlockSource for HttpSource {
    fn fetch(&self, address: &BlockAddress) -> Result<Vec<u8>, NetworkError> {
        let expected = address.size()?;
        let url = self.url_for(address);
        debug!(%url, "GET block");

        self.handle.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(NetworkError::Cancelled),
                res = tokio::time::timeout(self.timeout, self.get(&url, address, expected)) => {
                    res.unwrap_or(Err(NetworkError::Timeout(self.timeout)))
                }
            }
        })
    }
}

fn reqwest_error(err: reqwest::Error) -> NetworkError {
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        source = inner.source();
    }
    NetworkError::Transport(msg)
}

/// Serves zero-filled blocks of the requested size after a fixed delay.
/// Stands in for a block store when measuring how a patch would behave over
/// a slow link.
pub struct SimulatedSource {
    latency: Duration,
}

impl SimulatedSource {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl BlockSource for SimulatedSource {
    fn fetch(&self, address: &BlockAddress) -> Result<Vec<u8>, NetworkError> {
        let size = address.size()?;
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        Ok(vec![0u8; size as usize])
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Fetch, retrying transient failures with exponential backoff.
pub fn fetch_with_retries(
    source: &dyn BlockSource,
    address: &BlockAddress,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, NetworkError> {
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(NetworkError::Cancelled);
        }
        match source.fetch(address) {
            Ok(data) => return Ok(data),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(%address, attempt, error = %e, "block fetch failed, retrying in {backoff:?}");
                sleep_unless_cancelled(backoff, cancel)?;
                backoff = backoff.saturating_mul(2).min(policy.max_backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn sleep_unless_cancelled(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), NetworkError> {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(NetworkError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}
