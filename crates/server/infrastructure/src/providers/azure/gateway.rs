//! Rate-limited cloud gateway.
//!
//! Every outgoing ARM call is funnelled through one of four named token
//! buckets, so a scan pass over thousands of workers cannot exhaust the
//! subscription's request quota. The gateway also owns retry: throttling
//! and server-side failures are retried with backoff, every other failure
//! is surfaced to the caller untouched so the step engine can tell a 404
//! apart from a real error.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use cirrus_shared::config::{ApiRateLimits, RateLimitSettings};

use super::client::CloudError;

/// The named buckets cloud calls draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
    /// Mutations: create-or-update and delete calls
    Query,
    /// Point reads of a single resource
    Get,
    /// Listing calls
    List,
    /// Async-operation polling
    OpRead,
}

impl BucketKind {
    fn as_str(&self) -> &'static str {
        match self {
            BucketKind::Query => "query",
            BucketKind::Get => "get",
            BucketKind::List => "list",
            BucketKind::OpRead => "op-read",
        }
    }
}

/// Token bucket with continuous refill.
struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(settings: RateLimitSettings) -> Self {
        let capacity = f64::from(settings.capacity);
        let interval_secs = (settings.interval_ms as f64 / 1000.0).max(0.001);
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_rate: capacity / interval_secs,
        }
    }

    /// Take one token, sleeping until one is available.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let needed = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(needed / self.refill_rate))
                }
            };

            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Severity attached to a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffLevel {
    Notice,
    Warning,
}

/// A retry decision from the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub delay: Duration,
    pub level: BackoffLevel,
}

/// Classify a failed cloud call.
///
/// - 429: throttled; back off `base * 50` and note it
/// - 5xx and transport failures: back off `base * 2^tries` and warn
/// - anything else (404 included): not retryable here, propagate
pub fn classify_for_retry(error: &CloudError, tries: u32, base: Duration) -> Option<Backoff> {
    match error.status() {
        Some(429) => Some(Backoff {
            delay: base * 50,
            level: BackoffLevel::Notice,
        }),
        Some(status) if status >= 500 => Some(Backoff {
            delay: base * 2u32.saturating_pow(tries),
            level: BackoffLevel::Warning,
        }),
        Some(_) => None,
        None => match error {
            CloudError::Transport { .. } => Some(Backoff {
                delay: base * 2u32.saturating_pow(tries),
                level: BackoffLevel::Warning,
            }),
            _ => None,
        },
    }
}

/// Process-wide gateway all cloud calls go through.
pub struct CloudGateway {
    buckets: HashMap<BucketKind, TokenBucket>,
    backoff_delay: Duration,
    max_tries: u32,
}

impl CloudGateway {
    pub fn new(limits: ApiRateLimits, backoff_delay: Duration) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(BucketKind::Query, TokenBucket::new(limits.query));
        buckets.insert(BucketKind::Get, TokenBucket::new(limits.get));
        buckets.insert(BucketKind::List, TokenBucket::new(limits.list));
        buckets.insert(BucketKind::OpRead, TokenBucket::new(limits.op_read));
        Self {
            buckets,
            backoff_delay,
            max_tries: 5,
        }
    }

    /// Run `call` under the named bucket, retrying transient failures.
    ///
    /// `call` is re-invoked from scratch on every retry, so it must build a
    /// fresh request each time.
    pub async fn enqueue<T, F, Fut>(
        &self,
        bucket: BucketKind,
        context: &str,
        call: F,
    ) -> Result<T, CloudError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let mut tries = 0;
        loop {
            self.buckets[&bucket].acquire().await;

            match call().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let backoff = classify_for_retry(&error, tries, self.backoff_delay);
                    match backoff {
                        Some(backoff) if tries < self.max_tries => {
                            match backoff.level {
                                BackoffLevel::Notice => info!(
                                    bucket = bucket.as_str(),
                                    context,
                                    tries,
                                    delay_ms = backoff.delay.as_millis() as u64,
                                    error = %error,
                                    "cloud call throttled, backing off"
                                ),
                                BackoffLevel::Warning => warn!(
                                    bucket = bucket.as_str(),
                                    context,
                                    tries,
                                    delay_ms = backoff.delay.as_millis() as u64,
                                    error = %error,
                                    "cloud call failed, backing off"
                                ),
                            }
                            tokio::time::sleep(backoff.delay).await;
                            tries += 1;
                        }
                        _ => return Err(error),
                    }
                }
            }
        }
    }
}
