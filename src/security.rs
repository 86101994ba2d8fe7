//! Server-side admission control
//!
//! Per-IP fixed-window rate limiting, cheap datagram validation before
//! any parsing work, and an optional connection tracker for operator
//! telemetry. All three are mutex-guarded maps swept by background
//! tasks; none holds its lock across an await point.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::crypto::{CryptoError, ReplayCache, NONCE_SIZE, REPLAY_WINDOW};
use crate::message::{RR_TYPE_A, RR_TYPE_AAAA, RR_TYPE_TXT};

/// Minimum size of a DNS message (the header alone)
const MIN_QUERY_SIZE: usize = 12;

/// Maximum accepted datagram
const MAX_QUERY_SIZE: usize = 4096;

/// Errors produced by input validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("query too small")]
    QueryTooSmall,

    #[error("query too large")]
    QueryTooLarge,

    #[error("query type not allowed")]
    QueryTypeNotAllowed,
}

struct Counter {
    count: u32,
    window_start: Instant,
}

/// Per-key fixed-window rate limiter.
///
/// The first admission in a new window resets the count to 1; inside a
/// window admissions succeed while the count stays below the limit.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    counters: Arc<Mutex<HashMap<IpAddr, Counter>>>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl RateLimiter {
    /// Creates a limiter and its sweeper. Must run on a tokio runtime.
    pub fn new(limit: u32, window: Duration) -> Self {
        let counters: Arc<Mutex<HashMap<IpAddr, Counter>>> = Arc::new(Mutex::new(HashMap::new()));

        let sweep_map = Arc::clone(&counters);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(window * 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = window * 2;
                let now = Instant::now();
                let mut map = sweep_map.lock().expect("rate limiter poisoned");
                map.retain(|_, c| now.duration_since(c.window_start) < cutoff);
            }
        });

        RateLimiter {
            limit,
            window,
            counters,
            sweeper,
        }
    }

    /// Returns true if a request from `key` is admitted.
    pub fn allow(&self, key: IpAddr) -> bool {
        let now = Instant::now();
        let mut map = self.counters.lock().expect("rate limiter poisoned");

        match map.get_mut(&key) {
            Some(c) if now.duration_since(c.window_start) < self.window => {
                if c.count >= self.limit {
                    return false;
                }
                c.count += 1;
                true
            }
            _ => {
                map.insert(
                    key,
                    Counter {
                        count: 1,
                        window_start: now,
                    },
                );
                true
            }
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.counters.lock().expect("rate limiter poisoned").len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Rejects datagrams before any parsing work is spent on them.
pub struct InputValidator {
    max_query_size: usize,
    allowed_qtypes: Option<Vec<u16>>,
}

impl Default for InputValidator {
    fn default() -> Self {
        InputValidator {
            max_query_size: MAX_QUERY_SIZE,
            allowed_qtypes: Some(vec![RR_TYPE_A, RR_TYPE_AAAA, RR_TYPE_TXT]),
        }
    }
}

impl InputValidator {
    pub fn new(max_query_size: usize, allowed_qtypes: Option<Vec<u16>>) -> Self {
        InputValidator {
            max_query_size,
            allowed_qtypes,
        }
    }

    /// Length sanity check on the raw datagram.
    pub fn validate_datagram(&self, data: &[u8]) -> Result<(), ValidationError> {
        if data.len() < MIN_QUERY_SIZE {
            return Err(ValidationError::QueryTooSmall);
        }
        if data.len() > self.max_query_size {
            return Err(ValidationError::QueryTooLarge);
        }
        Ok(())
    }

    /// Optional allow-list check on the question type.
    pub fn validate_qtype(&self, qtype: u16) -> Result<(), ValidationError> {
        match &self.allowed_qtypes {
            Some(allowed) if !allowed.contains(&qtype) => {
                Err(ValidationError::QueryTypeNotAllowed)
            }
            _ => Ok(()),
        }
    }
}

/// Per-IP sighting record for operator telemetry.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub query_count: u64,
}

/// Tracks which peers have been talking to the server.
pub struct ConnectionTracker {
    connections: Arc<Mutex<HashMap<IpAddr, ConnectionInfo>>>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl ConnectionTracker {
    const SWEEP_PERIOD: Duration = Duration::from_secs(5 * 60);
    const IDLE_CUTOFF: Duration = Duration::from_secs(10 * 60);

    pub fn new() -> Self {
        let connections: Arc<Mutex<HashMap<IpAddr, ConnectionInfo>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let sweep_map = Arc::clone(&connections);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Self::SWEEP_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut map = sweep_map.lock().expect("connection tracker poisoned");
                map.retain(|_, info| now.duration_since(info.last_seen) < Self::IDLE_CUTOFF);
            }
        });

        ConnectionTracker {
            connections,
            sweeper,
        }
    }

    pub fn track(&self, ip: IpAddr) {
        let now = Instant::now();
        let mut map = self.connections.lock().expect("connection tracker poisoned");
        map.entry(ip)
            .and_modify(|info| {
                info.last_seen = now;
                info.query_count += 1;
            })
            .or_insert(ConnectionInfo {
                first_seen: now,
                last_seen: now,
                query_count: 1,
            });
    }

    pub fn stats(&self) -> HashMap<IpAddr, ConnectionInfo> {
        self.connections
            .lock()
            .expect("connection tracker poisoned")
            .clone()
    }
}

impl Drop for ConnectionTracker {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Bundles the admission checks the server runs per datagram.
pub struct Security {
    rate_limiter: RateLimiter,
    replay_cache: ReplayCache,
    validator: InputValidator,
}

impl Security {
    /// Must run on a tokio runtime (spawns the sweep tasks).
    pub fn new(rate_limit: u32) -> Self {
        Security {
            rate_limiter: RateLimiter::new(rate_limit, Duration::from_secs(1)),
            replay_cache: ReplayCache::new(REPLAY_WINDOW),
            validator: InputValidator::default(),
        }
    }

    pub fn check_rate_limit(&self, ip: IpAddr) -> bool {
        self.rate_limiter.allow(ip)
    }

    /// Returns an error if the envelope nonce was already seen inside
    /// the replay window.
    pub fn check_replay(&self, nonce: &[u8; NONCE_SIZE]) -> Result<(), CryptoError> {
        if self.replay_cache.check(nonce) {
            return Err(CryptoError::OpenFailed);
        }
        Ok(())
    }

    pub fn validator(&self) -> &InputValidator {
        &self.validator
    }
}
