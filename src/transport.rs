//! Parallel resolver transport
//!
//! Sends one marshalled outer query to every configured recursive at
//! once and returns the first raw datagram that comes back. Losing
//! tasks are aborted; per-resolver statistics survive across queries.
//!
//! The transport does not look inside the response bytes. RCODE and
//! payload validation belong to the caller.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::message::MAX_EDNS_SIZE;

/// Per-recursive performance counters.
#[derive(Debug, Clone, Default)]
pub struct ResolverStats {
    pub queries: u64,
    pub successes: u64,
    pub failures: u64,
    /// Accumulated latency of successful exchanges
    pub total_latency: Duration,
}

type StatsMap = Arc<Mutex<HashMap<String, ResolverStats>>>;

/// Races DNS queries across a set of public recursives.
pub struct Transport {
    resolvers: Vec<String>,
    timeout: Duration,
    stats: StatsMap,
}

impl Transport {
    pub fn new(resolvers: Vec<String>, timeout: Duration) -> Self {
        let stats = resolvers
            .iter()
            .map(|r| (r.clone(), ResolverStats::default()))
            .collect();

        Transport {
            resolvers,
            timeout,
            stats: Arc::new(Mutex::new(stats)),
        }
    }

    /// Sends `query` to all resolvers concurrently and returns the
    /// first successful response bytes. If every resolver fails the
    /// last error is returned; if nothing answers inside the timeout
    /// the result is a timeout error.
    pub async fn query(&self, query: &[u8]) -> Result<Vec<u8>> {
        if self.resolvers.is_empty() {
            bail!("no resolvers configured");
        }

        let (tx, mut rx) = mpsc::channel::<Result<Vec<u8>>>(self.resolvers.len());
        let mut handles = Vec::with_capacity(self.resolvers.len());

        for resolver in &self.resolvers {
            let resolver = resolver.clone();
            let query = query.to_vec();
            let tx = tx.clone();
            let stats = Arc::clone(&self.stats);
            let timeout = self.timeout;

            handles.push(tokio::spawn(async move {
                let start = Instant::now();
                let result = tokio::time::timeout(timeout, query_resolver(&resolver, &query))
                    .await
                    .map_err(|_| anyhow!("resolver {} timed out", resolver))
                    .and_then(|r| r);
                let latency = start.elapsed();

                record_stats(&stats, &resolver, result.is_ok(), latency);
                let _ = tx.send(result).await;
            }));
        }
        drop(tx);

        let winner = tokio::time::timeout(self.timeout, async {
            let mut last_err = anyhow!("all resolvers failed");
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(data) => return Ok(data),
                    Err(e) => last_err = e,
                }
            }
            Err(last_err)
        })
        .await;

        // First success wins; everything still in flight is cancelled.
        for handle in &handles {
            handle.abort();
        }

        match winner {
            Ok(result) => result,
            Err(_) => Err(anyhow!("no resolver answered within {:?}", self.timeout)),
        }
    }

    /// Snapshot of the per-resolver counters.
    pub fn stats(&self) -> HashMap<String, ResolverStats> {
        self.stats.lock().expect("transport stats poisoned").clone()
    }

    pub fn resolvers(&self) -> &[String] {
        &self.resolvers
    }
}

/// One UDP exchange with a single recursive from an ephemeral port.
async fn query_resolver(resolver: &str, query: &[u8]) -> Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind query socket")?;
    socket
        .connect(resolver)
        .await
        .with_context(|| format!("failed to connect to resolver {}", resolver))?;

    socket
        .send(query)
        .await
        .with_context(|| format!("failed to send query to {}", resolver))?;

    let mut buf = vec![0u8; MAX_EDNS_SIZE];
    let n = socket
        .recv(&mut buf)
        .await
        .with_context(|| format!("failed to read response from {}", resolver))?;
    buf.truncate(n);

    Ok(buf)
}

fn record_stats(stats: &StatsMap, resolver: &str, success: bool, latency: Duration) {
    let mut map = stats.lock().expect("transport stats poisoned");
    let entry = map.entry(resolver.to_string()).or_default();
    entry.queries += 1;
    if success {
        entry.successes += 1;
        entry.total_latency += latency;
    } else {
        entry.failures += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Binds a mock recursive that answers every datagram with `reply`
    /// after `delay`.
    async fn mock_resolver(reply: Vec<u8>, delay: Duration) -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                tokio::time::sleep(delay).await;
                let _ = socket.send_to(&reply, peer).await;
            }
        });

        addr.to_string()
    }

    #[tokio::test]
    async fn test_first_response_wins() {
        let slow = mock_resolver(b"slow".to_vec(), Duration::from_millis(300)).await;
        let fast = mock_resolver(b"fast".to_vec(), Duration::ZERO).await;

        let transport = Transport::new(vec![slow, fast], Duration::from_secs(2));
        let response = transport.query(b"query").await.unwrap();
        assert_eq!(response, b"fast");
    }

    #[tokio::test]
    async fn test_all_failed_records_failures() {
        // Nothing listens on these ports; the exchange times out.
        let transport = Transport::new(
            vec!["127.0.0.1:1".into(), "127.0.0.1:2".into()],
            Duration::from_millis(200),
        );

        assert!(transport.query(b"query").await.is_err());

        let stats = transport.stats();
        assert_eq!(stats.len(), 2);
        for stat in stats.values() {
            assert_eq!(stat.queries, 1);
            assert_eq!(stat.failures, 1);
            assert_eq!(stat.successes, 0);
        }
    }

    #[tokio::test]
    async fn test_success_updates_latency() {
        let resolver = mock_resolver(b"ok".to_vec(), Duration::from_millis(10)).await;
        let transport = Transport::new(vec![resolver.clone()], Duration::from_secs(2));

        transport.query(b"q").await.unwrap();

        let stats = transport.stats();
        let stat = &stats[&resolver];
        assert_eq!(stat.successes, 1);
        assert!(stat.total_latency >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_no_resolvers_is_an_error() {
        let transport = Transport::new(Vec::new(), Duration::from_secs(1));
        assert!(transport.query(b"q").await.is_err());
    }
}
