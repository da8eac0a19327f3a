//! Connection pool (component D): idle, handshaken connections keyed by
//! address string, shared between the async RPC client and the query op
//! handler's blocking workers. Protected with `std::sync::Mutex` rather than
//! an async mutex — both callers only ever hold the lock across plain data
//! manipulation, never across an `.await`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::config::PoolConfig;

struct PooledConn {
    stream: TcpStream,
    stored_at: Instant,
}

struct Inner {
    by_host: HashMap<String, Vec<PooledConn>>,
    num_pooled: u64,
}

/// Keyed pool of READY-state connections. A connection only ever enters the
/// pool after a successful HELLO/HELLO_ACK handshake; `acquire` never returns
/// a connection that still needs handshaking.
pub struct ConnectionPool {
    max_conns: u64,
    max_conns_per_host: u64,
    max_conn_age: Duration,
    io_timeout: Duration,
    inner: Mutex<Inner>,
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            max_conns: config.max_conns,
            max_conns_per_host: config.max_conns_per_host,
            max_conn_age: config.max_conn_age(),
            io_timeout: config.io_timeout(),
            inner: Mutex::new(Inner {
                by_host: HashMap::new(),
                num_pooled: 0,
            }),
        }
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Pops the most recently released connection for `host`, discarding any
    /// entries that have aged past `max_conn_age` along the way.
    pub fn acquire(&self, host: &str) -> Option<TcpStream> {
        let mut guard = self.inner.lock().expect("connection pool mutex poisoned");
        let Inner { by_host, num_pooled } = &mut *guard;
        let bucket = by_host.get_mut(host)?;
        while let Some(candidate) = bucket.pop() {
            *num_pooled -= 1;
            if candidate.stored_at.elapsed() <= self.max_conn_age {
                return Some(candidate.stream);
            }
            tracing::debug!(host, "dropping pooled connection past max_conn_age");
        }
        None
    }

    /// Returns a connection to the pool, or drops it if the host or global
    /// cap is already full.
    pub fn release(&self, host: &str, stream: TcpStream) {
        let mut inner = self.inner.lock().expect("connection pool mutex poisoned");
        if inner.num_pooled >= self.max_conns {
            return;
        }
        let bucket = inner.by_host.entry(host.to_string()).or_default();
        if bucket.len() as u64 >= self.max_conns_per_host {
            return;
        }
        bucket.push(PooledConn {
            stream,
            stored_at: Instant::now(),
        });
        inner.num_pooled += 1;
    }

    pub fn pooled_count(&self) -> u64 {
        self.inner.lock().expect("connection pool mutex poisoned").num_pooled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = listener.accept();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(accept, connect);
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn acquire_returns_none_for_unknown_host() {
        let pool = ConnectionPool::new(&PoolConfig::default());
        assert!(pool.acquire("127.0.0.1:1").is_none());
    }

    #[tokio::test]
    async fn release_then_acquire_roundtrips() {
        let pool = ConnectionPool::new(&PoolConfig::default());
        let (a, _b) = loopback_pair().await;
        pool.release("h1", a);
        assert_eq!(pool.pooled_count(), 1);
        assert!(pool.acquire("h1").is_some());
        assert_eq!(pool.pooled_count(), 0);
    }

    #[tokio::test]
    async fn release_respects_per_host_cap() {
        let mut cfg = PoolConfig::default();
        cfg.max_conns_per_host = 1;
        let pool = ConnectionPool::new(&cfg);
        let (a, _ka) = loopback_pair().await;
        let (b, _kb) = loopback_pair().await;
        pool.release("h1", a);
        pool.release("h1", b);
        assert_eq!(pool.pooled_count(), 1);
    }

    #[tokio::test]
    async fn release_respects_global_cap() {
        let mut cfg = PoolConfig::default();
        cfg.max_conns = 1;
        cfg.max_conns_per_host = 10;
        let pool = ConnectionPool::new(&cfg);
        let (a, _ka) = loopback_pair().await;
        let (b, _kb) = loopback_pair().await;
        pool.release("h1", a);
        pool.release("h2", b);
        assert_eq!(pool.pooled_count(), 1);
    }
}
