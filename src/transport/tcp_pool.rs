// src/transport/tcp_pool.rs
//
// Modbus TCP connection pool, keyed by "host:port". Entries are checked out
// exclusively for one exchange, so requests to the same endpoint are ordered.
// The pool mutex is never held across socket I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::modbus::MBAP_HEADER_LEN;

/// Pooled connections retained across exchanges. Sized for constrained
/// targets; hosts with generous memory may raise it.
pub const MAX_POOLED_CONNECTIONS: usize = 3;

/// Idle entries are closed on the next maintenance tick.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Entries older than this are closed regardless of use.
pub const POOL_MAX_AGE: Duration = Duration::from_millis(180_000);

/// Cadence of the prune task.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// One pooled connection and its bookkeeping.
pub struct PooledConn {
    stream: TcpStream,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    is_healthy: bool,
}

impl PooledConn {
    /// Whether the entry should be pruned at time `now`.
    fn should_evict(&self, now: Instant) -> bool {
        !self.is_healthy
            || now.duration_since(self.last_used) >= POOL_IDLE_TIMEOUT
            || now.duration_since(self.created_at) >= POOL_MAX_AGE
    }
}

struct PoolInner {
    entries: HashMap<String, PooledConn>,
    /// Connections currently handed to a caller
    checked_out: usize,
}

pub struct TcpPool {
    inner: Mutex<PoolInner>,
}

impl TcpPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                checked_out: 0,
            }),
        }
    }

    /// Perform one request/response exchange with the endpoint. Writes the
    /// full request, then reads one MBAP-framed response. The returned bytes
    /// include the MBAP header.
    pub async fn exchange(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        request: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let key = format!("{}:{}", host, port);
        let mut conn = self.acquire(&key, timeout).await?;

        let result = tokio::time::timeout(timeout, exchange_on(&mut conn.stream, request)).await;

        match result {
            Ok(Ok(frame)) => {
                self.release(&key, conn, true).await;
                Ok(frame)
            }
            Ok(Err(e)) => {
                self.release(&key, conn, false).await;
                Err(e)
            }
            Err(_) => {
                self.release(&key, conn, false).await;
                Err(TransportError::ReadTimeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Check out a healthy pooled entry for `key`, or open a new connection.
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<PooledConn, TransportError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(conn) = inner.entries.remove(key) {
                if !conn.should_evict(Instant::now()) {
                    inner.checked_out += 1;
                    return Ok(conn);
                }
                tdbg!("tcp_pool", "[TcpPool] Dropping stale entry for {}", key);
                // stale: fall through and dial fresh
            }

            if inner.entries.len() + inner.checked_out >= MAX_POOLED_CONNECTIONS {
                // Make room by evicting the least-recently-used pooled entry
                let lru = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, c)| c.last_used)
                    .map(|(k, _)| k.clone());
                match lru {
                    Some(k) => {
                        inner.entries.remove(&k);
                    }
                    None => return Err(TransportError::PoolExhausted),
                }
            }
            inner.checked_out += 1;
        }

        // Dial outside the lock
        match connect(key, timeout).await {
            Ok(stream) => {
                let now = Instant::now();
                Ok(PooledConn {
                    stream,
                    created_at: now,
                    last_used: now,
                    use_count: 0,
                    is_healthy: true,
                })
            }
            Err(e) => {
                self.inner.lock().await.checked_out -= 1;
                Err(e)
            }
        }
    }

    /// Return a connection after an exchange. Successful exchanges go back to
    /// the pool; failed ones are dropped and the socket closed.
    async fn release(&self, key: &str, mut conn: PooledConn, success: bool) {
        let mut inner = self.inner.lock().await;
        inner.checked_out -= 1;
        if success {
            conn.last_used = Instant::now();
            conn.use_count += 1;
            conn.is_healthy = true;
            inner.entries.insert(key.to_string(), conn);
        }
        // !success: conn drops here, closing the socket
    }

    /// Prune idle, aged and unhealthy entries. Called by the maintenance task.
    pub async fn maintain(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, conn| !conn.should_evict(now));
        let pruned = before - inner.entries.len();
        if pruned > 0 {
            tdbg!("tcp_pool", "[TcpPool] Pruned {} connection(s)", pruned);
        }
    }

    pub async fn pooled_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

impl Default for TcpPool {
    fn default() -> Self {
        Self::new()
    }
}

async fn connect(key: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    match tokio::time::timeout(timeout, TcpStream::connect(key)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(TransportError::WriteFailed(format!(
            "connect to {} failed: {}",
            key, e
        ))),
        Err(_) => Err(TransportError::ConnectTimeout(key.to_string())),
    }
}

/// Write the request and read one MBAP frame (header + declared body).
async fn exchange_on(stream: &mut TcpStream, request: &[u8]) -> Result<Vec<u8>, TransportError> {
    stream
        .write_all(request)
        .await
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

    let mut header = [0u8; MBAP_HEADER_LEN];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| TransportError::WriteFailed(format!("header read failed: {}", e)))?;

    // Length counts bytes from the unit id onward; the unit id is the
    // header's last byte, so body = length - 1.
    let declared = (((header[4] as usize) << 8) | header[5] as usize).max(1);
    let mut body = vec![0u8; declared - 1];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| TransportError::WriteFailed(format!("body read failed: {}", e)))?;

    let mut frame = header.to_vec();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Spawn the periodic pool maintenance task.
pub fn spawn_maintenance_task(
    pool: Arc<TcpPool>,
    flags: Arc<crate::ControlFlags>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            timer.tick().await;
            if flags.stopped() {
                break;
            }
            pool.maintain().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::{build_tcp_request, parse_tcp_response};
    use tokio::net::TcpListener;

    /// Minimal scripted Modbus TCP slave: answers every read with fixed words.
    async fn spawn_slave(words: Vec<u16>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let words = words.clone();
                tokio::spawn(async move {
                    let mut request = [0u8; 12];
                    while socket.read_exact(&mut request).await.is_ok() {
                        let byte_count = words.len() * 2;
                        let mut response = vec![
                            request[0],
                            request[1],
                            0,
                            0,
                            ((3 + byte_count) >> 8) as u8,
                            (3 + byte_count) as u8,
                            request[6],
                            request[7],
                            byte_count as u8,
                        ];
                        for w in &words {
                            response.push((w >> 8) as u8);
                            response.push((w & 0xFF) as u8);
                        }
                        if socket.write_all(&response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_exchange_and_reuse() {
        let addr = spawn_slave(vec![0x0064]).await;
        let pool = TcpPool::new();
        let timeout = Duration::from_millis(1000);

        let (tid, request) = build_tcp_request(1, 3, 0, 1);
        let frame = pool
            .exchange(&addr.ip().to_string(), addr.port(), timeout, &request)
            .await
            .unwrap();
        let payload = parse_tcp_response(&frame, tid, 1, 3).unwrap();
        assert_eq!(payload, vec![0x00, 0x64]);
        assert_eq!(pool.pooled_count().await, 1);

        // Second exchange reuses the pooled connection
        let (tid, request) = build_tcp_request(1, 3, 0, 1);
        let frame = pool
            .exchange(&addr.ip().to_string(), addr.port(), timeout, &request)
            .await
            .unwrap();
        parse_tcp_response(&frame, tid, 1, 3).unwrap();
        assert_eq!(pool.pooled_count().await, 1);

        let inner = pool.inner.lock().await;
        let conn = inner.entries.values().next().unwrap();
        assert_eq!(conn.use_count, 2);
        assert_eq!(inner.checked_out, 0);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let pool = TcpPool::new();
        // RFC 5737 TEST-NET address: never reachable
        let result = pool
            .exchange("192.0.2.1", 502, Duration::from_millis(50), &[0u8; 12])
            .await;
        // Blackhole addresses time out; some environments reject outright
        assert!(matches!(
            result,
            Err(TransportError::ConnectTimeout(_)) | Err(TransportError::WriteFailed(_))
        ));
        assert_eq!(pool.pooled_count().await, 0);
    }

    #[tokio::test]
    async fn test_eviction_policy() {
        let addr = spawn_slave(vec![1]).await;
        let pool = TcpPool::new();
        let timeout = Duration::from_millis(1000);
        let (_, request) = build_tcp_request(1, 3, 0, 1);
        pool.exchange(&addr.ip().to_string(), addr.port(), timeout, &request)
            .await
            .unwrap();

        // Force the entry past its idle window, then prune
        {
            let mut inner = pool.inner.lock().await;
            let conn = inner.entries.values_mut().next().unwrap();
            conn.last_used = Instant::now() - POOL_IDLE_TIMEOUT;
        }
        pool.maintain().await;
        assert_eq!(pool.pooled_count().await, 0);
    }

    #[tokio::test]
    async fn test_cap_evicts_lru() {
        let a = spawn_slave(vec![1]).await;
        let b = spawn_slave(vec![2]).await;
        let c = spawn_slave(vec![3]).await;
        let d = spawn_slave(vec![4]).await;
        let pool = TcpPool::new();
        let timeout = Duration::from_millis(1000);

        for addr in [&a, &b, &c, &d] {
            let (_, request) = build_tcp_request(1, 3, 0, 1);
            pool.exchange(&addr.ip().to_string(), addr.port(), timeout, &request)
                .await
                .unwrap();
        }

        // Cap holds: the fourth endpoint displaced the least-recently-used
        let inner = pool.inner.lock().await;
        assert_eq!(inner.entries.len(), MAX_POOLED_CONNECTIONS);
        assert!(!inner.entries.contains_key(&format!("{}:{}", a.ip(), a.port())));
        assert!(inner.entries.contains_key(&format!("{}:{}", d.ip(), d.port())));
    }
}
