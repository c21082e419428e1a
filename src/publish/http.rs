// src/publish/http.rs
//
// HTTP publisher. Per interval: the newest record per device is POST/PUT/
// PATCHed to the configured endpoint as JSON or form data. Failed requests
// retry on a 1 s / 2 s / 4 s ladder; a record that exhausts its attempts is
// dropped (HTTP has no persistent buffer).

use std::sync::Arc;
use std::time::Duration;

use crate::config::types::{HttpBodyFormat, HttpConfig, HttpMethod};
use crate::error::PublishError;
use crate::poll::TelemetryRecord;
use crate::publish::{payload, PendingStore};
use crate::ControlFlags;

/// Delay before retry attempt `n` (0-based): 1 s, 2 s, 4 s, then held at 4 s.
pub fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(2))
}

pub struct HttpPublisher {
    client: reqwest::Client,
    cfg: HttpConfig,
}

impl HttpPublisher {
    pub fn new(cfg: HttpConfig) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .user_agent("fieldgate")
            .timeout(Duration::from_millis(cfg.timeout.max(100)))
            .build()
            .map_err(|e| PublishError::HttpTransportFailed(e.to_string()))?;
        Ok(Self { client, cfg })
    }

    /// Send one record, retrying per the configured budget. Returns the
    /// terminal outcome; the caller drops the record either way.
    pub async fn send_with_retry(
        &self,
        record: &TelemetryRecord,
        flags: &ControlFlags,
    ) -> Result<(), PublishError> {
        let attempts = self.cfg.retry.max(1);
        let mut last_error = PublishError::HttpTransportFailed("no attempt made".to_string());

        for attempt in 0..attempts {
            if flags.stopped() || flags.ble_command_active() {
                return Err(last_error);
            }
            match self.send_once(record).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tdbg!(
                        "http",
                        "[HTTP] Attempt {}/{} for device {} failed: {}",
                        attempt + 1,
                        attempts,
                        record.device_id,
                        e
                    );
                    last_error = e;
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(retry_delay(attempt)).await;
            }
        }
        Err(last_error)
    }

    async fn send_once(&self, record: &TelemetryRecord) -> Result<(), PublishError> {
        let mut request = match self.cfg.method {
            HttpMethod::Post => self.client.post(&self.cfg.endpoint_url),
            HttpMethod::Put => self.client.put(&self.cfg.endpoint_url),
            HttpMethod::Patch => self.client.patch(&self.cfg.endpoint_url),
        };

        for (name, value) in &self.cfg.headers {
            request = request.header(name, value);
        }

        request = match self.cfg.body_format {
            HttpBodyFormat::Json => request.json(&payload::record_payload(record)),
            HttpBodyFormat::Form => request.form(&payload::form_fields(record)),
        };

        let response = request
            .send()
            .await
            .map_err(|e| PublishError::HttpTransportFailed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(PublishError::HttpNon2xx(status.as_u16()))
        }
    }
}

/// Spawn the HTTP publish loop. Returns the pending store the dispatcher
/// feeds, and `None` for the handle when the endpoint is unconfigured.
pub fn spawn_http_publisher(
    cfg: &HttpConfig,
    flags: Arc<ControlFlags>,
) -> (Arc<PendingStore>, Option<tokio::task::JoinHandle<()>>) {
    let store = PendingStore::new();

    if cfg.endpoint_url.trim().is_empty() {
        tlog!("[HTTP] No endpoint configured; HTTP publishing disabled");
        return (store, None);
    }

    let publisher = match HttpPublisher::new(cfg.clone()) {
        Ok(p) => p,
        Err(e) => {
            tlog!("[HTTP] Failed to build client: {}", e);
            return (store, None);
        }
    };

    let interval = cfg.interval.as_duration().max(Duration::from_millis(100));
    let endpoint = cfg.endpoint_url.clone();
    let task_store = store.clone();

    let handle = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        tlog!("[HTTP] Publishing to {} every {:?}", endpoint, interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = flags.wait_stopped() => break,
            }
            if flags.ble_command_active() {
                continue;
            }

            for record in task_store.take_all() {
                if let Err(e) = publisher.send_with_retry(&record, &flags).await {
                    tlog!(
                        "[HTTP] Dropping record for device {} after retries: {}",
                        record.device_id,
                        e
                    );
                }
            }
        }
        tlog!("[HTTP] Publish loop stopped");
    });

    (store, Some(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn record() -> TelemetryRecord {
        TelemetryRecord {
            device_id: "D4A5F1".to_string(),
            device_name: "boiler".to_string(),
            timestamp: 1,
            registers: BTreeMap::new(),
        }
    }

    #[test]
    fn test_retry_ladder() {
        assert_eq!(retry_delay(0), Duration::from_secs(1));
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(2), Duration::from_secs(4));
        assert_eq!(retry_delay(7), Duration::from_secs(4));
    }

    /// One-shot HTTP server answering every request with `status`.
    async fn spawn_server(status: u16, hits: Arc<std::sync::atomic::AtomicU32>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = format!(
                    "HTTP/1.1 {} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    status
                );
                let _ = socket.write_all(body.as_bytes()).await;
            }
        });
        format!("http://{}/ingest", addr)
    }

    #[tokio::test]
    async fn test_send_success() {
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let url = spawn_server(200, hits.clone()).await;

        let mut cfg = HttpConfig::default();
        cfg.endpoint_url = url;
        cfg.retry = 3;
        let publisher = HttpPublisher::new(cfg).unwrap();
        let flags = ControlFlags::new();

        publisher.send_with_retry(&record(), &flags).await.unwrap();
        assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_non_2xx_retries_then_drops() {
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let url = spawn_server(503, hits.clone()).await;

        let mut cfg = HttpConfig::default();
        cfg.endpoint_url = url;
        cfg.retry = 2;
        let publisher = HttpPublisher::new(cfg).unwrap();
        let flags = ControlFlags::new();

        let result = publisher.send_with_retry(&record(), &flags).await;
        match result {
            Err(PublishError::HttpNon2xx(503)) => {}
            other => panic!("expected HttpNon2xx(503), got {:?}", other),
        }
        assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
