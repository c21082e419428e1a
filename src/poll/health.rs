// src/poll/health.rs
//
// Per-device health state and metrics. Runtime only, never persisted:
// entries are created when a device first appears in config and dropped when
// it is removed.
//
// State machine:
//   Enabled --(consecutive_failures >= retry_limit)--> AutoDisabledRetry
//   AutoDisabledRetry --(probe ok)--> Enabled
//   AutoDisabledRetry --(retry_count >= ceiling)--> AutoDisabledTimeout
//   AutoDisabledTimeout / ManualDisabled --(manual enable)--> Enabled
//
// The registry is one lock around an id-keyed map; the lock is held for
// lookups and short updates only, never across I/O.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Probe budget in `AutoDisabledRetry` before the device parks in
/// `AutoDisabledTimeout`.
pub const RETRY_CEILING: u32 = 10;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CEILING_MS: u64 = 60_000;

/// Exponential probe backoff: `min(1s * 2^k, 60s)`.
pub fn backoff(retry_count: u32) -> Duration {
    let ms = BACKOFF_BASE_MS
        .checked_shl(retry_count.min(31))
        .unwrap_or(BACKOFF_CEILING_MS)
        .min(BACKOFF_CEILING_MS);
    Duration::from_millis(ms)
}

/// Why a device is not being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisableReason {
    None,
    Manual,
    AutoRetry,
    AutoTimeout,
}

/// Read counters and response-time aggregates for one device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceMetrics {
    pub total_reads: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub min_response_ms: Option<u64>,
    pub max_response_ms: u64,
    pub last_response_ms: u64,
    /// Running sum backing the average
    #[serde(skip)]
    response_total_ms: u64,
}

impl DeviceMetrics {
    fn record(&mut self, success: bool, response_ms: Option<u64>) {
        self.total_reads += 1;
        if success {
            self.successful_reads += 1;
        } else {
            self.failed_reads += 1;
        }
        if let Some(ms) = response_ms {
            self.min_response_ms = Some(self.min_response_ms.map_or(ms, |m| m.min(ms)));
            self.max_response_ms = self.max_response_ms.max(ms);
            self.last_response_ms = ms;
            self.response_total_ms += ms;
        }
    }

    pub fn avg_response_ms(&self) -> f64 {
        if self.successful_reads == 0 {
            0.0
        } else {
            self.response_total_ms as f64 / self.successful_reads as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_reads == 0 {
            0.0
        } else {
            self.successful_reads as f64 / self.total_reads as f64
        }
    }
}

/// Runtime health for one device.
#[derive(Debug, Clone)]
pub struct DeviceHealth {
    pub enabled: bool,
    pub disable_reason: DisableReason,
    pub disable_detail: String,
    pub disabled_at: Option<i64>,
    pub consecutive_failures: u32,
    pub retry_count: u32,
    pub next_retry_at: Option<Instant>,
    pub last_success_at: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub metrics: DeviceMetrics,
}

impl DeviceHealth {
    fn new() -> Self {
        Self {
            enabled: true,
            disable_reason: DisableReason::None,
            disable_detail: String::new(),
            disabled_at: None,
            consecutive_failures: 0,
            retry_count: 0,
            next_retry_at: None,
            last_success_at: None,
            last_attempt_at: None,
            metrics: DeviceMetrics::default(),
        }
    }
}

/// Status report for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub enabled: bool,
    pub disable_reason: DisableReason,
    pub disable_detail: String,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub last_success_at: Option<i64>,
    pub consecutive_failures: u32,
    pub retry_count: u32,
    pub metrics: DeviceMetrics,
}

/// All device health entries behind one lock.
pub struct HealthRegistry {
    devices: Mutex<HashMap<String, DeviceHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeviceHealth>> {
        self.devices.lock().expect("health registry poisoned")
    }

    /// Align the registry with a config snapshot: create entries for new
    /// devices, drop entries for removed ones, leave survivors untouched.
    /// Returns (created, removed).
    pub fn reconcile(&self, device_ids: &[String]) -> (usize, usize) {
        let mut devices = self.lock();
        let before = devices.len();
        devices.retain(|id, _| device_ids.contains(id));
        let removed = before - devices.len();

        let mut created = 0;
        for id in device_ids {
            if !devices.contains_key(id) {
                devices.insert(id.clone(), DeviceHealth::new());
                created += 1;
            }
        }
        (created, removed)
    }

    pub fn is_enabled(&self, device_id: &str) -> bool {
        self.lock().get(device_id).map(|h| h.enabled).unwrap_or(false)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.lock().contains_key(device_id)
    }

    /// Record a device-level batch success.
    pub fn record_batch_success(&self, device_id: &str, response_ms: Option<u64>) {
        let mut devices = self.lock();
        if let Some(health) = devices.get_mut(device_id) {
            let now_ms = chrono::Utc::now().timestamp_millis();
            health.metrics.record(true, response_ms);
            health.consecutive_failures = 0;
            health.last_success_at = Some(now_ms);
            health.last_attempt_at = Some(now_ms);
        }
    }

    /// Record a device-level batch failure. When the consecutive-failure
    /// count reaches `retry_limit` the device auto-disables and the first
    /// probe is scheduled. Returns true on that transition.
    pub fn record_batch_failure(&self, device_id: &str, retry_limit: u32, detail: &str) -> bool {
        let mut devices = self.lock();
        let Some(health) = devices.get_mut(device_id) else {
            return false;
        };
        health.metrics.record(false, None);
        health.last_attempt_at = Some(chrono::Utc::now().timestamp_millis());
        health.consecutive_failures += 1;

        if health.enabled && retry_limit > 0 && health.consecutive_failures >= retry_limit {
            health.enabled = false;
            health.disable_reason = DisableReason::AutoRetry;
            health.disable_detail = detail.to_string();
            health.disabled_at = Some(chrono::Utc::now().timestamp_millis());
            health.retry_count = 0;
            health.next_retry_at = Some(Instant::now() + backoff(0));
            return true;
        }
        false
    }

    /// Devices in `AutoDisabledRetry` whose probe is due. Each returned
    /// device has its schedule cleared so exactly one probe runs per
    /// backoff interval; the probe outcome re-arms or retires it.
    pub fn take_due_probes(&self, now: Instant) -> Vec<String> {
        let mut devices = self.lock();
        let mut due = Vec::new();
        for (id, health) in devices.iter_mut() {
            if health.disable_reason == DisableReason::AutoRetry {
                if let Some(at) = health.next_retry_at {
                    if at <= now {
                        health.next_retry_at = None;
                        due.push(id.clone());
                    }
                }
            }
        }
        due
    }

    /// Re-arm a probe that was taken but never issued, without burning a
    /// retry.
    pub fn reschedule_probe(&self, device_id: &str) {
        let mut devices = self.lock();
        if let Some(health) = devices.get_mut(device_id) {
            if health.disable_reason == DisableReason::AutoRetry && health.next_retry_at.is_none() {
                health.next_retry_at = Some(Instant::now() + backoff(health.retry_count));
            }
        }
    }

    /// A recovery probe answered: re-enable the device.
    pub fn probe_succeeded(&self, device_id: &str) {
        let mut devices = self.lock();
        if let Some(health) = devices.get_mut(device_id) {
            health.enabled = true;
            health.disable_reason = DisableReason::None;
            health.disable_detail.clear();
            health.disabled_at = None;
            health.consecutive_failures = 0;
            health.retry_count = 0;
            health.next_retry_at = None;
            health.last_success_at = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    /// A recovery probe failed: back off further, or park the device in
    /// `AutoDisabledTimeout` once the budget is spent. Returns true when the
    /// device timed out.
    pub fn probe_failed(&self, device_id: &str, ceiling: u32) -> bool {
        let mut devices = self.lock();
        let Some(health) = devices.get_mut(device_id) else {
            return false;
        };
        health.retry_count += 1;
        if health.retry_count >= ceiling {
            health.disable_reason = DisableReason::AutoTimeout;
            health.disable_detail = format!("{} recovery probes exhausted", health.retry_count);
            health.next_retry_at = None;
            true
        } else {
            health.next_retry_at = Some(Instant::now() + backoff(health.retry_count));
            false
        }
    }

    /// Operator enable. Leaves any disabled state, optionally clearing the
    /// read counters (`last_success_at` is kept).
    pub fn manual_enable(&self, device_id: &str, clear_metrics: bool) -> bool {
        let mut devices = self.lock();
        let Some(health) = devices.get_mut(device_id) else {
            return false;
        };
        health.enabled = true;
        health.disable_reason = DisableReason::None;
        health.disable_detail.clear();
        health.disabled_at = None;
        health.consecutive_failures = 0;
        health.retry_count = 0;
        health.next_retry_at = None;
        if clear_metrics {
            health.metrics = DeviceMetrics::default();
        }
        true
    }

    /// Operator disable.
    pub fn manual_disable(&self, device_id: &str, detail: &str) -> bool {
        let mut devices = self.lock();
        let Some(health) = devices.get_mut(device_id) else {
            return false;
        };
        health.enabled = false;
        health.disable_reason = DisableReason::Manual;
        health.disable_detail = detail.to_string();
        health.disabled_at = Some(chrono::Utc::now().timestamp_millis());
        health.next_retry_at = None;
        true
    }

    pub fn status(&self, device_id: &str) -> Option<DeviceStatus> {
        let devices = self.lock();
        devices.get(device_id).map(|h| to_status(device_id, h))
    }

    pub fn all_statuses(&self) -> Vec<DeviceStatus> {
        let devices = self.lock();
        let mut statuses: Vec<DeviceStatus> =
            devices.iter().map(|(id, h)| to_status(id, h)).collect();
        statuses.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        statuses
    }

    #[cfg(test)]
    pub(crate) fn snapshot_of(&self, device_id: &str) -> Option<DeviceHealth> {
        self.lock().get(device_id).cloned()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn to_status(device_id: &str, health: &DeviceHealth) -> DeviceStatus {
    DeviceStatus {
        device_id: device_id.to_string(),
        enabled: health.enabled,
        disable_reason: health.disable_reason,
        disable_detail: health.disable_detail.clone(),
        success_rate: health.metrics.success_rate(),
        avg_response_ms: health.metrics.avg_response_ms(),
        last_success_at: health.last_success_at,
        consecutive_failures: health.consecutive_failures,
        retry_count: health.retry_count,
        metrics: health.metrics.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(5), Duration::from_secs(32));
        // Monotone, capped at 60 s
        let mut prev = Duration::ZERO;
        for k in 0..40 {
            let b = backoff(k);
            assert!(b >= prev);
            assert!(b <= Duration::from_secs(60));
            prev = b;
        }
        assert_eq!(backoff(6), Duration::from_secs(60));
        assert_eq!(backoff(31), Duration::from_secs(60));
        assert_eq!(backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_reconcile_creates_and_removes() {
        let registry = HealthRegistry::new();
        let (created, removed) =
            registry.reconcile(&["AAAAAA".to_string(), "BBBBBB".to_string()]);
        assert_eq!((created, removed), (2, 0));
        assert!(registry.is_enabled("AAAAAA"));

        // Survivors keep their state
        registry.record_batch_failure("AAAAAA", 5, "timeout");
        let (created, removed) = registry.reconcile(&["AAAAAA".to_string()]);
        assert_eq!((created, removed), (0, 1));
        assert!(!registry.contains("BBBBBB"));
        assert_eq!(registry.snapshot_of("AAAAAA").unwrap().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_disable_then_timeout() {
        let registry = HealthRegistry::new();
        registry.reconcile(&["AAAAAA".to_string()]);

        // Three consecutive failures with retry_limit 3 disables the device
        assert!(!registry.record_batch_failure("AAAAAA", 3, "read timeout"));
        assert!(!registry.record_batch_failure("AAAAAA", 3, "read timeout"));
        assert!(registry.record_batch_failure("AAAAAA", 3, "read timeout"));
        assert!(!registry.is_enabled("AAAAAA"));
        let health = registry.snapshot_of("AAAAAA").unwrap();
        assert_eq!(health.disable_reason, DisableReason::AutoRetry);

        // First probe due after backoff(0) = 1 s, and only then
        assert!(registry.take_due_probes(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(1)).await;
        let due = registry.take_due_probes(Instant::now());
        assert_eq!(due, vec!["AAAAAA".to_string()]);
        // No second probe within the same interval
        assert!(registry.take_due_probes(Instant::now()).is_empty());

        // Exhaust the budget
        for k in 1..RETRY_CEILING {
            assert!(!registry.probe_failed("AAAAAA", RETRY_CEILING));
            tokio::time::advance(backoff(k)).await;
            assert_eq!(registry.take_due_probes(Instant::now()).len(), 1);
        }
        assert!(registry.probe_failed("AAAAAA", RETRY_CEILING));
        let health = registry.snapshot_of("AAAAAA").unwrap();
        assert_eq!(health.disable_reason, DisableReason::AutoTimeout);
        assert!(health.next_retry_at.is_none());

        // Only manual enable leaves AutoDisabledTimeout
        assert!(registry.manual_enable("AAAAAA", false));
        assert!(registry.is_enabled("AAAAAA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_reenables() {
        let registry = HealthRegistry::new();
        registry.reconcile(&["AAAAAA".to_string()]);
        registry.record_batch_failure("AAAAAA", 1, "unreachable");
        assert!(!registry.is_enabled("AAAAAA"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(registry.take_due_probes(Instant::now()).len(), 1);
        registry.probe_succeeded("AAAAAA");

        let health = registry.snapshot_of("AAAAAA").unwrap();
        assert!(health.enabled);
        assert_eq!(health.disable_reason, DisableReason::None);
        assert_eq!(health.consecutive_failures, 0);
        // Metrics survive recovery
        assert_eq!(health.metrics.failed_reads, 1);
    }

    #[test]
    fn test_metrics_invariant_and_aggregates() {
        let registry = HealthRegistry::new();
        registry.reconcile(&["AAAAAA".to_string()]);

        registry.record_batch_success("AAAAAA", Some(10));
        registry.record_batch_success("AAAAAA", Some(30));
        registry.record_batch_failure("AAAAAA", 10, "x");

        let m = registry.snapshot_of("AAAAAA").unwrap().metrics;
        assert_eq!(m.total_reads, m.successful_reads + m.failed_reads);
        assert_eq!(m.total_reads, 3);
        assert_eq!(m.min_response_ms, Some(10));
        assert_eq!(m.max_response_ms, 30);
        assert_eq!(m.last_response_ms, 30);
        assert_eq!(m.avg_response_ms(), 20.0);

        let status = registry.status("AAAAAA").unwrap();
        assert!((status.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_manual_disable_and_clear_metrics() {
        let registry = HealthRegistry::new();
        registry.reconcile(&["AAAAAA".to_string()]);
        registry.record_batch_success("AAAAAA", Some(5));

        assert!(registry.manual_disable("AAAAAA", "operator request"));
        let health = registry.snapshot_of("AAAAAA").unwrap();
        assert!(!health.enabled);
        assert_eq!(health.disable_reason, DisableReason::Manual);
        assert_eq!(health.disable_detail, "operator request");

        assert!(registry.manual_enable("AAAAAA", true));
        let health = registry.snapshot_of("AAAAAA").unwrap();
        assert!(health.enabled);
        assert_eq!(health.metrics.total_reads, 0);
        // last_success_at survives a metrics clear
        assert!(health.last_success_at.is_some());

        assert!(!registry.manual_enable("ZZZZZZ", false));
    }
}
