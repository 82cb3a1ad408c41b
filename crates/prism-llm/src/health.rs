//! Health tracking and circuit breaking, keyed by name.
//!
//! One table instance guards the LLM providers; a second instance guards the
//! retrieval lanes. All mutation goes through the table so updates for a key
//! are serialized and never lost.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// EWMA smoothing factor for latency and success rate.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; requests flow through.
    Closed,
    /// Failing; reject requests until the open window elapses.
    Open,
    /// One probe request is allowed to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct HealthEntry {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    open_until: Option<Instant>,
    ewma_latency_ms: f64,
    ewma_success_rate: f64,
    last_seen: Instant,
}

impl HealthEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            open_until: None,
            ewma_latency_ms: 0.0,
            ewma_success_rate: 1.0,
            last_seen: Instant::now(),
        }
    }

    /// Whether a request may proceed. Drives the open → half-open transition.
    fn allow_request(&mut self, now: Instant) -> bool {
        self.last_seen = now;
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.open_until.is_some_and(|t| now >= t) {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // A probe is already in flight.
            CircuitState::HalfOpen => false,
        }
    }

    fn record_success(&mut self, latency_ms: u64, now: Instant) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
        self.open_until = None;
        self.last_seen = now;
        self.ewma_latency_ms = ewma(self.ewma_latency_ms, latency_ms as f64);
        self.ewma_success_rate = ewma(self.ewma_success_rate, 1.0);
    }

    fn record_failure(&mut self, threshold: u32, open_window: Duration, now: Instant) {
        self.consecutive_failures += 1;
        self.last_failure_at = Some(now);
        self.last_seen = now;
        self.ewma_success_rate = ewma(self.ewma_success_rate, 0.0);

        let reopen = self.state == CircuitState::HalfOpen;
        if reopen || self.consecutive_failures >= threshold {
            self.state = CircuitState::Open;
            self.open_until = Some(now + open_window);
        }
    }
}

fn ewma(current: f64, sample: f64) -> f64 {
    if current == 0.0 && sample > 1.0 {
        // First latency sample seeds the average.
        sample
    } else {
        current * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA
    }
}

/// Point-in-time view of one key's health, for `/health/providers`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub ewma_latency_ms: f64,
    pub ewma_success_rate: f64,
    /// Milliseconds until the circuit re-admits a probe, when open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_for_ms: Option<u64>,
}

/// Process-global health table. Short critical sections; callers never hold
/// the lock across I/O.
pub struct HealthTable {
    entries: Mutex<HashMap<String, HealthEntry>>,
    failure_threshold: u32,
    open_window: Duration,
}

impl HealthTable {
    pub fn new(failure_threshold: u32, open_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failure_threshold,
            open_window,
        }
    }

    /// Open after 3 consecutive failures; stay open 5 minutes.
    pub fn with_defaults() -> Self {
        Self::new(3, Duration::from_secs(300))
    }

    /// Whether a request to `key` may proceed right now.
    pub fn allow(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(HealthEntry::new);
        let before = entry.state;
        let allowed = entry.allow_request(Instant::now());
        if before == CircuitState::Open && entry.state == CircuitState::HalfOpen {
            info!(key, "circuit breaker half-open, admitting probe");
        }
        allowed
    }

    pub fn record_success(&self, key: &str, latency_ms: u64) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(HealthEntry::new);
        let was_half_open = entry.state == CircuitState::HalfOpen;
        entry.record_success(latency_ms, Instant::now());
        if was_half_open {
            info!(key, "circuit breaker closed after successful probe");
        }
    }

    pub fn record_failure(&self, key: &str) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(HealthEntry::new);
        let was_open = entry.state == CircuitState::Open;
        entry.record_failure(self.failure_threshold, self.open_window, Instant::now());
        if !was_open && entry.state == CircuitState::Open {
            warn!(
                key,
                failures = entry.consecutive_failures,
                open_secs = self.open_window.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        let entries = self.entries.lock();
        entries
            .get(key)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, key: &str) -> HealthSnapshot {
        let now = Instant::now();
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(e) => HealthSnapshot {
                state: e.state,
                consecutive_failures: e.consecutive_failures,
                ewma_latency_ms: e.ewma_latency_ms,
                ewma_success_rate: e.ewma_success_rate,
                open_for_ms: e
                    .open_until
                    .and_then(|t| t.checked_duration_since(now))
                    .map(|d| d.as_millis() as u64),
            },
            None => HealthSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                ewma_latency_ms: 0.0,
                ewma_success_rate: 1.0,
                open_for_ms: None,
            },
        }
    }

    pub fn snapshot_all(&self) -> HashMap<String, HealthSnapshot> {
        let keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.into_iter()
            .map(|k| {
                let snap = self.snapshot(&k);
                (k, snap)
            })
            .collect()
    }

    /// EWMA success rate for tie-breaking in the router.
    pub fn success_rate(&self, key: &str) -> f64 {
        let entries = self.entries.lock();
        entries.get(key).map(|e| e.ewma_success_rate).unwrap_or(1.0)
    }

    /// Evict entries idle longer than `idle`. Called from a background sweep.
    pub fn sweep(&self, idle: Duration) {
        let cutoff = Instant::now() - idle;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.last_seen > cutoff || e.state != CircuitState::Closed);
        let evicted = before - entries.len();
        if evicted > 0 {
            info!(evicted, "health table sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_three_failures() {
        let table = HealthTable::with_defaults();
        assert!(table.allow("p"));
        table.record_failure("p");
        table.record_failure("p");
        assert_eq!(table.state("p"), CircuitState::Closed);
        assert!(table.allow("p"));
        table.record_failure("p");
        assert_eq!(table.state("p"), CircuitState::Open);
        assert!(!table.allow("p"));
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let table = HealthTable::new(1, Duration::from_millis(0));
        table.record_failure("p");
        assert_eq!(table.state("p"), CircuitState::Open);

        // Open window is zero, so the next allow() flips to half-open.
        assert!(table.allow("p"));
        assert_eq!(table.state("p"), CircuitState::HalfOpen);
        // A second concurrent probe is rejected.
        assert!(!table.allow("p"));
    }

    #[test]
    fn test_half_open_success_closes() {
        let table = HealthTable::new(1, Duration::from_millis(0));
        table.record_failure("p");
        assert!(table.allow("p"));
        table.record_success("p", 50);
        assert_eq!(table.state("p"), CircuitState::Closed);
        assert!(table.allow("p"));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let table = HealthTable::new(3, Duration::from_millis(0));
        table.record_failure("p");
        table.record_failure("p");
        table.record_failure("p");
        assert_eq!(table.state("p"), CircuitState::Open);
        assert!(table.allow("p"));
        // Failure during the probe reopens immediately, regardless of count.
        table.record_failure("p");
        assert_eq!(table.state("p"), CircuitState::Open);
    }

    #[test]
    fn test_ewma_moves_toward_samples() {
        let table = HealthTable::with_defaults();
        table.record_success("p", 100);
        table.record_success("p", 100);
        let snap = table.snapshot("p");
        assert!(snap.ewma_latency_ms > 90.0 && snap.ewma_latency_ms <= 100.0);
        assert!(snap.ewma_success_rate > 0.9);

        table.record_failure("p");
        let snap = table.snapshot("p");
        assert!(snap.ewma_success_rate < 1.0);
    }

    #[test]
    fn test_sweep_keeps_open_circuits() {
        let table = HealthTable::new(1, Duration::from_secs(600));
        table.record_failure("bad");
        table.record_success("good", 10);
        table.sweep(Duration::from_millis(0));
        // Open circuits survive the sweep so the block keeps holding.
        assert_eq!(table.state("bad"), CircuitState::Open);
        assert!(table.snapshot_all().contains_key("bad"));
        assert!(!table.snapshot_all().contains_key("good"));
    }

    #[test]
    fn test_unknown_key_is_closed() {
        let table = HealthTable::with_defaults();
        assert_eq!(table.state("never-seen"), CircuitState::Closed);
        assert_eq!(table.snapshot("never-seen").consecutive_failures, 0);
    }
}
