use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// Significant figures kept by latency histograms.
pub const LATENCY_SIGFIG: u8 = 3;

// ---------------------------------------------------------------------------
// AttackResult
// ---------------------------------------------------------------------------

/// Outcome of a single request fired by the load generator.
#[derive(Debug, Clone)]
pub struct AttackResult {
    pub timestamp: DateTime<Utc>,
    /// HTTP status, 0 when the request never got a response.
    pub code: u16,
    pub error: Option<String>,
    pub latency: Duration,
    pub bytes_out: u64,
    pub bytes_in: u64,
    /// Identifier header the targeter put on the request.
    pub event_id: Option<String>,
}

impl AttackResult {
    pub fn is_accepted(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.code)
    }
}

// ---------------------------------------------------------------------------
// AttackStats
// ---------------------------------------------------------------------------

/// Latency distribution in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub total: u64,
    pub mean: u64,
    pub min: u64,
    #[serde(rename = "50th")]
    pub p50: u64,
    #[serde(rename = "90th")]
    pub p90: u64,
    #[serde(rename = "95th")]
    pub p95: u64,
    #[serde(rename = "99th")]
    pub p99: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ByteSummary {
    pub total: u64,
    pub mean: f64,
}

/// Raw load generator statistics, accumulated with [`AttackStats::add`]
/// and finalised with [`AttackStats::close`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackStats {
    pub requests: u64,
    /// Requests per second over the attack window.
    pub rate: f64,
    /// Successful requests per second over the attack window.
    pub throughput: f64,
    /// Ratio of successful requests, in `[0, 1]`.
    pub success: f64,
    /// Attack window in nanoseconds.
    pub duration: u64,
    pub latencies: LatencySummary,
    pub bytes_in: ByteSummary,
    pub bytes_out: ByteSummary,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub status_codes: BTreeMap<String, u64>,
    pub errors: Vec<String>,

    #[serde(skip)]
    histogram: Option<Histogram<u64>>,
    #[serde(skip)]
    successes: u64,
}

impl AttackStats {
    pub fn add(&mut self, result: &AttackResult) {
        self.requests += 1;
        *self
            .status_codes
            .entry(result.code.to_string())
            .or_insert(0) += 1;

        let latency = u64::try_from(result.latency.as_nanos()).unwrap_or(u64::MAX);
        if self.histogram.is_none() {
            self.histogram = Histogram::new(LATENCY_SIGFIG).ok();
        }
        if let Some(h) = self.histogram.as_mut() {
            h.saturating_record(latency);
        }
        self.latencies.total = self.latencies.total.saturating_add(latency);
        self.bytes_in.total += result.bytes_in;
        self.bytes_out.total += result.bytes_out;

        if result.is_accepted() {
            self.successes += 1;
        }
        if let Some(err) = &result.error {
            if !self.errors.contains(err) {
                self.errors.push(err.clone());
            }
        }

        if self.earliest.map_or(true, |t| result.timestamp < t) {
            self.earliest = Some(result.timestamp);
        }
        if self.latest.map_or(true, |t| result.timestamp > t) {
            self.latest = Some(result.timestamp);
        }
    }

    /// Compute the derived fields. Safe to call more than once.
    pub fn close(&mut self) {
        if self.requests == 0 {
            return;
        }
        let n = self.requests as f64;

        self.latencies.mean = self.latencies.total / self.requests;
        if let Some(h) = &self.histogram {
            self.latencies.min = h.min();
            self.latencies.max = h.max();
            self.latencies.p50 = h.value_at_quantile(0.50);
            self.latencies.p90 = h.value_at_quantile(0.90);
            self.latencies.p95 = h.value_at_quantile(0.95);
            self.latencies.p99 = h.value_at_quantile(0.99);
        }

        self.bytes_in.mean = self.bytes_in.total as f64 / n;
        self.bytes_out.mean = self.bytes_out.total as f64 / n;
        self.success = self.successes as f64 / n;

        if let (Some(first), Some(last)) = (self.earliest, self.latest) {
            let window = (last - first).to_std().unwrap_or_default();
            self.duration = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
            let secs = window.as_secs_f64();
            if secs > f64::EPSILON {
                self.rate = n / secs;
                self.throughput = self.successes as f64 / secs;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Attack-phase totals embedded in the final report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Every proposal the correlator observed, matched or not.
    pub proposed_count: u64,
    /// Events proven both proposed and accepted by the transport.
    pub accepted_count: u64,
    /// Correlator inputs rejected for an empty identifier.
    pub malformed_signals: u64,
    /// Proposals that never got a matching acceptance.
    pub unmatched_proposals: u64,
    /// Acceptances that never got a matching proposal.
    pub unmatched_acceptances: u64,
    pub metrics: AttackStats,
}
