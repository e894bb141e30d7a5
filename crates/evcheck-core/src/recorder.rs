//! Receiver-side latency and concurrency histograms.
//!
//! One [`LatencyRecorder`] is created per run and shared by handle with the
//! receiver; its snapshot is flushed to the log once the run ends.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::error::HarnessResult;
use crate::metrics::LATENCY_SIGFIG;

/// Explicit bucket upper bounds, in milliseconds (or plain counts for the
/// in-flight histogram).
pub const BUCKET_BOUNDARIES: [u64; 13] = [
    10, 20, 50, 100, 500, 1000, // < 1s
    5_000, 10_000, 30_000, 60_000, // < 60s
    300_000, 600_000, 1_200_000, // < 20m
];

pub const E2E_LATENCY: &str = "latency_e2e_ms";
pub const PROCESSING_LATENCY: &str = "processing_latency_ms";
pub const IN_FLIGHT_REQUESTS: &str = "in_flight_requests";

#[derive(Debug, Clone)]
struct Distribution {
    values: Histogram<u64>,
    // hdrhistogram only keeps bucketed values, so the exact total lives here
    sum: u64,
}

impl Distribution {
    fn record(&mut self, value: u64) {
        self.values.saturating_record(value);
        self.sum = self.sum.saturating_add(value);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut buckets: Vec<Bucket> = BUCKET_BOUNDARIES
            .iter()
            .map(|bound| Bucket {
                le: bound.to_string(),
                count: self.values.count_between(0, *bound),
            })
            .collect();
        buckets.push(Bucket {
            le: "+Inf".to_string(),
            count: self.values.len(),
        });
        HistogramSnapshot {
            count: self.values.len(),
            sum: self.sum,
            p50: self.values.value_at_quantile(0.50),
            p99: self.values.value_at_quantile(0.99),
            buckets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub le: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: u64,
    pub p50: u64,
    pub p99: u64,
    /// Cumulative counts, one per boundary plus `+Inf`.
    pub buckets: Vec<Bucket>,
}

/// Histograms by metric name, then by label set.
pub type RecorderSnapshot = BTreeMap<&'static str, BTreeMap<String, HistogramSnapshot>>;

type Series = Mutex<BTreeMap<String, Distribution>>;

#[derive(Debug)]
pub struct LatencyRecorder {
    include_remote_addr: bool,
    // every label set starts from a copy of this empty histogram
    template: Histogram<u64>,
    e2e: Series,
    processing: Series,
    in_flight_hist: Series,
    in_flight: AtomicI64,
}

impl LatencyRecorder {
    pub fn new(include_remote_addr: bool) -> HarnessResult<Arc<Self>> {
        Ok(Arc::new(Self {
            include_remote_addr,
            template: Histogram::new(LATENCY_SIGFIG)?,
            e2e: Series::default(),
            processing: Series::default(),
            in_flight_hist: Series::default(),
            in_flight: AtomicI64::new(0),
        }))
    }

    fn labels(&self, path: &str, remote_addr: &str) -> String {
        let path = if path.is_empty() { "/" } else { path };
        if self.include_remote_addr {
            format!("request_path={path},remote_addr={remote_addr}")
        } else {
            format!("request_path={path}")
        }
    }

    fn record(&self, series: &Series, labels: String, value: u64) {
        let mut series = series.lock().unwrap_or_else(PoisonError::into_inner);
        let dist = match series.entry(labels) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(Distribution {
                values: Histogram::new_from(&self.template),
                sum: 0,
            }),
        };
        dist.record(value);
    }

    pub fn record_e2e(&self, path: &str, remote_addr: &str, millis: u64) {
        self.record(&self.e2e, self.labels(path, remote_addr), millis);
    }

    pub fn record_processing(&self, path: &str, remote_addr: &str, millis: u64) {
        self.record(&self.processing, self.labels(path, remote_addr), millis);
    }

    /// Count a request as in flight until the returned guard is dropped.
    pub fn request_started(self: &Arc<Self>, path: &str, remote_addr: &str) -> InFlightGuard {
        let labels = self.labels(path, remote_addr);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(&self.in_flight_hist, labels.clone(), now.max(0) as u64);
        InFlightGuard {
            recorder: Arc::clone(self),
            labels,
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        let take = |series: &Series| {
            series
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(k, h)| (k.clone(), h.snapshot()))
                .collect::<BTreeMap<_, _>>()
        };
        let mut out = RecorderSnapshot::new();
        out.insert(E2E_LATENCY, take(&self.e2e));
        out.insert(PROCESSING_LATENCY, take(&self.processing));
        out.insert(IN_FLIGHT_REQUESTS, take(&self.in_flight_hist));
        out
    }
}

pub struct InFlightGuard {
    recorder: Arc<LatencyRecorder>,
    labels: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now = self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.recorder.record(
            &self.recorder.in_flight_hist,
            std::mem::take(&mut self.labels),
            now.max(0) as u64,
        );
    }
}
