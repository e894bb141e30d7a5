//! Constant-rate HTTP load generator.
//!
//! Worker threads share one [`Pacer`]; request `k` is due at
//! `start + k / rate`. Each worker claims the next slot, sleeps until it is
//! due, builds a target and fires it through a shared `ureq` agent.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use evcheck_core::{
    AcceptedSignal, AttackResult, AttackStats, HarnessError, HarnessResult, LoadGenerator,
    ShutdownListener, Target, Targeter,
};

use crate::targeter::EVENT_ID_HEADER;

pub const DEFAULT_WORKERS: usize = 10;

/// Longest single sleep while waiting for a slot, so workers notice
/// shutdown promptly.
const PACING_TICK: Duration = Duration::from_millis(50);

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttackPlan {
    /// Requests per second.
    pub rate: u64,
    pub duration: Duration,
    pub workers: usize,
    pub keep_alive: bool,
    pub request_timeout: Option<Duration>,
}

impl Default for AttackPlan {
    fn default() -> Self {
        Self {
            rate: 1,
            duration: Duration::from_secs(1),
            workers: DEFAULT_WORKERS,
            keep_alive: true,
            request_timeout: Some(Duration::from_secs(30)),
        }
    }
}

// ---------------------------------------------------------------------------
// Pacer
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Pacer {
    start: Instant,
    rate: u64,
    total: u64,
    next: AtomicU64,
}

impl Pacer {
    fn new(rate: u64, duration: Duration) -> Self {
        let total = u128::from(rate) * duration.as_nanos() / NANOS_PER_SEC;
        Self {
            start: Instant::now(),
            rate,
            total: u64::try_from(total).unwrap_or(u64::MAX),
            next: AtomicU64::new(0),
        }
    }

    /// Claim the next slot. `None` once the attack's request budget is spent.
    fn next_slot(&self) -> Option<Instant> {
        let k = self.next.fetch_add(1, Ordering::Relaxed);
        if k >= self.total || self.rate == 0 {
            return None;
        }
        let offset = u128::from(k) * NANOS_PER_SEC / u128::from(self.rate);
        Some(self.start + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX)))
    }
}

/// Sleep until `deadline`. Returns false if shutdown fired first.
fn wait_until(deadline: Instant, shutdown: &ShutdownListener) -> bool {
    loop {
        if shutdown.is_triggered() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(PACING_TICK));
    }
}

// ---------------------------------------------------------------------------
// HttpLoadGenerator
// ---------------------------------------------------------------------------

pub struct HttpLoadGenerator {
    plan: AttackPlan,
    agent: ureq::Agent,
}

impl HttpLoadGenerator {
    pub fn new(plan: AttackPlan) -> Self {
        let mut builder = ureq::AgentBuilder::new();
        if let Some(timeout) = plan.request_timeout {
            builder = builder.timeout(timeout);
        }
        if !plan.keep_alive {
            builder = builder.max_idle_connections(0).max_idle_connections_per_host(0);
        }
        Self {
            agent: builder.build(),
            plan,
        }
    }
}

impl LoadGenerator for HttpLoadGenerator {
    fn attack(
        &self,
        targeter: Arc<dyn Targeter>,
        shutdown: ShutdownListener,
    ) -> HarnessResult<std_mpsc::Receiver<AttackResult>> {
        let workers = self.plan.workers.max(1);
        let (tx, rx) = std_mpsc::sync_channel(workers * 4);
        let pacer = Arc::new(Pacer::new(self.plan.rate, self.plan.duration));

        info!(
            rate = self.plan.rate,
            duration_ms = self.plan.duration.as_millis() as u64,
            workers,
            keep_alive = self.plan.keep_alive,
            "starting attack"
        );

        for i in 0..workers {
            let worker = Worker {
                agent: self.agent.clone(),
                targeter: targeter.clone(),
                pacer: pacer.clone(),
                shutdown: shutdown.clone(),
                results: tx.clone(),
            };
            thread::Builder::new()
                .name(format!("attack-{i}"))
                .spawn(move || worker.run())
                .map_err(|e| HarnessError::Lifecycle(format!("cannot spawn attack worker: {e}")))?;
        }
        Ok(rx)
    }
}

struct Worker {
    agent: ureq::Agent,
    targeter: Arc<dyn Targeter>,
    pacer: Arc<Pacer>,
    shutdown: ShutdownListener,
    results: SyncSender<AttackResult>,
}

impl Worker {
    fn run(self) {
        while let Some(due) = self.pacer.next_slot() {
            if !wait_until(due, &self.shutdown) {
                debug!("attack worker stopped by shutdown");
                break;
            }
            let target = match self.targeter.next_target() {
                Ok(target) => target,
                Err(e) => {
                    warn!(error = %e, "targeter failed, worker stopping");
                    break;
                }
            };
            if self.results.send(fire(&self.agent, &target)).is_err() {
                break;
            }
        }
    }
}

fn drain(response: ureq::Response) -> u64 {
    io::copy(&mut response.into_reader(), &mut io::sink()).unwrap_or(0)
}

fn fire(agent: &ureq::Agent, target: &Target) -> AttackResult {
    let timestamp = Utc::now();
    let started = Instant::now();

    let mut request = agent.request(&target.method, &target.url);
    for (name, value) in &target.headers {
        request = request.set(name, value);
    }

    let (code, error, bytes_in) = match request.send_bytes(&target.body) {
        Ok(response) => {
            let code = response.status();
            (code, None, drain(response))
        }
        Err(ureq::Error::Status(code, response)) => {
            let status = format!("{code} {}", response.status_text());
            (code, Some(status), drain(response))
        }
        Err(ureq::Error::Transport(e)) => (0, Some(e.to_string()), 0),
    };

    AttackResult {
        timestamp,
        code,
        error,
        latency: started.elapsed(),
        bytes_out: target.body.len() as u64,
        bytes_in,
        event_id: target.header(EVENT_ID_HEADER).map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// Attack loop
// ---------------------------------------------------------------------------

/// Drive `generator` to completion, raising an acceptance signal for every
/// 2xx result and folding all results into [`AttackStats`].
///
/// Blocks the calling thread. `accepted` is dropped on return, which closes
/// the acceptance stream.
pub fn run_attack(
    generator: &dyn LoadGenerator,
    targeter: Arc<dyn Targeter>,
    accepted: mpsc::Sender<AcceptedSignal>,
    shutdown: ShutdownListener,
) -> HarnessResult<AttackStats> {
    let results = generator.attack(targeter, shutdown)?;
    let mut stats = AttackStats::default();

    for result in results {
        stats.add(&result);
        if result.is_accepted() {
            // a missing id reaches the correlator as empty and is counted there
            let id = result.event_id.unwrap_or_default();
            if accepted.blocking_send(AcceptedSignal::new(id)).is_err() {
                warn!("acceptance channel closed, signal dropped");
            }
        } else {
            debug!(code = result.code, error = ?result.error, "request not accepted");
        }
    }

    stats.close();
    info!(
        requests = stats.requests,
        success = stats.success,
        rate = stats.rate,
        "attack finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evcheck_core::Shutdown;
    use std::net::TcpListener;
    use std::sync::Mutex;

    #[test]
    fn test_pacer_slot_budget() {
        let pacer = Pacer::new(100, Duration::from_millis(50));
        let slots: Vec<_> = std::iter::from_fn(|| pacer.next_slot()).collect();
        assert_eq!(slots.len(), 5);
        assert!(pacer.next_slot().is_none());
    }

    #[test]
    fn test_pacer_spacing() {
        let pacer = Pacer::new(10, Duration::from_secs(1));
        let first = pacer.next_slot().unwrap();
        let second = pacer.next_slot().unwrap();
        assert_eq!(second - first, Duration::from_millis(100));
    }

    #[test]
    fn test_pacer_zero_rate() {
        let pacer = Pacer::new(0, Duration::from_secs(5));
        assert!(pacer.next_slot().is_none());
    }

    #[test]
    fn test_wait_until_honours_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let far = Instant::now() + Duration::from_secs(60);
        assert!(!wait_until(far, &shutdown.listener()));
    }

    /// Replays canned results instead of talking HTTP.
    struct Scripted(Mutex<Vec<AttackResult>>);

    impl LoadGenerator for Scripted {
        fn attack(
            &self,
            _targeter: Arc<dyn Targeter>,
            _shutdown: ShutdownListener,
        ) -> HarnessResult<std_mpsc::Receiver<AttackResult>> {
            let (tx, rx) = std_mpsc::channel();
            for result in self.0.lock().unwrap().drain(..) {
                tx.send(result).unwrap();
            }
            Ok(rx)
        }
    }

    struct NoTargets;

    impl Targeter for NoTargets {
        fn next_target(&self) -> HarnessResult<Target> {
            Err(HarnessError::Codec("unused".into()))
        }
    }

    fn result(code: u16, error: Option<&str>, id: Option<&str>) -> AttackResult {
        AttackResult {
            timestamp: Utc::now(),
            code,
            error: error.map(str::to_string),
            latency: Duration::from_millis(2),
            bytes_out: 10,
            bytes_in: 0,
            event_id: id.map(str::to_string),
        }
    }

    #[test]
    fn test_run_attack_signals_only_accepted() {
        let generator = Scripted(Mutex::new(vec![
            result(200, None, Some("a")),
            result(503, Some("503 Service Unavailable"), Some("b")),
            result(0, Some("connection refused"), Some("c")),
            result(202, None, None),
        ]));
        let (tx, mut rx) = mpsc::channel(8);

        let stats = run_attack(
            &generator,
            Arc::new(NoTargets),
            tx,
            Shutdown::new().listener(),
        )
        .unwrap();

        assert_eq!(rx.try_recv().unwrap().id, "a");
        assert_eq!(rx.try_recv().unwrap().id, "");
        // sender dropped by run_attack
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        assert_eq!(stats.requests, 4);
        assert_eq!(stats.success, 0.5);
        assert_eq!(stats.status_codes["0"], 1);
        assert_eq!(stats.errors.len(), 2);
    }

    struct FixedTarget(String);

    impl Targeter for FixedTarget {
        fn next_target(&self) -> HarnessResult<Target> {
            Ok(Target {
                method: "POST".into(),
                url: self.0.clone(),
                headers: vec![(EVENT_ID_HEADER.into(), "x".into())],
                body: b"{}".to_vec(),
            })
        }
    }

    #[test]
    fn test_refused_connections_are_transport_errors() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let generator = HttpLoadGenerator::new(AttackPlan {
            rate: 20,
            duration: Duration::from_millis(100),
            workers: 2,
            keep_alive: false,
            request_timeout: Some(Duration::from_secs(2)),
        });
        let results: Vec<_> = generator
            .attack(
                Arc::new(FixedTarget(format!("http://127.0.0.1:{port}/"))),
                Shutdown::new().listener(),
            )
            .unwrap()
            .into_iter()
            .collect();

        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.code, 0);
            assert!(r.error.is_some());
            assert_eq!(r.event_id.as_deref(), Some("x"));
            assert!(!r.is_accepted());
        }
    }

    #[test]
    fn test_attack_stops_on_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let generator = HttpLoadGenerator::new(AttackPlan {
            rate: 1000,
            duration: Duration::from_secs(60),
            ..AttackPlan::default()
        });
        let results = generator
            .attack(
                Arc::new(FixedTarget("http://127.0.0.1:9/".into())),
                shutdown.listener(),
            )
            .unwrap();
        assert_eq!(results.into_iter().count(), 0);
    }
}
