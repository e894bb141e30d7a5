//! Run lifecycle: receiver up, attack, grace period, drain, reconcile.

use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use evcheck_core::{
    AttackStats, EventCodec, HarnessResult, LatencyRecorder, Metrics, ObservedEvent, Shutdown,
    Side, Targeter,
};
use evcheck_ledger::{
    reconcile, spawn_correlator, CorrelatorTask, Feeder, Ledger, LedgerConfig, ReconcileOptions,
    Report,
};
use evcheck_net::{run_attack, EventTargeter, HttpLoadGenerator, JsonEventCodec, Receiver};

use crate::config::Config;
use crate::verdict::{describe_order_violations, VerdictRules};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

struct Attack {
    correlator: CorrelatorTask,
    done: oneshot::Receiver<HarnessResult<AttackStats>>,
}

pub fn verdict_rules(config: &Config) -> VerdictRules {
    VerdictRules {
        sender_enabled: !config.sender.disabled,
        max_duplicates_percentage: config
            .receiver
            .max_duplicates_percentage
            .and_then(|p| u64::try_from(p).ok()),
    }
}

/// Execute one run and return its report. Only configuration and
/// lifecycle problems are errors; delivery anomalies land in the report.
pub async fn run(config: &Config, shutdown: Shutdown) -> Result<Report> {
    info!(config = %serde_json::to_string(config)?, "starting run");
    if config.order_check_races_workers() {
        warn!(
            workers = config.sender.workers,
            "verifyOrder compares against response order; use sender.workers = 1 for a strict check"
        );
    }

    let capacity = config.buffer_size();
    let ledger = Arc::new(Ledger::new(LedgerConfig {
        ordered: config.num_partition_keys().is_some(),
    }));

    let (sent_tx, sent_rx) = mpsc::channel(capacity);
    let (received_tx, received_rx) = mpsc::channel(capacity);
    let sent_feeder = Feeder::spawn(ledger.clone(), Side::Sent, sent_rx);
    let received_feeder = Feeder::spawn(ledger.clone(), Side::Received, received_rx);

    let codec: Arc<dyn EventCodec> = Arc::new(JsonEventCodec);
    let recorder = LatencyRecorder::new(
        config
            .receiver
            .include_remote_address_label
            .unwrap_or(false),
    )
    .context("failed to create latency recorder")?;

    let receiver = Receiver::bind(
        &config.receiver_settings()?,
        codec.clone(),
        recorder.clone(),
        received_tx,
    )
    .await
    .context("failed to start receiver")?;

    let grace = config.receiver.parsed_timeout;
    let stop = {
        let listener = shutdown.listener();
        let ledger = ledger.clone();
        async move {
            listener.triggered().await;
            info!(grace_ms = grace.as_millis() as u64, "waiting for in-flight events");
            report_progress(&ledger, tokio::time::sleep(grace)).await;
        }
    };
    let server = tokio::spawn(receiver.serve(stop));

    let attack = if config.sender.disabled {
        drop(sent_tx);
        info!("sender disabled, receiving until interrupted");
        None
    } else {
        let delay = config.sender.parsed_start_delay;
        info!(delay_ms = delay.as_millis() as u64, "waiting for receiver to start");
        let started = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.listener().triggered() => false,
        };
        if started {
            Some(start_attack(config, codec, sent_tx, capacity, shutdown.clone())?)
        } else {
            drop(sent_tx);
            None
        }
    };

    report_progress(&ledger, shutdown.listener().triggered()).await;
    info!("attack finished, waiting for events");

    let metrics = match attack {
        Some(attack) => {
            let stats = attack
                .done
                .await
                .map_err(|_| anyhow!("attack thread exited without a result"))?
                .context("attack failed")?;
            let summary = attack.correlator.finish().await?;
            summary.into_metrics(stats)
        }
        None => Metrics::default(),
    };

    server.await.context("receiver task panicked")??;

    info!("waiting for sent events to drain");
    let sent = sent_feeder.drained().await?;
    info!("waiting for received events to drain");
    let received = received_feeder.drained().await?;
    info!(
        sent = sent.inserted,
        received = received.inserted,
        "ledger final"
    );

    let accepted = metrics.accepted_count;
    ledger.mark_terminated(metrics)?;
    let report = reconcile(
        &ledger.snapshot(),
        ReconcileOptions {
            verify_order: config.verify_order(),
        },
    );

    let unreceived = accepted as i64 - report.received_count as i64;
    if unreceived != 0 {
        warn!(
            accepted,
            received = report.received_count,
            unreceived,
            "accepted and received counts differ"
        );
    }
    for line in describe_order_violations(&report.order_violations) {
        warn!("order violation in {line}");
    }

    info!(report = %serde_json::to_string_pretty(&report)?, "report");
    info!(latency = %serde_json::to_string(&recorder.snapshot())?, "receiver latency");
    Ok(report)
}

/// Log ledger counts every [`PROGRESS_INTERVAL`] until `until` completes.
async fn report_progress(ledger: &Ledger, until: impl Future<Output = ()>) {
    tokio::pin!(until);
    let mut tick = tokio::time::interval(PROGRESS_INTERVAL);
    // the first tick fires immediately
    tick.tick().await;
    loop {
        tokio::select! {
            _ = &mut until => return,
            _ = tick.tick() => info!(
                sent = ledger.sent_count(),
                received = ledger.received_count(),
                "progress"
            ),
        }
    }
}

/// Spawn the correlator and the attack thread. The thread triggers
/// `shutdown` when the attack ends, however it ends.
fn start_attack(
    config: &Config,
    codec: Arc<dyn EventCodec>,
    sent: mpsc::Sender<ObservedEvent>,
    capacity: usize,
    shutdown: Shutdown,
) -> Result<Attack> {
    let (inputs, correlator) = spawn_correlator(sent, capacity);
    let targeter: Arc<dyn Targeter> = Arc::new(EventTargeter::new(
        config.sender.target.clone(),
        config.num_partition_keys(),
        codec,
        inputs.proposed,
    ));
    let generator = HttpLoadGenerator::new(config.attack_plan());
    let accepted = inputs.accepted;
    let (done_tx, done) = oneshot::channel();

    thread::Builder::new()
        .name("attack".into())
        .spawn(move || {
            let outcome = run_attack(&generator, targeter, accepted, shutdown.listener());
            shutdown.trigger();
            // the orchestrator only drops the receiver when it is already failing
            let _ = done_tx.send(outcome);
        })
        .context("failed to spawn attack thread")?;

    Ok(Attack { correlator, done })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::evaluate;
    use std::net::TcpListener;
    use std::time::Duration;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn self_targeting(port: u16, extra: &str) -> Config {
        let toml_str = format!(
            r#"
duration = "1s"

[sender]
target = "http://127.0.0.1:{port}/"
frequency = 20
workers = 4
keepAlive = true
startDelay = "0s"

[receiver]
port = {port}
timeout = "300ms"
maxDuplicatesPercentage = 0
{extra}
"#
        );
        Config::from_toml(&toml_str).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_self_targeting_run_passes() {
        let port = free_port();
        let config = self_targeting(port, "");

        let report = run(&config, Shutdown::new()).await.unwrap();

        assert!(report.terminated);
        assert_eq!(report.metrics.proposed_count, 20);
        assert_eq!(report.metrics.accepted_count, 20);
        assert_eq!(report.metrics.metrics.requests, 20);
        assert_eq!(report.received_count, 20);
        assert_eq!(report.lost_count, 0);
        assert_eq!(report.duplicate_count, 0);
        assert_eq!(evaluate(&report, verdict_rules(&config)), Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ordered_run_buckets_by_partition() {
        let port = free_port();
        let config = self_targeting(port, "\n[ordered]\nnumPartitionKeys = 3\n");

        let report = run(&config, Shutdown::new()).await.unwrap();

        assert_eq!(report.received_count, 20);
        assert_eq!(report.lost_count, 0);
        assert!(!report.received_events_by_partition_key.is_empty());
        for pk in report.received_events_by_partition_key.keys() {
            assert!(["0", "1", "2"].contains(&pk.as_str()), "unexpected key {pk}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_receive_only_run_ends_on_shutdown() {
        let port = free_port();
        let toml_str = format!(
            "duration = \"1s\"\n[sender]\ndisabled = true\n[receiver]\nport = {port}\ntimeout = \"0s\"\n"
        );
        let config = Config::from_toml(&toml_str).unwrap();

        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });

        let report = run(&config, shutdown).await.unwrap();
        assert!(report.terminated);
        assert_eq!(report.received_count, 0);
        assert_eq!(report.metrics.accepted_count, 0);
        assert_eq!(evaluate(&report, verdict_rules(&config)), Ok(()));
    }

    #[tokio::test]
    async fn test_bind_failure_aborts_run() {
        let taken = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = self_targeting(port, "");

        let err = run(&config, Shutdown::new()).await.unwrap_err();
        assert!(err.to_string().contains("receiver"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reporting_stops_with_its_future() {
        let ledger = Ledger::new(LedgerConfig::default());
        ledger.insert_received("a", None).unwrap();
        let started = tokio::time::Instant::now();
        report_progress(&ledger, tokio::time::sleep(Duration::from_secs(12))).await;
        assert_eq!(started.elapsed(), Duration::from_secs(12));
        assert_eq!(ledger.received_count(), 1);
    }

    #[test]
    fn test_verdict_rules_from_config() {
        let config = self_targeting(8080, "");
        let rules = verdict_rules(&config);
        assert!(rules.sender_enabled);
        assert_eq!(rules.max_duplicates_percentage, Some(0));
    }
}
