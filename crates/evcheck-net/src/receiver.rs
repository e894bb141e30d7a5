//! HTTP receiver: accepts delivered events and forwards their identity to
//! the received side of the ledger.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use chrono::Utc;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use evcheck_core::{
    EventCodec, HarnessError, HarnessResult, LatencyRecorder, ObservedEvent,
};

/// Prefix of binary-mode attribute headers.
const ATTRIBUTE_HEADER_PREFIX: &str = "ce-";

/// Delay applied before acknowledging each event, drawn uniformly from
/// `[min_sleep, max_sleep)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInjection {
    pub min_sleep: Duration,
    pub max_sleep: Duration,
}

impl FaultInjection {
    fn pick(&self) -> Duration {
        if self.max_sleep <= self.min_sleep {
            return self.min_sleep;
        }
        rand::thread_rng().gen_range(self.min_sleep..self.max_sleep)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverSettings {
    pub port: u16,
    pub fault: Option<FaultInjection>,
}

struct AppState {
    codec: Arc<dyn EventCodec>,
    received: mpsc::Sender<ObservedEvent>,
    recorder: Arc<LatencyRecorder>,
    fault: Option<FaultInjection>,
}

/// A bound, not yet serving, receiver. Owns the only sender of the
/// received channel; it is dropped when [`Receiver::serve`] returns.
pub struct Receiver {
    listener: TcpListener,
    router: Router,
}

impl Receiver {
    pub async fn bind(
        settings: &ReceiverSettings,
        codec: Arc<dyn EventCodec>,
        recorder: Arc<LatencyRecorder>,
        received: mpsc::Sender<ObservedEvent>,
    ) -> HarnessResult<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            HarnessError::Lifecycle(format!("cannot bind receiver to {addr}: {e}"))
        })?;

        let state = Arc::new(AppState {
            codec,
            received,
            recorder,
            fault: settings.fault,
        });
        let router = Router::new()
            .fallback(handle_event)
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> HarnessResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| HarnessError::Lifecycle(format!("receiver has no local address: {e}")))
    }

    /// Serve until `stop` resolves, then finish in-flight requests and
    /// release the received channel.
    pub async fn serve<F>(self, stop: F) -> HarnessResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(%addr, "receiver listening");

        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stop)
        .await
        .map_err(|e| HarnessError::Lifecycle(format!("receiver failed: {e}")))?;

        info!("receiver stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

fn attributes(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(ATTRIBUTE_HEADER_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

async fn handle_event(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let path = uri.path();
    let remote = remote.to_string();
    let _in_flight = state.recorder.request_started(path, &remote);
    let started = Instant::now();

    let status = accept_event(&state, &method, &headers, &body, path, &remote).await;

    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    state.recorder.record_processing(path, &remote, elapsed);
    status
}

async fn accept_event(
    state: &AppState,
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
    path: &str,
    remote: &str,
) -> StatusCode {
    if method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED;
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let event = match state.codec.decode(content_type, &attributes(headers), body) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "rejecting undecodable event");
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Some(sent_at) = event.benchmark_timestamp {
        let latency = Utc::now().timestamp_millis() - sent_at;
        match u64::try_from(latency) {
            Ok(ms) => state.recorder.record_e2e(path, remote, ms),
            Err(_) => warn!(id = %event.id, latency_ms = latency, "negative end-to-end latency"),
        }
    }

    if let Some(fault) = state.fault {
        tokio::time::sleep(fault.pick()).await;
    }

    if state.received.send(ObservedEvent::from(&event)).await.is_err() {
        warn!(id = %event.id, "received channel closed");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}
