use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "digestscope";

/// Prometheus metrics describing the relay's own health.
///
/// Only counters about routing and buffering live here; inspected-page
/// telemetry never leaves the session.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Broker ===
    /// Messages received by the Broker, by sender role.
    pub messages_received: CounterVec,
    /// Messages forwarded to another endpoint, by task.
    pub messages_forwarded: CounterVec,
    /// Messages dropped, by reason.
    pub messages_dropped: CounterVec,
    /// Messages carrying a task outside the vocabulary.
    pub unknown_tasks: Counter,
    /// Active routes per role.
    pub routes_active: GaugeVec,
    /// Channels currently connected to the Broker.
    pub connections_active: Gauge,
    /// Cleanup signals sent to producers.
    pub cleanup_signals: Counter,

    // === Collector ===
    /// Samples recorded, by kind.
    pub samples_recorded: CounterVec,
    /// Panel messages whose payload failed to decode, by task.
    pub malformed_payloads: CounterVec,
    /// Time spent deriving a series, by series name.
    pub series_query_duration: HistogramVec,
    /// Poller ticks, by poller name.
    pub poller_ticks: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let messages_received = CounterVec::new(
            Opts::new(
                "messages_received_total",
                "Messages received by the broker by sender role.",
            )
            .namespace(NAMESPACE),
            &["role"],
        )?;
        let messages_forwarded = CounterVec::new(
            Opts::new(
                "messages_forwarded_total",
                "Messages forwarded to another endpoint by task.",
            )
            .namespace(NAMESPACE),
            &["task"],
        )?;
        let messages_dropped = CounterVec::new(
            Opts::new("messages_dropped_total", "Messages dropped by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let unknown_tasks = Counter::with_opts(
            Opts::new(
                "unknown_tasks_total",
                "Messages with a task outside the protocol vocabulary.",
            )
            .namespace(NAMESPACE),
        )?;
        let routes_active = GaugeVec::new(
            Opts::new("routes_active", "Active routes per endpoint role.").namespace(NAMESPACE),
            &["role"],
        )?;
        let connections_active = Gauge::with_opts(
            Opts::new(
                "connections_active",
                "Channels currently connected to the broker.",
            )
            .namespace(NAMESPACE),
        )?;
        let cleanup_signals = Counter::with_opts(
            Opts::new(
                "cleanup_signals_total",
                "Cleanup signals sent to producers after an inspector left.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_recorded = CounterVec::new(
            Opts::new("samples_recorded_total", "Samples recorded by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let malformed_payloads = CounterVec::new(
            Opts::new(
                "malformed_payloads_total",
                "Panel messages whose payload failed to decode by task.",
            )
            .namespace(NAMESPACE),
            &["task"],
        )?;
        let series_query_duration = HistogramVec::new(
            HistogramOpts::new(
                "series_query_duration_seconds",
                "Time spent deriving a plot series.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005,
            ]),
            &["series"],
        )?;
        let poller_ticks = CounterVec::new(
            Opts::new("poller_ticks_total", "Live poller ticks by poller.").namespace(NAMESPACE),
            &["poller"],
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_forwarded.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(unknown_tasks.clone()))?;
        registry.register(Box::new(routes_active.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(cleanup_signals.clone()))?;
        registry.register(Box::new(samples_recorded.clone()))?;
        registry.register(Box::new(malformed_payloads.clone()))?;
        registry.register(Box::new(series_query_duration.clone()))?;
        registry.register(Box::new(poller_ticks.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            messages_received,
            messages_forwarded,
            messages_dropped,
            unknown_tasks,
            routes_active,
            connections_active,
            cleanup_signals,
            samples_recorded,
            malformed_payloads,
            series_query_duration,
            poller_ticks,
        })
    }

    /// Renders all registered metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("metrics are not utf-8")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_without_collision() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health
            .messages_received
            .with_label_values(&["producer_relay"])
            .inc();
        health.unknown_tasks.inc();

        let text = health.render().expect("render");
        assert!(text.contains("digestscope_messages_received_total"));
        assert!(text.contains("digestscope_unknown_tasks_total 1"));
    }

    #[test]
    fn test_instances_do_not_share_registry() {
        let a = HealthMetrics::new(":0").expect("metrics");
        let b = HealthMetrics::new(":0").expect("metrics");
        a.cleanup_signals.inc();
        assert!((b.cleanup_signals.get() - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_start_and_stop_on_ephemeral_port() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }
}
