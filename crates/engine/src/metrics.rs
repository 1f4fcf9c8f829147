use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use webscout_common::types::EngineStats;

/// Prometheus surface for the engine. Gauges are refreshed from periodic
/// stats snapshots; the counters are bumped inline by the service.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub pool_live_instances: IntGauge,
    pub pool_leased_instances: IntGauge,
    pub queue_depth: IntGauge,
    /// 0 = closed, 1 = half-open, 2 = open.
    pub breaker_state: IntGauge,
    pub instances_created_total: IntGauge,
    pub instances_recycled_total: IntGauge,
    pub instances_destroyed_total: IntGauge,
    pub active_sessions: IntGauge,
    pub active_requests: IntGauge,
    pub tool_calls: IntCounterVec,
    pub navigation_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let pool_live_instances = IntGauge::with_opts(Opts::new(
            "webscout_pool_live_instances",
            "Browser instances currently alive in the pool",
        ))?;
        registry.register(Box::new(pool_live_instances.clone()))?;

        let pool_leased_instances = IntGauge::with_opts(Opts::new(
            "webscout_pool_leased_instances",
            "Browser instances currently leased to requests",
        ))?;
        registry.register(Box::new(pool_leased_instances.clone()))?;

        let queue_depth = IntGauge::with_opts(Opts::new(
            "webscout_queue_depth",
            "Acquisition requests waiting in the admission queue",
        ))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let breaker_state = IntGauge::with_opts(Opts::new(
            "webscout_breaker_state",
            "Circuit breaker state (0=closed, 1=half-open, 2=open)",
        ))?;
        registry.register(Box::new(breaker_state.clone()))?;

        let instances_created_total = IntGauge::with_opts(Opts::new(
            "webscout_instances_created_total",
            "Browser instances created since start",
        ))?;
        registry.register(Box::new(instances_created_total.clone()))?;

        let instances_recycled_total = IntGauge::with_opts(Opts::new(
            "webscout_instances_recycled_total",
            "Browser instances recycled since start",
        ))?;
        registry.register(Box::new(instances_recycled_total.clone()))?;

        let instances_destroyed_total = IntGauge::with_opts(Opts::new(
            "webscout_instances_destroyed_total",
            "Browser instances destroyed since start",
        ))?;
        registry.register(Box::new(instances_destroyed_total.clone()))?;

        let active_sessions = IntGauge::with_opts(Opts::new(
            "webscout_active_sessions",
            "Research sessions currently held in the store",
        ))?;
        registry.register(Box::new(active_sessions.clone()))?;

        let active_requests = IntGauge::with_opts(Opts::new(
            "webscout_active_requests",
            "Tool operations currently in flight",
        ))?;
        registry.register(Box::new(active_requests.clone()))?;

        let tool_calls = IntCounterVec::new(
            Opts::new("webscout_tool_calls_total", "Tool operations by kind"),
            &["op"],
        )?;
        registry.register(Box::new(tool_calls.clone()))?;

        let navigation_failures = IntCounterVec::new(
            Opts::new(
                "webscout_navigation_failures_total",
                "Failed navigations by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(navigation_failures.clone()))?;

        Ok(Self {
            registry,
            pool_live_instances,
            pool_leased_instances,
            queue_depth,
            breaker_state,
            instances_created_total,
            instances_recycled_total,
            instances_destroyed_total,
            active_sessions,
            active_requests,
            tool_calls,
            navigation_failures,
        })
    }

    /// Refresh the gauges from a stats snapshot.
    pub fn observe(&self, stats: &EngineStats) {
        self.pool_live_instances.set(stats.pool.live_instances as i64);
        self.pool_leased_instances
            .set(stats.pool.leased_instances as i64);
        self.queue_depth.set(stats.pool.queue_depth as i64);
        self.breaker_state.set(breaker_state_gauge(&stats.breaker.state));
        self.instances_created_total
            .set(stats.pool.total_instances_created as i64);
        self.instances_recycled_total
            .set(stats.pool.total_instances_recycled as i64);
        self.instances_destroyed_total
            .set(stats.pool.total_instances_destroyed as i64);
        self.active_sessions
            .set(stats.sessions.active_sessions as i64);
        self.active_requests.set(stats.active_requests as i64);
    }

    /// Start the HTTP server for Prometheus scrapes.
    pub async fn start_server(self, port: u16) -> anyhow::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));
        let app = app.with_state(self);

        let addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Metrics server listening on {}", addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}

fn breaker_state_gauge(state: &str) -> i64 {
    match state {
        "closed" => 0,
        "half_open" => 1,
        _ => 2,
    }
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Metrics>,
) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}
