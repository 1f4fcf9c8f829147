mod browser_pool;
mod circuit_breaker;
mod instance;
mod metrics;
mod navigator;
mod service;

pub use browser_pool::{BrowserPool, PageLease};
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use metrics::Metrics;
pub use navigator::Navigator;
pub use service::{ContentExtractor, MarkdownExtractor, ResearchService, ScreenshotStore};

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use webscout_common::config::EngineConfig;

/// Cadence of the stats-to-metrics refresh loop.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Run the research engine until SIGTERM/Ctrl+C: pool dispatcher, breaker
/// monitor, session cleanup, metrics server and the stats refresh loop.
///
/// Embedders who want the service without the process scaffolding can build
/// the pieces directly; see `ResearchService`.
pub async fn run_engine(config: EngineConfig) -> Result<()> {
    info!("starting research engine: {:?}", config.pool);

    let shutdown = CancellationToken::new();

    let metrics = Metrics::new()?;
    let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
    breaker.start_monitor(shutdown.clone());

    let pool = Arc::new(BrowserPool::new(
        config.pool.clone(),
        config.browser.clone(),
        config.navigation.navigation_timeout,
        breaker.clone(),
    ));
    pool.start(&shutdown);

    let service = Arc::new(ResearchService::new(
        &config,
        pool.clone(),
        breaker,
        metrics.clone(),
        shutdown.clone(),
    ));
    let active_requests = service.active_requests_handle();
    let is_ready = service.is_ready_handle();

    let metrics_port = config.metrics_port;
    let metrics_handle = {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics.start_server(metrics_port).await {
                tracing::error!("metrics server error: {}", e);
            }
        })
    };

    // Keep the gauges current.
    {
        let service = service.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(STATS_INTERVAL) => {}
                }
                metrics.observe(&service.engine_stats().await);
            }
        });
    }

    tokio::select! {
        _ = shutdown_signal(active_requests.clone(), is_ready, shutdown.clone()) => {}
        _ = metrics_handle => {
            warn!("metrics server stopped unexpectedly");
            shutdown.cancel();
        }
    }

    pool.shutdown().await;

    let remaining = active_requests.load(Ordering::SeqCst);
    if remaining == 0 {
        info!("all requests drained, terminating cleanly");
    } else {
        warn!(
            "terminating with {} request(s) still running",
            remaining
        );
    }

    info!("engine shutdown complete");
    Ok(())
}

async fn shutdown_signal(
    active_requests: Arc<AtomicUsize>,
    is_ready: Arc<AtomicBool>,
    cancellation_token: CancellationToken,
) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received Ctrl+C");
        },
        _ = terminate => {
            warn!("received SIGTERM");
        },
    }

    // Readiness goes false first so load balancers stop routing here.
    is_ready.store(false, Ordering::SeqCst);
    info!("engine marked not ready");

    info!("cancelling in-flight operations");
    cancellation_token.cancel();

    let active_count = active_requests.load(Ordering::SeqCst);
    if active_count > 0 {
        info!(
            "draining {} active request(s) before exit",
            active_count
        );

        loop {
            let remaining = active_requests.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            info!("still draining {} request(s)", remaining);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        info!("drain complete");
    } else {
        info!("no active requests to drain");
    }
}
