use crate::{
    checker::Checker,
    config::CheckerConfig,
    metrics::{PANICS_RECOVERED, PrometheusReporter, encode_metrics},
    report::{FanoutReporter, JsonReporter, Reporter},
};
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{Duration, Utc};
use futures::FutureExt;
use std::{fmt, net::IpAddr, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, signal, task, time};
use tracing::{error, info, warn};

/// Where signals go besides the `/metrics` registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Output {
    /// One JSON object per signal on stdout
    #[default]
    Json,
    /// Metrics endpoint only
    None,
}

impl FromStr for Output {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "none" => Ok(Self::None),
            _ => Err(format!("Invalid output: {s}. Valid options: json, none")),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::None => f.write_str("none"),
        }
    }
}

/// Reporter chain for `output`, always feeding the Prometheus registry
#[must_use]
pub fn reporter_for(output: Output) -> Arc<dyn Reporter> {
    match output {
        Output::Json => Arc::new(FanoutReporter::new(vec![
            Arc::new(PrometheusReporter),
            Arc::new(JsonReporter),
        ])),
        Output::None => Arc::new(PrometheusReporter),
    }
}

/// Start the checker and serve `/metrics` until interrupted
///
/// # Errors
///
/// Returns an error if the checker cannot start or the metrics port cannot
/// be bound
pub async fn start(
    config: CheckerConfig,
    interval: u16,
    listen: Option<IpAddr>,
    port: u16,
    output: Output,
) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));

    // Bind to socket with smart fallback
    let (listener, bind_addr) = match listen {
        Some(addr) => {
            let socket_addr = match addr {
                IpAddr::V6(v6) => format!("[{v6}]:{port}"),
                IpAddr::V4(v4) => format!("{v4}:{port}"),
            };
            let listener = TcpListener::bind(&socket_addr).await?;
            (listener, socket_addr)
        }
        None => {
            // Auto mode: try IPv6 first, fallback to IPv4
            if let Ok(l) = TcpListener::bind(format!("[::]:{port}")).await {
                (l, format!("[::]:{port}"))
            } else {
                let socket_addr = format!("0.0.0.0:{port}");
                (TcpListener::bind(&socket_addr).await?, socket_addr)
            }
        }
    };

    info!(%bind_addr, interval, %output, "listening for /metrics");

    let checker = Arc::new(Checker::start(config, reporter_for(output)).await?);

    let mut monitor_handle = task::spawn(run_loop(checker.clone(), interval));

    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(shutdown_signal());

    tokio::select! {
        result = server => {
            result?;
        }
        result = &mut monitor_handle => {
            checker.stop().await;
            match result {
                Ok(()) => anyhow::bail!("Monitoring loop stopped"),
                Err(e) => anyhow::bail!("Monitoring loop panicked: {e}"),
            }
        }
    }

    monitor_handle.abort();
    checker.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn metrics_handler() -> impl IntoResponse {
    match encode_metrics() {
        Ok(buffer) => (StatusCode::OK, buffer),
        Err(e) => {
            error!("{e}");
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

#[inline]
fn remaining_sleep_duration(wait_time: Duration, runtime: Duration) -> Option<time::Duration> {
    wait_time
        .checked_sub(&runtime)
        .and_then(|remaining| remaining.to_std().ok())
        .filter(|duration| !duration.is_zero())
}

async fn run_loop(checker: Arc<Checker>, every: u16) {
    let wait_time = Duration::seconds(every.into());

    loop {
        // Catch panics in individual iterations to keep loop alive
        let iteration_result = std::panic::AssertUnwindSafe(async {
            let now = Utc::now();

            checker.tick();

            let runtime = Utc::now().signed_duration_since(now);

            // Sleep for remaining interval time to maintain fixed interval
            if let Some(remaining) = remaining_sleep_duration(wait_time, runtime) {
                time::sleep(remaining).await;
            }
        })
        .catch_unwind()
        .await;

        if let Err(panic_info) = iteration_result {
            error!("Panic in scheduling loop iteration: {panic_info:?}");
            PANICS_RECOVERED.inc();
            time::sleep(time::Duration::from_secs(every.into())).await;
        }
    }
}
