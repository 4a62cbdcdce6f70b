use crate::report::{HealthSignal, Reporter};
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGaugeVec, Registry, opts, register_gauge_vec_with_registry,
    register_histogram_vec_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

trait ResultExt<T> {
    fn or_exit(self, context: &str) -> T;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn or_exit(self, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                eprintln!("failed to initialize metric ({context}): {err}");
                std::process::exit(1);
            }
        }
    }
}

// Health signals
pub static SIGNAL_STATE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        opts!(
            "tlspulse_signal_state",
            "Latest state per service (0 ok, 1 warning, 2 critical)"
        ),
        &["service"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static SIGNAL_METRIC: LazyLock<GaugeVec> = LazyLock::new(|| {
    register_gauge_vec_with_registry!(
        opts!(
            "tlspulse_signal_metric",
            "Latest metric per service, when the signal carries one"
        ),
        &["service"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static SIGNALS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        opts!("tlspulse_signals_total", "Total signals reported by state"),
        &["state"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

// Scheduling
pub static TICK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram_with_registry!(
        HistogramOpts::new(
            "tlspulse_tick_duration_seconds",
            "Time spent enqueueing one round of targets"
        ),
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static TICKS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        opts!("tlspulse_ticks_total", "Total scheduling ticks"),
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static PANICS_RECOVERED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        opts!(
            "tlspulse_panics_recovered_total",
            "Total panics recovered from"
        ),
        &REGISTRY
    )
    .or_exit("metric can be created")
});

// Handshakes
pub static HANDSHAKE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec_with_registry!(
        HistogramOpts::new(
            "tlspulse_handshake_duration_seconds",
            "Connect, upgrade and TLS handshake duration in seconds"
        ),
        &["protocol"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

pub static HANDSHAKE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        opts!(
            "tlspulse_handshake_errors_total",
            "Total probe failures by type (connection, timeout, protocol, tls)"
        ),
        &["protocol", "error_type"],
        &REGISTRY
    )
    .or_exit("metric can be created")
});

/// Mirrors every signal into the registry served at `/metrics`
#[derive(Debug, Default)]
pub struct PrometheusReporter;

impl Reporter for PrometheusReporter {
    fn report(&self, signal: HealthSignal) {
        SIGNAL_STATE
            .with_label_values(&[signal.service.as_str()])
            .set(signal.state.as_gauge());
        if let Some(metric) = signal.metric {
            SIGNAL_METRIC
                .with_label_values(&[signal.service.as_str()])
                .set(metric);
        }
        SIGNALS_TOTAL
            .with_label_values(&[signal.state.as_str()])
            .inc();
    }

    fn forget(&self, services: &[String]) {
        for service in services {
            // absent series are not an error here
            let _ = SIGNAL_STATE.remove_label_values(&[service.as_str()]);
            let _ = SIGNAL_METRIC.remove_label_values(&[service.as_str()]);
        }
    }
}

/// Encode and return metrics for HTTP export
///
/// # Errors
///
/// Returns an error if metrics encoding fails
pub fn encode_metrics() -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();

    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| format!("could not encode custom metrics: {e}"))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::report::State;

    #[test]
    fn test_prometheus_reporter_sets_state_and_metric() {
        let service = "TLS certificate https://metrics.example.com/ 127.0.0.1:443 not after";
        PrometheusReporter.report(
            HealthSignal::new(service, State::Warning).with_metric(86_400.0),
        );

        assert_eq!(SIGNAL_STATE.with_label_values(&[service]).get(), 1);
        assert!((SIGNAL_METRIC.with_label_values(&[service]).get() - 86_400.0).abs() < f64::EPSILON);

        PrometheusReporter.report(HealthSignal::new(service, State::Critical));
        assert_eq!(SIGNAL_STATE.with_label_values(&[service]).get(), 2);
        // a signal without metric leaves the last value alone
        assert!((SIGNAL_METRIC.with_label_values(&[service]).get() - 86_400.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_forget_drops_series() {
        let stale = "TLS certificate https://rotated.example.com/ 192.0.2.1:443 not after";
        let kept = "TLS certificate https://rotated.example.com/ 192.0.2.2:443 not after";
        for service in [stale, kept] {
            PrometheusReporter.report(HealthSignal::new(service, State::Ok).with_metric(1.0));
        }

        PrometheusReporter.forget(&[stale.to_string(), "never reported".to_string()]);

        let output = String::from_utf8(encode_metrics().unwrap()).unwrap();
        assert!(!output.contains("192.0.2.1:443"));
        assert!(output.contains("192.0.2.2:443"));
    }

    #[test]
    fn test_signals_total_counts_by_state() {
        let before = SIGNALS_TOTAL.with_label_values(&["ok"]).get();
        PrometheusReporter.report(HealthSignal::new("tlspulse counted", State::Ok));
        assert!(SIGNALS_TOTAL.with_label_values(&["ok"]).get() > before);
    }

    #[test]
    fn test_handshake_metrics() {
        HANDSHAKE_DURATION
            .with_label_values(&["smtp"])
            .observe(0.05);
        HANDSHAKE_ERRORS
            .with_label_values(&["postgres", "protocol"])
            .inc();
        TICK_DURATION.start_timer().observe_duration();
        TICKS_TOTAL.inc();
        PANICS_RECOVERED.inc();
    }

    #[test]
    fn test_encode_metrics() {
        PANICS_RECOVERED.inc();

        let result = encode_metrics();
        assert!(result.is_ok());

        let buffer = result.unwrap();
        assert!(!buffer.is_empty());

        let output = String::from_utf8(buffer).unwrap();
        assert!(output.contains("tlspulse_panics_recovered_total"));
    }

    #[test]
    fn test_registry() {
        TICKS_TOTAL.inc();
        HANDSHAKE_ERRORS.with_label_values(&["raw", "timeout"]).inc();
        PrometheusReporter.report(HealthSignal::new("tlspulse registry", State::Ok).with_metric(0.5));

        let metric_names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|m| m.name().to_string())
            .collect();

        assert!(metric_names.contains(&"tlspulse_ticks_total".to_string()));
        assert!(metric_names.contains(&"tlspulse_handshake_errors_total".to_string()));
        assert!(metric_names.contains(&"tlspulse_signal_state".to_string()));
        assert!(metric_names.contains(&"tlspulse_signal_metric".to_string()));
        assert!(metric_names.contains(&"tlspulse_signals_total".to_string()));
    }
}
