use crate::{
    config::{Check, CheckerConfig},
    evaluation::Evaluation,
    pool::PoolStats,
    target::{CheckTarget, endpoint_name},
    tls::{config::TlsContext, facts::humanize, ocsp::OcspStatus, probe::ProbeError},
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::{
    fmt,
    net::IpAddr,
    sync::{Arc, Mutex},
};

/// Severity of a health signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Ok,
    Warning,
    Critical,
}

impl State {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// 0 ok, 1 warning, 2 critical
    #[must_use]
    pub const fn as_gauge(&self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::Warning => 1,
            Self::Critical => 2,
        }
    }

    #[must_use]
    pub const fn ok_or_critical(ok: bool) -> Self {
        if ok { Self::Ok } else { Self::Critical }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One check outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSignal {
    pub service: String,
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<f64>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl HealthSignal {
    #[must_use]
    pub fn new(service: impl Into<String>, state: State) -> Self {
        Self {
            service: service.into(),
            state,
            metric: None,
            description: String::new(),
            host: None,
            port: None,
        }
    }

    #[must_use]
    pub const fn with_metric(mut self, metric: f64) -> Self {
        self.metric = Some(metric);
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_origin(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }
}

/// Sink for health signals.
///
/// Called concurrently from every worker, must not block on delivery.
pub trait Reporter: Send + Sync {
    fn report(&self, signal: HealthSignal);

    /// `services` will not be reported again, drop whatever is kept for them
    fn forget(&self, _services: &[String]) {}
}

/// One JSON object per line on stdout
#[derive(Debug, Default)]
pub struct JsonReporter;

#[derive(Serialize)]
struct JsonLine<'a> {
    time: String,
    #[serde(flatten)]
    signal: &'a HealthSignal,
}

impl Reporter for JsonReporter {
    fn report(&self, signal: HealthSignal) {
        let line = JsonLine {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            signal: &signal,
        };
        if let Ok(serialized) = serde_json::to_string(&line) {
            println!("{serialized}");
        }
    }
}

/// Hands every signal to each inner reporter
#[derive(Default)]
pub struct FanoutReporter {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl FanoutReporter {
    #[must_use]
    pub fn new(reporters: Vec<Arc<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for FanoutReporter {
    fn report(&self, signal: HealthSignal) {
        if let Some((last, rest)) = self.reporters.split_last() {
            for reporter in rest {
                reporter.report(signal.clone());
            }
            last.report(signal);
        }
    }

    fn forget(&self, services: &[String]) {
        for reporter in &self.reporters {
            reporter.forget(services);
        }
    }
}

/// Keeps every signal, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryReporter {
    signals: Mutex<Vec<HealthSignal>>,
}

impl MemoryReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn signals(&self) -> Vec<HealthSignal> {
        self.signals
            .lock()
            .map(|signals| signals.clone())
            .unwrap_or_default()
    }

    /// Remove and return everything received so far
    pub fn drain(&self) -> Vec<HealthSignal> {
        self.signals
            .lock()
            .map(|mut signals| std::mem::take(&mut *signals))
            .unwrap_or_default()
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, signal: HealthSignal) {
        if let Ok(mut signals) = self.signals.lock() {
            signals.push(signal);
        }
    }
}

/// Checks reported per endpoint, availability first
pub const ENDPOINT_CHECKS: [&str; 6] = [
    "availability",
    "not before",
    "not after",
    "identity",
    "trust",
    "OCSP status",
];

/// `TLS certificate <uri> <endpoint> <check>`
#[must_use]
pub fn service_name(target: &CheckTarget, endpoint: &str, check: &str) -> String {
    format!("TLS certificate {} {endpoint} {check}", target.redacted())
}

/// Every service name `endpoint` of `target` can be reported under
#[must_use]
pub fn endpoint_services(target: &CheckTarget, endpoint: &str) -> Vec<String> {
    ENDPOINT_CHECKS
        .iter()
        .map(|check| service_name(target, endpoint, check))
        .collect()
}

/// `address:port`, or the bare address when the scheme has no port
#[must_use]
pub fn address_endpoint(address: IpAddr, port: Option<u16>) -> String {
    port.map_or_else(|| address.to_string(), |port| endpoint_name(address, port))
}

/// `host:port` as written in the URI, for targets without any address
#[must_use]
pub fn unresolved_endpoint(target: &CheckTarget) -> String {
    target.port().map_or_else(
        || target.host().to_string(),
        |port| format!("{}:{port}", target.host()),
    )
}

fn signal(evaluation: &Evaluation, check: &str, state: State) -> HealthSignal {
    let target = evaluation.target();
    HealthSignal::new(
        service_name(target, &evaluation.endpoint(), check),
        state,
    )
    .with_origin(target.hostname(), Some(evaluation.port()))
}

/// `ocsp` is only consulted when it is applicable
#[must_use]
pub fn availability_signal(evaluation: &Evaluation, ocsp: Option<&OcspStatus>) -> HealthSignal {
    if let Some(exception) = evaluation.exception() {
        return signal(evaluation, "availability", State::Critical).with_description(exception);
    }

    let issues = evaluation.issues(ocsp);
    signal(
        evaluation,
        "availability",
        State::ok_or_critical(issues.is_empty()),
    )
    .with_description(issues.join("\n"))
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn not_before_signal(evaluation: &Evaluation) -> Option<HealthSignal> {
    let facts = evaluation.facts()?;
    let elapsed = facts.not_before_elapsed(evaluation.now());

    Some(
        signal(
            evaluation,
            "not before",
            facts.not_before_state(evaluation.now()),
        )
        .with_metric(elapsed.num_seconds() as f64)
        .with_description(humanize(-elapsed)),
    )
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn not_after_signal(evaluation: &Evaluation) -> Option<HealthSignal> {
    let facts = evaluation.facts()?;
    let remaining = facts.not_after_remaining(evaluation.now());

    Some(
        signal(
            evaluation,
            "not after",
            facts.not_after_state(evaluation.now(), evaluation.thresholds()),
        )
        .with_metric(remaining.num_seconds() as f64)
        .with_description(humanize(remaining)),
    )
}

#[must_use]
pub fn identity_signal(evaluation: &Evaluation) -> Option<HealthSignal> {
    let facts = evaluation.facts()?;
    let mut description = String::from("Valid for:");
    for identity in facts.acceptable_identities() {
        description.push('\n');
        description.push_str(&identity);
    }

    Some(
        signal(
            evaluation,
            "identity",
            State::ok_or_critical(evaluation.valid_identity()),
        )
        .with_description(description),
    )
}

#[must_use]
pub fn trust_signal(evaluation: &Evaluation) -> Option<HealthSignal> {
    evaluation.facts()?;

    if let Some(exception) = evaluation.exception() {
        return Some(signal(evaluation, "trust", State::Critical).with_description(exception));
    }

    Some(
        signal(
            evaluation,
            "trust",
            State::ok_or_critical(evaluation.trusted()),
        )
        .with_description(evaluation.verify_code().to_string()),
    )
}

/// `None` unless OCSP applies to the certificate
#[must_use]
pub fn ocsp_signal(evaluation: &Evaluation, status: &OcspStatus) -> Option<HealthSignal> {
    if evaluation.facts().is_none() || !status.is_applicable() {
        return None;
    }

    Some(
        signal(
            evaluation,
            "OCSP status",
            State::ok_or_critical(status.is_valid()),
        )
        .with_description(status.description()),
    )
}

/// Availability first, then every enabled check that applies.
///
/// The OCSP responder is only contacted when the `ocsp` check is enabled.
pub async fn classify(
    evaluation: &Evaluation,
    config: &CheckerConfig,
    tls: &TlsContext,
) -> Vec<HealthSignal> {
    let ocsp = if config.enabled(Check::Ocsp) && evaluation.facts().is_some() {
        Some(evaluation.ocsp(tls).await)
    } else {
        None
    };

    let mut signals = vec![availability_signal(evaluation, ocsp)];

    if evaluation.facts().is_none() {
        return signals;
    }

    for check in &config.checks {
        let signal = match check {
            Check::NotBefore => not_before_signal(evaluation),
            Check::NotAfter => not_after_signal(evaluation),
            Check::Identity => identity_signal(evaluation),
            Check::Trust => trust_signal(evaluation),
            Check::Ocsp => ocsp.and_then(|status| ocsp_signal(evaluation, status)),
        };
        signals.extend(signal);
    }

    signals
}

/// Availability failure for an address that could not be probed
#[must_use]
pub fn unavailable_signal(
    target: &CheckTarget,
    address: IpAddr,
    port: Option<u16>,
    error: &ProbeError,
) -> HealthSignal {
    HealthSignal::new(
        service_name(target, &address_endpoint(address, port), "availability"),
        State::Critical,
    )
    .with_description(error.to_string())
    .with_origin(target.hostname(), port)
}

/// Availability failure for a target without any address
#[must_use]
pub fn unresolved_signal(target: &CheckTarget) -> HealthSignal {
    HealthSignal::new(
        service_name(target, &unresolved_endpoint(target), "availability"),
        State::Critical,
    )
    .with_description(format!("Could not resolve {}", target.hostname()))
    .with_origin(target.hostname(), target.port())
}

/// Utilization and saturation of one pool
#[must_use]
pub fn pool_signals(name: &str, stats: &PoolStats) -> [HealthSignal; 2] {
    #[allow(clippy::cast_precision_loss)]
    let depth = stats.depth as f64;

    [
        HealthSignal::new(
            format!("tlspulse {name} utilization"),
            State::ok_or_critical(!stats.fully_busy()),
        )
        .with_metric(stats.utilization()),
        HealthSignal::new(
            format!("tlspulse {name} saturation"),
            State::ok_or_critical(!stats.saturated()),
        )
        .with_metric(depth),
    ]
}
