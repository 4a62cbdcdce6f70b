use crate::{
    config::CheckerConfig,
    evaluation::Evaluation,
    metrics::{HANDSHAKE_DURATION, HANDSHAKE_ERRORS, PANICS_RECOVERED, TICK_DURATION, TICKS_TOTAL},
    pool::{Pool, PoolStats},
    report::{self, Reporter},
    resolver::Resolver,
    target::CheckTarget,
    tls::{
        config::TlsContext,
        probe::{self, ProbeContext, ProbeError},
    },
};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use std::{
    collections::HashMap,
    net::IpAddr,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};
use tracing::{debug, error, info};

/// A target and every address it resolved to
#[derive(Debug, Clone)]
pub struct Resolved {
    pub target: CheckTarget,
    pub addresses: Vec<IpAddr>,
}

/// Endpoints each target was last reported under
#[derive(Debug, Default)]
pub struct KnownEndpoints {
    endpoints: Mutex<HashMap<String, Vec<String>>>,
}

impl KnownEndpoints {
    /// Record the current endpoints of `target`, returns the ones it lost
    pub fn replace(&self, target: &CheckTarget, current: Vec<String>) -> Vec<String> {
        let Ok(mut endpoints) = self.endpoints.lock() else {
            return Vec::new();
        };
        let key = target.to_string();
        let lost = endpoints
            .get(&key)
            .map(|previous| {
                previous
                    .iter()
                    .filter(|endpoint| !current.contains(endpoint))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        endpoints.insert(key, current);

        lost
    }
}

/// Shared by every worker task
pub struct WorkerContext {
    pub probe: ProbeContext,
    pub config: Arc<CheckerConfig>,
    pub reporter: Arc<dyn Reporter>,
}

/// Resolver and worker pools fed by [`Checker::tick`]
pub struct Checker {
    config: Arc<CheckerConfig>,
    reporter: Arc<dyn Reporter>,
    resolvers: Pool<CheckTarget>,
    workers: Arc<Pool<Resolved>>,
}

impl Checker {
    /// Validate the configuration, build the trust store and start both pools
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the TLS context
    /// cannot be built. No task is started in that case.
    pub async fn start(config: CheckerConfig, reporter: Arc<dyn Reporter>) -> Result<Self> {
        Self::start_with_resolver(config, reporter, Resolver::new()).await
    }

    /// Same as [`Checker::start`], looking targets up through `resolver`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the TLS context
    /// cannot be built
    pub async fn start_with_resolver(
        config: CheckerConfig,
        reporter: Arc<dyn Reporter>,
        resolver: Resolver,
    ) -> Result<Self> {
        config.validate().context("invalid checker configuration")?;

        let tls = Arc::new(
            TlsContext::build(&config.trust, config.connect_timeout)
                .await
                .context("failed to build TLS context")?,
        );
        let config = Arc::new(config);

        let context = Arc::new(WorkerContext {
            probe: ProbeContext {
                tls,
                connect_timeout: config.connect_timeout,
                ehlo_hostname: config.ehlo_hostname.clone(),
            },
            config: config.clone(),
            reporter: reporter.clone(),
        });

        let workers = Arc::new(Pool::start("workers", config.workers, {
            let context = context.clone();
            move |resolved: Resolved| {
                let context = context.clone();
                async move { check_addresses(&context, resolved).await }
            }
        }));

        let resolvers = Pool::start("resolvers", config.resolvers, {
            let workers = workers.clone();
            let reporter = reporter.clone();
            let known = Arc::new(KnownEndpoints::default());
            move |target: CheckTarget| {
                let resolver = resolver.clone();
                let workers = workers.clone();
                let reporter = reporter.clone();
                let known = known.clone();
                async move {
                    let addresses = resolver.resolve(&target).await;
                    forget_lost_endpoints(&known, reporter.as_ref(), &target, &addresses);
                    dispatch_addresses(&workers, reporter.as_ref(), target, addresses);
                }
            }
        });

        info!(
            targets = config.targets.len(),
            resolvers = config.resolvers,
            workers = config.workers,
            "checker started"
        );

        Ok(Self {
            config,
            reporter,
            resolvers,
            workers,
        })
    }

    /// Report pool health, then queue every target for resolution
    pub fn tick(&self) {
        let timer = TICK_DURATION.start_timer();
        TICKS_TOTAL.inc();

        for signal in report::pool_signals(self.resolvers.name(), &self.resolvers.stats()) {
            self.reporter.report(signal);
        }
        for signal in report::pool_signals(self.workers.name(), &self.workers.stats()) {
            self.reporter.report(signal);
        }

        for target in &self.config.targets {
            if !self.resolvers.push(target.clone()) {
                debug!(uri = %target, "resolver pool stopped, target dropped");
            }
        }

        timer.observe_duration();
    }

    #[must_use]
    pub fn resolver_stats(&self) -> PoolStats {
        self.resolvers.stats()
    }

    #[must_use]
    pub fn worker_stats(&self) -> PoolStats {
        self.workers.stats()
    }

    #[must_use]
    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Drain and join the resolvers, then the workers
    pub async fn stop(&self) {
        self.resolvers.stop().await;
        self.workers.stop().await;
        info!("checker stopped");
    }
}

/// Service names move with the resolved addresses, drop the ones that left
fn forget_lost_endpoints(
    known: &KnownEndpoints,
    reporter: &dyn Reporter,
    target: &CheckTarget,
    addresses: &[IpAddr],
) {
    let current = if addresses.is_empty() {
        vec![report::unresolved_endpoint(target)]
    } else {
        addresses
            .iter()
            .map(|address| report::address_endpoint(*address, target.port()))
            .collect()
    };

    let lost = known.replace(target, current);
    if lost.is_empty() {
        return;
    }

    debug!(uri = %target, ?lost, "endpoints gone");
    let services: Vec<String> = lost
        .iter()
        .flat_map(|endpoint| report::endpoint_services(target, endpoint))
        .collect();
    reporter.forget(&services);
}

fn dispatch_addresses(
    workers: &Pool<Resolved>,
    reporter: &dyn Reporter,
    target: CheckTarget,
    addresses: Vec<IpAddr>,
) {
    if addresses.is_empty() {
        debug!(uri = %target, "no address");
        reporter.report(report::unresolved_signal(&target));
        return;
    }

    debug!(uri = %target, ?addresses, "resolved");
    if !workers.push(Resolved { target, addresses }) {
        debug!("worker pool stopped, resolved target dropped");
    }
}

async fn check_addresses(context: &WorkerContext, resolved: Resolved) {
    for address in resolved.addresses {
        let result = AssertUnwindSafe(check_address(context, &resolved.target, address))
            .catch_unwind()
            .await;
        if result.is_err() {
            error!(uri = %resolved.target, %address, "recovered from panic while checking address");
            PANICS_RECOVERED.inc();
        }
    }
}

/// Probe one address of `target` and report everything learned from it
pub async fn check_address(context: &WorkerContext, target: &CheckTarget, address: IpAddr) {
    let protocol = target.protocol();

    let Some(port) = target.port() else {
        let error = ProbeError::NoDefaultPort {
            scheme: target.scheme().to_string(),
        };
        record_failure(context, target, address, None, &error);
        return;
    };

    let timer = HANDSHAKE_DURATION
        .with_label_values(&[protocol.as_str()])
        .start_timer();
    let result = probe::probe(&context.probe, target, address).await;
    timer.observe_duration();

    let attempt = match result {
        Ok(attempt) => attempt,
        Err(error) => {
            record_failure(context, target, address, Some(port), &error);
            return;
        }
    };

    if let Some(exception) = &attempt.exception {
        debug!(uri = %target, %address, "TLS handshake failed: {exception}");
        HANDSHAKE_ERRORS
            .with_label_values(&[protocol.as_str(), "tls"])
            .inc();
    }

    let evaluation = Evaluation::new(
        target.clone(),
        address,
        port,
        attempt,
        context.config.thresholds,
        Utc::now(),
    );

    for signal in report::classify(&evaluation, &context.config, &context.probe.tls).await {
        context.reporter.report(signal);
    }
}

fn record_failure(
    context: &WorkerContext,
    target: &CheckTarget,
    address: IpAddr,
    port: Option<u16>,
    error: &ProbeError,
) {
    debug!(uri = %target, %address, "probe failed: {error}");
    HANDSHAKE_ERRORS
        .with_label_values(&[target.protocol().as_str(), error.kind()])
        .inc();
    context
        .reporter
        .report(report::unavailable_signal(target, address, port, error));
}
