use crate::{
    cli::actions::Action,
    config::{self, CheckerConfig, Thresholds},
    pulse::Output,
    target::CheckTarget,
    tls::config::TrustConfig,
};
use anyhow::{Context, Result};
use clap::ArgMatches;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Parse every `--uri` value, skipping empty entries left by the delimiter
fn extract_targets(matches: &ArgMatches) -> Result<Vec<CheckTarget>> {
    matches
        .get_many::<String>("uri")
        .context("at least one URI is required")?
        .map(|uri| uri.trim())
        .filter(|uri| !uri.is_empty())
        .map(|uri| CheckTarget::parse(uri).with_context(|| format!("Invalid URI: {uri}")))
        .collect()
}

/// Convert `ArgMatches` into typed Action enum with validation
///
/// # Errors
///
/// Returns an error if a URI, check name, threshold or listen address is invalid
pub fn dispatch(matches: &ArgMatches) -> Result<Action> {
    let targets = extract_targets(matches)?;
    if targets.is_empty() {
        anyhow::bail!("at least one URI is required");
    }

    let checks = match matches.get_one::<String>("checks") {
        Some(list) => config::parse_checks(list)?,
        None => config::Check::ALL.to_vec(),
    };

    let thresholds = Thresholds {
        renewal_ratio: matches
            .get_one::<f64>("renewal-ratio")
            .copied()
            .unwrap_or(1.0 / 3.0),
        renewal_days: matches.get_one::<u32>("renewal-days").copied().unwrap_or(90),
    };
    thresholds.validate()?;

    let trust = TrustConfig {
        extra_ca: matches
            .get_many::<String>("trust")
            .map(|paths| paths.map(PathBuf::from).collect())
            .unwrap_or_default(),
    };

    // Extract interval with default
    let interval = matches.get_one::<u16>("interval").copied().unwrap_or(60);
    if interval == 0 {
        anyhow::bail!("interval must be greater than 0");
    }

    let connect_timeout = matches.get_one::<u64>("connect-timeout").map_or_else(
        || config::default_connect_timeout(Duration::from_secs(interval.into())),
        |seconds| Duration::from_secs(*seconds),
    );

    let ehlo_hostname = matches
        .get_one::<String>("ehlo-hostname")
        .cloned()
        .unwrap_or_else(config::local_hostname);

    // Extract and validate listen address
    let listen = matches
        .get_one::<String>("listen")
        .map(|addr| {
            addr.parse::<IpAddr>()
                .with_context(|| format!("Invalid IP address: {addr}"))
        })
        .transpose()?;

    // Extract port with default
    let port = matches.get_one::<u16>("port").copied().unwrap_or(9400);

    let output = matches
        .get_one::<String>("output")
        .map(|output| output.parse::<Output>().map_err(anyhow::Error::msg))
        .transpose()?
        .unwrap_or_default();

    let config = CheckerConfig {
        targets,
        checks,
        thresholds,
        trust,
        resolvers: matches.get_one::<usize>("resolvers").copied().unwrap_or(5),
        workers: matches.get_one::<usize>("workers").copied().unwrap_or(20),
        connect_timeout,
        ehlo_hostname,
    };
    config.validate()?;

    Ok(Action::Monitor {
        config,
        interval,
        listen,
        port,
        output,
    })
}
