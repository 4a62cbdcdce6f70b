use crate::{target::CheckTarget, tls::config::TrustConfig};
use anyhow::{Result, bail};
use std::{fmt, str::FromStr, time::Duration};

/// Longest connect timeout picked when none is configured
pub const MAX_DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Certificate checks that can be enabled individually
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    Identity,
    NotBefore,
    NotAfter,
    Trust,
    Ocsp,
}

impl Check {
    pub const ALL: [Self; 5] = [
        Self::Identity,
        Self::NotAfter,
        Self::NotBefore,
        Self::Ocsp,
        Self::Trust,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::NotBefore => "not-before",
            Self::NotAfter => "not-after",
            Self::Trust => "trust",
            Self::Ocsp => "ocsp",
        }
    }
}

impl FromStr for Check {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "identity" => Ok(Self::Identity),
            "not-before" => Ok(Self::NotBefore),
            "not-after" => Ok(Self::NotAfter),
            "trust" => Ok(Self::Trust),
            "ocsp" => Ok(Self::Ocsp),
            _ => Err(format!("Invalid check: {s}")),
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renewal window configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Fraction of the validity period that makes up the renewal window
    pub renewal_ratio: f64,
    /// Upper bound of the renewal window
    pub renewal_days: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            renewal_ratio: 1.0 / 3.0,
            renewal_days: 90,
        }
    }
}

impl Thresholds {
    /// # Errors
    ///
    /// Returns an error if the ratio is outside `(0, 1]`
    pub fn validate(&self) -> Result<()> {
        if !(self.renewal_ratio > 0.0 && self.renewal_ratio <= 1.0) {
            bail!(
                "renewal ratio must be in (0, 1], got {}",
                self.renewal_ratio
            );
        }
        Ok(())
    }
}

/// Everything the checker needs, fixed at startup
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub targets: Vec<CheckTarget>,
    pub checks: Vec<Check>,
    pub thresholds: Thresholds,
    pub trust: TrustConfig,
    pub resolvers: usize,
    pub workers: usize,
    pub connect_timeout: Duration,
    pub ehlo_hostname: String,
}

impl CheckerConfig {
    #[must_use]
    pub fn new(targets: Vec<CheckTarget>) -> Self {
        Self {
            targets,
            checks: Check::ALL.to_vec(),
            thresholds: Thresholds::default(),
            trust: TrustConfig::default(),
            resolvers: 5,
            workers: 20,
            connect_timeout: MAX_DEFAULT_CONNECT_TIMEOUT,
            ehlo_hostname: local_hostname(),
        }
    }

    #[must_use]
    pub fn enabled(&self, check: Check) -> bool {
        self.checks.contains(&check)
    }

    /// # Errors
    ///
    /// Returns an error on a zero pool size, zero timeout or bad thresholds
    pub fn validate(&self) -> Result<()> {
        if self.resolvers == 0 {
            bail!("resolvers must be greater than 0");
        }
        if self.workers == 0 {
            bail!("workers must be greater than 0");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be greater than 0");
        }
        self.thresholds.validate()
    }
}

/// Parse a comma separated list of checks, duplicates are ignored
///
/// # Errors
///
/// Returns an error naming the first unknown check
pub fn parse_checks(list: &str) -> Result<Vec<Check>> {
    let mut checks = Vec::new();
    for item in list.split(',').filter(|item| !item.trim().is_empty()) {
        let check = item.parse::<Check>().map_err(anyhow::Error::msg)?;
        if !checks.contains(&check) {
            checks.push(check);
        }
    }
    Ok(checks)
}

/// Half the interval, at most [`MAX_DEFAULT_CONNECT_TIMEOUT`] and at least one second
#[must_use]
pub fn default_connect_timeout(interval: Duration) -> Duration {
    (interval / 2).clamp(Duration::from_secs(1), MAX_DEFAULT_CONNECT_TIMEOUT)
}

/// Name announced in SMTP `EHLO`
#[must_use]
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
