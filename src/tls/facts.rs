use crate::{config::Thresholds, report::State};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use x509_parser::{
    extensions::{GeneralName, ParsedExtension},
    prelude::{FromDer, X509Certificate},
    time::ASN1Time,
};

const OCSP_ACCESS_METHOD: &str = "1.3.6.1.5.5.7.48.1";

/// Read-only view over a peer certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFacts {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// `true` when a subjectAltName extension is present, even if empty
    pub has_san: bool,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub common_names: Vec<String>,
    /// First OCSP responder advertised in authorityInfoAccess
    pub ocsp_url: Option<String>,
}

impl CertificateFacts {
    /// # Errors
    ///
    /// Returns an error if `der` is not an X.509 certificate
    pub fn parse(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| anyhow!("failed to parse certificate: {e}"))?;

        let mut facts = Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before: to_utc(cert.validity().not_before)?,
            not_after: to_utc(cert.validity().not_after)?,
            has_san: false,
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
            common_names: cert
                .subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(ToString::to_string)
                .collect(),
            ocsp_url: None,
        };

        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::SubjectAlternativeName(san) => {
                    facts.has_san = true;
                    for name in &san.general_names {
                        match name {
                            GeneralName::DNSName(dns) => facts.dns_names.push((*dns).to_string()),
                            GeneralName::IPAddress(bytes) => {
                                if let Some(ip) = ip_from_bytes(bytes) {
                                    facts.ip_addresses.push(ip);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                ParsedExtension::AuthorityInfoAccess(aia) if facts.ocsp_url.is_none() => {
                    facts.ocsp_url = aia
                        .accessdescs
                        .iter()
                        .filter(|desc| desc.access_method.to_id_string() == OCSP_ACCESS_METHOD)
                        .find_map(|desc| match &desc.access_location {
                            GeneralName::URI(uri) => Some((*uri).to_string()),
                            _ => None,
                        });
                }
                _ => {}
            }
        }

        Ok(facts)
    }

    #[must_use]
    pub fn not_valid_yet(&self, now: DateTime<Utc>) -> bool {
        now < self.not_before
    }

    #[must_use]
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now > self.not_after
    }

    #[must_use]
    pub fn validity_duration(&self) -> Duration {
        self.not_after - self.not_before
    }

    /// `min(validity * ratio, renewal_days)`
    #[must_use]
    pub fn renewal_duration(&self, thresholds: &Thresholds) -> Duration {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let share = Duration::milliseconds(
            (self.validity_duration().num_milliseconds() as f64 * thresholds.renewal_ratio).round()
                as i64,
        );
        share.min(Duration::days(i64::from(thresholds.renewal_days)))
    }

    //      not_before                      not_after
    //          |<----------------------------->|         validity
    //                              |<--------->|         renewal window
    //                              | ⅓ | ⅓ | ⅓ |
    // …oooooooooooooooooooooooooooooooowwwwcccccccccc…   not after state
    #[must_use]
    pub fn not_after_state(&self, now: DateTime<Utc>, thresholds: &Thresholds) -> State {
        let renewal = self.renewal_duration(thresholds);
        if now + renewal / 3 > self.not_after {
            State::Critical
        } else if now + renewal * 2 / 3 > self.not_after {
            State::Warning
        } else {
            State::Ok
        }
    }

    #[must_use]
    pub fn not_before_state(&self, now: DateTime<Utc>) -> State {
        if self.not_valid_yet(now) {
            State::Critical
        } else {
            State::Ok
        }
    }

    /// Seconds until expiry, negative once expired
    #[must_use]
    pub fn not_after_remaining(&self, now: DateTime<Utc>) -> Duration {
        self.not_after - now
    }

    /// Seconds since the start of validity, negative before it
    #[must_use]
    pub fn not_before_elapsed(&self, now: DateTime<Utc>) -> Duration {
        now - self.not_before
    }

    /// Match `host` against the SAN entries, or the subject CN when the
    /// certificate has no SAN extension
    #[must_use]
    pub fn valid_identity(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if let Ok(ip) = host.parse::<IpAddr>() {
            return if self.has_san {
                self.ip_addresses.contains(&ip)
            } else {
                self.common_names.iter().any(|cn| cn.parse::<IpAddr>() == Ok(ip))
            };
        }

        let names = if self.has_san {
            &self.dns_names
        } else {
            &self.common_names
        };
        names.iter().any(|pattern| hostname_matches(pattern, &host))
    }

    /// SAN entries, or the subject DN when there are none
    #[must_use]
    pub fn acceptable_identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self
            .dns_names
            .iter()
            .cloned()
            .chain(self.ip_addresses.iter().map(ToString::to_string))
            .collect();

        if identities.is_empty() {
            identities.push(self.subject.clone());
        }

        identities
    }
}

fn to_utc(time: ASN1Time) -> Result<DateTime<Utc>> {
    let raw = time.to_datetime();
    DateTime::<Utc>::from_timestamp(raw.unix_timestamp(), raw.nanosecond())
        .ok_or_else(|| anyhow!("invalid certificate timestamp"))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    <[u8; 16]>::try_from(bytes)
        .ok()
        .map(|octets| IpAddr::V6(Ipv6Addr::from(octets)))
}

/// RFC 6125 matching, a wildcard is only allowed as the whole left-most label
fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();

    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            // at least two labels after the wildcard
            if !suffix.contains('.') || suffix.contains('*') {
                return false;
            }
            host.split_once('.')
                .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix)
        }
        None => !pattern.contains('*') && pattern == host,
    }
}

/// `in 23 days`, `4 hours ago`
#[must_use]
pub fn humanize(delta: Duration) -> String {
    let seconds = delta.num_seconds();
    let magnitude = seconds.unsigned_abs();

    let (count, unit) = match magnitude {
        0..60 => (magnitude, "second"),
        60..3_600 => (magnitude / 60, "minute"),
        3_600..86_400 => (magnitude / 3_600, "hour"),
        86_400..63_072_000 => (magnitude / 86_400, "day"),
        _ => (magnitude / 31_536_000, "year"),
    };
    let plural = if count == 1 { "" } else { "s" };

    if seconds >= 0 {
        format!("in {count} {unit}{plural}")
    } else {
        format!("{count} {unit}{plural} ago")
    }
}
