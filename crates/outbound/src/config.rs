//! Plain, serde-deserializable configuration structs for the delivery core.
//! No reflective directive binding, no scripting layer: an embedder builds
//! one of these and hands it to [`crate::queue::QueueController::new`].

use mx_auth::AuthMethodSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seconds-as-integer on the wire, `Duration` in memory, matching the
/// pattern used throughout this tree's own config structs.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Whether, and how strictly, to use STARTTLS on the outbound leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tls {
    /// Use it if available; fail rather than fall back to plaintext if the
    /// peer's certificate doesn't verify.
    Opportunistic,
    /// Like `Opportunistic`, but also accept self-signed or otherwise
    /// invalid certificates. Lab/test use only.
    OpportunisticInsecure,
    /// TLS with a valid certificate is required; if STARTTLS isn't
    /// advertised or the handshake fails, the attempt is a permanent error.
    Required,
    /// Like `Required`, but also accept invalid certificates.
    RequiredInsecure,
    /// Never attempt STARTTLS.
    Disabled,
}

impl Default for Tls {
    fn default() -> Self {
        Self::Opportunistic
    }
}

impl Tls {
    pub fn allow_insecure(&self) -> bool {
        matches!(self, Self::OpportunisticInsecure | Self::RequiredInsecure)
    }

    pub fn wants_tls(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn requires_tls(&self) -> bool {
        matches!(self, Self::Required | Self::RequiredInsecure)
    }
}

/// Exponential backoff parameters for the retry queue controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,
    #[serde(default = "RetryConfig::default_growth_factor")]
    pub growth_factor: f64,
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,
    /// Grace period applied to any fire-time recovered at startup that
    /// would otherwise already be due.
    #[serde(default = "RetryConfig::default_startup_grace", with = "duration_serde")]
    pub startup_grace: Duration,
}

impl RetryConfig {
    fn default_initial_delay() -> Duration {
        Duration::from_secs(15 * 60)
    }
    fn default_growth_factor() -> f64 {
        2.0
    }
    fn default_max_attempts() -> u32 {
        8
    }
    fn default_startup_grace() -> Duration {
        Duration::from_secs(10)
    }

    /// `initial_delay * growth_factor^(attempts - 1)`. `attempts` is 1-based: the delay
    /// computed right after the first failed attempt is `initial_delay`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let factor = self.growth_factor.powi(exponent as i32);
        Duration::from_secs_f64(self.initial_delay.as_secs_f64() * factor)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Self::default_initial_delay(),
            growth_factor: Self::default_growth_factor(),
            max_attempts: Self::default_max_attempts(),
            startup_grace: Self::default_startup_grace(),
        }
    }
}

/// Which MX authentication methods are enabled and whether an
/// authenticated MX is mandatory.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MxAuthConfig {
    #[serde(default)]
    pub dnssec: bool,
    #[serde(default)]
    pub mta_sts: bool,
    #[serde(default)]
    pub common_domain: bool,
    /// The floor: true if `require_tls` was requested by the submitter.
    /// An MTA-STS `enforce` policy raises this to strict regardless of
    /// this flag.
    #[serde(default)]
    pub require_tls: bool,
}

impl MxAuthConfig {
    pub fn method_set(&self) -> AuthMethodSet {
        let mut methods = AuthMethodSet::OFF;
        if self.dnssec {
            methods |= AuthMethodSet::DNSSEC;
        }
        if self.mta_sts {
            methods |= AuthMethodSet::MTA_STS;
        }
        if self.common_domain {
            methods |= AuthMethodSet::COMMON_DOMAIN;
        }
        methods
    }
}

/// Everything the remote delivery driver needs besides its
/// collaborators (DNS facade, MTA-STS cache, HTTPS getter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Overridable for tests; production always dials 25.
    #[serde(default = "DispatchConfig::default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub ehlo_domain: Option<String>,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub mx_auth: MxAuthConfig,
    #[serde(default)]
    pub smtp_auth_plain_username: Option<String>,
    #[serde(default)]
    pub smtp_auth_plain_password: Option<String>,
    #[serde(default)]
    pub allow_smtp_auth_plain_without_tls: bool,
    #[serde(default = "DispatchConfig::default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl DispatchConfig {
    fn default_smtp_port() -> u16 {
        25
    }
    fn default_connect_timeout() -> Duration {
        Duration::from_secs(60)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            smtp_port: Self::default_smtp_port(),
            ehlo_domain: None,
            tls: Tls::default(),
            mx_auth: MxAuthConfig::default(),
            smtp_auth_plain_username: None,
            smtp_auth_plain_password: None,
            allow_smtp_auth_plain_without_tls: false,
            connect_timeout: Self::default_connect_timeout(),
        }
    }
}

/// Whole-of-queue knobs: retry parameters, DSN domain, concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    /// Hostname reported in `Reporting-MTA` and used to build the
    /// `MAILER-DAEMON@<reporting_mta>` DSN sender.
    pub reporting_mta: String,
    #[serde(default = "QueueConfig::default_max_in_flight")]
    pub max_in_flight: usize,
    /// Ceiling on simultaneous connections to any one destination site,
    /// fed into the `ideal_connection_count` throttle curve: a site with
    /// a shallow backlog earns far fewer than this many connections, and
    /// only asymptotically approaches it as the backlog deepens.
    #[serde(default = "QueueConfig::default_site_connection_limit")]
    pub site_connection_limit: usize,
}

impl QueueConfig {
    fn default_max_in_flight() -> usize {
        16
    }
    fn default_site_connection_limit() -> usize {
        32
    }
}

/// Static misconfiguration, surfaced to the caller and never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must be >= {minimum}, got {value}")]
    TooSmall {
        field: &'static str,
        minimum: u32,
        value: u32,
    },
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reporting_mta.is_empty() {
            return Err(ConfigError::Empty {
                field: "reporting_mta",
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::TooSmall {
                field: "retry.max_attempts",
                minimum: 1,
                value: 0,
            });
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::TooSmall {
                field: "max_in_flight",
                minimum: 1,
                value: 0,
            });
        }
        if self.site_connection_limit == 0 {
            return Err(ConfigError::TooSmall {
                field: "site_connection_limit",
                minimum: 1,
                value: 0,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_matches_the_documented_formula() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(15 * 60));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(30 * 60));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(60 * 60));
        assert_eq!(retry.delay_for_attempt(8), Duration::from_secs(15 * 60 * 128));
    }

    #[test]
    fn rejects_empty_reporting_mta() {
        let config = QueueConfig {
            retry: RetryConfig::default(),
            reporting_mta: String::new(),
            max_in_flight: 16,
            site_connection_limit: 32,
        };
        assert!(config.validate().is_err());
    }
}
