//! MX authentication evaluator: component C of the delivery core.
//!
//! Combines DNSSEC (the AD flag on the MX RRset), MTA-STS pattern matching,
//! and a common-registrable-domain heuristic to label each candidate MX
//! "authenticated" or "non-authenticated", and to exclude MXs an MTA-STS
//! `enforce` policy rules out entirely.
use dns_resolver::dns_name_eq;
use mta_sts::policy::{MtaStsPolicy, PolicyMode};

bitflags::bitflags! {
    /// Which authentication methods are enabled. An empty set ("off")
    /// disables authentication: every MX is reported authenticated.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AuthMethodSet: u8 {
        const DNSSEC        = 0b001;
        const MTA_STS       = 0b010;
        const COMMON_DOMAIN = 0b100;
    }
}

impl AuthMethodSet {
    /// The "off" sentinel: authentication is disabled entirely.
    pub const OFF: Self = Self::empty();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MxAuthResult {
    Authenticated,
    NonAuthenticated,
    /// Ruled out entirely by an MTA-STS `enforce` policy mismatch; callers
    /// must drop this MX from the candidate list rather than merely
    /// deprioritizing it.
    Excluded,
}

/// Evaluates whether `mx_host` is an authenticated MX for `recipient_domain`.
/// `dnssec_ad` is the AD flag observed on the MX RRset lookup;
/// `policy` is the recipient domain's MTA-STS policy, if any.
pub fn evaluate(
    recipient_domain: &str,
    mx_host: &str,
    dnssec_ad: bool,
    policy: Option<&MtaStsPolicy>,
    methods: AuthMethodSet,
) -> MxAuthResult {
    if let Some(policy) = policy {
        if policy.mode == PolicyMode::Enforce
            && methods.contains(AuthMethodSet::MTA_STS)
            && !policy.mx_name_matches(&mx_host.to_lowercase())
        {
            return MxAuthResult::Excluded;
        }
    }

    if methods.is_empty() {
        return MxAuthResult::Authenticated;
    }

    if dns_name_eq(recipient_domain, mx_host) {
        return MxAuthResult::Authenticated;
    }

    if methods.contains(AuthMethodSet::MTA_STS) {
        if let Some(policy) = policy {
            if policy.mx_name_matches(&mx_host.to_lowercase()) {
                return MxAuthResult::Authenticated;
            }
        }
    }

    if methods.contains(AuthMethodSet::DNSSEC) && dnssec_ad {
        return MxAuthResult::Authenticated;
    }

    if methods.contains(AuthMethodSet::COMMON_DOMAIN) && common_domain_matches(recipient_domain, mx_host) {
        return MxAuthResult::Authenticated;
    }

    MxAuthResult::NonAuthenticated
}

/// True if the effective-top-level-domain-plus-one of both names is equal.
fn common_domain_matches(a: &str, b: &str) -> bool {
    match (psl::domain_str(a.trim_end_matches('.')), psl::domain_str(b.trim_end_matches('.'))) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

/// Partitions resolved MX hosts into authenticated and non-authenticated
/// lists (dropping excluded ones), in the order the remote delivery driver
/// should try them: authenticated first, then non-authenticated — unless
/// `require_authenticated` is set, in which case the non-authenticated list
/// is always empty.
pub struct Partitioned {
    pub authenticated: Vec<String>,
    pub non_authenticated: Vec<String>,
}

pub fn partition_hosts(
    recipient_domain: &str,
    hosts_worst_first: &[String],
    dnssec_ad: bool,
    policy: Option<&MtaStsPolicy>,
    methods: AuthMethodSet,
    require_authenticated: bool,
) -> Partitioned {
    let mut authenticated = vec![];
    let mut non_authenticated = vec![];

    // hosts_worst_first is ordered worst-preference-first; preserve that
    // relative order within each bucket.
    for host in hosts_worst_first {
        match evaluate(recipient_domain, host, dnssec_ad, policy, methods) {
            MxAuthResult::Authenticated => authenticated.push(host.clone()),
            MxAuthResult::NonAuthenticated => {
                if !require_authenticated {
                    non_authenticated.push(host.clone());
                } else {
                    tracing::info!(
                        "{host} is not an authenticated MX for {recipient_domain} \
                         and require_tls forbids falling back to it"
                    );
                }
            }
            MxAuthResult::Excluded => {
                tracing::info!(
                    "{host} excluded as an MX for {recipient_domain} by MTA-STS enforce policy"
                );
            }
        }
    }

    Partitioned {
        authenticated,
        non_authenticated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn enforce_policy(mx: &[&str]) -> MtaStsPolicy {
        MtaStsPolicy {
            mode: PolicyMode::Enforce,
            mx: mx.iter().map(|s| s.to_string()).collect(),
            max_age: 86400,
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn self_mx_is_authenticated() {
        let result = evaluate(
            "example.org",
            "example.org.",
            false,
            None,
            AuthMethodSet::DNSSEC,
        );
        assert_eq!(result, MxAuthResult::Authenticated);
    }

    #[test]
    fn dnssec_ad_authenticates() {
        let result = evaluate(
            "example.org",
            "mx.example.net",
            true,
            None,
            AuthMethodSet::DNSSEC,
        );
        assert_eq!(result, MxAuthResult::Authenticated);
    }

    #[test]
    fn mta_sts_pattern_match() {
        let policy = enforce_policy(&["*.example.net"]);
        let result = evaluate(
            "example.org",
            "mx.example.net",
            false,
            Some(&policy),
            AuthMethodSet::MTA_STS,
        );
        assert_eq!(result, MxAuthResult::Authenticated);
    }

    #[test]
    fn mta_sts_enforce_excludes_mismatch() {
        let policy = enforce_policy(&["mx4.example.invalid"]);
        let result = evaluate(
            "example.invalid",
            "mx.example.invalid",
            false,
            Some(&policy),
            AuthMethodSet::MTA_STS,
        );
        assert_eq!(result, MxAuthResult::Excluded);
    }

    #[test]
    fn common_domain_heuristic() {
        let result = evaluate(
            "mail.example.org",
            "mx1.example.org",
            false,
            None,
            AuthMethodSet::COMMON_DOMAIN,
        );
        assert_eq!(result, MxAuthResult::Authenticated);
    }

    #[test]
    fn off_sentinel_authenticates_everything() {
        let result = evaluate("example.org", "anything.example.net", false, None, AuthMethodSet::OFF);
        assert_eq!(result, MxAuthResult::Authenticated);
    }

    #[test]
    fn unrelated_host_is_non_authenticated() {
        let result = evaluate(
            "example.org",
            "mx.unrelated.invalid",
            false,
            None,
            AuthMethodSet::DNSSEC | AuthMethodSet::COMMON_DOMAIN,
        );
        assert_eq!(result, MxAuthResult::NonAuthenticated);
    }
}
