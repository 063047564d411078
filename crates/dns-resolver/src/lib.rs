//! DNS resolver facade: component A of the delivery core.
//!
//! Exposes MX/host/TXT/PTR lookups plus DNSSEC-authenticated variants, with
//! short-lived caching of both positive and negative answers. The facade is
//! owned by the caller (there is no process-global resolver); every
//! component that needs DNS holds an `Arc<DnsFacade>` it was handed at
//! construction time.
mod resolver;

pub use hickory_resolver::proto::rr::rdata::tlsa::TLSA;
pub use hickory_resolver::proto::rr::RecordType;
pub use hickory_resolver::Name;
pub use resolver::{ptr_host, Answer, DnsError, HickoryResolver, Resolver, TestResolver};

use moka::future::Cache;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a failed MX lookup is cached for, so a flapping remote domain
/// doesn't cause a lookup storm.
pub const MX_NEGATIVE_TTL: Duration = Duration::from_secs(300);

/// A resolved MX RRset for one domain, grouped by preference.
#[derive(Debug, Clone, Serialize)]
pub struct MailExchanger {
    pub domain_name: String,
    pub hosts: Vec<String>,
    pub site_name: String,
    pub by_pref: BTreeMap<u16, Vec<String>>,
    pub is_domain_literal: bool,
    /// True only when every contributing MX record was DNSSEC-verified.
    pub is_secure: bool,
    pub is_mx: bool,
    #[serde(skip)]
    expires: Option<Instant>,
}

impl MailExchanger {
    pub fn has_expired(&self) -> bool {
        match self.expires {
            Some(deadline) => deadline <= Instant::now(),
            None => false,
        }
    }

    /// Candidate host names in worst-preference-first order (so a caller
    /// can `pop()` best-first), shuffled within each preference tier so
    /// that MXs of equal priority load-balance outbound connections.
    pub fn hosts_worst_first(&self) -> Vec<String> {
        let mut result = vec![];
        for hosts in self.by_pref.values() {
            let mut tier = hosts.clone();
            tier.shuffle(&mut rand::thread_rng());
            result.extend(tier);
        }
        result.reverse();
        result
    }

    /// Returns the resolved MX hosts in *reverse* preference order; the
    /// first host to try is the last element, so the dispatcher can `pop()`
    /// candidates until its connection plan is exhausted.
    pub async fn resolve_addresses(&self, facade: &DnsFacade) -> ResolvedMxAddresses {
        let mut result = vec![];

        for hosts in self.by_pref.values().rev() {
            let mut by_pref = vec![];

            for mx_host in hosts {
                if mx_host == "." {
                    // RFC 7505 null MX: domain explicitly does not accept mail.
                    return ResolvedMxAddresses::NullMx;
                }

                let (host, opt_port) = match has_colon_port(mx_host) {
                    Some((host, port)) => (host, Some(port)),
                    None => (mx_host.as_str(), None),
                };

                if let Ok(addr) = host.parse::<IpAddr>() {
                    by_pref.push(ResolvedAddress {
                        name: host.to_string(),
                        addr,
                        port: opt_port,
                    });
                    continue;
                }

                match facade.ip_lookup(host).await {
                    Err(err) => {
                        tracing::error!("failed to resolve {host}: {err:#}");
                        continue;
                    }
                    Ok(addrs) => {
                        for addr in addrs.iter() {
                            by_pref.push(ResolvedAddress {
                                name: host.to_string(),
                                addr: *addr,
                                port: opt_port,
                            });
                        }
                    }
                }
            }

            // Randomize within a preference tier so that hosts of equal
            // priority probabilistically load-balance outbound traffic.
            by_pref.shuffle(&mut rand::thread_rng());
            result.append(&mut by_pref);
        }
        ResolvedMxAddresses::Addresses(result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub name: String,
    pub addr: IpAddr,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub enum ResolvedMxAddresses {
    NullMx,
    Addresses(Vec<ResolvedAddress>),
}

/// Converts a domain to its fully-qualified, lower-cased `Name`, so that a
/// trailing dot and casing never affect equality or cache keys.
pub fn fully_qualify(domain_name: &str) -> Result<Name, hickory_resolver::proto::ProtoError> {
    let mut name = Name::from_str_relaxed(domain_name)?.to_lowercase();
    name.set_fqdn(true);
    Ok(name)
}

/// True if two domain names are the same once fully-qualified and
/// lower-cased; a trailing dot or case difference never causes a mismatch.
/// Used by the MX authentication evaluator's self-MX check.
pub fn dns_name_eq(a: &str, b: &str) -> bool {
    match (fully_qualify(a), fully_qualify(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.trim_end_matches('.').eq_ignore_ascii_case(b.trim_end_matches('.')),
    }
}

/// If `a` ends with `:PORT` and `PORT` parses as `u16`, splits it off.
/// Returns `None` for things like bare IPv6 addresses, where a trailing
/// `:xxxx` is part of the address rather than a port suffix.
pub fn has_colon_port(a: &str) -> Option<(&str, u16)> {
    let (label, maybe_port) = a.rsplit_once(':')?;
    if label.contains(':') {
        return None;
    }
    maybe_port.parse::<u16>().ok().map(|port| (label, port))
}

/// Helper to reason about a domain name string: either a name pending
/// resolution, or an IP literal (optionally `[bracketed]`, RFC 5321 4.1.3),
/// with an optional port suffix either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainClassification {
    Domain(Name, Option<u16>),
    Literal(IpAddr, Option<u16>),
}

impl DomainClassification {
    pub fn classify(domain_name: &str) -> anyhow::Result<Self> {
        let (domain_name, mut opt_port) = match has_colon_port(domain_name) {
            Some((domain_name, port)) => (domain_name, Some(port)),
            None => (domain_name, None),
        };

        if domain_name.starts_with('[') {
            if !domain_name.ends_with(']') {
                anyhow::bail!(
                    "domain_name `{domain_name}` is a malformed literal domain with no trailing `]`"
                );
            }

            let lowered = domain_name.to_ascii_lowercase();
            let literal = &lowered[1..lowered.len() - 1];

            let literal = match has_colon_port(literal) {
                Some((_, _)) if opt_port.is_some() => {
                    anyhow::bail!(
                        "invalid address: `{domain_name}` specifies a port both inside and \
                         outside a literal address enclosed in square brackets"
                    );
                }
                Some((literal, port)) => {
                    opt_port.replace(port);
                    literal
                }
                None => literal,
            };

            let literal = literal.strip_prefix("ipv6:").unwrap_or(literal);
            let ip: IpAddr = literal
                .parse::<Ipv6Addr>()
                .map(IpAddr::V6)
                .or_else(|_| literal.parse::<IpAddr>())
                .map_err(|err| anyhow::anyhow!("invalid address: `{literal}`: {err:#}"))?;
            return Ok(Self::Literal(ip, opt_port));
        }

        if let Ok(ip) = domain_name.parse::<IpAddr>() {
            return Ok(Self::Literal(ip, opt_port));
        }

        Ok(Self::Domain(fully_qualify(domain_name)?, opt_port))
    }

    pub fn has_port(&self) -> bool {
        match self {
            Self::Domain(_, port) | Self::Literal(_, port) => port.is_some(),
        }
    }
}

struct ByPreference {
    hosts: Vec<String>,
    pref: u16,
    is_secure: bool,
    is_mx: bool,
}

/// Facade over DNS lookups, with short-lived in-memory caching of MX and
/// address answers. One instance is constructed by the embedder and shared,
/// via `Arc`, by every component that needs DNS — no process-wide global.
pub struct DnsFacade {
    resolver: Arc<dyn Resolver>,
    mx_cache: Cache<(Name, Option<u16>), Arc<Result<MailExchanger, String>>>,
    ip_cache: Cache<Name, Arc<Vec<IpAddr>>>,
}

impl DnsFacade {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            mx_cache: Cache::builder()
                .max_capacity(64 * 1024)
                .time_to_live(Duration::from_secs(3600))
                .build(),
            ip_cache: Cache::builder()
                .max_capacity(16 * 1024)
                .time_to_live(Duration::from_secs(3600))
                .build(),
        }
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    pub async fn resolve_mx(&self, domain_name: &str) -> anyhow::Result<Arc<MailExchanger>> {
        let (name_fq, opt_port) = match DomainClassification::classify(domain_name)? {
            DomainClassification::Literal(ip, _port) => {
                let mut by_pref = BTreeMap::new();
                by_pref.insert(1, vec![ip.to_string()]);
                return Ok(Arc::new(MailExchanger {
                    domain_name: domain_name.to_string(),
                    hosts: vec![ip.to_string()],
                    site_name: ip.to_string(),
                    by_pref,
                    is_domain_literal: true,
                    is_secure: false,
                    is_mx: false,
                    expires: None,
                }));
            }
            DomainClassification::Domain(name_fq, opt_port) => (name_fq, opt_port),
        };

        let cache_key = (name_fq.clone(), opt_port);
        if let Some(cached) = self.mx_cache.get(&cache_key).await {
            return (*cached).clone().map(Arc::new).map_err(|e| anyhow::anyhow!(e));
        }

        let result = self.lookup_mx_uncached(domain_name, &name_fq, opt_port).await;
        let cached_value = result
            .as_ref()
            .map(|mx| (**mx).clone())
            .map_err(|err| format!("{err:#}"));
        self.mx_cache.insert(cache_key, Arc::new(cached_value)).await;
        result
    }

    async fn lookup_mx_uncached(
        &self,
        domain_name: &str,
        name_fq: &Name,
        opt_port: Option<u16>,
    ) -> anyhow::Result<Arc<MailExchanger>> {
        let (mut by_pref, expires) = self.lookup_mx_record(name_fq).await?;

        let mut hosts = vec![];
        for pref in &mut by_pref {
            for host in &mut pref.hosts {
                if let Some(port) = opt_port {
                    *host = format!("{host}:{port}");
                }
                hosts.push(host.clone());
            }
        }

        let is_secure = by_pref.iter().all(|p| p.is_secure);
        let is_mx = by_pref.iter().all(|p| p.is_mx);
        let by_pref: BTreeMap<u16, Vec<String>> =
            by_pref.into_iter().map(|p| (p.pref, p.hosts)).collect();

        Ok(Arc::new(MailExchanger {
            site_name: factor_names(&hosts),
            hosts,
            domain_name: name_fq.to_ascii(),
            by_pref,
            is_domain_literal: false,
            is_secure,
            is_mx,
            expires: Some(expires),
        }))
    }

    async fn lookup_mx_record(
        &self,
        domain_name: &Name,
    ) -> anyhow::Result<(Vec<ByPreference>, Instant)> {
        let answer = self
            .resolver
            .resolve(domain_name.clone(), RecordType::MX)
            .await?;

        if answer.records.is_empty() {
            if answer.nxdomain {
                anyhow::bail!("NXDOMAIN");
            }
            // RFC 5321 5.1: no MX, but the domain itself may accept mail
            // directly. We encode that as a single preference-0 "MX".
            return Ok((
                vec![ByPreference {
                    hosts: vec![domain_name.to_lowercase().to_ascii()],
                    pref: 0,
                    is_secure: answer.secure,
                    is_mx: false,
                }],
                answer.expires,
            ));
        }

        let mut records: Vec<ByPreference> = vec![];
        for rdata in &answer.records {
            if let Some(mx) = rdata.as_mx() {
                let pref = mx.preference();
                let host = mx.exchange().to_lowercase().to_string();
                match records.iter_mut().find(|r| r.pref == pref) {
                    Some(r) => r.hosts.push(host),
                    None => records.push(ByPreference {
                        hosts: vec![host],
                        pref,
                        is_secure: answer.secure,
                        is_mx: true,
                    }),
                }
            }
        }

        records.sort_unstable_by(|a, b| a.pref.cmp(&b.pref));
        for r in &mut records {
            r.hosts.sort();
        }

        Ok((records, answer.expires))
    }

    pub async fn ip_lookup(&self, host: &str) -> anyhow::Result<Arc<Vec<IpAddr>>> {
        let key_fq = fully_qualify(host)?;
        if let Some(cached) = self.ip_cache.get(&key_fq).await {
            return Ok(cached);
        }
        let answer = self.resolver.resolve_ip(host).await?;
        let ips = Arc::new(answer);
        self.ip_cache.insert(key_fq, ips.clone()).await;
        Ok(ips)
    }

    /// Resolves A/AAAA records for `domain_name`, or short-circuits for an
    /// IP-literal or bracketed-literal domain without touching the network.
    pub async fn resolve_a_or_aaaa(&self, domain_name: &str) -> anyhow::Result<Vec<ResolvedAddress>> {
        match DomainClassification::classify(domain_name)? {
            DomainClassification::Literal(addr, port) => Ok(vec![ResolvedAddress {
                name: domain_name.to_string(),
                addr,
                port,
            }]),
            DomainClassification::Domain(name_fq, port) => {
                let ips = self.ip_lookup(&name_fq.to_ascii()).await?;
                Ok(ips
                    .iter()
                    .map(|addr| ResolvedAddress {
                        name: domain_name.to_string(),
                        addr: *addr,
                        port,
                    })
                    .collect())
            }
        }
    }

    /// Resolves TLSA records for a destination name and port per
    /// <https://datatracker.ietf.org/doc/html/rfc6698#appendix-b.2>. Records
    /// are only trusted (and returned) when the DNSSEC "AD" bit is set;
    /// otherwise, an empty (not erroring) result is returned, since an
    /// unauthenticated TLSA answer must not influence TLS verification.
    pub async fn resolve_dane(&self, hostname: &str, port: u16) -> anyhow::Result<Vec<TLSA>> {
        let name = fully_qualify(&format!("_{port}._tcp.{hostname}"))?;
        let answer = self.resolver.resolve(name, RecordType::TLSA).await?;
        tracing::debug!("resolve_dane {hostname}:{port} TLSA answer is: {answer:?}");

        if answer.bogus {
            anyhow::bail!(
                "DANE result for {hostname}:{port} unusable because: {}",
                answer.why_bogus.as_deref().unwrap_or("DNSSEC validation failed")
            );
        }

        let mut result = vec![];
        if answer.secure {
            for r in &answer.records {
                if let Some(tlsa) = r.as_tlsa() {
                    result.push(tlsa.clone());
                }
            }
            result.sort_by_key(|a| a.to_string());
        }

        tracing::info!("resolve_dane {hostname}:{port} result is: {result:?}");
        Ok(result)
    }

    /// Looks up a DNSSEC-authenticated PTR record, used by the MX
    /// authentication evaluator when the recipient domain is an
    /// IP-literal.
    pub async fn resolve_authenticated_ptr(&self, ip: IpAddr) -> anyhow::Result<Vec<Name>> {
        if !self.resolver.is_security_aware() {
            return Ok(vec![]);
        }
        let names = self.resolver.resolve_ptr(ip).await?;
        Ok(names)
    }
}

impl std::fmt::Debug for DnsFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsFacade").finish_non_exhaustive()
    }
}

/// Given a list of host names, produces a compact alternation rendering of
/// their differing components, eg. `(mta5|mta6|mta7).am0.yahoodns.net`, to
/// keep log/metric label cardinality down when many hosts share a suffix.
pub fn factor_names<S: AsRef<str>>(name_strings: &[S]) -> String {
    let mut names = vec![];
    for name in name_strings {
        let (name, opt_port) = match has_colon_port(name.as_ref()) {
            Some((name, port)) => (name, Some(port)),
            None => (name.as_ref(), None),
        };
        if let Ok(name) = fully_qualify(name) {
            names.push((name.to_lowercase(), opt_port));
        }
    }

    if names.is_empty() {
        return String::new();
    }
    if names.len() == 1 {
        let (name, port) = &names[0];
        return match port {
            Some(p) => format!("{}:{p}", name.to_ascii().trim_end_matches('.')),
            None => name.to_ascii().trim_end_matches('.').to_string(),
        };
    }

    let mut split_names = vec![];
    let mut max_len = 0;
    for (name, opt_port) in &names {
        let mut fields: Vec<String> = name
            .iter()
            .map(|s| String::from_utf8_lossy(s).to_string())
            .collect();
        if let Some(port) = opt_port {
            if let Some(last) = fields.last_mut() {
                last.push_str(&format!(":{port}"));
            }
        }
        fields.reverse();
        max_len = max_len.max(fields.len());
        split_names.push(fields);
    }

    let mut common_suffix_len = 0;
    'outer: while common_suffix_len < max_len {
        let mut label = None;
        for fields in &split_names {
            let Some(field) = fields.get(common_suffix_len) else {
                break 'outer;
            };
            match &label {
                None => label = Some(field.clone()),
                Some(l) if l != field => break 'outer,
                _ => {}
            }
        }
        common_suffix_len += 1;
    }

    if common_suffix_len == 0 {
        return name_strings
            .iter()
            .map(|n| n.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
    }

    let suffix = split_names[0][..common_suffix_len]
        .iter()
        .rev()
        .cloned()
        .collect::<Vec<_>>()
        .join(".");

    let mut prefixes: Vec<String> = split_names
        .iter()
        .map(|fields| {
            fields[common_suffix_len..]
                .iter()
                .rev()
                .cloned()
                .collect::<Vec<_>>()
                .join(".")
        })
        .collect();
    prefixes.sort();
    prefixes.dedup();

    if prefixes.iter().any(|p| p.is_empty()) {
        return name_strings
            .iter()
            .map(|n| n.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
    }

    format!("({}).{}", prefixes.join("|"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_factoring() {
        assert_eq!(factor_names(&["mta5.am0.yahoodns.net"]), "mta5.am0.yahoodns.net");
        assert_eq!(
            factor_names(&[
                "mta5.am0.yahoodns.net",
                "mta6.am0.yahoodns.net",
                "mta7.am0.yahoodns.net"
            ]),
            "(mta5|mta6|mta7).am0.yahoodns.net"
        );
    }

    #[test]
    fn colon_port_splitting() {
        assert_eq!(has_colon_port("mx.example.com:25"), Some(("mx.example.com", 25)));
        assert_eq!(has_colon_port("::1"), None);
        assert_eq!(has_colon_port("mx.example.com"), None);
    }

    #[test]
    fn classify_literal_v4() {
        assert_eq!(
            DomainClassification::classify("[1.2.3.4]").unwrap(),
            DomainClassification::Literal("1.2.3.4".parse().unwrap(), None)
        );
    }

    #[test]
    fn classify_literal_v6() {
        assert_eq!(
            DomainClassification::classify("[IPv6:::1]").unwrap(),
            DomainClassification::Literal("::1".parse().unwrap(), None)
        );
    }

    #[test]
    fn classify_bare_ip() {
        assert_eq!(
            DomainClassification::classify("1.2.3.4").unwrap(),
            DomainClassification::Literal("1.2.3.4".parse().unwrap(), None)
        );
    }

    #[tokio::test]
    async fn resolve_mx_falls_back_to_self() {
        let resolver: Arc<dyn Resolver> =
            Arc::new(TestResolver::default().with_zone("example.invalid. IN A 127.0.0.1"));
        let facade = DnsFacade::new(resolver);
        let mx = facade.resolve_mx("example.invalid").await.unwrap();
        assert_eq!(
            mx.by_pref.get(&0).unwrap(),
            &vec!["example.invalid".to_string()]
        );
    }

    #[tokio::test]
    async fn resolve_mx_null_mx() {
        let resolver: Arc<dyn Resolver> =
            Arc::new(TestResolver::default().with_zone("example.invalid. IN MX 0 ."));
        let facade = DnsFacade::new(resolver);
        let mx = facade.resolve_mx("example.invalid").await.unwrap();
        assert!(matches!(
            mx.resolve_addresses(&facade).await,
            ResolvedMxAddresses::NullMx
        ));
    }

    #[tokio::test]
    async fn resolve_mx_orders_by_preference() {
        let resolver: Arc<dyn Resolver> = Arc::new(
            TestResolver::default().with_zone(
                "example.invalid. IN MX 10 b.example.invalid.\n\
                 example.invalid. IN MX 5 a.example.invalid.",
            ),
        );
        let facade = DnsFacade::new(resolver);
        let mx = facade.resolve_mx("example.invalid").await.unwrap();
        assert_eq!(mx.by_pref[&5], vec!["a.example.invalid".to_string()]);
        assert_eq!(mx.by_pref[&10], vec!["b.example.invalid".to_string()]);
    }

    #[tokio::test]
    async fn hosts_worst_first_keeps_tiers_separate_but_shuffles_within_them() {
        let resolver: Arc<dyn Resolver> = Arc::new(
            TestResolver::default().with_zone(
                "example.invalid. IN MX 10 b.example.invalid.\n\
                 example.invalid. IN MX 10 c.example.invalid.\n\
                 example.invalid. IN MX 5 a.example.invalid.",
            ),
        );
        let facade = DnsFacade::new(resolver);
        let mx = facade.resolve_mx("example.invalid").await.unwrap();
        let worst_first = mx.hosts_worst_first();
        assert_eq!(worst_first.len(), 3);
        // Worst tier (pref 10) comes first; best tier (pref 5) comes last.
        assert_eq!(worst_first[2], "a.example.invalid");
        let mut tier_ten: Vec<&str> = worst_first[..2].iter().map(String::as_str).collect();
        tier_ten.sort();
        assert_eq!(tier_ten, vec!["b.example.invalid", "c.example.invalid"]);
    }
}
