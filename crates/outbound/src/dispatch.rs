//! Remote delivery driver: component E of the delivery core.
//!
//! For one message's recipients grouped by destination domain, resolves
//! candidate MXs, authenticates them, opens a single SMTP client against
//! the first host that completes EHLO, and streams the message to each
//! recipient on that domain over the one connection.
//!
//! Grounded on `smtp_dispatcher.rs`'s `init`/`attempt_connection`/
//! `deliver_message` split, generalized from one recipient per dispatcher
//! to many recipients sharing one connection.

use dns_resolver::{DnsFacade, DomainClassification, ResolvedAddress};
use message::{EnvelopeAddress, RecordedError};
use mta_sts::{Get, MtaStsCache, PolicyLookup};
use mx_auth::partition_hosts;
use rfc5321::{
    ClientError, Command, EnhancedStatusCode, ForwardPath, Response, ReversePath, SmtpClient,
    SmtpClientTimeouts, TlsOptions,
};
use std::time::Duration;
use tokio::time::timeout;

use crate::config::{DispatchConfig, Tls};
use crate::metrics::DispatchMetrics;

/// Recipients destined for a single domain, sharing one connection attempt.
#[derive(Debug, Clone)]
pub struct DomainGroup {
    pub domain: String,
    pub recipients: Vec<EnvelopeAddress>,
}

/// Per-recipient result sink for the non-atomic delivery interface.
/// `set_status` is called at most once per recipient, and only before
/// [`deliver_group`] returns.
pub trait StatusSink: Send {
    fn set_status(&mut self, recipient: &EnvelopeAddress, result: Result<(), RecordedError>);
}

/// Collects every outcome in submission order; the usual sink for the queue
/// controller, which needs the full set to update message metadata.
#[derive(Default)]
pub struct CollectingSink {
    pub results: Vec<(EnvelopeAddress, Result<(), RecordedError>)>,
}

impl StatusSink for CollectingSink {
    fn set_status(&mut self, recipient: &EnvelopeAddress, result: Result<(), RecordedError>) {
        self.results.push((recipient.clone(), result));
    }
}

/// Delivers `group` over a single connection, reporting one outcome per
/// recipient through `sink`. This is the non-atomic interface that the
/// queue controller always prefers: a DATA failure on this domain
/// never touches other domains' deliveries in the same attempt.
pub async fn deliver_group(
    dns: &DnsFacade,
    sts: &MtaStsCache,
    getter: &dyn Get,
    config: &DispatchConfig,
    metrics: &DispatchMetrics,
    sender: &EnvelopeAddress,
    group: &DomainGroup,
    header: &[u8],
    body: &[u8],
    sink: &mut dyn StatusSink,
) {
    let mut candidates = match resolve_candidates(dns, sts, getter, config, &group.domain).await {
        Ok(candidates) => candidates,
        Err(err) => {
            metrics.bounced(&group.domain, group.recipients.len());
            for recipient in &group.recipients {
                sink.set_status(recipient, Err(err.clone()));
            }
            return;
        }
    };

    let mut last_err = None;
    while let Some(host) = candidates.pop() {
        match connect_and_ehlo(dns, config, &group.domain, &host, metrics).await {
            Ok(mut client) => {
                deliver_over_connection(&mut client, sender, group, header, body, sink).await;
                let _ = timeout(Duration::from_secs(5), client.send_command(&Command::Quit)).await;
                metrics.connection_closed(&group.domain);
                return;
            }
            Err(err) => {
                tracing::debug!(site = %group.domain, host = %host, error = %err, "connection attempt failed");
                last_err = Some(err);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| {
        RecordedError::internal(format!("no usable MX hosts for {}", group.domain))
    });
    metrics.bounced(&group.domain, group.recipients.len());
    for recipient in &group.recipients {
        sink.set_status(recipient, Err(err.clone()));
    }
}

/// Atomic variant: a single error covering every recipient on the domain,
/// surfaced only when every recipient failed. Exposed alongside
/// [`deliver_group`] for collaborators that genuinely want
/// all-or-nothing semantics instead of a per-recipient sink.
pub async fn deliver_group_atomic(
    dns: &DnsFacade,
    sts: &MtaStsCache,
    getter: &dyn Get,
    config: &DispatchConfig,
    metrics: &DispatchMetrics,
    sender: &EnvelopeAddress,
    group: &DomainGroup,
    header: &[u8],
    body: &[u8],
) -> Result<(), RecordedError> {
    let mut collector = CollectingSink::default();
    deliver_group(
        dns, sts, getter, config, metrics, sender, group, header, body, &mut collector,
    )
    .await;

    if collector.results.iter().all(|(_, r)| r.is_ok()) {
        return Ok(());
    }
    match collector.results.into_iter().find_map(|(_, r)| r.err()) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn deliver_over_connection(
    client: &mut SmtpClient,
    sender: &EnvelopeAddress,
    group: &DomainGroup,
    header: &[u8],
    body: &[u8],
    sink: &mut dyn StatusSink,
) {
    let reverse_path: ReversePath = match sender.try_into() {
        Ok(p) => p,
        Err(err) => {
            let err = RecordedError::internal(format!("invalid sender address: {err}"));
            for recipient in &group.recipients {
                sink.set_status(recipient, Err(err.clone()));
            }
            return;
        }
    };

    let mut data = Vec::with_capacity(header.len() + body.len());
    data.extend_from_slice(header);
    data.extend_from_slice(body);

    for recipient in &group.recipients {
        let forward_path: ForwardPath = match recipient.try_into() {
            Ok(p) => p,
            Err(err) => {
                sink.set_status(
                    recipient,
                    Err(RecordedError::internal(format!("invalid recipient address: {err}"))),
                );
                continue;
            }
        };

        let result = client.send_mail(reverse_path.clone(), forward_path, &data).await;
        sink.set_status(recipient, classify_send_result(result));
    }
}

fn classify_send_result(result: Result<Response, ClientError>) -> Result<(), RecordedError> {
    match result {
        Ok(_) => Ok(()),
        Err(ClientError::Rejected(response)) => Err(RecordedError::from_response(&response)),
        Err(err @ ClientError::NonAsciiEnvelope(_)) => Err(RecordedError {
            code: 553,
            enhanced_code: Some(EnhancedStatusCode {
                class: 5,
                subject: 6,
                detail: 7,
            }),
            message: err.to_string(),
            command: None,
        }),
        Err(err) => Err(RecordedError::internal(err.to_string())),
    }
}

/// Worst-preference-first candidate host names, already MX-authenticated
/// and partitioned, ready to `pop()` best-first.
struct Candidates {
    authenticated: Vec<String>,
    non_authenticated: Vec<String>,
}

impl Candidates {
    fn pop(&mut self) -> Option<String> {
        self.authenticated.pop().or_else(|| self.non_authenticated.pop())
    }
}

async fn resolve_candidates(
    dns: &DnsFacade,
    sts: &MtaStsCache,
    getter: &dyn Get,
    config: &DispatchConfig,
    domain: &str,
) -> Result<Candidates, RecordedError> {
    // An IP-literal recipient domain bypasses MX discovery entirely.
    if let Ok(DomainClassification::Literal(ip, _)) = DomainClassification::classify(domain) {
        let authenticated = if config.mx_auth.dnssec {
            !dns.resolve_authenticated_ptr(ip)
                .await
                .unwrap_or_default()
                .is_empty()
        } else {
            false
        };
        if config.mx_auth.require_tls && !authenticated {
            return Err(RecordedError {
                code: 550,
                enhanced_code: Some(EnhancedStatusCode {
                    class: 5,
                    subject: 7,
                    detail: 1,
                }),
                message: format!("{ip} has no DNSSEC-authenticated PTR and an authenticated MX is required"),
                command: None,
            });
        }
        return Ok(Candidates {
            authenticated: vec![],
            non_authenticated: vec![ip.to_string()],
        });
    }

    let mx = dns
        .resolve_mx(domain)
        .await
        .map_err(|err| RecordedError::internal(format!("MX lookup for {domain} failed: {err:#}")))?;

    let hosts_worst_first = mx.hosts_worst_first();
    if hosts_worst_first.iter().any(|h| h == ".") {
        return Err(RecordedError {
            code: 556,
            enhanced_code: Some(EnhancedStatusCode {
                class: 5,
                subject: 1,
                detail: 10,
            }),
            message: "Domain does not accept email (null MX)".to_string(),
            command: None,
        });
    }

    let methods = config.mx_auth.method_set();
    let policy = if config.mx_auth.mta_sts {
        match sts.get_policy_for_domain(domain, dns.resolver().as_ref(), getter).await {
            Ok(PolicyLookup::Policy(policy)) => Some(policy),
            Ok(PolicyLookup::NoPolicy) => None,
            Err(err) if err.is_permanent() => None,
            Err(err) => return Err(RecordedError::internal(err.to_string())),
        }
    } else {
        None
    };

    let partitioned = partition_hosts(
        domain,
        &hosts_worst_first,
        mx.is_secure,
        policy.as_deref(),
        methods,
        config.mx_auth.require_tls || policy.as_ref().map(|p| p.mode == mta_sts::policy::PolicyMode::Enforce).unwrap_or(false),
    );

    if partitioned.authenticated.is_empty() && partitioned.non_authenticated.is_empty() {
        return Err(RecordedError {
            code: 550,
            enhanced_code: Some(EnhancedStatusCode {
                class: 5,
                subject: 7,
                detail: 1,
            }),
            message: format!("no usable MXs for {domain} (all excluded by policy)"),
            command: None,
        });
    }

    Ok(Candidates {
        authenticated: partitioned.authenticated,
        non_authenticated: partitioned.non_authenticated,
    })
}

async fn connect_and_ehlo(
    dns: &DnsFacade,
    config: &DispatchConfig,
    site: &str,
    host: &str,
    metrics: &DispatchMetrics,
) -> anyhow::Result<SmtpClient> {
    let addresses = dns.resolve_a_or_aaaa(host).await?;
    anyhow::ensure!(!addresses.is_empty(), "no A/AAAA records for {host}");

    let mut last_err = None;
    for address in addresses {
        match connect_one(config, site, &address, metrics).await {
            Ok(client) => return Ok(client),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no addresses for {host}")))
}

async fn connect_one(
    config: &DispatchConfig,
    site: &str,
    address: &ResolvedAddress,
    metrics: &DispatchMetrics,
) -> anyhow::Result<SmtpClient> {
    let port = address.port.unwrap_or(config.smtp_port);
    let socket_addr = std::net::SocketAddr::new(address.addr, port);

    let mut client = timeout(config.connect_timeout, async move {
        let stream = tokio::net::TcpStream::connect(socket_addr).await?;
        stream.set_nodelay(true)?;
        let mut client = SmtpClient::with_stream(stream, &address.name, SmtpClientTimeouts::default());
        let banner = client.read_response(None).await?;
        anyhow::ensure!(banner.code == 220, "bad banner: {banner:?}");
        anyhow::Result::<SmtpClient>::Ok(client)
    })
    .await??;

    metrics.connection_opened(site);

    let ehlo_name = ehlo_domain(config);
    let caps = client.ehlo(&ehlo_name).await?.clone();
    let has_starttls = caps.contains_key("STARTTLS");

    let tls_enabled = match (config.tls, has_starttls) {
        (Tls::Required | Tls::RequiredInsecure, false) => {
            anyhow::bail!("TLS required but STARTTLS is not advertised by {site}");
        }
        (Tls::Disabled, _) | (Tls::Opportunistic | Tls::OpportunisticInsecure, false) => false,
        (_, true) => {
            let options = TlsOptions {
                insecure: config.tls.allow_insecure(),
                ..Default::default()
            };
            match client.starttls(options).await {
                Ok(rfc5321::TlsStatus::Info(_)) => true,
                Ok(rfc5321::TlsStatus::FailedHandshake(reason)) => {
                    let _ = client.send_command(&Command::Quit).await;
                    anyhow::bail!("TLS handshake with {site} failed: {reason}");
                }
                Err(err) => {
                    let _ = client.send_command(&Command::Quit).await;
                    return Err(err.into());
                }
            }
        }
    };

    if let Some(username) = &config.smtp_auth_plain_username {
        if !tls_enabled && !config.allow_smtp_auth_plain_without_tls {
            anyhow::bail!("TLS is not enabled and AUTH PLAIN is required for {site}");
        }
        client
            .auth_plain(username, config.smtp_auth_plain_password.as_deref())
            .await?;
    }

    Ok(client)
}

fn ehlo_domain(config: &DispatchConfig) -> String {
    let name = config
        .ehlo_domain
        .clone()
        .unwrap_or_else(|| {
            gethostname::gethostname()
                .to_str()
                .unwrap_or("[127.0.0.1]")
                .to_string()
        });
    idna::domain_to_ascii(&name).unwrap_or(name)
}
