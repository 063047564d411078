//! Loopback-TCP scenarios exercising DNS resolution, MX failover, MTA-STS
//! policy enforcement, and the retry queue's DSN path against a real (if
//! tiny) SMTP server, rather than against mocked collaborators.

use dns_resolver::{DnsFacade, Resolver, TestResolver};
use futures::future::BoxFuture;
use message::dsn::{self, DsnParams};
use message::{EnvelopeAddress, Message, SourceInfo};
use mta_sts::{Get, MtaStsCache};
use outbound::config::{DispatchConfig, MxAuthConfig, QueueConfig, RetryConfig, Tls};
use outbound::dispatch::{self, CollectingSink, DomainGroup};
use outbound::metrics::DispatchMetrics;
use outbound::queue::QueueController;
use spool::local_disk::LocalDiskSpool;
use spool::Spool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

fn addr(s: &str) -> EnvelopeAddress {
    EnvelopeAddress::parse(s).unwrap()
}

fn dns_facade(resolver: TestResolver) -> DnsFacade {
    let resolver: Arc<dyn Resolver> = Arc::new(resolver);
    DnsFacade::new(resolver)
}

/// The canned reply code/text a fake MX gives at each stage of one
/// transaction. The same `Script` answers every connection it accepts.
#[derive(Clone, Copy)]
struct Script {
    mail: (u16, &'static str),
    rcpt: (u16, &'static str),
    data: (u16, &'static str),
    dot: (u16, &'static str),
}

impl Script {
    fn accept_all() -> Self {
        Self {
            mail: (250, "2.1.0 Ok"),
            rcpt: (250, "2.1.5 Ok"),
            data: (354, "Go ahead"),
            dot: (250, "2.0.0 Ok, queued"),
        }
    }

    fn reject_mail_temporarily() -> Self {
        Self {
            mail: (450, "4.3.0 try later"),
            ..Self::accept_all()
        }
    }

    fn reject_dot_permanently() -> Self {
        Self {
            dot: (550, "5.1.1 mailbox unavailable"),
            ..Self::accept_all()
        }
    }
}

/// Binds a one-shot-per-connection fake SMTP server on `ip:0` and returns
/// its assigned port plus a log of every command line it received, in the
/// order connections happened to arrive.
async fn spawn_fake_smtp(ip: &str, script: Script) -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind((ip, 0)).await.expect("bind fake smtp listener");
    let port = listener.local_addr().unwrap().port();
    let log = Arc::new(Mutex::new(Vec::new()));
    let log_for_task = Arc::clone(&log);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_one(stream, script, Arc::clone(&log_for_task)));
        }
    });
    (port, log)
}

async fn serve_one(stream: TcpStream, script: Script, log: Arc<Mutex<Vec<String>>>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    if writer.write_all(b"220 fake.invalid ESMTP ready\r\n").await.is_err() {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end_matches(['\r', '\n']).to_string();
        log.lock().unwrap().push(command.clone());
        let upper = command.to_ascii_uppercase();

        if upper.starts_with("QUIT") {
            let _ = writer.write_all(b"221 Bye\r\n").await;
            return;
        }

        let reply = if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            "250 fake.invalid\r\n".to_string()
        } else if upper.starts_with("MAIL FROM") {
            format!("{} {}\r\n", script.mail.0, script.mail.1)
        } else if upper.starts_with("RCPT TO") {
            format!("{} {}\r\n", script.rcpt.0, script.rcpt.1)
        } else if upper == "DATA" {
            format!("{} {}\r\n", script.data.0, script.data.1)
        } else if upper.starts_with("RSET") {
            "250 Ok\r\n".to_string()
        } else {
            "500 unrecognized command\r\n".to_string()
        };

        if writer.write_all(reply.as_bytes()).await.is_err() {
            return;
        }

        if upper == "DATA" && script.data.0 == 354 {
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                if line.trim_end_matches(['\r', '\n']) == "." {
                    log.lock().unwrap().push(".".to_string());
                    break;
                }
            }
            let reply = format!("{} {}\r\n", script.dot.0, script.dot.1);
            if writer.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

struct MapGetter(HashMap<&'static str, &'static str>);

impl Get for MapGetter {
    fn http_get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
        let found = self.0.get(url).copied();
        Box::pin(async move {
            found
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("404 {url}"))
        })
    }
}

fn no_mta_sts() -> MapGetter {
    MapGetter(HashMap::new())
}

fn test_config(port: u16) -> DispatchConfig {
    DispatchConfig {
        smtp_port: port,
        tls: Tls::Disabled,
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn group(domain: &str, recipients: &[&str]) -> DomainGroup {
    DomainGroup {
        domain: domain.to_string(),
        recipients: recipients.iter().map(|r| addr(r)).collect(),
    }
}

const HEADER: &[u8] = b"Subject: hello\r\nFrom: sender@example.com\r\n\r\n";
const BODY: &[u8] = b"hello there\r\n";

#[tokio::test]
async fn happy_path_single_mx() {
    let (port, log) = spawn_fake_smtp("127.0.0.1", Script::accept_all()).await;
    let dns = dns_facade(TestResolver::default().with_zone(
        "example.invalid. IN MX 10 mx.example.invalid.\nmx.example.invalid. IN A 127.0.0.1",
    ));
    let config = test_config(port);
    let metrics = DispatchMetrics::new().unwrap();
    let sender = addr("sender@example.com");
    let g = group("example.invalid", &["a@example.invalid", "b@example.invalid"]);

    let result = dispatch::deliver_group_atomic(
        &dns,
        &MtaStsCache::new(),
        &no_mta_sts(),
        &config,
        &metrics,
        &sender,
        &g,
        HEADER,
        BODY,
    )
    .await;

    assert!(result.is_ok(), "expected delivery to succeed, got {result:?}");
    let commands = log.lock().unwrap().clone();
    assert!(commands.iter().any(|c| c.to_ascii_uppercase().starts_with("MAIL FROM")));
    assert_eq!(
        commands.iter().filter(|c| c.to_ascii_uppercase().starts_with("RCPT TO")).count(),
        2,
        "both recipients should share the one connection"
    );
    assert!(commands.iter().any(|c| c == "DATA"));
    assert!(commands.iter().any(|c| c.to_ascii_uppercase().starts_with("QUIT")));
}

#[tokio::test]
async fn null_mx_is_rejected_without_connecting() {
    let dns = dns_facade(TestResolver::default().with_zone("example.invalid. IN MX 0 ."));
    let config = test_config(0);
    let metrics = DispatchMetrics::new().unwrap();
    let sender = addr("sender@example.com");
    let g = group("example.invalid", &["a@example.invalid"]);

    let result = dispatch::deliver_group_atomic(
        &dns,
        &MtaStsCache::new(),
        &no_mta_sts(),
        &config,
        &metrics,
        &sender,
        &g,
        HEADER,
        BODY,
    )
    .await;

    let err = result.expect_err("null MX must be a permanent failure");
    assert!(err.is_permanent());
    assert_eq!(err.code, 556);
    assert!(err.message.to_lowercase().contains("null mx"));
}

#[tokio::test]
async fn mta_sts_enforce_excludes_mismatched_mx() {
    let (_port, log) = spawn_fake_smtp("127.0.0.1", Script::accept_all()).await;
    let dns = dns_facade(
        TestResolver::default()
            .with_zone(
                "example.invalid. IN MX 10 mx.example.invalid.\nmx.example.invalid. IN A 127.0.0.1",
            )
            .with_txt("_mta-sts.example.invalid", "v=STSv1; id=20260101000000;".to_string()),
    );
    let getter = MapGetter(HashMap::from([(
        "https://mta-sts.example.invalid/.well-known/mta-sts.txt",
        "version: STSv1\nmode: enforce\nmx: mx-that-does-not-match.example.invalid\nmax_age: 86400",
    )]));
    let mut config = test_config(0);
    config.mx_auth = MxAuthConfig {
        dnssec: false,
        mta_sts: true,
        common_domain: false,
        require_tls: false,
    };
    let metrics = DispatchMetrics::new().unwrap();
    let sender = addr("sender@example.com");
    let g = group("example.invalid", &["a@example.invalid"]);

    let result = dispatch::deliver_group_atomic(
        &dns,
        &MtaStsCache::new(),
        &getter,
        &config,
        &metrics,
        &sender,
        &g,
        HEADER,
        BODY,
    )
    .await;

    let err = result.expect_err("the only candidate MX is excluded by policy");
    assert!(err.is_permanent());
    assert!(log.lock().unwrap().is_empty(), "an excluded MX must never be connected to");
}

#[tokio::test]
async fn fails_over_to_the_second_preference_mx() {
    // mx1 (preference 10, tried first) resolves to a loopback address with
    // nothing listening, so the connection attempt is refused outright;
    // mx2 (preference 20) is the one with a real listener and must be the
    // one that actually receives the transaction.
    let (good_port, good_log) = spawn_fake_smtp("127.0.0.2", Script::accept_all()).await;
    let config = test_config(good_port);
    let dns = dns_facade(TestResolver::default().with_zone(
        "example.invalid. IN MX 10 mx1.example.invalid.\n\
         example.invalid. IN MX 20 mx2.example.invalid.\n\
         mx1.example.invalid. IN A 127.0.0.3\n\
         mx2.example.invalid. IN A 127.0.0.2",
    ));
    let metrics = DispatchMetrics::new().unwrap();
    let sender = addr("sender@example.com");
    let g = group("example.invalid", &["a@example.invalid"]);

    let result = dispatch::deliver_group_atomic(
        &dns,
        &MtaStsCache::new(),
        &no_mta_sts(),
        &config,
        &metrics,
        &sender,
        &g,
        HEADER,
        BODY,
    )
    .await;

    assert!(result.is_ok(), "delivery should succeed via the reachable second MX: {result:?}");
    let commands = good_log.lock().unwrap().clone();
    assert!(
        commands.iter().any(|c| c == "DATA"),
        "the working, lower-priority MX should have received the transaction"
    );
}

#[tokio::test]
async fn partial_recipient_failure_produces_a_dsn_for_the_rejected_recipient() {
    let (dom1_port, dom1_log) = spawn_fake_smtp("127.0.0.1", Script::reject_dot_permanently()).await;
    let (_reused_port, dom2_log) = {
        // Reuse dom1's port on a second loopback address: `DispatchConfig`
        // has a single global `smtp_port` fallback shared by every
        // address without an explicit port.
        let listener = TcpListener::bind(("127.0.0.2", dom1_port)).await.unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_task = Arc::clone(&log);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve_one(stream, Script::accept_all(), Arc::clone(&log_for_task)));
            }
        });
        (dom1_port, log)
    };

    let dns = dns_facade(
        TestResolver::default()
            .with_zone("dom1.invalid. IN MX 10 mx.dom1.invalid.\nmx.dom1.invalid. IN A 127.0.0.1")
            .with_zone("dom2.invalid. IN MX 10 mx.dom2.invalid.\nmx.dom2.invalid. IN A 127.0.0.2"),
    );
    let config = test_config(dom1_port);
    let metrics = DispatchMetrics::new().unwrap();
    let sender = addr("sender@example.com");

    let message = Message::new(
        sender.clone(),
        vec![addr("a@dom1.invalid"), addr("b@dom2.invalid")],
        HEADER.to_vec(),
        BODY.to_vec(),
        SourceInfo::default(),
    );

    for (domain, recipients) in [
        ("dom1.invalid", vec!["a@dom1.invalid"]),
        ("dom2.invalid", vec!["b@dom2.invalid"]),
    ] {
        let mut sink = CollectingSink::default();
        let g = group(domain, &recipients);
        dispatch::deliver_group(
            &dns,
            &MtaStsCache::new(),
            &no_mta_sts(),
            &config,
            &metrics,
            &sender,
            &g,
            HEADER,
            BODY,
            &mut sink,
        )
        .await;
        for (recipient, result) in sink.results {
            match result {
                Ok(()) => message.mark_delivered(&recipient),
                Err(err) => message.mark_permanently_failed(recipient, err),
            }
        }
    }

    let (header, body) = dsn::compose(&message, &DsnParams { reporting_mta: "mx.example.com" })
        .unwrap()
        .expect("a DSN should be generated for the one rejected recipient");
    let full = String::from_utf8(header).unwrap() + &String::from_utf8(body).unwrap();
    assert!(full.contains("Final-Recipient: rfc822;a@dom1.invalid"));
    assert!(!full.contains("Final-Recipient: rfc822;b@dom2.invalid"));
    assert!(full.contains("Action: failed"));

    assert!(dom1_log.lock().unwrap().iter().any(|c| c == "."));
    assert!(dom2_log.lock().unwrap().iter().any(|c| c == "."));
}

#[tokio::test]
async fn retry_and_backoff_exhausts_into_a_delivered_dsn() {
    let (mx_port, mx_log) = spawn_fake_smtp("127.0.0.1", Script::reject_mail_temporarily()).await;
    let sender_listener = TcpListener::bind(("127.0.0.2", mx_port)).await.unwrap();
    let sender_log = Arc::new(Mutex::new(Vec::new()));
    let sender_log_for_task = Arc::clone(&sender_log);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = sender_listener.accept().await else {
                break;
            };
            tokio::spawn(serve_one(stream, Script::accept_all(), Arc::clone(&sender_log_for_task)));
        }
    });

    let dns = dns_facade(
        TestResolver::default()
            .with_zone("example.invalid. IN MX 10 mx.example.invalid.\nmx.example.invalid. IN A 127.0.0.1")
            .with_zone("example.com. IN MX 10 mx.example.com.\nmx.example.com. IN A 127.0.0.2"),
    );

    let tempdir = tempfile::tempdir().unwrap();
    let spool: Arc<dyn Spool> = Arc::new(LocalDiskSpool::new(tempdir.path(), false).unwrap());
    let retry = RetryConfig {
        initial_delay: Duration::from_millis(20),
        growth_factor: 1.0,
        max_attempts: 2,
        startup_grace: Duration::from_millis(1),
    };
    let queue_config = QueueConfig {
        retry,
        reporting_mta: "mx.example.com".to_string(),
        max_in_flight: 4,
        site_connection_limit: 4,
    };
    let controller = QueueController::new(
        Arc::clone(&spool),
        Arc::new(dns),
        Arc::new(MtaStsCache::new()),
        Arc::new(no_mta_sts()),
        test_config(mx_port),
        queue_config,
        Arc::new(DispatchMetrics::new().unwrap()),
    )
    .unwrap();

    let message = Message::new(
        addr("sender@example.com"),
        vec![addr("a@example.invalid")],
        HEADER.to_vec(),
        BODY.to_vec(),
        SourceInfo::default(),
    );
    controller.submit(message).await.unwrap();

    let runner = tokio::spawn(Arc::clone(&controller).run());
    wait_until_spool_empty(spool.as_ref(), Duration::from_secs(10)).await;
    controller.close();
    runner.await.unwrap();

    let mail_attempts = mx_log
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.to_ascii_uppercase().starts_with("MAIL FROM"))
        .count();
    assert_eq!(mail_attempts, 2, "both retry attempts should have connected and tried MAIL FROM");
    assert!(
        sender_log.lock().unwrap().iter().any(|c| c == "."),
        "the generated DSN should have been delivered back to the sender's domain"
    );
}

async fn spool_len(spool: &dyn Spool) -> usize {
    let (tx, mut rx) = tokio::sync::mpsc::channel(32);
    spool.enumerate(tx).expect("enumerate");
    let mut count = 0;
    while rx.recv().await.is_some() {
        count += 1;
    }
    count
}

async fn wait_until_spool_empty(spool: &dyn Spool, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if spool_len(spool).await == 0 {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the spool to drain"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
