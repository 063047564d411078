//! Retry queue controller: component H of the delivery core.
//!
//! Accepts messages from the ingress pipeline, drives delivery attempts
//! through [`crate::dispatch`], classifies per-recipient outcomes,
//! reschedules temporary failures with exponential backoff, and hands
//! exhausted/partially-failed messages to the DSN composer.
//!
//! Grounded on `queue/queue.rs`'s `increment_attempts_and_update_delay`/
//! `requeue_message_internal` attempt loop and `queue/maintainer.rs`'s
//! tick-the-wheel-then-reinsert pattern, replacing the hash-wheel/
//! per-named-queue actor model with a single [`timeq::TimeQ`] shared
//! across all messages plus a bounded worker pool.

use chrono::Utc;
use dns_resolver::DnsFacade;
use message::{EnvelopeAddress, Message, SourceInfo};
use mta_sts::{Get, MtaStsCache};
use spool::{Spool, SpoolEntry, SpoolId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::config::{DispatchConfig, QueueConfig};
use crate::dispatch::{self, CollectingSink, DomainGroup};
use crate::metrics::DispatchMetrics;

/// Groups `recipients` by the domain portion of the address, preserving
/// first-seen domain order so the same message always dispatches in a
/// stable, log-friendly order.
fn group_by_domain(recipients: &[EnvelopeAddress]) -> Vec<DomainGroup> {
    let mut order = vec![];
    let mut groups: HashMap<String, Vec<EnvelopeAddress>> = HashMap::new();
    for recipient in recipients {
        let domain = recipient.domain().to_string();
        if !groups.contains_key(&domain) {
            order.push(domain.clone());
        }
        groups.entry(domain).or_default().push(recipient.clone());
    }
    order
        .into_iter()
        .map(|domain| {
            let recipients = groups.remove(&domain).unwrap_or_default();
            DomainGroup { domain, recipients }
        })
        .collect()
}

fn instant_for(fire_at: chrono::DateTime<Utc>) -> Instant {
    let delta = fire_at - Utc::now();
    match delta.to_std() {
        Ok(delta) => Instant::now() + delta,
        Err(_) => Instant::now(),
    }
}

/// Exponential decay curve, asymptotic up to `connection_limit`: a site
/// with a shallow backlog doesn't earn as many concurrent connections as
/// one with a deep backlog. Floored at 1 since this is only consulted
/// when a group is actually waiting to go out.
fn ideal_connection_count(backlog: usize, connection_limit: usize) -> usize {
    let factor = 0.023;
    let goal = (connection_limit as f32) * (1. - (-1.0 * backlog as f32 * factor).exp());
    (goal.ceil() as usize).clamp(1, connection_limit.max(1))
}

/// Per-destination-site admission control: bounds how many domain groups
/// may be mid-delivery to the same site at once, scaled to the number of
/// groups currently contending for that site rather than a flat cap.
struct SiteThrottle {
    backlog: StdMutex<HashMap<String, usize>>,
    inflight: StdMutex<HashMap<String, usize>>,
}

impl SiteThrottle {
    fn new() -> Self {
        Self {
            backlog: StdMutex::new(HashMap::new()),
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, site: &str, connection_limit: usize) -> SiteSlot<'_> {
        let backlog = {
            let mut map = self.backlog.lock().unwrap();
            let entry = map.entry(site.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        loop {
            let ideal = ideal_connection_count(backlog, connection_limit);
            let acquired = {
                let mut map = self.inflight.lock().unwrap();
                let entry = map.entry(site.to_string()).or_insert(0);
                if *entry < ideal {
                    *entry += 1;
                    true
                } else {
                    false
                }
            };
            if acquired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        SiteSlot {
            throttle: self,
            site: site.to_string(),
        }
    }
}

struct SiteSlot<'a> {
    throttle: &'a SiteThrottle,
    site: String,
}

impl Drop for SiteSlot<'_> {
    fn drop(&mut self) {
        if let Some(v) = self.throttle.inflight.lock().unwrap().get_mut(&self.site) {
            *v = v.saturating_sub(1);
        }
        if let Some(v) = self.throttle.backlog.lock().unwrap().get_mut(&self.site) {
            *v = v.saturating_sub(1);
        }
    }
}

/// Owns every collaborator the delivery core needs and drives the retry
/// loop. Constructed once by the embedder: every collaborator is an
/// explicit field, not a process-wide singleton.
pub struct QueueController {
    spool: Arc<dyn Spool>,
    dns: Arc<DnsFacade>,
    sts: Arc<MtaStsCache>,
    getter: Arc<dyn Get>,
    dispatch_config: DispatchConfig,
    queue_config: QueueConfig,
    metrics: Arc<DispatchMetrics>,
    timeq: Arc<timeq::TimeQ<SpoolId>>,
    pool: Arc<Semaphore>,
    site_throttle: SiteThrottle,
    in_flight: AtomicUsize,
}

impl QueueController {
    pub fn new(
        spool: Arc<dyn Spool>,
        dns: Arc<DnsFacade>,
        sts: Arc<MtaStsCache>,
        getter: Arc<dyn Get>,
        dispatch_config: DispatchConfig,
        queue_config: QueueConfig,
        metrics: Arc<DispatchMetrics>,
    ) -> Result<Arc<Self>, crate::config::ConfigError> {
        queue_config.validate()?;
        let pool = Arc::new(Semaphore::new(queue_config.max_in_flight));
        Ok(Arc::new(Self {
            spool,
            dns,
            sts,
            getter,
            dispatch_config,
            queue_config,
            metrics,
            timeq: Arc::new(timeq::TimeQ::new()),
            pool,
            site_throttle: SiteThrottle::new(),
            in_flight: AtomicUsize::new(0),
        }))
    }

    /// Persists a new message and schedules its first attempt immediately.
    pub async fn submit(&self, message: Message) -> anyhow::Result<SpoolId> {
        let id = message.id();
        message.save_to(self.spool.as_ref()).await?;
        message.set_next_attempt_at(Utc::now());
        message.save_to(self.spool.as_ref()).await?;
        self.timeq.add(Instant::now(), id).map_err(|_| anyhow::anyhow!("queue is closed"))?;
        self.metrics.set_queue_depth("scheduled", self.timeq.len());
        Ok(id)
    }

    /// Enumerates the spool at startup and re-arms the timing wheel for
    /// every surviving triplet. A next-fire time sooner than
    /// `retry.startup_grace` is pushed out to `now + grace`.
    pub async fn recover(&self) -> anyhow::Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(128);
        self.spool.enumerate(tx)?;

        while let Some(entry) = rx.recv().await {
            match entry {
                SpoolEntry::Item(id) => {
                    match Message::load_from_spool(id, self.spool.as_ref()).await {
                        Ok(message) => self.recover_one(message),
                        Err(err) => tracing::warn!(%id, error = %err, "failed to load recovered message"),
                    }
                }
                SpoolEntry::Corrupt { id, error } => {
                    tracing::warn!(%id, %error, "discarding corrupt spool entry at startup");
                }
            }
        }
        self.metrics.set_queue_depth("scheduled", self.timeq.len());
        Ok(())
    }

    fn recover_one(&self, message: Message) {
        let id = message.id();
        let grace_floor = Utc::now() + self.queue_config.retry.startup_grace;
        let fire_at = message.next_attempt_at().unwrap_or_else(Utc::now).max(grace_floor);
        let _ = self.timeq.add(instant_for(fire_at), id);
    }

    /// Runs the worker loop until the timing wheel is closed and drained.
    /// Intended to be spawned as a long-lived task by the embedder.
    pub async fn run(self: Arc<Self>) {
        loop {
            let Some(id) = self.timeq.recv().await else {
                break;
            };
            self.metrics.set_queue_depth("scheduled", self.timeq.len());

            let controller = Arc::clone(&self);
            let permit = match Arc::clone(&self.pool).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = controller.process(id).await {
                    tracing::error!(message_id = %id, error = %err, "attempt processing failed");
                }
                controller.in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    /// Signals shutdown: closes the timing wheel so [`Self::run`] returns
    /// once in-flight attempts (bounded by the pool) drain naturally.
    pub fn close(&self) {
        self.timeq.close();
    }

    async fn process(&self, id: SpoolId) -> anyhow::Result<()> {
        let message = Message::load_from_spool(id, self.spool.as_ref()).await?;
        let span = tracing::info_span!("attempt", message_id = %id, attempt = message.attempts() + 1);
        let _enter = span.enter();

        message.record_attempt_started();

        let groups = group_by_domain(&message.pending_recipients());
        let header = message.header()?;
        let body = message.body()?;
        let sender = message.sender();

        for group in &groups {
            let _slot = self
                .site_throttle
                .acquire(&group.domain, self.queue_config.site_connection_limit)
                .await;

            let mut sink = CollectingSink::default();
            dispatch::deliver_group(
                self.dns.as_ref(),
                self.sts.as_ref(),
                self.getter.as_ref(),
                &self.dispatch_config,
                &self.metrics,
                &sender,
                group,
                &header,
                &body,
                &mut sink,
            )
            .await;

            let mut delivered = 0usize;
            let mut deferred = 0usize;
            let mut bounced = 0usize;
            for (recipient, result) in sink.results {
                match result {
                    Ok(()) => {
                        message.mark_delivered(&recipient);
                        delivered += 1;
                    }
                    Err(err) if err.is_permanent() => {
                        message.mark_permanently_failed(recipient, err);
                        bounced += 1;
                    }
                    Err(err) => {
                        message.record_temporary_failure(recipient, err);
                        deferred += 1;
                    }
                }
            }
            if delivered > 0 {
                self.metrics.delivered(&group.domain, delivered);
            }
            if deferred > 0 {
                self.metrics.deferred(&group.domain, deferred);
            }
            if bounced > 0 {
                self.metrics.bounced(&group.domain, bounced);
            }
        }

        self.finish_attempt(message).await
    }

    async fn finish_attempt(&self, message: Message) -> anyhow::Result<()> {
        let meta = message.clone_metadata();
        let should_retry = meta.has_temporary_failures() && meta.attempts < self.queue_config.retry.max_attempts;

        if should_retry {
            let delay = self.queue_config.retry.delay_for_attempt(meta.attempts);
            let fire_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            message.set_next_attempt_at(fire_at);
            message.save_to(self.spool.as_ref()).await?;
            message.shrink();
            self.timeq
                .add(Instant::now() + delay, message.id())
                .map_err(|_| anyhow::anyhow!("queue is closed"))?;
            return Ok(());
        }

        if meta.has_temporary_failures() {
            // Attempt budget exhausted: the remaining temporary failures
            // become permanent so the DSN below reports them.
            message.give_up_on_temporary_failures();
        }

        let final_meta = message.clone_metadata();
        if !final_meta.permanently_failed.is_empty() && !message.is_dsn() {
            self.emit_dsn(&message).await?;
        }

        message.remove_from_spool(self.spool.as_ref()).await?;
        Ok(())
    }

    async fn emit_dsn(&self, message: &Message) -> anyhow::Result<()> {
        let params = message::dsn::DsnParams {
            reporting_mta: &self.queue_config.reporting_mta,
        };
        let Some((header, body)) = message::dsn::compose(message, &params)? else {
            return Ok(());
        };
        let original_sender = message.sender();
        let dsn_message = Message::new(
            message::dsn::dsn_envelope_sender(),
            vec![original_sender],
            header,
            body,
            SourceInfo::default(),
        );
        dsn_message.set_is_dsn();
        self.submit(dsn_message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use message::EnvelopeAddress;

    fn addr(s: &str) -> EnvelopeAddress {
        EnvelopeAddress::parse(s).unwrap()
    }

    #[test]
    fn groups_recipients_by_domain_preserving_order() {
        let recipients = vec![
            addr("a@dom1.example"),
            addr("b@dom2.example"),
            addr("c@dom1.example"),
        ];
        let groups = group_by_domain(&recipients);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].domain, "dom1.example");
        assert_eq!(groups[0].recipients.len(), 2);
        assert_eq!(groups[1].domain, "dom2.example");
        assert_eq!(groups[1].recipients.len(), 1);
    }

    #[test]
    fn connection_count_grows_with_backlog_up_to_the_limit() {
        let limit = 32;
        let sizes = [0, 1, 5, 10, 32, 128];
        let targets: Vec<usize> = sizes.iter().map(|&n| ideal_connection_count(n, limit)).collect();
        // Matches the upstream curve's documented table, clamped to at
        // least 1 here since this throttle is only ever consulted when
        // there is a group actually waiting to go out.
        assert_eq!(targets, vec![1, 1, 4, 7, 17, 31]);
        assert!(targets.windows(2).all(|w| w[0] <= w[1]));
        assert!(targets.iter().all(|&n| n <= limit));
    }

    #[tokio::test]
    async fn site_throttle_caps_concurrent_slots_for_a_shallow_backlog() {
        let throttle = SiteThrottle::new();
        let _first = throttle.acquire("dest.example", 32).await;
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            throttle.acquire("dest.example", 32),
        )
        .await;
        assert!(second.is_err(), "a single-item backlog should only admit one slot");
    }
}
