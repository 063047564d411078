use crate::EnvelopeAddress;
use chrono::{DateTime, Utc};
use rfc5321::{EnhancedStatusCode, Response};
use serde::{Deserialize, Serialize};
use spool::{Spool, SpoolId};
use std::sync::{Arc, Mutex};

/// A snapshot of a failed SMTP reply, stored structurally so it can be
/// replayed into a DSN or a log record without re-parsing text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedError {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub message: String,
    pub command: Option<String>,
}

impl RecordedError {
    pub fn from_response(resp: &Response) -> Self {
        Self {
            code: resp.code,
            enhanced_code: resp.enhanced_code,
            message: resp.content.clone(),
            command: resp.command.clone(),
        }
    }

    /// Used for failures that never produced a remote reply: DNS errors,
    /// connection refusals, local I/O errors. Classified as temporary
    /// (4xx) per the queue boundary's error policy.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: 400,
            enhanced_code: None,
            message: message.into(),
            command: None,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

/// A recipient that has left the pending set, together with the error
/// that most recently applied to it and how many attempts it has absorbed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientFailure {
    pub recipient: EnvelopeAddress,
    pub error: RecordedError,
    pub attempts: u32,
}

/// Context inherited from the ingress pipeline; carried unchanged across
/// attempts and copied verbatim into any DSN produced for this message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    pub protocol: String,
    pub source_hostname: Option<String>,
    pub authenticated_user: Option<String>,
    pub received_from: Option<String>,
    pub original_recipients: Vec<EnvelopeAddress>,
    pub quarantined: bool,
    pub requires_tls: bool,
    pub smtp_utf8: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaData {
    pub sender: EnvelopeAddress,
    pub pending: Vec<EnvelopeAddress>,
    pub permanently_failed: Vec<RecipientFailure>,
    pub temporarily_failed: Vec<RecipientFailure>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub first_attempt: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Wall-clock time the next attempt is scheduled for, so a restart can
    /// recover the retry schedule from the persisted triplet alone rather
    /// than reconstructing it from `attempts`/`last_attempt`.
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set on bounce messages generated by the DSN composer, to prevent
    /// a failed bounce from producing a second-order bounce.
    pub is_dsn: bool,
    pub source: SourceInfo,
    /// Free-form extension data; not interpreted by this crate.
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl MetaData {
    /// True once every recipient has left the pending set.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn has_temporary_failures(&self) -> bool {
        !self.temporarily_failed.is_empty()
    }
}

#[derive(Debug)]
struct MessageInner {
    metadata: MetaData,
    header: Option<Arc<[u8]>>,
    body: Option<Arc<[u8]>>,
    /// False until the triplet has been written via `Spool::put` at least once.
    persisted: bool,
    meta_dirty: bool,
}

/// A single queued message: immutable header/body content plus metadata
/// that evolves across delivery attempts. Cheap to clone; all mutation
/// goes through the shared inner state.
#[derive(Clone, Debug)]
pub struct Message {
    id: SpoolId,
    inner: Arc<Mutex<MessageInner>>,
}

impl Message {
    /// Creates a brand-new message accepted from the ingress pipeline.
    /// Nothing is written to the spool until [`Message::save_to`] is called.
    pub fn new(
        sender: EnvelopeAddress,
        recipients: Vec<EnvelopeAddress>,
        header: Vec<u8>,
        body: Vec<u8>,
        source: SourceInfo,
    ) -> Self {
        let metadata = MetaData {
            sender,
            pending: recipients,
            permanently_failed: vec![],
            temporarily_failed: vec![],
            created: Utc::now(),
            attempts: 0,
            first_attempt: None,
            last_attempt: None,
            next_attempt_at: None,
            is_dsn: false,
            source,
            meta: serde_json::Value::Object(Default::default()),
        };
        Self {
            id: SpoolId::new(),
            inner: Arc::new(Mutex::new(MessageInner {
                metadata,
                header: Some(header.into()),
                body: Some(body.into()),
                persisted: false,
                meta_dirty: true,
            })),
        }
    }

    /// Rehydrates a message from a spool entry found at startup.
    pub async fn load_from_spool(id: SpoolId, spool: &dyn Spool) -> anyhow::Result<Self> {
        let triplet = spool.read(id).await?;
        let metadata: MetaData = serde_json::from_slice(&triplet.meta)?;
        Ok(Self {
            id,
            inner: Arc::new(Mutex::new(MessageInner {
                metadata,
                header: Some(triplet.header.into()),
                body: Some(triplet.body.into()),
                persisted: true,
                meta_dirty: false,
            })),
        })
    }

    pub fn id(&self) -> SpoolId {
        self.id
    }

    /// Writes the triplet for the first time, or just the metadata file
    /// if the triplet was already persisted and only metadata changed.
    pub async fn save_to(&self, spool: &dyn Spool) -> anyhow::Result<()> {
        let (header, body, meta_bytes, persisted, meta_dirty) = {
            let inner = self.inner.lock().unwrap();
            if !inner.meta_dirty && inner.persisted {
                return Ok(());
            }
            let meta_bytes = serde_json::to_vec(&inner.metadata)?;
            (
                inner.header.clone(),
                inner.body.clone(),
                meta_bytes,
                inner.persisted,
                inner.meta_dirty,
            )
        };

        if !persisted {
            let header = header.ok_or_else(|| anyhow::anyhow!("message header is not loaded"))?;
            let body = body.ok_or_else(|| anyhow::anyhow!("message body is not loaded"))?;
            spool.put(self.id, &header, &body, &meta_bytes).await?;
        } else if meta_dirty {
            spool.update_meta(self.id, &meta_bytes).await?;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.persisted = true;
        inner.meta_dirty = false;
        Ok(())
    }

    pub async fn remove_from_spool(&self, spool: &dyn Spool) -> anyhow::Result<()> {
        spool.delete(self.id).await
    }

    /// Drops the in-memory header/body copies to free heap; they are
    /// immutable once persisted, so this never loses data.
    pub fn shrink(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.header = None;
        inner.body = None;
    }

    pub async fn ensure_data_loaded(&self, spool: &dyn Spool) -> anyhow::Result<()> {
        let needs_load = {
            let inner = self.inner.lock().unwrap();
            inner.header.is_none() || inner.body.is_none()
        };
        if needs_load {
            let triplet = spool.read(self.id).await?;
            let mut inner = self.inner.lock().unwrap();
            inner.header = Some(triplet.header.into());
            inner.body = Some(triplet.body.into());
        }
        Ok(())
    }

    pub fn header(&self) -> anyhow::Result<Arc<[u8]>> {
        self.inner
            .lock()
            .unwrap()
            .header
            .clone()
            .ok_or_else(|| anyhow::anyhow!("message header is not loaded"))
    }

    pub fn body(&self) -> anyhow::Result<Arc<[u8]>> {
        self.inner
            .lock()
            .unwrap()
            .body
            .clone()
            .ok_or_else(|| anyhow::anyhow!("message body is not loaded"))
    }

    pub fn sender(&self) -> EnvelopeAddress {
        self.inner.lock().unwrap().metadata.sender.clone()
    }

    pub fn is_dsn(&self) -> bool {
        self.inner.lock().unwrap().metadata.is_dsn
    }

    pub fn set_is_dsn(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.metadata.is_dsn = true;
        inner.meta_dirty = true;
    }

    pub fn pending_recipients(&self) -> Vec<EnvelopeAddress> {
        self.inner.lock().unwrap().metadata.pending.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().metadata.is_complete()
    }

    pub fn clone_metadata(&self) -> MetaData {
        self.inner.lock().unwrap().metadata.clone()
    }

    /// Removes `recipient` from the pending set: it was delivered
    /// successfully and needs no further tracking.
    pub fn mark_delivered(&self, recipient: &EnvelopeAddress) {
        let mut inner = self.inner.lock().unwrap();
        inner.metadata.pending.retain(|r| r != recipient);
        inner
            .metadata
            .temporarily_failed
            .retain(|f| &f.recipient != recipient);
        inner.meta_dirty = true;
    }

    /// Moves `recipient` out of pending (and any stale temporary-failure
    /// record) into the permanently-failed set.
    pub fn mark_permanently_failed(&self, recipient: EnvelopeAddress, error: RecordedError) {
        let mut inner = self.inner.lock().unwrap();
        inner.metadata.pending.retain(|r| *r != recipient);
        inner
            .metadata
            .temporarily_failed
            .retain(|f| f.recipient != recipient);
        inner
            .metadata
            .permanently_failed
            .push(RecipientFailure {
                recipient,
                error,
                attempts: 1,
            });
        inner.meta_dirty = true;
    }

    /// Records a transient failure for `recipient` without removing it
    /// from pending: it remains eligible for the next scheduled attempt.
    /// The temporarily-failed list is an accounting trail of the most
    /// recent error seen, not a separate queue.
    pub fn record_temporary_failure(&self, recipient: EnvelopeAddress, error: RecordedError) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.metadata.pending.contains(&recipient) {
            // Already resolved (delivered or permanently failed) by a
            // racing update; nothing to record.
            return;
        }
        if let Some(existing) = inner
            .metadata
            .temporarily_failed
            .iter_mut()
            .find(|f| f.recipient == recipient)
        {
            existing.error = error;
            existing.attempts += 1;
        } else {
            inner.metadata.temporarily_failed.push(RecipientFailure {
                recipient,
                error,
                attempts: 1,
            });
        }
        inner.meta_dirty = true;
    }

    /// Promotes every currently temporarily-failed recipient to
    /// permanently-failed; called once the attempt budget is exhausted.
    pub fn give_up_on_temporary_failures(&self) -> Vec<RecipientFailure> {
        let mut inner = self.inner.lock().unwrap();
        let promoted: Vec<RecipientFailure> =
            std::mem::take(&mut inner.metadata.temporarily_failed);
        inner.metadata.pending.retain(|r| {
            !promoted.iter().any(|p| p.recipient == *r)
        });
        inner
            .metadata
            .permanently_failed
            .extend(promoted.iter().cloned());
        inner.meta_dirty = true;
        promoted
    }

    pub fn record_attempt_started(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        inner.metadata.attempts += 1;
        inner.metadata.first_attempt.get_or_insert(now);
        inner.metadata.last_attempt = Some(now);
        inner.meta_dirty = true;
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().unwrap().metadata.attempts
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().unwrap().metadata.next_attempt_at
    }

    pub fn set_next_attempt_at(&self, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        inner.metadata.next_attempt_at = Some(at);
        inner.meta_dirty = true;
    }

    pub fn set_meta<S: AsRef<str>, V: Into<serde_json::Value>>(&self, key: S, value: V) {
        let mut inner = self.inner.lock().unwrap();
        if let serde_json::Value::Object(map) = &mut inner.metadata.meta {
            map.insert(key.as_ref().to_string(), value.into());
        }
        inner.meta_dirty = true;
    }

    pub fn get_meta<S: serde_json::value::Index>(&self, key: S) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        inner.metadata.meta.get(key).cloned().unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> EnvelopeAddress {
        EnvelopeAddress::parse(s).unwrap()
    }

    #[test]
    fn recipient_partitioning_stays_disjoint() {
        let msg = Message::new(
            addr("sender@example.com"),
            vec![addr("a@dest.com"), addr("b@dest.com"), addr("c@dest.com")],
            b"Subject: hi\r\n\r\n".to_vec(),
            b"hello\r\n".to_vec(),
            SourceInfo::default(),
        );

        msg.mark_delivered(&addr("a@dest.com"));
        msg.mark_permanently_failed(
            addr("b@dest.com"),
            RecordedError {
                code: 550,
                enhanced_code: None,
                message: "no such user".into(),
                command: Some("RCPT TO".into()),
            },
        );
        msg.record_temporary_failure(
            addr("c@dest.com"),
            RecordedError::internal("connection refused"),
        );

        let meta = msg.clone_metadata();
        assert_eq!(meta.pending, vec![addr("c@dest.com")]);
        assert_eq!(meta.permanently_failed.len(), 1);
        assert_eq!(meta.temporarily_failed.len(), 1);
        assert!(!meta.is_complete());
    }

    #[test]
    fn giving_up_promotes_temporary_to_permanent() {
        let msg = Message::new(
            addr("sender@example.com"),
            vec![addr("c@dest.com")],
            b"Subject: hi\r\n\r\n".to_vec(),
            b"hello\r\n".to_vec(),
            SourceInfo::default(),
        );
        msg.record_temporary_failure(addr("c@dest.com"), RecordedError::internal("timeout"));
        let promoted = msg.give_up_on_temporary_failures();
        assert_eq!(promoted.len(), 1);
        let meta = msg.clone_metadata();
        assert!(meta.pending.is_empty());
        assert!(meta.temporarily_failed.is_empty());
        assert_eq!(meta.permanently_failed.len(), 1);
        assert!(meta.is_complete());
    }
}
