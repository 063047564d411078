//! MTA-STS policy cache: component B of the delivery core.
//!
//! Discovers, fetches, persists and refreshes per-domain MTA-STS policies
//! (RFC 8461). The cache keeps an in-memory map behind a read/write lock
//! plus, optionally, one file per domain on disk so policies survive a
//! restart without a guaranteed-fresh TXT/HTTPS round trip.
pub mod dns;
pub mod policy;

use dns_resolver::Resolver;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use policy::MtaStsPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// How often the background refresher walks the cache.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 3600);
/// Entries whose remaining lifetime is under this window are refreshed
/// eagerly by the walker, rather than waiting for them to go stale.
pub const REFRESH_EAGERNESS: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Error, Clone)]
pub enum PolicyError {
    #[error("transient failure discovering MTA-STS policy for {domain}: {reason}")]
    Temporary { domain: String, reason: String },
    #[error("permanent failure parsing MTA-STS policy for {domain}: {reason}")]
    Permanent { domain: String, reason: String },
}

impl PolicyError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// Outcome of a policy lookup: either the domain has no MTA-STS policy at
/// all, or it has one.
#[derive(Debug, Clone)]
pub enum PolicyLookup {
    NoPolicy,
    Policy(Arc<MtaStsPolicy>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedPolicy {
    id: String,
    fetched_at_epoch: u64,
    policy: MtaStsPolicy,
}

impl CachedPolicy {
    fn is_stale(&self) -> bool {
        let fetched_at = UNIX_EPOCH + Duration::from_secs(self.fetched_at_epoch);
        let expires = fetched_at + Duration::from_secs(self.policy.max_age);
        expires <= SystemTime::now()
    }

    fn expires_before(&self, horizon: SystemTime) -> bool {
        let fetched_at = UNIX_EPOCH + Duration::from_secs(self.fetched_at_epoch);
        let expires = fetched_at + Duration::from_secs(self.policy.max_age);
        expires <= horizon
    }
}

pub trait Get: Sync + Send {
    fn http_get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<String>>;
}

/// Fetches policy bodies over HTTPS, honoring RFC 8461 3.3's "no redirects,
/// text/plain only" requirements.
pub struct HttpsGetter {
    timeout: Duration,
}

impl Default for HttpsGetter {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
        }
    }
}

impl Get for HttpsGetter {
    fn http_get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let response = reqwest::Client::builder()
                // https://datatracker.ietf.org/doc/html/rfc8461#section-3.3
                .redirect(reqwest::redirect::Policy::none())
                .timeout(self.timeout)
                .build()?
                .request(reqwest::Method::GET, url)
                .send()
                .await?;

            let status = response.status();
            if status != reqwest::StatusCode::OK {
                anyhow::bail!("failed to GET {url}: {status}");
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .ok_or_else(|| anyhow::anyhow!("missing required Content-Type header"))?;
            let content_type = content_type.to_str()?;
            let ct = content_type
                .split_once(';')
                .map(|(ct, _)| ct.trim())
                .unwrap_or_else(|| content_type.trim());
            if ct != "text/plain" {
                anyhow::bail!("Content-Type must be text/plain, got {content_type}");
            }

            Ok(response.text().await?)
        })
    }
}

/// Per-domain MTA-STS policy cache, with optional on-disk persistence.
pub struct MtaStsCache {
    entries: RwLock<HashMap<String, CachedPolicy>>,
    persist_dir: Option<PathBuf>,
}

impl MtaStsCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            persist_dir: None,
        }
    }

    /// Enables on-disk persistence: each domain's cache entry lives in its
    /// own file under `dir`, named by the domain string, written via a
    /// tempfile-then-rename so a crash never leaves a half-written entry.
    pub fn with_persist_dir(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut cache = Self {
            entries: RwLock::new(HashMap::new()),
            persist_dir: Some(dir.clone()),
        };
        cache.load_persisted()?;
        Ok(cache)
    }

    fn load_persisted(&mut self) -> anyhow::Result<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let mut entries = self.entries.write();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let domain = entry.file_name().to_string_lossy().to_string();
            match std::fs::read(entry.path())
                .map_err(anyhow::Error::from)
                .and_then(|data| Ok(serde_json::from_slice::<CachedPolicy>(&data)?))
            {
                Ok(cached) => {
                    entries.insert(domain, cached);
                }
                Err(err) => {
                    tracing::warn!("discarding corrupt MTA-STS cache entry {domain}: {err:#}");
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    fn persist(&self, domain: &str, cached: &CachedPolicy) -> anyhow::Result<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(cached)?;
        write_atomic(dir, domain, &data)
    }

    /// Resolves the applicable policy for `policy_domain`, following this
    /// cache's semantics: serves a non-stale cached entry unchanged, refetches on
    /// policy-id change, and falls back to a stale cached entry when a fresh
    /// lookup fails transiently.
    pub async fn get_policy_for_domain(
        &self,
        policy_domain: &str,
        resolver: &dyn Resolver,
        getter: &dyn Get,
    ) -> Result<PolicyLookup, PolicyError> {
        let cached = self.entries.read().get(policy_domain).cloned();

        let record = match dns::resolve_dns_record(policy_domain, resolver).await {
            Ok(record) => Some(record),
            Err(err) => {
                if let Some(cached) = &cached {
                    if !cached.is_stale() {
                        tracing::debug!(
                            "TXT lookup for {policy_domain} failed ({err:#}); \
                             serving non-stale cached policy"
                        );
                        return Ok(PolicyLookup::Policy(Arc::new(cached.policy.clone())));
                    }
                }
                None
            }
        };

        let record = match record {
            Some(record) => record,
            None => {
                return match cached {
                    Some(_) => Err(PolicyError::Temporary {
                        domain: policy_domain.to_string(),
                        reason: "TXT lookup failed and no usable cached policy".to_string(),
                    }),
                    None => Ok(PolicyLookup::NoPolicy),
                };
            }
        };

        if let Some(cached) = &cached {
            if cached.id == record.id && !cached.is_stale() {
                return Ok(PolicyLookup::Policy(Arc::new(cached.policy.clone())));
            }
        }

        match policy::load_policy_for_domain(policy_domain, getter).await {
            Ok(policy) => {
                let cached = CachedPolicy {
                    id: record.id,
                    fetched_at_epoch: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                    policy,
                };
                if let Err(err) = self.persist(policy_domain, &cached) {
                    tracing::warn!("failed to persist MTA-STS policy for {policy_domain}: {err:#}");
                }
                let policy = Arc::new(cached.policy.clone());
                self.entries.write().insert(policy_domain.to_string(), cached);
                Ok(PolicyLookup::Policy(policy))
            }
            Err(err) => {
                if let Some(cached) = cached {
                    tracing::warn!(
                        "HTTPS fetch of MTA-STS policy for {policy_domain} failed ({err:#}); \
                         serving cached policy"
                    );
                    return Ok(PolicyLookup::Policy(Arc::new(cached.policy)));
                }
                Err(PolicyError::Temporary {
                    domain: policy_domain.to_string(),
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    /// Refreshes every cache entry whose remaining lifetime is under
    /// `REFRESH_EAGERNESS`. Intended to be called from a periodic task at
    /// `REFRESH_INTERVAL`.
    pub async fn refresh_stale_entries(&self, resolver: &dyn Resolver, getter: &dyn Get) {
        let horizon = SystemTime::now() + REFRESH_EAGERNESS;
        let domains: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, cached)| cached.expires_before(horizon))
            .map(|(domain, _)| domain.clone())
            .collect();

        for domain in domains {
            if let Err(err) = self.get_policy_for_domain(&domain, resolver, getter).await {
                tracing::warn!("MTA-STS refresh for {domain} failed: {err}");
            }
        }
    }

    /// Spawns a background task that calls [`Self::refresh_stale_entries`]
    /// every [`REFRESH_INTERVAL`] until the returned handle is aborted.
    pub fn spawn_refresher(
        cache: Arc<Self>,
        resolver: Arc<dyn Resolver>,
        getter: Arc<dyn Get>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.refresh_stale_entries(&*resolver, &*getter).await;
            }
        })
    }
}

impl Default for MtaStsCache {
    fn default() -> Self {
        Self::new()
    }
}

fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.persist(dir.join(name))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use dns_resolver::TestResolver;

    struct TestGetter {
        policies: std::collections::BTreeMap<&'static str, &'static str>,
    }

    impl Get for TestGetter {
        fn http_get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
            Box::pin(async move {
                match self.policies.get(url) {
                    Some(result) => Ok(result.to_string()),
                    None => anyhow::bail!("404 {url}"),
                }
            })
        }
    }

    const SAMPLE_POLICY: &str =
        "version: STSv1\nmode: enforce\nmx: mail.example.com\nmax_age: 604800";

    #[tokio::test]
    async fn fetch_and_cache() {
        let resolver = TestResolver::default().with_txt(
            "_mta-sts.example.com",
            "v=STSv1; id=20190429T010101;".to_owned(),
        );
        let getter = TestGetter {
            policies: std::collections::BTreeMap::from_iter([(
                "https://mta-sts.example.com/.well-known/mta-sts.txt",
                SAMPLE_POLICY,
            )]),
        };

        let cache = MtaStsCache::new();
        let result = cache
            .get_policy_for_domain("example.com", &resolver, &getter)
            .await
            .unwrap();
        let PolicyLookup::Policy(policy) = result else {
            panic!("expected a policy");
        };
        assert_eq!(policy.mode, policy::PolicyMode::Enforce);

        // Second lookup hits the in-memory cache without needing the
        // getter to be consulted again (same TXT id).
        let result = cache
            .get_policy_for_domain("example.com", &resolver, &getter)
            .await
            .unwrap();
        assert!(matches!(result, PolicyLookup::Policy(_)));
    }

    #[tokio::test]
    async fn no_policy_when_txt_absent() {
        let resolver = TestResolver::default();
        let getter = TestGetter {
            policies: Default::default(),
        };
        let cache = MtaStsCache::new();
        let result = cache
            .get_policy_for_domain("example.com", &resolver, &getter)
            .await
            .unwrap();
        assert!(matches!(result, PolicyLookup::NoPolicy));
    }

    #[tokio::test]
    async fn persists_to_disk() {
        let resolver = TestResolver::default().with_txt(
            "_mta-sts.example.com",
            "v=STSv1; id=1;".to_owned(),
        );
        let getter = TestGetter {
            policies: std::collections::BTreeMap::from_iter([(
                "https://mta-sts.example.com/.well-known/mta-sts.txt",
                SAMPLE_POLICY,
            )]),
        };

        let dir = tempfile::tempdir().unwrap();
        let cache = MtaStsCache::with_persist_dir(dir.path()).unwrap();
        cache
            .get_policy_for_domain("example.com", &resolver, &getter)
            .await
            .unwrap();
        assert!(dir.path().join("example.com").exists());

        let reloaded = MtaStsCache::with_persist_dir(dir.path()).unwrap();
        let result = reloaded
            .entries
            .read()
            .get("example.com")
            .cloned()
            .unwrap();
        assert_eq!(result.id, "1");
    }
}
