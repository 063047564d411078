use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use uuid::{Context, Timestamp, Uuid};

/// The node identifier used to seed v1 UUID generation: the MAC address of
/// the first non-loopback interface, falling back to `gethostid()` when
/// none is found.
static NODE_ID: LazyLock<[u8; 6]> = LazyLock::new(|| match mac_address::get_mac_address() {
    Ok(Some(addr)) => addr.bytes(),
    _ => {
        let host_id = unsafe { libc::gethostid() }.to_le_bytes();
        [
            host_id[0], host_id[1], host_id[2], host_id[3], host_id[4], host_id[5],
        ]
    }
});

static CONTEXT: LazyLock<Context> = LazyLock::new(Context::new_random);

fn now_v1() -> Uuid {
    Uuid::now_v1(&*NODE_ID)
}

fn new_v1(ts: Timestamp) -> Uuid {
    Uuid::new_v1(ts, &*NODE_ID)
}

/// Identifies a message within the spool. A v1 UUID so that enumeration and
/// log correlation sort naturally by creation time; rendered in its simple
/// (no-hyphen) hex form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SpoolId(Uuid);

impl std::fmt::Display for SpoolId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.simple().fmt(fmt)
    }
}

impl From<Uuid> for SpoolId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<SpoolId> for String {
    fn from(id: SpoolId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for SpoolId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let uuid = Uuid::parse_str(&s)?;
        Ok(Self(uuid))
    }
}

impl Default for SpoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl SpoolId {
    pub fn new() -> Self {
        Self(now_v1())
    }

    /// The base filename (without extension) for this id's three on-disk
    /// siblings, eg. `{id}.header`/`{id}.body`/`{id}.meta`.
    pub fn header_path(&self, dir: &Path) -> std::path::PathBuf {
        dir.join(format!("{self}.header"))
    }

    pub fn body_path(&self, dir: &Path) -> std::path::PathBuf {
        dir.join(format!("{self}.body"))
    }

    pub fn meta_path(&self, dir: &Path) -> std::path::PathBuf {
        dir.join(format!("{self}.meta"))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(s: &[u8]) -> Option<Self> {
        let uuid = Uuid::from_slice(s).ok()?;
        Some(Self(uuid))
    }

    pub fn from_ascii_bytes(s: &[u8]) -> Option<Self> {
        let uuid = Uuid::try_parse_ascii(s).ok()?;
        Some(Self(uuid))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let uuid = Uuid::parse_str(s).ok()?;
        Some(Self(uuid))
    }

    /// Parses an id back out of a `{id}.header`/`{id}.body`/`{id}.meta`
    /// filename (any of the three extensions, or none).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.split('.').next()?;
        Self::from_str(stem)
    }

    /// Returns time elapsed since the id was created, given the current
    /// timestamp.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let created = self.created();
        now - created
    }

    pub fn created(&self) -> DateTime<Utc> {
        let (seconds, nanos) = self.0.get_timestamp().unwrap().to_unix();
        Utc.timestamp_opt(seconds.try_into().unwrap(), nanos).unwrap()
    }

    /// Assuming that self is a SpoolId received from some other node, this
    /// method produces a new SpoolId with the information from the local
    /// node, but with the timestamp from the source spool id. The intent is
    /// to reduce the chances of having multiple messages with the same
    /// spool id live on a system in the case of a misconfiguration that
    /// produces a loop.
    pub fn derive_new_with_cloned_timestamp(&self) -> Self {
        let ts = self.0.get_timestamp().unwrap();

        let candidate = Self(new_v1(ts));
        if candidate != *self {
            return candidate;
        }

        let (mut seconds, mut subsec_nanos) = ts.to_gregorian();
        loop {
            let (counter, secs, nanos) =
                CONTEXT.generate_timestamp_sequence(seconds, subsec_nanos.into());
            seconds = secs;
            subsec_nanos = nanos as u16;

            let ts = Timestamp::from_unix_time(
                seconds,
                subsec_nanos.into(),
                counter.into(),
                CONTEXT.usable_bits() as u8,
            );

            let candidate = Self(new_v1(ts));
            if candidate != *self {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_file_name() {
        let id = SpoolId::new();
        let path = id.header_path(Path::new("/spool"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(SpoolId::from_file_name(name), Some(id));
    }

    #[test]
    fn roundtrip_bytes() {
        let id = SpoolId::new();
        let bytes = id.as_bytes();
        let id2 = SpoolId::from_slice(bytes.as_slice()).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn distinct_derived_timestamp() {
        let id = SpoolId::new();
        let derived = id.derive_new_with_cloned_timestamp();
        assert_ne!(id, derived);
        assert_eq!(id.created(), derived.created());
    }
}
