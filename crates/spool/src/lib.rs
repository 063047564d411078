use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

pub mod local_disk;
pub mod spool_id;

pub use spool_id::SpoolId;

/// One id surfaced by [`Spool::enumerate`]'s startup scan.
#[derive(Debug)]
pub enum SpoolEntry {
    Item(SpoolId),
    Corrupt { id: SpoolId, error: String },
}

/// A complete on-disk triplet as returned by [`Spool::read`]: metadata,
/// header, body, in that order (the order they were written in reverse).
pub struct Triplet {
    pub meta: Vec<u8>,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Spool: Send + Sync {
    /// Writes header, then body, then metadata, in that order, so that a
    /// crash mid-write never leaves a triplet with metadata but no body.
    /// Any failure removes whichever sibling files were already created.
    async fn put(&self, id: SpoolId, header: &[u8], body: &[u8], meta: &[u8]) -> anyhow::Result<()>;

    /// Overwrites the metadata file for an existing triplet in place
    /// (atomically, via temp-file-then-rename).
    async fn update_meta(&self, id: SpoolId, meta: &[u8]) -> anyhow::Result<()>;

    /// Reads the full triplet for `id`.
    async fn read(&self, id: SpoolId) -> anyhow::Result<Triplet>;

    /// Removes a triplet's files, in header/body/meta order.
    async fn delete(&self, id: SpoolId) -> anyhow::Result<()>;

    /// Scans the spool directory for complete triplets, sending one
    /// [`SpoolEntry`] per id found. A `.meta` file with a missing
    /// `.header` or `.body` sibling (or the reverse) is dangling and is
    /// removed rather than surfaced. The scan order is unspecified.
    fn enumerate(&self, sender: Sender<SpoolEntry>) -> anyhow::Result<()>;

    /// Removes any dangling partial triplets left over from a prior crash.
    async fn cleanup(&self) -> anyhow::Result<()>;
}
