use crate::{Spool, SpoolEntry, SpoolId, Triplet};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::mpsc::Sender;

/// A single flat directory holding `{id}.header`/`{id}.body`/`{id}.meta`
/// triplets, guarded by a pid-locked `lock` file so that only one process
/// ever owns a given spool directory at a time.
pub struct LocalDiskSpool {
    path: PathBuf,
    flush: bool,
    _pid_file: File,
}

impl LocalDiskSpool {
    pub fn new(path: &Path, flush: bool) -> anyhow::Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("creating spool directory {path:?}"))?;
        let _pid_file = lock_pid_file(path.join("lock"))?;

        Ok(Self {
            path: path.to_path_buf(),
            flush,
            _pid_file,
        })
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> anyhow::Result<()> {
        let mut temp = NamedTempFile::new_in(&self.path)
            .with_context(|| format!("failed to create a temporary file to write {path:?}"))?;
        temp.write_all(data)
            .with_context(|| format!("failed to write {path:?}"))?;
        if self.flush {
            temp.as_file_mut()
                .sync_data()
                .with_context(|| format!("failed to sync {path:?}"))?;
        }
        temp.persist(path)
            .with_context(|| format!("failed to move temp file into place at {path:?}"))?;
        Ok(())
    }

    /// Removes any triplet whose `.header`/`.body`/`.meta` siblings are
    /// incomplete, returning the ids of the complete triplets that remain.
    fn scan(path: &Path) -> Vec<SpoolId> {
        #[derive(Default)]
        struct Seen {
            header: bool,
            body: bool,
            meta: bool,
        }

        let mut by_id: HashMap<SpoolId, Seen> = HashMap::new();

        for entry in jwalk::WalkDir::new(path).max_depth(1).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((stem, ext)) = name.rsplit_once('.') else {
                continue;
            };
            let Some(id) = SpoolId::from_str(stem) else {
                continue;
            };
            let seen = by_id.entry(id).or_default();
            match ext {
                "header" => seen.header = true,
                "body" => seen.body = true,
                "meta" => seen.meta = true,
                _ => {}
            }
        }

        let mut complete = vec![];
        for (id, seen) in by_id {
            if seen.header && seen.body && seen.meta {
                complete.push(id);
            } else {
                if seen.header {
                    let _ = std::fs::remove_file(id.header_path(path));
                }
                if seen.body {
                    let _ = std::fs::remove_file(id.body_path(path));
                }
                if seen.meta {
                    let _ = std::fs::remove_file(id.meta_path(path));
                }
            }
        }
        complete
    }
}

#[async_trait]
impl Spool for LocalDiskSpool {
    async fn put(&self, id: SpoolId, header: &[u8], body: &[u8], meta: &[u8]) -> anyhow::Result<()> {
        let header_path = id.header_path(&self.path);
        let body_path = id.body_path(&self.path);
        let meta_path = id.meta_path(&self.path);

        if let Err(err) = self.write_atomic(&header_path, header) {
            return Err(err);
        }
        if let Err(err) = self.write_atomic(&body_path, body) {
            let _ = std::fs::remove_file(&header_path);
            return Err(err);
        }
        if let Err(err) = self.write_atomic(&meta_path, meta) {
            let _ = std::fs::remove_file(&header_path);
            let _ = std::fs::remove_file(&body_path);
            return Err(err);
        }
        Ok(())
    }

    async fn update_meta(&self, id: SpoolId, meta: &[u8]) -> anyhow::Result<()> {
        let meta_path = id.meta_path(&self.path);
        self.write_atomic(&meta_path, meta)
    }

    async fn read(&self, id: SpoolId) -> anyhow::Result<Triplet> {
        let header_path = id.header_path(&self.path);
        let body_path = id.body_path(&self.path);
        let meta_path = id.meta_path(&self.path);

        let meta = tokio::fs::read(&meta_path)
            .await
            .with_context(|| format!("failed to read metadata for {id} from {meta_path:?}"))?;
        let header = tokio::fs::read(&header_path)
            .await
            .with_context(|| format!("failed to read header for {id} from {header_path:?}"))?;
        let body = tokio::fs::read(&body_path)
            .await
            .with_context(|| format!("failed to read body for {id} from {body_path:?}"))?;

        Ok(Triplet { meta, header, body })
    }

    async fn delete(&self, id: SpoolId) -> anyhow::Result<()> {
        let header_path = id.header_path(&self.path);
        let body_path = id.body_path(&self.path);
        let meta_path = id.meta_path(&self.path);

        tokio::fs::remove_file(&header_path).await.ok();
        tokio::fs::remove_file(&body_path).await.ok();
        tokio::fs::remove_file(&meta_path)
            .await
            .with_context(|| format!("failed to remove metadata for {id} from {meta_path:?}"))
    }

    fn enumerate(&self, sender: Sender<SpoolEntry>) -> anyhow::Result<()> {
        let path = self.path.clone();
        tokio::task::Builder::new()
            .name("LocalDiskSpool enumerate")
            .spawn_blocking(move || -> anyhow::Result<()> {
                for id in Self::scan(&path) {
                    sender
                        .blocking_send(SpoolEntry::Item(id))
                        .map_err(|err| anyhow::anyhow!("failed to send entry for {id}: {err:#}"))?;
                }
                Ok(())
            })?;
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        let path = self.path.clone();
        tokio::task::Builder::new()
            .name("LocalDiskSpool cleanup")
            .spawn_blocking(move || {
                Self::scan(&path);
            })?
            .await?;
        Ok(())
    }
}

/// Set the sticky bit on path. This prevents tmpwatch from removing the
/// lock file.
pub fn set_sticky_bit(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = path.metadata() {
            let mut perms = metadata.permissions();
            let mode = perms.mode();
            perms.set_mode(mode | libc::S_ISVTX as u32);
            let _ = std::fs::set_permissions(path, perms);
        }
    }

    #[cfg(windows)]
    {
        let _ = path;
    }
}

fn lock_pid_file(pid_file: PathBuf) -> anyhow::Result<std::fs::File> {
    let pid_file_dir = pid_file
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{} has no parent?", pid_file.display()))?;
    std::fs::create_dir_all(pid_file_dir).with_context(|| {
        format!(
            "while creating directory structure: {}",
            pid_file_dir.display()
        )
    })?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&pid_file)
        .with_context(|| format!("opening pid file {}", pid_file.display()))?;
    set_sticky_bit(&pid_file);
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res != 0 {
        let err = std::io::Error::last_os_error();

        let owner = match std::fs::read_to_string(&pid_file) {
            Ok(pid) => format!(". Owned by pid {}.", pid.trim()),
            Err(_) => "".to_string(),
        };

        anyhow::bail!(
            "unable to lock pid file {}: {}{owner}",
            pid_file.display(),
            err
        );
    }

    unsafe { libc::ftruncate(file.as_raw_fd(), 0) };
    writeln!(file, "{}", unsafe { libc::getpid() }).ok();

    Ok(file)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn basic_spool() -> anyhow::Result<()> {
        let location = tempfile::tempdir()?;
        let spool = LocalDiskSpool::new(location.path(), false)?;

        {
            let id1 = SpoolId::new();
            assert!(spool.read(id1).await.is_err());
        }

        let mut ids = vec![];
        for i in 0..100 {
            let id = SpoolId::new();
            spool
                .put(
                    id,
                    format!("header {i}").as_bytes(),
                    format!("body {i}").as_bytes(),
                    format!("{{\"i\":{i}}}").as_bytes(),
                )
                .await?;
            ids.push(id);
        }

        for (i, &id) in ids.iter().enumerate() {
            let triplet = spool.read(id).await?;
            assert_eq!(String::from_utf8(triplet.header)?, format!("header {i}"));
            assert_eq!(String::from_utf8(triplet.body)?, format!("body {i}"));
            assert_eq!(String::from_utf8(triplet.meta)?, format!("{{\"i\":{i}}}"));
        }

        {
            let (tx, mut rx) = tokio::sync::mpsc::channel(32);
            spool.enumerate(tx)?;
            let mut count = 0;

            while let Some(item) = rx.recv().await {
                match item {
                    SpoolEntry::Item(id) => {
                        assert!(ids.contains(&id));
                        spool.delete(id).await?;
                        assert!(spool.read(id).await.is_err());
                        count += 1;
                    }
                    SpoolEntry::Corrupt { id, error } => {
                        anyhow::bail!("Corrupt: {id}: {error}");
                    }
                }
            }

            assert_eq!(count, 100);
        }

        for _ in 0..2 {
            let (tx, mut rx) = tokio::sync::mpsc::channel(32);
            spool.enumerate(tx)?;
            let mut unexpected = vec![];

            while let Some(item) = rx.recv().await {
                match item {
                    SpoolEntry::Item(id) | SpoolEntry::Corrupt { id, .. } => unexpected.push(id),
                }
            }

            assert_eq!(unexpected.len(), 0);
        }

        Ok(())
    }

    #[tokio::test]
    async fn dangling_triplet_is_removed() -> anyhow::Result<()> {
        let location = tempfile::tempdir()?;
        let spool = LocalDiskSpool::new(location.path(), false)?;
        let id = SpoolId::new();

        // Simulate a crash between the header write and the body write:
        // only the header and meta exist, no body.
        tokio::fs::write(id.header_path(location.path()), b"header").await?;
        tokio::fs::write(id.meta_path(location.path()), b"meta").await?;

        let (tx, mut rx) = tokio::sync::mpsc::channel(32);
        spool.enumerate(tx)?;
        assert!(rx.recv().await.is_none());
        assert!(!id.header_path(location.path()).exists());
        assert!(!id.meta_path(location.path()).exists());

        Ok(())
    }
}
