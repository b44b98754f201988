//! Filesystem-backed [`BlobTransport`] binding — the reference
//! implementation (`spec.md` §4.1/§6), grounded in
//! `original_source/folder.py`'s `FolderCommunicationSession`/
//! `FolderCommServer`/`FolderCommClient`.
//!
//! Naming schema is exactly `"{sender},{recipient},{sid},{seq}.bin"` for a
//! data blob and `"{rid}.capa"` for a capability record, all living flat in
//! one shared root directory (the Python original supports distinct
//! reception/emission folders; this binding is used symmetrically by both
//! peers against the same directory, which is the common case and the one
//! every example launcher in the original project actually exercises).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use crate::ids::Recipient;

use super::{BlobFilter, BlobMeta, BlobTransport};

const ANY: &str = "ANY";

/// A shared directory used as a symmetric named-blob channel.
pub struct FolderTransport {
    root: PathBuf,
    poll_interval: Duration,
    broadcast_ttl: Duration,
    /// Broadcast uids this process has already returned from `list`, so a
    /// lister never re-processes the same `ANY` blob twice (`spec.md` §4.1:
    /// "a lister MUST NOT delete [a broadcast blob]; it MUST record the uid
    /// to avoid re-processing").
    seen_broadcasts: Mutex<HashSet<String>>,
}

impl FolderTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: Duration::from_millis(100),
            broadcast_ttl: Duration::from_secs(24 * 3600),
            seen_broadcasts: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_broadcast_ttl(mut self, ttl: Duration) -> Self {
        self.broadcast_ttl = ttl;
        self
    }

    fn blob_path(&self, uid: &str) -> PathBuf {
        self.root.join(uid)
    }

    fn capa_path(&self, rid: &str) -> PathBuf {
        self.root.join(format!("{rid}.capa"))
    }

    async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating transport root {:?}", self.root))
    }

    /// Spawns the broadcast GC reaper task, deleting `ANY` blobs older than
    /// `broadcast_ttl` (the resolution to the broadcast-growth open question,
    /// `spec.md` §9/SPEC_FULL.md §4.1).
    pub fn spawn_reaper(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.broadcast_ttl / 4).await;
                if let Err(err) = self.reap_expired_broadcasts().await {
                    warn!("broadcast reaper failed: {err:#}");
                }
            }
        })
    }

    async fn reap_expired_broadcasts(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.root).await?;
        let now = SystemTime::now();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(fields) = parse_blob_name(&name) else {
                continue;
            };
            if fields.recipient != ANY {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() > self.broadcast_ttl {
                let path = entry.path();
                if fs::remove_file(&path).await.is_ok() {
                    debug!("reaped expired broadcast blob {:?}", path);
                }
            }
        }
        Ok(())
    }
}

struct BlobNameFields<'a> {
    sender: &'a str,
    recipient: &'a str,
    sid: u64,
    seq: u64,
}

fn blob_name(sender: &str, recipient: &str, sid: u64, seq: u64) -> String {
    format!("{sender},{recipient},{sid},{seq}.bin")
}

fn parse_blob_name(name: &str) -> Option<BlobNameFields<'_>> {
    let stem = name.strip_suffix(".bin")?;
    let mut parts = stem.splitn(4, ',');
    let sender = parts.next()?;
    let recipient = parts.next()?;
    let sid: u64 = parts.next()?.parse().ok()?;
    let seq: u64 = parts.next()?.parse().ok()?;
    Some(BlobNameFields {
        sender,
        recipient,
        sid,
        seq,
    })
}

#[async_trait]
impl BlobTransport for FolderTransport {
    async fn send(
        &self,
        sender: &str,
        recipient: &Recipient,
        sid: u64,
        seq: u64,
        payload: &[u8],
    ) -> Result<String> {
        self.ensure_root().await?;
        let uid = blob_name(sender, recipient.as_wire_str(), sid, seq);
        let final_path = self.root.join(&uid);
        let tmp_path = self.root.join(format!(".{uid}.tmp"));
        fs::write(&tmp_path, payload)
            .await
            .with_context(|| format!("writing temp blob {:?}", tmp_path))?;
        fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("renaming blob into place: {:?}", final_path))?;
        Ok(uid)
    }

    async fn list(&self, listener: &str, filter: &BlobFilter) -> Result<Vec<String>> {
        self.ensure_root().await?;
        let mut entries = fs::read_dir(&self.root).await?;
        let mut out = Vec::new();
        let mut seen = self.seen_broadcasts.lock().expect("lock poisoned");
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            let Some(fields) = parse_blob_name(&name) else {
                continue;
            };
            if let Some(want) = &filter.sender {
                if fields.sender != want {
                    continue;
                }
            }
            if let Some(want) = &filter.recipient {
                if fields.recipient != want {
                    continue;
                }
            }
            if let Some(want) = filter.sid {
                if fields.sid != want {
                    continue;
                }
            }
            if let Some(want) = filter.seq {
                if fields.seq != want {
                    continue;
                }
            }
            let visible = if fields.recipient == ANY {
                true
            } else {
                fields.recipient == listener
            };
            if !visible {
                continue;
            }
            if fields.recipient == ANY {
                if seen.contains(&name) {
                    continue;
                }
                seen.insert(name.clone());
            }
            out.push(name);
        }
        Ok(out)
    }

    async fn fetch(&self, uid: &str) -> Result<Option<(BlobMeta, Vec<u8>)>> {
        let Some(fields) = parse_blob_name(uid) else {
            return Ok(None);
        };
        let path = self.blob_path(uid);
        match fs::read(&path).await {
            Ok(payload) => Ok(Some((
                BlobMeta {
                    sender: fields.sender.to_string(),
                    recipient: Recipient::from(fields.recipient),
                    sid: fields.sid,
                    seq: fields.seq,
                },
                payload,
            ))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("fetching blob {:?}", path)),
        }
    }

    async fn delete(&self, uid: &str) -> Result<()> {
        let path = self.blob_path(uid);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("deleting blob {:?}", path)),
        }
    }

    async fn publish_capabilities(&self, rid: &str, capabilities: &[String]) -> Result<()> {
        self.ensure_root().await?;
        let body = capabilities.join("\n");
        let path = self.capa_path(rid);
        let tmp = self.root.join(format!(".{rid}.capa.tmp"));
        fs::write(&tmp, body.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn capabilities(&self, rid: &str) -> Result<Option<Vec<String>>> {
        match fs::read_to_string(self.capa_path(rid)).await {
            Ok(body) => Ok(Some(
                body.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect(),
            )),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_servers(&self) -> Result<Vec<String>> {
        self.ensure_root().await?;
        let mut entries = fs::read_dir(&self.root).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rid) = name.strip_suffix(".capa") {
                out.push(rid.to_string());
            }
        }
        Ok(out)
    }

    async fn retract_capabilities(&self, rid: &str) -> Result<()> {
        match fs::remove_file(self.capa_path(rid)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn name(&self) -> &'static str {
        "folder"
    }
}

/// Joins `root`/`uid`, exposed for tests that want to poke at blob files
/// directly without reaching into [`FolderTransport`]'s private fields.
#[cfg(test)]
pub(crate) fn blob_path_for_test(root: &Path, uid: &str) -> PathBuf {
    root.join(uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn send_then_fetch_round_trips_payload() {
        let dir = tempdir().unwrap();
        let transport = FolderTransport::new(dir.path());
        let uid = transport
            .send("alice", &Recipient::from("bob"), 1, 0, b"hello")
            .await
            .unwrap();
        let (meta, payload) = transport.fetch(&uid).await.unwrap().unwrap();
        assert_eq!(meta.sender, "alice");
        assert_eq!(meta.recipient, Recipient::from("bob"));
        assert_eq!(meta.sid, 1);
        assert_eq!(meta.seq, 0);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn list_only_returns_blobs_visible_to_listener() {
        let dir = tempdir().unwrap();
        let transport = FolderTransport::new(dir.path());
        transport
            .send("alice", &Recipient::from("bob"), 1, 0, b"x")
            .await
            .unwrap();
        transport
            .send("alice", &Recipient::from("carol"), 1, 0, b"y")
            .await
            .unwrap();

        let bob_view = transport.list("bob", &BlobFilter::new()).await.unwrap();
        assert_eq!(bob_view.len(), 1);
        let carol_view = transport.list("carol", &BlobFilter::new()).await.unwrap();
        assert_eq!(carol_view.len(), 1);
    }

    #[tokio::test]
    async fn broadcast_blob_is_never_deleted_by_list_but_not_reprocessed() {
        let dir = tempdir().unwrap();
        let transport = FolderTransport::new(dir.path());
        transport
            .send("alice", &Recipient::Any, 0, 0, b"hi everyone")
            .await
            .unwrap();

        let first = transport.list("bob", &BlobFilter::new()).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = transport.list("bob", &BlobFilter::new()).await.unwrap();
        assert!(second.is_empty(), "broadcast blob should not be re-listed to the same listener");

        // A different listener still sees it, and the file itself survives.
        let carol_sees_it = transport.list("carol", &BlobFilter::new()).await.unwrap();
        assert_eq!(carol_sees_it.len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let transport = FolderTransport::new(dir.path());
        let uid = transport
            .send("alice", &Recipient::from("bob"), 1, 0, b"x")
            .await
            .unwrap();
        transport.delete(&uid).await.unwrap();
        transport.delete(&uid).await.unwrap();
        assert!(transport.fetch(&uid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn capability_publish_list_retract_round_trip() {
        let dir = tempdir().unwrap();
        let transport = FolderTransport::new(dir.path());
        transport
            .publish_capabilities("server1", &["socks4".into(), "socks5".into()])
            .await
            .unwrap();
        assert_eq!(transport.list_servers().await.unwrap(), vec!["server1".to_string()]);
        assert_eq!(
            transport.capabilities("server1").await.unwrap(),
            Some(vec!["socks4".to_string(), "socks5".to_string()])
        );
        transport.retract_capabilities("server1").await.unwrap();
        assert!(transport.capabilities("server1").await.unwrap().is_none());
        assert!(transport.list_servers().await.unwrap().is_empty());
    }
}
