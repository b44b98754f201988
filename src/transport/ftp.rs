//! FTP-directory-backed [`BlobTransport`] binding (`spec.md` §4.1/§6).
//!
//! Reuses the filesystem naming schema (`"{sender},{recipient},{sid},{seq}.bin"`,
//! `"{rid}.capa"`) against a remote directory listing, the same way the
//! reference project layers `folder.py`'s schema over different carriers.
//! A real FTP session (`STOR`, `NLST`, `RETR`, `DELE`) is an external
//! collaborator per `spec.md` §1; [`FtpClient`] is that collaborator's
//! interface.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::ids::Recipient;

use super::{BlobFilter, BlobMeta, BlobTransport};

const ANY: &str = "ANY";

/// The FTP operations [`FtpTransport`] needs from a live session. A real
/// binding (e.g. backed by the `suppaftp` crate) implements this against
/// one remote directory.
#[async_trait]
pub trait FtpClient: Send + Sync {
    /// Uploads `data` atomically under `name` (e.g. `STOR` to a temp name
    /// then `RNFR`/`RNTO`, mirroring [`crate::transport::folder`]'s
    /// rename-based atomicity rule).
    async fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Lists entry names in the working directory.
    async fn list(&self) -> Result<Vec<String>>;

    /// Downloads the named entry, or `Ok(None)` if it no longer exists.
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Deletes the named entry. Idempotent: deleting a missing entry is not
    /// an error.
    async fn remove(&self, name: &str) -> Result<()>;
}

fn blob_name(sender: &str, recipient: &str, sid: u64, seq: u64) -> String {
    format!("{sender},{recipient},{sid},{seq}.bin")
}

fn parse_blob_name(name: &str) -> Option<(String, String, u64, u64)> {
    let stem = name.strip_suffix(".bin")?;
    let mut parts = stem.splitn(4, ',');
    let sender = parts.next()?.to_string();
    let recipient = parts.next()?.to_string();
    let sid: u64 = parts.next()?.parse().ok()?;
    let seq: u64 = parts.next()?.parse().ok()?;
    Some((sender, recipient, sid, seq))
}

/// A [`BlobTransport`] built on top of an [`FtpClient`], naming blobs the
/// same way [`crate::transport::folder::FolderTransport`] does.
pub struct FtpTransport {
    client: std::sync::Arc<dyn FtpClient>,
    poll_interval: Duration,
    seen_broadcasts: Mutex<HashSet<String>>,
}

impl FtpTransport {
    pub fn new(client: std::sync::Arc<dyn FtpClient>) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(2),
            seen_broadcasts: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl BlobTransport for FtpTransport {
    async fn send(
        &self,
        sender: &str,
        recipient: &Recipient,
        sid: u64,
        seq: u64,
        payload: &[u8],
    ) -> Result<String> {
        let name = blob_name(sender, recipient.as_wire_str(), sid, seq);
        self.client.put(&name, payload).await?;
        Ok(name)
    }

    async fn list(&self, listener: &str, filter: &BlobFilter) -> Result<Vec<String>> {
        let mut seen = self.seen_broadcasts.lock().expect("lock poisoned");
        let mut out = Vec::new();
        for name in self.client.list().await? {
            let Some((sender, recipient, sid, seq)) = parse_blob_name(&name) else {
                continue;
            };
            if let Some(want) = &filter.sender {
                if &sender != want {
                    continue;
                }
            }
            if let Some(want) = &filter.recipient {
                if &recipient != want {
                    continue;
                }
            }
            if let Some(want) = filter.sid {
                if sid != want {
                    continue;
                }
            }
            if let Some(want) = filter.seq {
                if seq != want {
                    continue;
                }
            }
            let visible = recipient == ANY || recipient == listener;
            if !visible {
                continue;
            }
            if recipient == ANY {
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
        let Some((sender, recipient, sid, seq)) = parse_blob_name(uid) else {
            return Ok(None);
        };
        let Some(payload) = self.client.get(uid).await? else {
            return Ok(None);
        };
        Ok(Some((
            BlobMeta {
                sender,
                recipient: Recipient::from(recipient),
                sid,
                seq,
            },
            payload,
        )))
    }

    async fn delete(&self, uid: &str) -> Result<()> {
        self.client.remove(uid).await
    }

    async fn publish_capabilities(&self, rid: &str, capabilities: &[String]) -> Result<()> {
        let name = format!("{rid}.capa");
        self.client.put(&name, capabilities.join("\n").as_bytes()).await
    }

    async fn capabilities(&self, rid: &str) -> Result<Option<Vec<String>>> {
        let name = format!("{rid}.capa");
        let Some(body) = self.client.get(&name).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&body);
        Ok(Some(
            text.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect(),
        ))
    }

    async fn list_servers(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for name in self.client.list().await? {
            if let Some(rid) = name.strip_suffix(".capa") {
                out.push(rid.to_string());
            }
        }
        Ok(out)
    }

    async fn retract_capabilities(&self, rid: &str) -> Result<()> {
        self.client.remove(&format!("{rid}.capa")).await
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn name(&self) -> &'static str {
        "ftp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeFtp {
        files: AsyncMutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    impl FakeFtp {
        fn new() -> Self {
            Self {
                files: AsyncMutex::new(std::collections::HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl FtpClient for FakeFtp {
        async fn put(&self, name: &str, data: &[u8]) -> Result<()> {
            self.files.lock().await.insert(name.to_string(), data.to_vec());
            Ok(())
        }

        async fn list(&self) -> Result<Vec<String>> {
            Ok(self.files.lock().await.keys().cloned().collect())
        }

        async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.files.lock().await.get(name).cloned())
        }

        async fn remove(&self, name: &str) -> Result<()> {
            self.files.lock().await.remove(name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_then_fetch_round_trips() {
        let transport = FtpTransport::new(std::sync::Arc::new(FakeFtp::new()));
        let uid = transport
            .send("alice", &Recipient::from("bob"), 1, 0, b"hello")
            .await
            .unwrap();
        let (meta, payload) = transport.fetch(&uid).await.unwrap().unwrap();
        assert_eq!(meta.sender, "alice");
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn capability_round_trip() {
        let transport = FtpTransport::new(std::sync::Arc::new(FakeFtp::new()));
        transport
            .publish_capabilities("server1", &["socks4".into()])
            .await
            .unwrap();
        assert_eq!(
            transport.capabilities("server1").await.unwrap(),
            Some(vec!["socks4".to_string()])
        );
        assert_eq!(transport.list_servers().await.unwrap(), vec!["server1".to_string()]);
    }
}
