//! Blob transport abstraction (C1, `spec.md` §4.1).
//!
//! A symmetric named-blob store: peers write blobs tagged with sender,
//! recipient, session id and sequence number, and list/fetch/delete them by
//! those tags. Concrete bindings (folder, IMAP, FTP) all implement
//! [`BlobTransport`]; the session and peer layers above never see binding
//! details, mirroring the teacher's `IpcTransport` abstraction over its
//! UDS/SHM/TCP/PMQ mechanisms.

pub mod folder;
pub mod ftp;
pub mod mailbox;

pub use folder::FolderTransport;
pub use ftp::FtpTransport;
pub use mailbox::ImapTransport;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::Recipient;

/// Metadata carried by a blob, independent of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub sender: String,
    pub recipient: Recipient,
    pub sid: u64,
    pub seq: u64,
}

/// A listing/fetch filter. `None` fields match any value.
#[derive(Debug, Clone, Default)]
pub struct BlobFilter {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub sid: Option<u64>,
    pub seq: Option<u64>,
}

impl BlobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn sid(mut self, sid: u64) -> Self {
        self.sid = Some(sid);
        self
    }

    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }
}

/// A symmetric named-blob channel. Every binding (filesystem, IMAP, FTP)
/// implements the same contract so the session/peer layers are carrier
/// agnostic.
///
/// Failure semantics (`spec.md` §4.1): list/fetch/delete failures are
/// retried by the caller's poll loop; a fetch racing a delete returns "not
/// found" and is ignored by the caller; delete is idempotent so spurious
/// duplicate listings never error.
#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Writes a blob atomically and returns its unique retrieval token.
    async fn send(
        &self,
        sender: &str,
        recipient: &Recipient,
        sid: u64,
        seq: u64,
        payload: &[u8],
    ) -> Result<String>;

    /// Lists uids of blobs matching `filter`, visible to `listener`
    /// (a broadcast blob is visible to everyone; a unicast blob only to its
    /// named recipient).
    async fn list(&self, listener: &str, filter: &BlobFilter) -> Result<Vec<String>>;

    /// Fetches a previously listed blob without removing it. Returns `Ok(None)`
    /// if the blob no longer exists (raced a delete).
    async fn fetch(&self, uid: &str) -> Result<Option<(BlobMeta, Vec<u8>)>>;

    /// Removes a blob. Idempotent: deleting an already-deleted uid is not
    /// an error. Callers must not call this for broadcast blobs they don't
    /// own; the reaper task is responsible for those (see [`FolderTransport`]).
    async fn delete(&self, uid: &str) -> Result<()>;

    /// Publishes (overwriting) the capability record for `rid`.
    async fn publish_capabilities(&self, rid: &str, capabilities: &[String]) -> Result<()>;

    /// Reads the capability record for `rid`, if one is currently published.
    async fn capabilities(&self, rid: &str) -> Result<Option<Vec<String>>>;

    /// Lists the `rid`s with a currently published capability record.
    async fn list_servers(&self) -> Result<Vec<String>>;

    /// Removes the capability record for `rid` (graceful server stop).
    async fn retract_capabilities(&self, rid: &str) -> Result<()>;

    /// The poll interval callers should sleep between list attempts.
    fn poll_interval(&self) -> Duration;

    /// A short name for this binding, used in logs (`"folder"`, `"imap"`, `"ftp"`).
    fn name(&self) -> &'static str;
}

/// Which concrete binding to construct, and its connection parameters.
///
/// Mirrors the teacher's `TransportConfig`: a flat, serde-able struct a CLI
/// or config file can populate directly, consumed by [`TransportFactory`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportKind {
    Folder {
        root: std::path::PathBuf,
        #[serde(default)]
        poll_interval_ms: Option<u64>,
        #[serde(default)]
        broadcast_ttl_secs: Option<u64>,
    },
    Imap {
        host: String,
        port: u16,
        username: String,
        #[serde(default)]
        poll_interval_secs: Option<u64>,
    },
    Ftp {
        host: String,
        port: u16,
        username: String,
        root: String,
        #[serde(default)]
        poll_interval_secs: Option<u64>,
    },
}

/// Constructs a boxed [`BlobTransport`] for a [`TransportKind`], mirroring
/// the teacher's `TransportFactory::create`.
pub struct TransportFactory;

impl TransportFactory {
    pub fn create(kind: &TransportKind) -> Result<Box<dyn BlobTransport>> {
        match kind {
            TransportKind::Folder {
                root,
                poll_interval_ms,
                broadcast_ttl_secs,
            } => {
                let mut transport = FolderTransport::new(root.clone());
                if let Some(ms) = poll_interval_ms {
                    transport = transport.with_poll_interval(Duration::from_millis(*ms));
                }
                if let Some(secs) = broadcast_ttl_secs {
                    transport = transport.with_broadcast_ttl(Duration::from_secs(*secs));
                }
                Ok(Box::new(transport))
            }
            TransportKind::Imap { .. } => Err(anyhow::anyhow!(
                "imap transport requires a MailboxClient; construct ImapTransport directly"
            )),
            TransportKind::Ftp { .. } => Err(anyhow::anyhow!(
                "ftp transport requires an FtpClient; construct FtpTransport directly"
            )),
        }
    }
}
