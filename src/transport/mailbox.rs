//! IMAP-mailbox-backed [`BlobTransport`] binding (`spec.md` §4.1/§6),
//! grounded in `original_source/imap.py`'s `ImapCommSession`/
//! `Imap4CommServer`/`Imap4CommClient`.
//!
//! A real IMAP session (TLS handshake, `LOGIN`, `SEARCH`, `FETCH`, `APPEND`,
//! `STORE \Deleted` + `EXPUNGE`) is out of this crate's scope — per
//! `spec.md` §1 it is an external collaborator, specified only by the
//! behavior it must produce. [`MailboxClient`] is that collaborator's
//! interface; a real binding (e.g. backed by the `imap` crate) implements
//! it, and [`ImapTransport`] does the rest: subject/body encoding, blob
//! metadata round-tripping, and capability-record bookkeeping.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;

use crate::ids::Recipient;

use super::{BlobFilter, BlobMeta, BlobTransport};

const SUFFIX_EMAIL: &str = "@remoteconanywhere.com";
const CAPABILITY_PREFIX: &str = "Capabilities-";
const CAPABILITY_SUFFIX: &str = "-K";
const DATA_SEARCH_TERM: &str = "-Message-";

/// The IMAP operations [`ImapTransport`] needs from a live mailbox
/// connection. Kept deliberately narrow so any IMAP client library can
/// satisfy it with a thin adapter.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Logs in (or re-authenticates) and selects the working mailbox.
    async fn login(&self) -> Result<()>;

    /// A cheap round trip used to detect a dead connection before a real
    /// operation; callers re-[`login`](MailboxClient::login) on failure.
    async fn noop(&self) -> Result<()>;

    /// Appends a new message with the given `Subject` and plain-text body,
    /// returning the server-assigned uid.
    async fn append(&self, subject: &str, body: &str) -> Result<String>;

    /// Returns the native uids of all non-deleted messages whose `Subject`
    /// header contains `subject_contains`.
    async fn search(&self, subject_contains: &str) -> Result<Vec<String>>;

    /// Fetches a message's `Subject` header and plain-text body.
    async fn fetch(&self, uid: &str) -> Result<Option<(String, String)>>;

    /// Marks a message `\Deleted` and expunges it.
    async fn delete(&self, uid: &str) -> Result<()>;
}

fn data_subject(sender: &str, recipient: &str, sid: u64, seq: u64) -> String {
    format!("{sender}-{sid}-{recipient}-Message-{seq}th")
}

fn parse_data_subject(subject: &str) -> Option<(String, u64, String, u64)> {
    let rest = subject.strip_suffix("th")?;
    let (head, seq) = rest.rsplit_once(DATA_SEARCH_TERM)?;
    let seq: u64 = seq.parse().ok()?;
    let mut parts = head.splitn(3, '-');
    let sender = parts.next()?.to_string();
    let sid: u64 = parts.next()?.parse().ok()?;
    let recipient = parts.next()?.to_string();
    Some((sender, sid, recipient, seq))
}

fn capability_subject(rid: &str) -> String {
    format!("{CAPABILITY_PREFIX}{rid}{CAPABILITY_SUFFIX}")
}

fn parse_capability_subject(subject: &str) -> Option<&str> {
    subject
        .strip_prefix(CAPABILITY_PREFIX)?
        .strip_suffix(CAPABILITY_SUFFIX)
}

/// A [`BlobTransport`] built on top of a [`MailboxClient`].
pub struct ImapTransport {
    client: std::sync::Arc<dyn MailboxClient>,
    poll_interval: Duration,
    seen_broadcasts: Mutex<HashSet<String>>,
}

impl ImapTransport {
    pub fn new(client: std::sync::Arc<dyn MailboxClient>) -> Self {
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

    /// Checks the connection with a cheap `noop`, reconnecting on failure.
    /// Mirrors the Python `imapclient` property's "test then lazily
    /// reconnect" pattern, and doubles as the `RESTART_AFTER` renewal point
    /// since a real [`MailboxClient`] is expected to reconnect internally
    /// once its connection age passes that bound.
    async fn ensure_connected(&self) -> Result<()> {
        if self.client.noop().await.is_err() {
            self.client.login().await?;
        }
        Ok(())
    }

    async fn find_and_delete_capability(&self, rid: &str) -> Result<()> {
        let subject = capability_subject(rid);
        for uid in self.client.search(&subject).await? {
            self.client.delete(&uid).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobTransport for ImapTransport {
    async fn send(
        &self,
        sender: &str,
        recipient: &Recipient,
        sid: u64,
        seq: u64,
        payload: &[u8],
    ) -> Result<String> {
        self.ensure_connected().await?;
        let subject = data_subject(sender, recipient.as_wire_str(), sid, seq);
        let body = base64::engine::general_purpose::STANDARD.encode(payload);
        self.client.append(&subject, &body).await
    }

    async fn list(&self, listener: &str, filter: &BlobFilter) -> Result<Vec<String>> {
        self.ensure_connected().await?;
        let candidates = self.client.search(DATA_SEARCH_TERM).await?;
        let mut seen = self.seen_broadcasts.lock().expect("lock poisoned");
        let mut out = Vec::new();
        for uid in candidates {
            let Some((subject, _body)) = self.client.fetch(&uid).await? else {
                continue;
            };
            let Some((sender, sid, recipient, seq)) = parse_data_subject(&subject) else {
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
            let visible = recipient == Recipient::ANY_LITERAL || recipient == listener;
            if !visible {
                continue;
            }
            if recipient == Recipient::ANY_LITERAL {
                if seen.contains(&uid) {
                    continue;
                }
                seen.insert(uid.clone());
            }
            out.push(uid);
        }
        Ok(out)
    }

    async fn fetch(&self, uid: &str) -> Result<Option<(BlobMeta, Vec<u8>)>> {
        let Some((subject, body)) = self.client.fetch(uid).await? else {
            return Ok(None);
        };
        let Some((sender, sid, recipient, seq)) = parse_data_subject(&subject) else {
            return Ok(None);
        };
        let payload = base64::engine::general_purpose::STANDARD
            .decode(body.trim())
            .unwrap_or_default();
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
        self.client.delete(uid).await
    }

    async fn publish_capabilities(&self, rid: &str, capabilities: &[String]) -> Result<()> {
        self.ensure_connected().await?;
        self.find_and_delete_capability(rid).await?;
        let subject = capability_subject(rid);
        let body = capabilities.join("\n");
        self.client.append(&subject, &body).await?;
        Ok(())
    }

    async fn capabilities(&self, rid: &str) -> Result<Option<Vec<String>>> {
        self.ensure_connected().await?;
        let subject = capability_subject(rid);
        let uids = self.client.search(&subject).await?;
        let Some(uid) = uids.first() else {
            return Ok(None);
        };
        let Some((_subject, body)) = self.client.fetch(uid).await? else {
            return Ok(None);
        };
        Ok(Some(
            body.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect(),
        ))
    }

    async fn list_servers(&self) -> Result<Vec<String>> {
        self.ensure_connected().await?;
        let uids = self.client.search(CAPABILITY_PREFIX).await?;
        let mut out = Vec::new();
        for uid in uids {
            if let Some((subject, _body)) = self.client.fetch(&uid).await? {
                if let Some(rid) = parse_capability_subject(&subject) {
                    out.push(rid.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn retract_capabilities(&self, rid: &str) -> Result<()> {
        self.ensure_connected().await?;
        self.find_and_delete_capability(rid).await
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn name(&self) -> &'static str {
        "imap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_subject_round_trips() {
        let subject = data_subject("alice", "bob", 3, 7);
        assert_eq!(subject, "alice-3-bob-Message-7th");
        assert_eq!(
            parse_data_subject(&subject),
            Some(("alice".to_string(), 3, "bob".to_string(), 7))
        );
    }

    #[test]
    fn capability_subject_round_trips() {
        let subject = capability_subject("server1");
        assert_eq!(subject, "Capabilities-server1-K");
        assert_eq!(parse_capability_subject(&subject), Some("server1"));
    }

    #[test]
    fn suffix_email_is_recognizable() {
        let addr = format!("alice{SUFFIX_EMAIL}");
        assert!(addr.ends_with("@remoteconanywhere.com"));
    }
}
