//! Ordered, chunked, bidirectional byte stream over a [`BlobTransport`]
//! (C2, `spec.md` §4.2), grounded in `original_source/communication.py`'s
//! `CommunicationSession`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::defaults::MAX_CHUNK;
use crate::error::TunnelError;
use crate::ids::Recipient;
use crate::sentinel::raw;
use crate::transport::{BlobFilter, BlobTransport};

/// How long [`Session::receive_byte`] sleeps between empty polls while
/// draining a chunk byte-at-a-time (`communication.py`'s `cacheUpdateTime`,
/// defaulted there to `LOOP_SLEEP`).
const CACHE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A bidirectional, ordered byte stream between `me` and `other`, identified
/// by `sid`. Wraps an `Arc`'d transport and interior mutability for the
/// send/receive cursors, so both halves of a bridging loop can hold a `&Session`
/// concurrently (e.g. via `tokio::select!`) without needing a lock of their own.
pub struct Session {
    transport: Arc<dyn BlobTransport>,
    me: String,
    other: String,
    sid: u64,
    send_seq: Mutex<u64>,
    recv_seq: Mutex<u64>,
    byte_cache: Mutex<Option<(Vec<u8>, usize)>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(transport: Arc<dyn BlobTransport>, me: impl Into<String>, other: impl Into<String>, sid: u64) -> Self {
        Self {
            transport,
            me: me.into(),
            other: other.into(),
            sid,
            send_seq: Mutex::new(0),
            recv_seq: Mutex::new(0),
            byte_cache: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn other(&self) -> &str {
        &self.other
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fragments `data` into chunks of at most [`MAX_CHUNK`] bytes and
    /// emits each via the transport with a strictly increasing `seq`.
    /// Serialized per session so concurrent callers don't interleave
    /// sequence numbers; may run concurrently with a receiver.
    pub async fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed(self.sid.to_string()));
        }
        if data.len() <= MAX_CHUNK {
            self.send_unit(data).await
        } else {
            for chunk in data.chunks(MAX_CHUNK) {
                self.send_unit(chunk).await?;
            }
            Ok(())
        }
    }

    async fn send_unit(&self, payload: &[u8]) -> Result<(), TunnelError> {
        let mut seq_guard = self.send_seq.lock().await;
        let seq = *seq_guard;
        debug!(sid = self.sid, seq, bytes = payload.len(), "sending chunk");
        self.transport
            .send(&self.me, &Recipient::from(self.other.as_str()), self.sid, seq, payload)
            .await
            .map_err(|err| TunnelError::Transport(crate::error::TransportError::Transient(err.to_string())))?;
        *seq_guard += 1;
        Ok(())
    }

    /// Sends the close sentinel (unless `silent` or this is the `sid=0`
    /// discovery session) and marks the session closed locally. Idempotent.
    pub async fn close(&self, silent: bool) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Ok(());
        }
        if self.sid != 0 && !silent {
            self.send_unit(raw::CLOSE_SESSION).await?;
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Polls for the next expected chunk. `Ok(Some(vec![]))` means nothing
    /// is available yet (including the degenerate case of a genuine
    /// zero-length payload: both cases leave nothing for the caller to
    /// act on). `Ok(None)` means the close sentinel was just seen, or the
    /// session was already closed locally.
    pub async fn receive_chunk(&self) -> Result<Option<Vec<u8>>, TunnelError> {
        if self.is_closed() {
            return Ok(None);
        }
        let expected = {
            let guard = self.recv_seq.lock().await;
            *guard
        };
        let filter = BlobFilter::new()
            .sender(self.other.clone())
            .recipient(self.me.clone())
            .sid(self.sid)
            .seq(expected);
        let uids = self
            .transport
            .list(&self.me, &filter)
            .await
            .map_err(|err| TunnelError::Transport(crate::error::TransportError::Transient(err.to_string())))?;
        let Some(uid) = uids.into_iter().next() else {
            return Ok(Some(Vec::new()));
        };
        let fetched = self
            .transport
            .fetch(&uid)
            .await
            .map_err(|err| TunnelError::Transport(crate::error::TransportError::Transient(err.to_string())))?;
        let Some((_meta, payload)) = fetched else {
            // Raced a delete; treat as "nothing yet", caller will retry.
            return Ok(Some(Vec::new()));
        };
        self.transport
            .delete(&uid)
            .await
            .map_err(|err| TunnelError::Transport(crate::error::TransportError::Transient(err.to_string())))?;
        {
            let mut guard = self.recv_seq.lock().await;
            *guard += 1;
        }
        if payload == raw::CLOSE_SESSION {
            debug!(sid = self.sid, "received close sentinel");
            self.closed.store(true, Ordering::Release);
            return Ok(None);
        }
        Ok(Some(payload))
    }

    /// True iff a chunk for the next expected `seq` can be fetched without
    /// blocking.
    pub async fn data_available(&self) -> Result<bool, TunnelError> {
        if self.is_closed() {
            return Ok(false);
        }
        let expected = *self.recv_seq.lock().await;
        let filter = BlobFilter::new()
            .sender(self.other.clone())
            .recipient(self.me.clone())
            .sid(self.sid)
            .seq(expected);
        let uids = self
            .transport
            .list(&self.me, &filter)
            .await
            .map_err(|err| TunnelError::Transport(crate::error::TransportError::Transient(err.to_string())))?;
        Ok(!uids.is_empty())
    }

    /// Drains the current chunk one byte at a time, polling for new chunks
    /// as the cache empties. `Ok(None)` once the session closes or
    /// `timeout` elapses without new data.
    pub async fn receive_byte(&self, timeout: Option<Duration>) -> Result<Option<u8>, TunnelError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let mut cache = self.byte_cache.lock().await;
                if let Some((buf, idx)) = cache.as_mut() {
                    if *idx < buf.len() {
                        let byte = buf[*idx];
                        *idx += 1;
                        return Ok(Some(byte));
                    }
                }
            }
            match self.receive_chunk().await? {
                None => return Ok(None),
                Some(chunk) if !chunk.is_empty() => {
                    *self.byte_cache.lock().await = Some((chunk, 0));
                }
                Some(_) => {
                    if let Some(dl) = deadline {
                        if Instant::now() >= dl {
                            return Ok(None);
                        }
                    }
                    tokio::time::sleep(CACHE_POLL_INTERVAL).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FolderTransport;
    use tempfile::tempdir;

    fn pair(root: &std::path::Path) -> (Session, Session) {
        let transport: Arc<dyn BlobTransport> = Arc::new(FolderTransport::new(root));
        let a = Session::new(transport.clone(), "alice", "bob", 1);
        let b = Session::new(transport, "bob", "alice", 1);
        (a, b)
    }

    #[tokio::test]
    async fn send_then_receive_preserves_order() {
        let dir = tempdir().unwrap();
        let (alice, bob) = pair(dir.path());
        alice.send(b"first").await.unwrap();
        alice.send(b"second").await.unwrap();
        assert_eq!(bob.receive_chunk().await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(bob.receive_chunk().await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn receive_chunk_returns_empty_when_nothing_available() {
        let dir = tempdir().unwrap();
        let (_alice, bob) = pair(dir.path());
        assert_eq!(bob.receive_chunk().await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn close_then_receive_returns_none() {
        let dir = tempdir().unwrap();
        let (alice, bob) = pair(dir.path());
        alice.close(false).await.unwrap();
        assert_eq!(bob.receive_chunk().await.unwrap(), None);
        assert!(bob.is_closed());
    }

    #[tokio::test]
    async fn silent_close_on_nonzero_sid_sends_nothing_but_marks_closed() {
        let dir = tempdir().unwrap();
        let (alice, bob) = pair(dir.path());
        alice.close(true).await.unwrap();
        assert!(alice.is_closed());
        // bob never receives a close sentinel, so it stays open and idle.
        assert_eq!(bob.receive_chunk().await.unwrap(), Some(Vec::new()));
        assert!(!bob.is_closed());
    }

    #[tokio::test]
    async fn sid_zero_close_never_sends_a_sentinel() {
        let dir = tempdir().unwrap();
        let transport: Arc<dyn BlobTransport> = Arc::new(FolderTransport::new(dir.path()));
        let discovery = Session::new(transport, "alice", "bob", 0);
        discovery.close(false).await.unwrap();
        assert!(discovery.is_closed());
    }

    #[tokio::test]
    async fn send_after_close_is_an_error() {
        let dir = tempdir().unwrap();
        let (alice, _bob) = pair(dir.path());
        alice.close(false).await.unwrap();
        assert!(alice.send(b"too late").await.is_err());
    }

    #[tokio::test]
    async fn oversized_write_splits_into_two_blobs() {
        let dir = tempdir().unwrap();
        let (alice, bob) = pair(dir.path());
        let data = vec![7u8; MAX_CHUNK + 1];
        alice.send(&data).await.unwrap();
        let first = bob.receive_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_CHUNK);
        let second = bob.receive_chunk().await.unwrap().unwrap();
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn receive_byte_drains_a_chunk_one_byte_at_a_time() {
        let dir = tempdir().unwrap();
        let (alice, bob) = pair(dir.path());
        alice.send(b"hi").await.unwrap();
        assert_eq!(bob.receive_byte(None).await.unwrap(), Some(b'h'));
        assert_eq!(bob.receive_byte(None).await.unwrap(), Some(b'i'));
    }

    #[tokio::test]
    async fn receive_byte_times_out_when_nothing_arrives() {
        let dir = tempdir().unwrap();
        let (_alice, bob) = pair(dir.path());
        let start = Instant::now();
        let result = bob.receive_byte(Some(Duration::from_millis(150))).await.unwrap();
        assert_eq!(result, None);
        assert!(start.elapsed() >= Duration::from_millis(140));
    }
}
