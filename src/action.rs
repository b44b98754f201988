//! Server-side capability handlers bound to a session after open (C4,
//! `spec.md` §4.4), grounded in `original_source/communication.py`'s
//! `ActionServer`.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::session::Session;

/// A registered capability. `start` is handed ownership of the freshly
/// opened session and must spawn its own task promptly — it never blocks
/// the caller (the server's discovery-poll loop).
pub trait Action: Send + Sync {
    fn capability(&self) -> &str;

    fn start(self: Arc<Self>, session: Session) -> JoinHandle<()>;
}

/// Echoes every received chunk back to the sender. Kept as a small built-in
/// (mirroring `communication.py`'s `EchoActionServer`) purely to exercise
/// the [`Action`]/[`Session`] contract in tests without a real SOCKS client.
pub struct EchoAction {
    name: String,
}

impl EchoAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Action for EchoAction {
    fn capability(&self) -> &str {
        &self.name
    }

    fn start(self: Arc<Self>, session: Session) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match session.receive_chunk().await {
                    Ok(None) => break,
                    Ok(Some(chunk)) if chunk.is_empty() => {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                    Ok(Some(chunk)) => {
                        if let Err(err) = session.send(&chunk).await {
                            error!("echo action failed to send reply: {err:#}");
                            break;
                        }
                    }
                    Err(err) => {
                        error!("echo action receive failed: {err:#}");
                        break;
                    }
                }
            }
            info!(sid = session.sid(), "echo action finished");
        })
    }
}

/// Echoes one received byte at a time, mirroring
/// `communication.py`'s `EchoByteByByteActionServer` — used to exercise the
/// byte-at-a-time receive path distinctly from the chunked one.
pub struct EchoByteByByteAction {
    name: String,
}

impl EchoByteByByteAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Action for EchoByteByByteAction {
    fn capability(&self) -> &str {
        &self.name
    }

    fn start(self: Arc<Self>, session: Session) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match session.receive_byte(None).await {
                    Ok(None) => break,
                    Ok(Some(byte)) => {
                        if let Err(err) = session.send(&[byte]).await {
                            error!("byte-echo action failed to send reply: {err:#}");
                            break;
                        }
                    }
                    Err(err) => {
                        error!("byte-echo action receive failed: {err:#}");
                        break;
                    }
                }
            }
            info!(sid = session.sid(), "byte-echo action finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BlobTransport, FolderTransport};
    use tempfile::tempdir;

    #[tokio::test]
    async fn echo_action_sends_back_received_chunks() {
        let dir = tempdir().unwrap();
        let transport: Arc<dyn BlobTransport> = Arc::new(FolderTransport::new(dir.path()));
        let server_side = Session::new(transport.clone(), "server", "client", 1);
        let client_side = Session::new(transport, "client", "server", 1);

        let action = Arc::new(EchoAction::new("echo"));
        let handle = action.start(server_side);

        client_side.send(b"ping").await.unwrap();
        let mut reply = client_side.receive_chunk().await.unwrap();
        while reply == Some(Vec::new()) {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            reply = client_side.receive_chunk().await.unwrap();
        }
        assert_eq!(reply, Some(b"ping".to_vec()));

        client_side.close(false).await.unwrap();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
    }
}
