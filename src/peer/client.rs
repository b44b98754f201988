//! Client role (`spec.md` §4.3), grounded in `communication.py`'s
//! `CommunicationClient`/`FolderCommClient`.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{ProtocolError, TransportError, TunnelError};
use crate::sentinel::{parse_sid_reply, raw, ControlMessage};
use crate::session::Session;
use crate::transport::BlobTransport;

/// How long [`Client::open_session`] sleeps between polls while waiting for
/// the server's reply (`communication.py`'s `LOOP_SLEEP`, reused here since
/// this wait happens on the same discovery channel as ordinary chunks).
const OPEN_SESSION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A client identity: discovers servers, reads their capabilities, and
/// opens sessions against a chosen capability.
pub struct Client {
    cid: String,
    transport: Arc<dyn BlobTransport>,
}

impl Client {
    pub fn new(cid: impl Into<String>, transport: Arc<dyn BlobTransport>) -> Self {
        Self {
            cid: cid.into(),
            transport,
        }
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Lists the `rid`s of servers with a currently published capability
    /// record.
    pub async fn list_servers(&self) -> Result<Vec<String>, TunnelError> {
        self.transport
            .list_servers()
            .await
            .map_err(|err| TunnelError::Transport(TransportError::Transient(err.to_string())))
    }

    /// Reads a server's advertised capabilities.
    pub async fn capabilities(&self, rid: &str) -> Result<Vec<String>, TunnelError> {
        self.transport
            .capabilities(rid)
            .await
            .map_err(|err| TunnelError::Transport(TransportError::Transient(err.to_string())))?
            .ok_or_else(|| TunnelError::Protocol(ProtocolError::ServiceNotKnown(rid.to_string())))
    }

    /// Opens a session for `capability` against server `rid`: sends the
    /// open sentinel on a fresh discovery session, waits for the reply,
    /// and returns the newly allocated [`Session`].
    pub async fn open_session(&self, rid: &str, capability: &str) -> Result<Session, TunnelError> {
        let discovery = Session::new(self.transport.clone(), self.cid.clone(), rid.to_string(), 0);
        discovery
            .send(&ControlMessage::Open(capability.to_string()).encode())
            .await?;

        let reply = loop {
            match discovery.receive_chunk().await? {
                Some(chunk) if !chunk.is_empty() => break chunk,
                _ => tokio::time::sleep(OPEN_SESSION_POLL_INTERVAL).await,
            }
        };

        // The discovery session never carries the close sentinel (sid=0);
        // retire it silently now that we have our reply.
        discovery.close(true).await?;

        let sid = parse_sid_reply(&reply).map_err(TunnelError::Protocol)?;
        debug!(%rid, %capability, sid, "opened session");
        Ok(Session::new(self.transport.clone(), self.cid.clone(), rid.to_string(), sid))
    }

    /// Sends the generic-RPC sentinel to `target` (`"server"` for
    /// introspection, or a capability name opted into RPC dispatch),
    /// invoking `method` with `args`, and returns its reply bytes.
    pub async fn call_rpc(&self, rid: &str, target: &str, method: &str, args: &[u8]) -> Result<Vec<u8>, TunnelError> {
        let discovery = Session::new(self.transport.clone(), self.cid.clone(), rid.to_string(), 0);
        discovery
            .send(&ControlMessage::Rpc {
                target: target.to_string(),
                method: method.to_string(),
                args: args.to_vec(),
            }
            .encode())
            .await?;

        let reply = loop {
            match discovery.receive_chunk().await? {
                Some(chunk) if !chunk.is_empty() => break chunk,
                _ => tokio::time::sleep(OPEN_SESSION_POLL_INTERVAL).await,
            }
        };
        discovery.close(true).await?;

        match ControlMessage::decode(&reply) {
            ControlMessage::Error(reason) => Err(TunnelError::Protocol(ProtocolError::PeerError(reason))),
            ControlMessage::Data(bytes) => Ok(bytes),
            other => Ok(other.encode()),
        }
    }

    /// Sends the stop-server sentinel to `rid`'s discovery channel.
    pub async fn stop_server(&self, rid: &str) -> Result<(), TunnelError> {
        let discovery = Session::new(self.transport.clone(), self.cid.clone(), rid.to_string(), 0);
        discovery.send(raw::STOP_SERVER).await?;
        discovery.close(true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::EchoAction;
    use crate::peer::Server;
    use crate::transport::FolderTransport;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_session_against_known_capability_succeeds() {
        let dir = tempdir().unwrap();
        let transport: Arc<dyn BlobTransport> = Arc::new(FolderTransport::new(dir.path()));

        let mut server = Server::new("server1", transport.clone());
        server.register_capability(Arc::new(EchoAction::new("echo")));
        let server = Arc::new(server);
        let server_task = tokio::spawn(server.clone().serve_forever());

        let client = Client::new("client1", transport);
        let session = client.open_session("server1", "echo").await.unwrap();
        assert!(session.sid() >= 1);

        session.send(b"hello").await.unwrap();
        let mut reply = session.receive_chunk().await.unwrap();
        while reply == Some(Vec::new()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reply = session.receive_chunk().await.unwrap();
        }
        assert_eq!(reply, Some(b"hello".to_vec()));

        server.stop().await.unwrap();
        server_task.abort();
    }

    #[tokio::test]
    async fn open_session_against_unknown_capability_fails() {
        let dir = tempdir().unwrap();
        let transport: Arc<dyn BlobTransport> = Arc::new(FolderTransport::new(dir.path()));

        let server = Arc::new(Server::new("server1", transport.clone()));
        let server_task = tokio::spawn(server.clone().serve_forever());

        let client = Client::new("client1", transport);
        let result = client.open_session("server1", "bogus").await;
        assert!(matches!(
            result,
            Err(TunnelError::Protocol(ProtocolError::ServiceNotKnown(ref name))) if name == "bogus"
        ));

        server_task.abort();
    }

    #[tokio::test]
    async fn server_introspection_rpc_responds_to_ping() {
        let dir = tempdir().unwrap();
        let transport: Arc<dyn BlobTransport> = Arc::new(FolderTransport::new(dir.path()));

        let server = Arc::new(Server::new("server1", transport.clone()));
        let server_task = tokio::spawn(server.clone().serve_forever());

        let client = Client::new("client1", transport);
        let reply = client.call_rpc("server1", "server", "ping", b"").await.unwrap();
        assert_eq!(reply, b"pong");

        server_task.abort();
    }
}
