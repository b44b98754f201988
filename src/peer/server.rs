//! Server role (`spec.md` §4.3), grounded in `communication.py`'s
//! `CommunicationServer`/`FolderCommServer`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::error::{TransportError, TunnelError};
use crate::sentinel::{raw, ControlMessage};
use crate::session::Session;
use crate::transport::{BlobFilter, BlobTransport};

use super::RpcTarget;

/// A server identity: registers capabilities, advertises them, and
/// dispatches incoming `sid=0` discovery traffic (open/RPC/stop) from any
/// number of clients.
pub struct Server {
    rid: String,
    transport: Arc<dyn BlobTransport>,
    capabilities: HashMap<String, Arc<dyn Action>>,
    rpc_targets: HashMap<String, Arc<dyn RpcTarget>>,
    /// Incremented only by the single task running [`Server::serve_forever`]
    /// (`spec.md` §5: "incremented only in the single discovery-poll
    /// thread"). An `AtomicU64` purely so `Server` can be shared via `Arc`
    /// without an async mutex on the hot discovery path; it is never
    /// contended in practice.
    next_sid: AtomicU64,
    stopped: AtomicBool,
}

impl Server {
    pub fn new(rid: impl Into<String>, transport: Arc<dyn BlobTransport>) -> Self {
        Self {
            rid: rid.into(),
            transport,
            capabilities: HashMap::new(),
            rpc_targets: HashMap::new(),
            next_sid: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    /// Registers a capability handler. Must be called before
    /// [`Server::serve_forever`] starts; the capability map is read without
    /// locking thereafter.
    pub fn register_capability(&mut self, action: Arc<dyn Action>) {
        self.capabilities.insert(action.capability().to_string(), action);
    }

    /// Opts a registered capability's name into generic RPC dispatch
    /// (`target != "server"` branch of `spec.md` §4.3).
    pub fn register_rpc_target(&mut self, name: impl Into<String>, target: Arc<dyn RpcTarget>) {
        self.rpc_targets.insert(name.into(), target);
    }

    /// Publishes the capability record, mirroring `showCapabilities`.
    pub async fn publish(&self) -> Result<(), TunnelError> {
        let names: Vec<String> = self.capabilities.keys().cloned().collect();
        self.transport
            .publish_capabilities(&self.rid, &names)
            .await
            .map_err(|err| TunnelError::Transport(TransportError::Transient(err.to_string())))
    }

    /// Stops the server: retracts its capability record and signals the
    /// discovery loop to exit after finishing any in-flight replies.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        info!(rid = %self.rid, "stopping server");
        self.stopped.store(true, Ordering::Release);
        self.transport
            .retract_capabilities(&self.rid)
            .await
            .map_err(|err| TunnelError::Transport(TransportError::Transient(err.to_string())))
    }

    /// Publishes capabilities, then polls the `sid=0` discovery channel
    /// forever (until [`Server::stop`] is called or a `StopServer`
    /// sentinel is received), dispatching each message.
    pub async fn serve_forever(self: Arc<Self>) -> Result<(), TunnelError> {
        self.publish().await?;
        info!(rid = %self.rid, capabilities = ?self.capabilities.keys().collect::<Vec<_>>(), "serving");
        while !self.stopped.load(Ordering::Acquire) {
            if let Err(err) = self.poll_discovery_once().await {
                warn!("discovery poll failed: {err:#}");
            }
            tokio::time::sleep(self.transport.poll_interval()).await;
        }
        Ok(())
    }

    /// A single discovery-poll iteration: lists every blob addressed to
    /// this `rid` on `sid=0` from any sender (the server's inbox is shared
    /// by every client, unlike an ordinary [`Session`] which has one fixed
    /// peer on each end), and dispatches each.
    async fn poll_discovery_once(&self) -> Result<(), TunnelError> {
        let filter = BlobFilter::new().recipient(self.rid.clone()).sid(0);
        let uids = self
            .transport
            .list(&self.rid, &filter)
            .await
            .map_err(|err| TunnelError::Transport(TransportError::Transient(err.to_string())))?;
        for uid in uids {
            let fetched = self
                .transport
                .fetch(&uid)
                .await
                .map_err(|err| TunnelError::Transport(TransportError::Transient(err.to_string())))?;
            let Some((meta, payload)) = fetched else {
                continue;
            };
            self.transport
                .delete(&uid)
                .await
                .map_err(|err| TunnelError::Transport(TransportError::Transient(err.to_string())))?;
            self.handle_discovery_message(&meta.sender, &payload).await;
        }
        Ok(())
    }

    async fn handle_discovery_message(&self, cid: &str, payload: &[u8]) {
        match ControlMessage::decode(payload) {
            ControlMessage::Open(capability) => self.handle_open(cid, &capability).await,
            ControlMessage::Rpc { target, method, args } => {
                self.handle_rpc(cid, &target, &method, &args).await
            }
            ControlMessage::Stop => {
                debug!(rid = %self.rid, "received stop-server sentinel");
                self.stopped.store(true, Ordering::Release);
            }
            other => {
                warn!(rid = %self.rid, ?other, "unexpected message on discovery channel, ignoring");
            }
        }
    }

    async fn handle_open(&self, cid: &str, capability: &str) {
        let reply_payload = if let Some(action) = self.capabilities.get(capability) {
            let sid = self.next_sid.fetch_add(1, Ordering::AcqRel);
            let session = Session::new(self.transport.clone(), self.rid.clone(), cid.to_string(), sid);
            action.clone().start(session);
            sid.to_string().into_bytes()
        } else {
            warn!(rid = %self.rid, %capability, "unknown capability requested by {cid}");
            ControlMessage::service_not_known(capability).encode()
        };
        self.reply(cid, &reply_payload).await;
    }

    async fn handle_rpc(&self, cid: &str, target: &str, method: &str, args: &[u8]) {
        let result = if target == "server" {
            self.call_self(method, args)
        } else {
            match self.rpc_targets.get(target) {
                Some(rpc_target) => rpc_target.call(method, args),
                None => Err(format!("no rpc target named {target:?}")),
            }
        };
        let reply_payload = match result {
            Ok(bytes) => bytes,
            Err(reason) => {
                let mut message = raw::ERROR_PREFIX.to_vec();
                message.extend_from_slice(format!("Error while calling {target}.{method}: {reason}").as_bytes());
                message
            }
        };
        self.reply(cid, &reply_payload).await;
    }

    /// The narrow, fixed method set exposed when `target == "server"`
    /// (`spec.md` §4.3's server-introspection RPC target).
    fn call_self(&self, method: &str, _args: &[u8]) -> Result<Vec<u8>, String> {
        match method {
            "ping" => Ok(b"pong".to_vec()),
            "rid" => Ok(self.rid.clone().into_bytes()),
            other => Err(format!("server has no method {other:?}")),
        }
    }

    async fn reply(&self, cid: &str, payload: &[u8]) {
        let reply_session = Session::new(self.transport.clone(), self.rid.clone(), cid.to_string(), 0);
        if let Err(err) = reply_session.send(payload).await {
            error!("failed to reply to {cid} on discovery channel: {err:#}");
        }
    }
}
