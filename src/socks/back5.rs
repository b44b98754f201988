//! SOCKS5 back-end (C6, `spec.md` §4.6): RFC 1928 method negotiation and
//! request parsing, grounded in the same `Socks4Backend` shape from
//! `original_source/socks.py` generalized to the two-stage SOCKS5 handshake.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::defaults::DATA_TAG;
use crate::session::Session;

use super::wire::{
    dial_error_to_socks5, parse_socks5_methods, socks5_reply, Socks5Request, SOCKS5_AUTH_NONE,
    SOCKS5_AUTH_NO_ACCEPTABLE, SOCKS5_AUTH_USERPASS, SOCKS5_CMD_BIND, SOCKS5_CMD_CONNECT, SOCKS5_CMD_UDP_ASSOCIATE,
    SOCKS5_VERSION,
};

pub struct Socks5Backend {
    name: String,
}

impl Socks5Backend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Action for Socks5Backend {
    fn capability(&self) -> &str {
        &self.name
    }

    fn start(self: Arc<Self>, session: Session) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = run(&session).await {
                warn!(sid = session.sid(), "socks5 backend failed: {err:#}");
                let _ = session.close(false).await;
            }
        })
    }
}

/// Accumulates chunks until `predicate` recognizes a complete unit,
/// stripping a leading `DATA` tag defensively (pre-handshake bytes should
/// never carry one, but a stray tag shouldn't wedge the parser).
async fn read_until<T>(
    session: &Session,
    buf: &mut Vec<u8>,
    mut predicate: impl FnMut(&[u8]) -> Option<Result<T, &'static str>>,
) -> anyhow::Result<Option<T>> {
    loop {
        if let Some(result) = predicate(buf) {
            return Ok(Some(result.map_err(|msg| anyhow::anyhow!(msg))?));
        }
        match session.receive_chunk().await? {
            None => {
                debug!(sid = session.sid(), "session closed mid-handshake");
                return Ok(None);
            }
            Some(chunk) if chunk.is_empty() => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Some(chunk) => {
                let chunk = chunk.strip_prefix(DATA_TAG).unwrap_or(&chunk).to_vec();
                buf.extend_from_slice(&chunk);
            }
        }
    }
}

async fn run(session: &Session) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    let Some(methods) = read_until(session, &mut buf, |b| parse_socks5_methods(b).map(|r| r.map(<[u8]>::to_vec))).await?
    else {
        return Ok(());
    };
    buf.clear();

    if methods.contains(&SOCKS5_AUTH_NONE) {
        session.send(&[SOCKS5_VERSION, SOCKS5_AUTH_NONE]).await?;
    } else if methods.contains(&SOCKS5_AUTH_USERPASS) {
        session.send(&[SOCKS5_VERSION, SOCKS5_AUTH_USERPASS]).await?;
        // Stub sub-negotiation: accept whatever single message arrives.
        let _ = read_until(session, &mut buf, |b| if b.is_empty() { None } else { Some(Ok(())) }).await?;
        buf.clear();
    } else {
        session.send(&[SOCKS5_VERSION, SOCKS5_AUTH_NO_ACCEPTABLE]).await?;
        session.close(false).await?;
        return Ok(());
    }

    let Some(request) = read_until(session, &mut buf, |b| Socks5Request::parse(b)).await? else {
        return Ok(());
    };
    let leftover = buf[request.consumed..].to_vec();

    match request.command {
        SOCKS5_CMD_CONNECT => handle_connect(session, request, leftover).await,
        SOCKS5_CMD_BIND | SOCKS5_CMD_UDP_ASSOCIATE => {
            warn!(sid = session.sid(), command = request.command, "SOCKS5 BIND/UDP ASSOCIATE not supported");
            session.send(&request.reply_bytes(socks5_reply::COMMAND_NOT_SUPPORTED)).await?;
            session.close(false).await?;
            Ok(())
        }
        other => {
            warn!(sid = session.sid(), command = other, "unknown SOCKS5 command");
            session.send(&request.reply_bytes(socks5_reply::COMMAND_NOT_SUPPORTED)).await?;
            session.close(false).await?;
            Ok(())
        }
    }
}

async fn handle_connect(session: &Session, request: Socks5Request, leftover: Vec<u8>) -> anyhow::Result<()> {
    let host = request.address.host_string();
    let origin = match TcpStream::connect((host.as_str(), request.port)).await {
        Ok(stream) => stream,
        Err(err) => {
            info!(sid = session.sid(), %host, port = request.port, "socks5 dial failed: {err}");
            session.send(&request.reply_bytes(dial_error_to_socks5(&err))).await?;
            session.close(false).await?;
            return Ok(());
        }
    };

    session.send(&request.reply_bytes(socks5_reply::SUCCEEDED)).await?;
    info!(sid = session.sid(), %host, port = request.port, "socks5 connected");
    super::bridge::bridge_session_to_origin(session, origin, leftover).await
}
