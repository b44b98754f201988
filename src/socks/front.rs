//! SOCKS front-end (C5, `spec.md` §4.5), grounded in
//! `original_source/socks.py`'s `SocksFrontEnd`: a local TCP listener that
//! proxies each accepted connection over a freshly opened session.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::defaults::{DATA_TAG, SOCKS_BLOCK_SIZE, SOCKS_DATA_TIMEOUT, SOCKS_LOOP_TIMEOUT};
use crate::error::TunnelError;
use crate::peer::Client;
use crate::session::Session;

use super::wire;

/// Which SOCKS dialect a front-end listener speaks; selects both the
/// capability name requested from C3 and the handshake framing state
/// machine below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Socks4,
    Socks5,
}

impl ProxyMode {
    pub fn capability(self) -> &'static str {
        match self {
            ProxyMode::Socks4 => "socks",
            ProxyMode::Socks5 => "socks5",
        }
    }
}

/// Local TCP listener that opens one session per accepted connection and
/// bridges bytes to/from it, framing post-handshake payload with the `DATA`
/// tag per `spec.md` §3/§4.5.
pub struct SocksFrontEnd {
    client: Arc<Client>,
    rid: String,
    mode: ProxyMode,
}

impl SocksFrontEnd {
    pub fn new(client: Arc<Client>, rid: impl Into<String>, mode: ProxyMode) -> Self {
        Self {
            client,
            rid: rid.into(),
            mode,
        }
    }

    /// Binds `addr` and accepts connections forever, spawning one bridging
    /// task per connection. Returns only on a listener error.
    pub async fn serve(self: Arc<Self>, addr: impl ToSocketAddrs) -> Result<(), TunnelError> {
        let listener = TcpListener::bind(addr).await?;
        info!(rid = %self.rid, capability = self.mode.capability(), local = ?listener.local_addr().ok(), "socks front-end listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                debug!(%peer, "accepted socks connection");
                if let Err(err) = this.handle_connection(stream).await {
                    warn!(%peer, "socks connection ended with error: {err:#}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let session = self.client.open_session(&self.rid, self.mode.capability()).await?;
        let (mut sock_read, mut sock_write) = stream.into_split();

        let mut state = match self.mode {
            ProxyMode::Socks4 => FrontState::Socks4Awaiting,
            ProxyMode::Socks5 => FrontState::Socks5Stage0,
        };
        let mut buf: Vec<u8> = Vec::new();
        let mut read_buf = vec![0u8; SOCKS_BLOCK_SIZE];

        loop {
            tokio::select! {
                result = sock_read.read(&mut read_buf) => {
                    match result {
                        Ok(0) => {
                            session.close(false).await?;
                            break;
                        }
                        Ok(n) => {
                            buf.extend_from_slice(&read_buf[..n]);
                            drain_handshake(&session, &mut buf, &mut state).await?;
                            if state == FrontState::Payload && buf.len() + DATA_TAG.len() >= crate::defaults::MAX_CHUNK {
                                flush_payload(&session, &mut buf).await?;
                            }
                        }
                        Err(err) => {
                            debug!("socket read failed: {err}");
                            let _ = session.close(false).await;
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(SOCKS_DATA_TIMEOUT), if !buf.is_empty() => {
                    match state {
                        FrontState::Payload => flush_payload(&session, &mut buf).await?,
                        _ => {
                            let head = std::mem::take(&mut buf);
                            session.send(&head).await?;
                        }
                    }
                }
                chunk = session.receive_chunk() => {
                    match chunk? {
                        None => {
                            let _ = sock_write.shutdown().await;
                            break;
                        }
                        Some(c) if c.is_empty() => {
                            tokio::time::sleep(SOCKS_LOOP_TIMEOUT).await;
                        }
                        Some(c) => {
                            let payload = c.strip_prefix(DATA_TAG).unwrap_or(&c);
                            if sock_write.write_all(payload).await.is_err() {
                                let _ = session.close(false).await;
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrontState {
    Socks4Awaiting,
    Socks5Stage0,
    /// Username/password sub-negotiation: stubbed as a single forwarded
    /// message (`spec.md` §4.5).
    Socks5Stage9,
    Socks5Stage10,
    Payload,
}

/// Finds the end of a SOCKS4/4a handshake (fixed header + NUL-terminated
/// USERID, and DOMAIN if the `0.0.0.x` marker is set). `None` means keep
/// buffering.
fn socks4_handshake_len(buf: &[u8]) -> Option<usize> {
    let header = wire::Socks4Header::parse(buf)?;
    let userid_nul = wire::find_nul(&buf[wire::Socks4Header::LEN..])? + wire::Socks4Header::LEN;
    if header.is_socks4a_marker() {
        let domain_start = userid_nul + 1;
        let domain_nul = wire::find_nul(&buf[domain_start..])? + domain_start;
        Some(domain_nul + 1)
    } else {
        Some(userid_nul + 1)
    }
}

/// Advances `state` through as many complete handshake sub-headers as `buf`
/// currently holds, sending each as one untagged chunk. Stops once the
/// buffer no longer holds a complete sub-header for the current state, or
/// once `Payload` is reached (payload framing/flushing is the caller's job).
async fn drain_handshake(session: &Session, buf: &mut Vec<u8>, state: &mut FrontState) -> Result<(), TunnelError> {
    loop {
        match *state {
            FrontState::Socks4Awaiting => match socks4_handshake_len(buf) {
                None => break,
                Some(len) => {
                    let head: Vec<u8> = buf.drain(..len).collect();
                    session.send(&head).await?;
                    *state = FrontState::Payload;
                }
            },
            FrontState::Socks5Stage0 => match wire::parse_socks5_methods(buf) {
                None => break,
                Some(Err(_)) => {
                    let head = std::mem::take(buf);
                    session.send(&head).await?;
                    *state = FrontState::Payload;
                }
                Some(Ok(methods)) => {
                    let methods = methods.to_vec();
                    let header_len = 2 + methods.len();
                    let head: Vec<u8> = buf.drain(..header_len.min(buf.len())).collect();
                    session.send(&head).await?;
                    *state = if methods.contains(&wire::SOCKS5_AUTH_NONE) {
                        FrontState::Socks5Stage10
                    } else if methods.contains(&wire::SOCKS5_AUTH_USERPASS) {
                        FrontState::Socks5Stage9
                    } else {
                        // Back-end will reply 0xff and close; nothing more
                        // to parse on this connection.
                        FrontState::Payload
                    };
                }
            },
            FrontState::Socks5Stage9 => {
                if buf.is_empty() {
                    break;
                }
                let head = std::mem::take(buf);
                session.send(&head).await?;
                *state = FrontState::Socks5Stage10;
            }
            FrontState::Socks5Stage10 => match wire::Socks5Request::parse(buf) {
                None => break,
                Some(parsed) => {
                    let consumed = parsed.as_ref().map(|r| r.consumed).unwrap_or(buf.len());
                    let head: Vec<u8> = buf.drain(..consumed.min(buf.len())).collect();
                    session.send(&head).await?;
                    *state = FrontState::Payload;
                }
            },
            FrontState::Payload => break,
        }
    }
    Ok(())
}

async fn flush_payload(session: &Session, buf: &mut Vec<u8>) -> Result<(), TunnelError> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut framed = DATA_TAG.to_vec();
    framed.append(buf);
    session.send(&framed).await
}
