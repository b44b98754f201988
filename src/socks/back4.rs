//! SOCKS4/4a back-end (C6, `spec.md` §4.6), grounded in
//! `original_source/socks.py`'s `Socks4Backend`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::defaults::DATA_TAG;
use crate::session::Session;

use super::wire::{self, dial_error_to_socks4, socks4_reply, Socks4Header, SOCKS4_CMD_CONNECT};

/// Server-side capability that speaks SOCKS4/4a on a freshly opened session:
/// parses the handshake, dials the requested origin, and bridges bytes.
pub struct Socks4Backend {
    name: String,
}

impl Socks4Backend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Action for Socks4Backend {
    fn capability(&self) -> &str {
        &self.name
    }

    fn start(self: Arc<Self>, session: Session) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = run(&session).await {
                warn!(sid = session.sid(), "socks4 backend failed: {err:#}");
                let _ = session.close(false).await;
            }
        })
    }
}

/// Accumulates chunks from `session` until `header`, `userid`, and (for
/// SOCKS4a) `domain` have all been consumed, stripping a leading `DATA` tag
/// from each chunk the way the front-end's pre-handshake bytes never carry
/// one but a defensive peer might still send a tagged chunk.
async fn run(session: &Session) -> anyhow::Result<()> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        if let Some(parsed) = try_parse(&buf) {
            return handle_request(session, parsed, buf).await;
        }
        match session.receive_chunk().await? {
            None => {
                debug!(sid = session.sid(), "session closed mid-handshake");
                return Ok(());
            }
            Some(chunk) if chunk.is_empty() => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Some(chunk) => {
                let chunk = strip_data_tag(&chunk);
                buf.extend_from_slice(chunk);
            }
        }
    }
}

struct ParsedRequest {
    header: Socks4Header,
    connect_to: String,
    header_end: usize,
}

fn strip_data_tag(chunk: &[u8]) -> &[u8] {
    chunk.strip_prefix(DATA_TAG).unwrap_or(chunk)
}

/// Returns `Some` once the fixed header, USERID, and (if SOCKS4a) DOMAIN
/// have all been fully buffered.
fn try_parse(buf: &[u8]) -> Option<ParsedRequest> {
    let header = Socks4Header::parse(buf)?;
    let userid_start = Socks4Header::LEN;
    let userid_nul = wire::find_nul(&buf[userid_start..])? + userid_start;

    if header.is_socks4a_marker() {
        let domain_start = userid_nul + 1;
        let domain_nul = wire::find_nul(&buf[domain_start..])? + domain_start;
        let connect_to = String::from_utf8_lossy(&buf[domain_start..domain_nul]).into_owned();
        Some(ParsedRequest {
            header,
            connect_to,
            header_end: domain_nul + 1,
        })
    } else {
        Some(ParsedRequest {
            connect_to: header.dst_ip_string(),
            header,
            header_end: userid_nul + 1,
        })
    }
}

async fn handle_request(session: &Session, parsed: ParsedRequest, buf: Vec<u8>) -> anyhow::Result<()> {
    let leftover = buf[parsed.header_end..].to_vec();

    if parsed.header.version != 4 {
        warn!(sid = session.sid(), version = parsed.header.version, "bad SOCKS4 version");
        session.send(&socks4_reply(socks4_reply::REJECTED)).await?;
        session.close(false).await?;
        return Ok(());
    }

    if parsed.header.command != SOCKS4_CMD_CONNECT {
        warn!(sid = session.sid(), command = parsed.header.command, "SOCKS4 BIND is not implemented");
        session.send(&socks4_reply(socks4_reply::REJECTED)).await?;
        session.close(false).await?;
        return Ok(());
    }

    let dial_addr = (parsed.connect_to.as_str(), parsed.header.dst_port);
    let origin = match TcpStream::connect(dial_addr).await {
        Ok(stream) => stream,
        Err(err) => {
            info!(sid = session.sid(), host = %parsed.connect_to, port = parsed.header.dst_port, "socks4 dial failed: {err}");
            session.send(&socks4_reply(dial_error_to_socks4(&err))).await?;
            session.close(false).await?;
            return Ok(());
        }
    };

    session.send(&socks4_reply(socks4_reply::GRANTED)).await?;
    info!(sid = session.sid(), host = %parsed.connect_to, port = parsed.header.dst_port, "socks4 connected");
    super::bridge::bridge_session_to_origin(session, origin, leftover).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_ipv4_request() {
        let mut buf = vec![4u8, 1, 0x00, 0x50, 127, 0, 0, 1];
        buf.extend_from_slice(b"root\0");
        let parsed = try_parse(&buf).unwrap();
        assert_eq!(parsed.connect_to, "127.0.0.1");
        assert_eq!(parsed.header.dst_port, 80);
        assert_eq!(parsed.header_end, buf.len());
    }

    #[test]
    fn parses_socks4a_domain_request() {
        let mut buf = vec![4u8, 1, 0x00, 0x50, 0, 0, 0, 7];
        buf.extend_from_slice(b"root\0");
        buf.extend_from_slice(b"example.com\0");
        let parsed = try_parse(&buf).unwrap();
        assert_eq!(parsed.connect_to, "example.com");
        assert_eq!(parsed.header_end, buf.len());
    }

    #[test]
    fn incomplete_userid_keeps_buffering() {
        let buf = vec![4u8, 1, 0x00, 0x50, 127, 0, 0, 1, b'r', b'o'];
        assert!(try_parse(&buf).is_none());
    }
}
