//! Shared bridging loop between a [`Session`] and an origin TCP socket
//! (`spec.md` §4.6, "the back-end enters a bridging loop"), used by both
//! [`super::back4`] and [`super::back5`].

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

use crate::defaults::{DATA_TAG, SOCKS_BLOCK_SIZE};
use crate::session::Session;

/// Writes `leftover` (handshake bytes the parser over-read) to `origin`,
/// then cooperatively shuttles bytes in both directions until either side
/// closes: `DATA`-tagged chunks from the session are written to the origin
/// socket; bytes read from the origin socket are tagged and sent back.
pub async fn bridge_session_to_origin(session: &Session, origin: TcpStream, leftover: Vec<u8>) -> anyhow::Result<()> {
    let (mut origin_read, mut origin_write) = origin.into_split();
    if !leftover.is_empty() {
        origin_write.write_all(&leftover).await?;
    }

    let mut read_buf = vec![0u8; SOCKS_BLOCK_SIZE];
    loop {
        tokio::select! {
            result = origin_read.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        session.close(false).await?;
                        break;
                    }
                    Ok(n) => {
                        let mut framed = DATA_TAG.to_vec();
                        framed.extend_from_slice(&read_buf[..n]);
                        session.send(&framed).await?;
                    }
                    Err(err) => {
                        warn!(sid = session.sid(), "origin read failed: {err}");
                        let _ = session.close(false).await;
                        break;
                    }
                }
            }
            chunk = session.receive_chunk() => {
                match chunk? {
                    None => break,
                    Some(c) if c.is_empty() => {
                        tokio::time::sleep(crate::defaults::SOCKS_LOOP_TIMEOUT).await;
                    }
                    Some(c) => {
                        let payload = c.strip_prefix(DATA_TAG).unwrap_or(&c);
                        if origin_write.write_all(payload).await.is_err() {
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
