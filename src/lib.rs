//! # Driftlink
//!
//! Tunnels arbitrary TCP traffic through a shared, high-latency,
//! store-and-forward medium (a folder, an FTP directory, an IMAP mailbox).
//! Neither endpoint opens a direct socket to the other: both sides poll the
//! same medium, exchanging named blobs. On top of that substrate this crate
//! multiplexes logical sessions and exposes a SOCKS4/4a/5 proxy.
//!
//! ## Layering
//!
//! - [`transport`] — the named-blob carrier abstraction (C1): write/list/
//!   read/delete blobs, publish/read capability records.
//! - [`session`] — ordered, chunked, bidirectional byte streams built on a
//!   transport (C2).
//! - [`peer`] — client/server roles that open and dispatch sessions (C3).
//! - [`action`] — server-side handlers bound to a session after open (C4).
//! - [`socks`] — the SOCKS4/4a/5 front-end (local listener) and back-end
//!   (session-bound origin dialer) built on top of the above (C5/C6).

pub mod action;
pub mod cli;
pub mod error;
pub mod ids;
pub mod logging;
pub mod peer;
pub mod sentinel;
pub mod session;
pub mod socks;
pub mod transport;

pub use error::{ProtocolError, TunnelError};
pub use ids::{PeerId, Recipient};
pub use peer::{Client, Server};
pub use session::Session;
pub use socks::{ProxyMode, Socks4Backend, Socks5Backend, SocksFrontEnd};
pub use transport::{BlobTransport, TransportFactory};

/// Crate version, as reported by `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol-wide default parameters.
///
/// Mirrors the constants named throughout `spec.md`; kept in one place so
/// the session/transport/socks layers agree without importing each other.
pub mod defaults {
    use std::time::Duration;

    /// Largest payload carried by a single blob before [`crate::session::Session::send`]
    /// splits it into multiple chunks.
    pub const MAX_CHUNK: usize = 500_000;

    /// Poll interval for the filesystem transport binding.
    pub const FOLDER_LOOP_SLEEP: Duration = Duration::from_millis(100);

    /// Poll interval for the IMAP/FTP transport bindings (network round trips
    /// are expensive, so these poll far less aggressively).
    pub const MAILBOX_LOOP_SLEEP: Duration = Duration::from_secs(2);

    /// How long a persistent mailbox login is trusted before the binding
    /// re-authenticates on the next operation.
    pub const RESTART_AFTER: Duration = Duration::from_secs(3600);

    /// Time-to-live for broadcast (`recipient = ANY`) blobs before the
    /// transport's reaper task deletes them.
    pub const BROADCAST_TTL: Duration = Duration::from_secs(24 * 3600);

    /// Read size per `recv` syscall in the SOCKS front-end's socket→session loop.
    pub const SOCKS_BLOCK_SIZE: usize = 1024;

    /// How long the SOCKS front-end buffers outbound bytes waiting for more
    /// before flushing them as a chunk.
    pub const SOCKS_DATA_TIMEOUT: Duration = Duration::from_millis(20);

    /// Bound on how long a socket-readiness poll blocks before re-checking
    /// session state.
    pub const SOCKS_LOOP_TIMEOUT: Duration = Duration::from_millis(10);

    /// The 4-byte tag prefixed to payload chunks once a SOCKS handshake has
    /// completed (`spec.md` §3).
    pub const DATA_TAG: &[u8] = b"DATA";
}
