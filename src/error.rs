//! Error taxonomy for the transport, session, peer and SOCKS layers.
//!
//! Mirrors `spec.md` §7: transient transport failures are retried by the
//! caller's poll loop, fatal ones tear the binding down, and protocol
//! violations are distinguished from ordinary session lifecycle events
//! (`SessionClosed`) so callers don't have to string-match error messages.

use thiserror::Error;

/// Errors surfaced by a [`crate::transport::BlobTransport`] binding.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The operation may succeed if retried (e.g. a locked file, a dropped
    /// IMAP connection that reconnects on the next poll).
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// The binding cannot continue (e.g. the backing folder was deleted,
    /// credentials were rejected).
    #[error("fatal transport failure: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while decoding or applying the control-sentinel protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(String),

    #[error("identifier is not a valid peer id: {0:?}")]
    InvalidIdentifier(String),

    #[error("session {sid} received chunk {got} out of order (expected {expected})")]
    OutOfOrder { sid: u64, expected: u64, got: u64 },

    #[error("no service named {0:?} is registered")]
    ServiceNotKnown(String),

    #[error("peer replied with an error: {0}")]
    PeerError(String),
}

/// Top-level error type returned by this crate's public APIs.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The session was closed, locally or by the remote peer. Not an error
    /// condition for most callers, but distinguished from I/O failure so a
    /// `send`-after-`close` can be told apart from a broken transport.
    #[error("session {0} is closed")]
    SessionClosed(String),

    /// A SOCKS client asked to dial an origin and the dial failed.
    #[error("failed to connect to {host}:{port}: {source}")]
    DialError {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
