//! Identifier types shared by the transport, session and peer layers.
//!
//! `spec.md` §3 requires `cid`/`rid` to be short ASCII strings drawn from
//! `[A-Za-z0-9._-]`, since they are embedded verbatim in blob names (the
//! filesystem binding's `FILENAME_RX` in the original project enforces the
//! same alphabet when parsing names back out).

use crate::error::TunnelError;

/// A validated peer identifier (`cid` or `rid`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Validates and wraps a peer identifier.
    ///
    /// Rejects the empty string and anything outside
    /// `[A-Za-z0-9._-]`, since such a value could not round-trip through
    /// the filesystem or IMAP naming schemas.
    pub fn new(id: impl Into<String>) -> Result<Self, TunnelError> {
        let id = id.into();
        if id.is_empty() {
            return Err(TunnelError::Protocol(crate::error::ProtocolError::InvalidIdentifier(id)));
        }
        let valid = id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if !valid {
            return Err(TunnelError::Protocol(crate::error::ProtocolError::InvalidIdentifier(id)));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

/// The destination of a blob: a concrete peer, or the broadcast literal `ANY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    One(String),
    Any,
}

impl Recipient {
    pub const ANY_LITERAL: &'static str = "ANY";

    /// Whether `candidate` (a listing peer's own id) should see this blob.
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Recipient::One(id) => id == candidate,
            Recipient::Any => true,
        }
    }

    pub fn as_wire_str(&self) -> &str {
        match self {
            Recipient::One(id) => id,
            Recipient::Any => Self::ANY_LITERAL,
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

impl From<&str> for Recipient {
    fn from(value: &str) -> Self {
        if value == Self::ANY_LITERAL {
            Recipient::Any
        } else {
            Recipient::One(value.to_string())
        }
    }
}

impl From<String> for Recipient {
    fn from(value: String) -> Self {
        if value == Self::ANY_LITERAL {
            Recipient::Any
        } else {
            Recipient::One(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_accepts_allowed_alphabet() {
        assert!(PeerId::new("client-1.local_A").is_ok());
    }

    #[test]
    fn peer_id_rejects_empty_and_invalid_chars() {
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("has space").is_err());
        assert!(PeerId::new("has/slash").is_err());
    }

    #[test]
    fn recipient_any_matches_everyone() {
        let any = Recipient::Any;
        assert!(any.matches("alice"));
        assert!(any.matches("bob"));
    }

    #[test]
    fn recipient_one_matches_only_itself() {
        let one = Recipient::One("alice".to_string());
        assert!(one.matches("alice"));
        assert!(!one.matches("bob"));
    }

    #[test]
    fn recipient_round_trips_any_literal() {
        let r: Recipient = Recipient::ANY_LITERAL.into();
        assert_eq!(r, Recipient::Any);
        assert_eq!(r.as_wire_str(), "ANY");
    }
}
