//! Control sentinels: literal byte strings that carry control meaning over
//! an otherwise opaque blob payload (`spec.md` §3).
//!
//! The raw bytes are part of the wire contract and MUST be reproduced
//! exactly for interoperability with any other implementation of this
//! protocol. [`ControlMessage`] wraps them in a tagged union so the rest of
//! the crate matches on variants rather than re-deriving `startswith`
//! chains, per the Design Notes' recommendation — but every decode still
//! round-trips to the exact same bytes on the wire.

use crate::error::ProtocolError;

/// The literal sentinel byte strings, exactly as specified.
pub mod raw {
    pub const OPEN_SESSION_PREFIX: &[u8] = b"MessageOutsideCommunication:PleaseStartASession:";
    pub const CLOSE_SESSION: &[u8] = b"MessageInCommunication:PleaseCloseTheSession";
    pub const STOP_SERVER: &[u8] = b"MessageOutsideSession:StopServer";
    pub const GENERIC_RPC_PREFIX: &[u8] = b"GenericMessageFor:";
    pub const ERROR_PREFIX: &[u8] = b"Error:";
    pub const SERVICE_NOT_KNOWN_PREFIX: &[u8] = b"ServiceNotKnown:";
}

/// The separator byte used to delimit `target`/`method`/`args` fields
/// within a [`raw::GENERIC_RPC_PREFIX`] payload. Chosen as the last byte of
/// the payload, per `spec.md` §4.3 ("split on the last byte as separator").
pub const RPC_FIELD_SEP: u8 = b':';

/// A decoded control message. `Data` is the fallback for any payload that
/// isn't one of the recognized sentinels — ordinary session traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Open a session for capability `X`.
    Open(String),
    /// Close the session this payload was received on.
    Close,
    /// Stop the server after finishing in-flight replies.
    Stop,
    /// Generic RPC dispatch: `target`, `method`, and trailing argument bytes.
    Rpc {
        target: String,
        method: String,
        args: Vec<u8>,
    },
    /// A service-level error reply (`Error:<reason>`).
    Error(String),
    /// Ordinary payload bytes — not a recognized sentinel.
    Data(Vec<u8>),
}

impl ControlMessage {
    /// Decodes a raw blob payload into a tagged control message.
    pub fn decode(payload: &[u8]) -> ControlMessage {
        if payload == raw::CLOSE_SESSION {
            return ControlMessage::Close;
        }
        if payload == raw::STOP_SERVER {
            return ControlMessage::Stop;
        }
        if let Some(rest) = payload.strip_prefix(raw::OPEN_SESSION_PREFIX) {
            return ControlMessage::Open(String::from_utf8_lossy(rest).into_owned());
        }
        if let Some(rest) = payload.strip_prefix(raw::ERROR_PREFIX) {
            return ControlMessage::Error(String::from_utf8_lossy(rest).into_owned());
        }
        if let Some(rest) = payload.strip_prefix(raw::GENERIC_RPC_PREFIX) {
            if let Some(rpc) = decode_rpc(rest) {
                return rpc;
            }
        }
        ControlMessage::Data(payload.to_vec())
    }

    /// Encodes this message back into the exact bytes it was decoded from
    /// (or would be decoded from, for a freshly constructed message).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMessage::Open(cap) => {
                let mut out = raw::OPEN_SESSION_PREFIX.to_vec();
                out.extend_from_slice(cap.as_bytes());
                out
            }
            ControlMessage::Close => raw::CLOSE_SESSION.to_vec(),
            ControlMessage::Stop => raw::STOP_SERVER.to_vec(),
            ControlMessage::Rpc {
                target,
                method,
                args,
            } => {
                let mut out = raw::GENERIC_RPC_PREFIX.to_vec();
                out.extend_from_slice(target.as_bytes());
                out.push(RPC_FIELD_SEP);
                out.extend_from_slice(method.as_bytes());
                out.push(RPC_FIELD_SEP);
                out.extend_from_slice(args);
                out
            }
            ControlMessage::Error(reason) => {
                let mut out = raw::ERROR_PREFIX.to_vec();
                out.extend_from_slice(reason.as_bytes());
                out
            }
            ControlMessage::Data(bytes) => bytes.clone(),
        }
    }

    /// Builds the `Error:ServiceNotKnown:<name>` reply (`spec.md` §4.3/§7).
    pub fn service_not_known(name: &str) -> ControlMessage {
        let mut reason = String::from_utf8_lossy(raw::SERVICE_NOT_KNOWN_PREFIX).into_owned();
        reason.push_str(name);
        ControlMessage::Error(reason)
    }

    /// If this is an `Error:ServiceNotKnown:<name>` reply, returns `name`.
    pub fn as_service_not_known(&self) -> Option<&str> {
        match self {
            ControlMessage::Error(reason) => reason
                .as_bytes()
                .strip_prefix(raw::SERVICE_NOT_KNOWN_PREFIX)
                .map(|_| &reason[raw::SERVICE_NOT_KNOWN_PREFIX.len()..]),
            _ => None,
        }
    }
}

/// Splits a `target:method:args` payload on the separator into exactly
/// three fields, `args` taking everything after the second separator
/// (args themselves may legally contain the separator byte).
fn decode_rpc(rest: &[u8]) -> Option<ControlMessage> {
    let first = rest.iter().position(|&b| b == RPC_FIELD_SEP)?;
    let (target, after_target) = rest.split_at(first);
    let after_target = &after_target[1..];
    let second = after_target.iter().position(|&b| b == RPC_FIELD_SEP)?;
    let (method, after_method) = after_target.split_at(second);
    let args = &after_method[1..];
    Some(ControlMessage::Rpc {
        target: String::from_utf8_lossy(target).into_owned(),
        method: String::from_utf8_lossy(method).into_owned(),
        args: args.to_vec(),
    })
}

/// Parses a discovery-session reply containing the decimal ASCII `sid`
/// allocated by `open_session`'s server-side handler, or surfaces the
/// server's `Error:` reply as a [`ProtocolError::PeerError`].
pub fn parse_sid_reply(payload: &[u8]) -> Result<u64, ProtocolError> {
    let message = ControlMessage::decode(payload);
    if let Some(name) = message.as_service_not_known() {
        return Err(ProtocolError::ServiceNotKnown(name.to_string()));
    }
    match message {
        ControlMessage::Error(reason) => Err(ProtocolError::PeerError(reason)),
        ControlMessage::Data(bytes) => {
            let text = std::str::from_utf8(&bytes)
                .map_err(|_| ProtocolError::Malformed("sid reply is not UTF-8".into()))?;
            text.trim()
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("sid reply not decimal: {text:?}")))
        }
        other => Err(ProtocolError::Malformed(format!(
            "unexpected reply to open_session: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_close_and_stop() {
        assert_eq!(ControlMessage::decode(raw::CLOSE_SESSION), ControlMessage::Close);
        assert_eq!(ControlMessage::decode(raw::STOP_SERVER), ControlMessage::Stop);
    }

    #[test]
    fn round_trips_open_session() {
        let msg = ControlMessage::Open("socks4".to_string());
        let encoded = msg.encode();
        assert_eq!(ControlMessage::decode(&encoded), msg);
    }

    #[test]
    fn round_trips_rpc_with_binary_args() {
        let msg = ControlMessage::Rpc {
            target: "server".to_string(),
            method: "ping".to_string(),
            args: vec![0, 1, 2, 255],
        };
        let encoded = msg.encode();
        assert_eq!(ControlMessage::decode(&encoded), msg);
    }

    #[test]
    fn service_not_known_round_trips() {
        let msg = ControlMessage::service_not_known("socks5");
        assert_eq!(msg.as_service_not_known(), Some("socks5"));
    }

    #[test]
    fn parse_sid_reply_accepts_decimal() {
        assert_eq!(parse_sid_reply(b"42").unwrap(), 42);
    }

    #[test]
    fn parse_sid_reply_surfaces_peer_error() {
        let err = ControlMessage::service_not_known("bogus").encode();
        let result = parse_sid_reply(&err);
        assert!(matches!(result, Err(ProtocolError::PeerError(_))));
    }

    #[test]
    fn ordinary_payload_decodes_as_data() {
        let payload = b"just some bytes";
        assert_eq!(
            ControlMessage::decode(payload),
            ControlMessage::Data(payload.to_vec())
        );
    }
}
