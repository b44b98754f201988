//! Client/server peer roles (C3, `spec.md` §4.3): discovery, capability
//! advertisement, session opening, and the generic RPC/stop dispatch that
//! runs on the `sid=0` discovery channel.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;

/// Opt-in surface for the generic RPC sentinel (`GenericMessageFor:`,
/// `spec.md` §3/§4.3) dispatched against a registered [`crate::action::Action`]
/// rather than the server itself. The original's Python dispatch reflects
/// on arbitrary attributes (`getattr`); Rust has no equivalent, so only
/// actions that implement this trait are reachable by name — a narrower
/// surface than the original, recorded as an open-question resolution in
/// `DESIGN.md`.
pub trait RpcTarget: Send + Sync {
    /// Invokes `method` with `args`, returning its reply bytes or an error
    /// string (surfaced to the caller as `Error:<reason>`).
    fn call(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, String>;
}
