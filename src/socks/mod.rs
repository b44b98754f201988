//! SOCKS4/4a/5 proxy (C5/C6, `spec.md` §4.5-§4.6): a local front-end
//! listener (`front`) paired with two remote back-end [`crate::action::Action`]
//! implementations (`back4`, `back5`), bridged over [`crate::session::Session`]
//! with the `DATA`-tag framing convention from `spec.md` §3.

mod bridge;

pub mod back4;
pub mod back5;
pub mod front;
pub mod wire;

pub use back4::Socks4Backend;
pub use back5::Socks5Backend;
pub use front::{ProxyMode, SocksFrontEnd};
