#![forbid(unsafe_code)]

//! Protocol core for a Shadowsocks AEAD relay: key derivation, AEAD
//! framing, the salt replay filter, and the SOCKS address codec shared by
//! the TCP and UDP relay paths.

pub mod crypto;
pub mod error;
pub mod filter;
pub mod packet;
pub mod socks;
pub mod stream;

pub use crypto::{derive_subkey, AeadSession, CipherKind, PreSharedKey};
pub use error::{Error, Result};
pub use filter::SaltFilter;
pub use packet::ShadowedPacketSocket;
pub use socks::Address;
pub use stream::ShadowedStream;
