#![forbid(unsafe_code)]

//! Library half of the relay daemon: configuration, the NAT table, the
//! TCP/UDP relay loops, and server composition. `main.rs` is a thin CLI
//! shell over this crate so integration tests can drive the same code
//! the binary runs.

pub mod config;
pub mod error;
pub mod nat;
pub mod relay;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
