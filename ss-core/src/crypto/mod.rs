pub mod cipher;
pub mod kdf;

pub use cipher::{derive_subkey, AeadSession, CipherKind, PreSharedKey};
