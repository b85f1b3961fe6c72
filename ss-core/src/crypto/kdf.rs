#![forbid(unsafe_code)]

//! EVP_BytesToKey-style key derivation (OpenSSL's legacy KDF, no salt,
//! iteration count 1), the scheme Shadowsocks uses to turn a password into
//! a fixed-length pre-shared key.

/// Derive a `key_size`-byte key from `password` via iterated MD5:
///
/// `H0 = MD5(password)`, `Hi = MD5(H(i-1) || password)`, output is
/// `H0 || H1 || ...` truncated to `key_size`.
///
/// Deterministic: the same `(password, key_size)` always yields the same
/// key, which property tests in `crypto::cipher` rely on.
pub fn derive_key(password: &[u8], key_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(key_size + 16);
    let mut prev: Vec<u8> = Vec::new();
    while out.len() < key_size {
        let mut input = Vec::with_capacity(prev.len() + password.len());
        input.extend_from_slice(&prev);
        input.extend_from_slice(password);
        let digest = md5::compute(&input);
        out.extend_from_slice(&digest.0);
        prev = digest.0.to_vec();
    }
    out.truncate(key_size);
    out
}
