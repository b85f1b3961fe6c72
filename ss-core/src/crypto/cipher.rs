#![forbid(unsafe_code)]

//! AEAD cipher construction: cipher identifiers, the per-server
//! pre-shared key, HKDF-SHA1 subkey derivation, and the per-direction
//! `AeadSession` that owns nonce state.

use aead::generic_array::GenericArray;
use aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha1::Sha1;
use zeroize::Zeroize;

use super::kdf::derive_key;
use crate::error::{Error, Result};

/// The three cipher suites the protocol supports, matched case-insensitively
/// against the wire identifiers in spec §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20IetfPoly1305,
}

impl CipherKind {
    /// All AEAD suites here use a 96-bit nonce and a 128-bit tag.
    pub const NONCE_SIZE: usize = 12;
    pub const TAG_SIZE: usize = 16;

    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(Self::Aes128Gcm),
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            "chacha20-ietf-poly1305" => Ok(Self::Chacha20IetfPoly1305),
            other => Err(Error::UnsupportedCipher(other.to_string())),
        }
    }

    pub fn key_size(self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::Chacha20IetfPoly1305 => 32,
        }
    }

    /// `max(key_size, 16)`: AES-128-GCM uses a 16-byte salt, the others 32.
    pub fn salt_size(self) -> usize {
        self.key_size().max(16)
    }
}

/// Opaque, zeroized-on-drop pre-shared key, derived once at server start.
pub struct PreSharedKey {
    bytes: Vec<u8>,
    kind: CipherKind,
}

impl PreSharedKey {
    pub fn derive(password: &str, kind: CipherKind) -> Self {
        let bytes = derive_key(password.as_bytes(), kind.key_size());
        Self { bytes, kind }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for PreSharedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// `subkey = HKDF-SHA1(ikm = psk, salt = session_salt, info = "ss-subkey", L = key_size)`
pub fn derive_subkey(psk: &[u8], salt: &[u8], kind: CipherKind) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), psk);
    let mut okm = vec![0u8; kind.key_size()];
    // key_size is at most 32 bytes, far inside HKDF-SHA1's 255*20-byte
    // expand limit, so this can never fail.
    hk.expand(b"ss-subkey", &mut okm)
        .expect("hkdf-sha1 expand within output length limit");
    okm
}

enum AeadImpl {
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    Chacha20(Box<ChaCha20Poly1305>),
}

/// A single-direction AEAD instance bound to one salt/subkey. Holds an
/// incrementing little-endian nonce counter; every successful `seal` or
/// `open` advances it by one.
pub struct AeadSession {
    cipher: AeadImpl,
    nonce: [u8; CipherKind::NONCE_SIZE],
}

impl AeadSession {
    pub fn new(kind: CipherKind, subkey: &[u8]) -> Self {
        let cipher = match kind {
            CipherKind::Aes128Gcm => {
                AeadImpl::Aes128Gcm(Box::new(Aes128Gcm::new(GenericArray::from_slice(subkey))))
            }
            CipherKind::Aes256Gcm => {
                AeadImpl::Aes256Gcm(Box::new(Aes256Gcm::new(GenericArray::from_slice(subkey))))
            }
            CipherKind::Chacha20IetfPoly1305 => AeadImpl::Chacha20(Box::new(
                ChaCha20Poly1305::new(GenericArray::from_slice(subkey)),
            )),
        };
        Self {
            cipher,
            nonce: [0u8; CipherKind::NONCE_SIZE],
        }
    }

    /// Current nonce value, little-endian, for tests that assert
    /// monotonicity.
    pub fn nonce_counter(&self) -> u128 {
        let mut padded = [0u8; 16];
        padded[..12].copy_from_slice(&self.nonce);
        u128::from_le_bytes(padded)
    }

    /// Seal `plaintext`, returning ciphertext with the tag appended, then
    /// advance the nonce. The nonce value consumed by this call is the one
    /// that was current *before* advancing.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(&self.nonce);
        let ct = match &self.cipher {
            AeadImpl::Aes128Gcm(c) => c.encrypt(nonce, plaintext),
            AeadImpl::Aes256Gcm(c) => c.encrypt(nonce, plaintext),
            AeadImpl::Chacha20(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|e| Error::Seal(e.to_string()))?;
        self.advance_nonce()?;
        Ok(ct)
    }

    /// Open `ciphertext` (payload with trailing tag), then advance the
    /// nonce the same way `seal` does.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(&self.nonce);
        let pt = match &self.cipher {
            AeadImpl::Aes128Gcm(c) => c.decrypt(nonce, ciphertext),
            AeadImpl::Aes256Gcm(c) => c.decrypt(nonce, ciphertext),
            AeadImpl::Chacha20(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|e| Error::Open(e.to_string()))?;
        self.advance_nonce()?;
        Ok(pt)
    }

    fn advance_nonce(&mut self) -> Result<()> {
        for byte in self.nonce.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                return Ok(());
            }
        }
        // Wrapped all the way back to zero: every byte overflowed in the
        // same call, meaning the counter exhausted its full range.
        Err(Error::NonceOverflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [CipherKind; 3] = [
        CipherKind::Aes128Gcm,
        CipherKind::Aes256Gcm,
        CipherKind::Chacha20IetfPoly1305,
    ];

    #[test]
    fn cipher_kind_parses_case_insensitively() {
        assert_eq!(
            CipherKind::from_name("AES-128-GCM").unwrap(),
            CipherKind::Aes128Gcm
        );
        assert_eq!(
            CipherKind::from_name("ChaCha20-IETF-Poly1305").unwrap(),
            CipherKind::Chacha20IetfPoly1305
        );
        assert!(CipherKind::from_name("rc4-md5").is_err());
    }

    #[test]
    fn salt_sizes_match_spec() {
        assert_eq!(CipherKind::Aes128Gcm.salt_size(), 16);
        assert_eq!(CipherKind::Aes256Gcm.salt_size(), 32);
        assert_eq!(CipherKind::Chacha20IetfPoly1305.salt_size(), 32);
    }

    #[test]
    fn subkey_derivation_is_deterministic_and_sized() {
        for kind in ALL_KINDS {
            let psk = PreSharedKey::derive("secret", kind);
            let salt = vec![7u8; kind.salt_size()];
            let a = derive_subkey(psk.bytes(), &salt, kind);
            let b = derive_subkey(psk.bytes(), &salt, kind);
            assert_eq!(a, b);
            assert_eq!(a.len(), kind.key_size());
        }
    }

    #[test]
    fn seal_open_roundtrip_for_every_cipher() {
        for kind in ALL_KINDS {
            let psk = PreSharedKey::derive("hunter2", kind);
            let salt = vec![3u8; kind.salt_size()];
            let subkey = derive_subkey(psk.bytes(), &salt, kind);
            let mut sealer = AeadSession::new(kind, &subkey);
            let mut opener = AeadSession::new(kind, &subkey);
            let msg = b"the quick brown fox";
            let ct = sealer.seal(msg).unwrap();
            let pt = opener.open(&ct).unwrap();
            assert_eq!(pt, msg);
        }
    }

    #[test]
    fn nonce_increments_once_per_operation() {
        let kind = CipherKind::Chacha20IetfPoly1305;
        let subkey = vec![1u8; kind.key_size()];
        let mut session = AeadSession::new(kind, &subkey);
        assert_eq!(session.nonce_counter(), 0);
        for expected in 1..=5u128 {
            session.seal(b"x").unwrap();
            assert_eq!(session.nonce_counter(), expected);
        }
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let kind = CipherKind::Aes256Gcm;
        let subkey = vec![9u8; kind.key_size()];
        let mut sealer = AeadSession::new(kind, &subkey);
        let mut opener = AeadSession::new(kind, &subkey);
        let mut ct = sealer.seal(b"payload").unwrap();
        *ct.last_mut().unwrap() ^= 0xFF;
        assert!(opener.open(&ct).is_err());
    }

    proptest::proptest! {
        #[test]
        fn roundtrip_arbitrary_payloads(msg in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..0x3FFF)) {
            let kind = CipherKind::Chacha20IetfPoly1305;
            let subkey = vec![2u8; kind.key_size()];
            let mut sealer = AeadSession::new(kind, &subkey);
            let mut opener = AeadSession::new(kind, &subkey);
            let ct = sealer.seal(&msg).unwrap();
            let pt = opener.open(&ct).unwrap();
            proptest::prop_assert_eq!(pt, msg);
        }
    }
}
