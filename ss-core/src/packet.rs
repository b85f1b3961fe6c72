#![forbid(unsafe_code)]

//! The UDP AEAD framing layer (C6): `ShadowedPacketSocket` wraps a
//! `tokio::net::UdpSocket` and speaks the per-packet record format from
//! spec §4.6 — `salt || sealed(payload, nonce = 0)`. Every datagram is an
//! independent sealing under a fresh salt; there is no per-direction nonce
//! state to carry between packets.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::crypto::{derive_subkey, AeadSession, CipherKind, PreSharedKey};
use crate::error::{Error, Result};
use crate::filter::SaltFilter;

/// Maximum UDP datagram size the relay will allocate a receive buffer for.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

pub struct ShadowedPacketSocket {
    socket: Arc<UdpSocket>,
    psk: Arc<PreSharedKey>,
    kind: CipherKind,
    salt_filter: Arc<SaltFilter>,
    /// Guards the full duration of `seal + send_to` on the write path so
    /// concurrent senders never interleave fragments of different
    /// datagrams (spec §4.6/§9). Each caller still builds its own
    /// scratch buffer, so the critical section only needs to cover the
    /// actual socket write.
    send_lock: Mutex<()>,
}

impl ShadowedPacketSocket {
    pub fn new(socket: Arc<UdpSocket>, psk: Arc<PreSharedKey>, salt_filter: Arc<SaltFilter>) -> Self {
        let kind = psk.kind();
        Self {
            socket,
            psk,
            kind,
            salt_filter,
            send_lock: Mutex::new(()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Seal `payload` under a fresh salt and send it to `target`.
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
        let salt_size = self.kind.salt_size();
        let mut salt = vec![0u8; salt_size];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let subkey = derive_subkey(self.psk.bytes(), &salt, self.kind);
        let mut session = AeadSession::new(self.kind, &subkey);
        let ciphertext = session.seal(payload)?;
        self.salt_filter.add(&salt).await;

        let mut datagram = Vec::with_capacity(salt_size + ciphertext.len());
        datagram.extend_from_slice(&salt);
        datagram.extend_from_slice(&ciphertext);

        let _guard = self.send_lock.lock().await;
        self.socket.send_to(&datagram, target).await?;
        Ok(())
    }

    /// Receive one datagram, open it, and return the source address and
    /// decrypted plaintext (`SOCKS address || inner payload`).
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(SocketAddr, Vec<u8>)> {
        let (len, src) = self.socket.recv_from(buf).await?;
        let data = &buf[..len];

        let salt_size = self.kind.salt_size();
        if data.len() < salt_size {
            return Err(Error::PacketTooShort);
        }
        let (salt, rest) = data.split_at(salt_size);

        if self.salt_filter.contains(salt).await {
            return Err(Error::RepeatedSalt);
        }
        if rest.len() < CipherKind::TAG_SIZE {
            return Err(Error::PacketTooShort);
        }

        let subkey = derive_subkey(self.psk.bytes(), salt, self.kind);
        self.salt_filter.add(salt).await;
        let mut session = AeadSession::new(self.kind, &subkey);
        let plaintext = session.open(rest)?;
        Ok((src, plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    async fn bound_socket() -> Arc<UdpSocket> {
        Arc::new(
            UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn roundtrip_datagram() {
        let psk = Arc::new(PreSharedKey::derive("secret", CipherKind::Chacha20IetfPoly1305));
        let filter = Arc::new(SaltFilter::with_capacity(1000, 1e-6));

        let server_raw = bound_socket().await;
        let server_addr = server_raw.local_addr().unwrap();
        let server = ShadowedPacketSocket::new(server_raw, psk.clone(), filter.clone());

        let client_raw = bound_socket().await;
        let client = ShadowedPacketSocket::new(client_raw, psk, filter);

        client.send_to(b"hello socks", server_addr).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (_src, plaintext) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(plaintext, b"hello socks");
    }

    #[tokio::test]
    async fn replayed_salt_is_rejected() {
        let kind = CipherKind::Aes128Gcm;
        let psk = Arc::new(PreSharedKey::derive("secret", kind));
        let filter = Arc::new(SaltFilter::with_capacity(1000, 1e-6));

        let server_raw = bound_socket().await;
        let server_addr = server_raw.local_addr().unwrap();
        let server = ShadowedPacketSocket::new(server_raw, psk.clone(), filter.clone());

        // Build one valid datagram by hand so its raw bytes can be resent.
        let salt_size = kind.salt_size();
        let mut salt = vec![0u8; salt_size];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let subkey = derive_subkey(psk.bytes(), &salt, kind);
        let mut session = AeadSession::new(kind, &subkey);
        let ciphertext = session.seal(b"hello").unwrap();
        let mut datagram = salt.clone();
        datagram.extend_from_slice(&ciphertext);

        let client_raw = bound_socket().await;
        client_raw.send_to(&datagram, server_addr).await.unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (_src, pt) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(pt, b"hello");

        // Resending the exact same bytes must be rejected: the salt was
        // already recorded by the first receive.
        client_raw.send_to(&datagram, server_addr).await.unwrap();
        let mut buf2 = vec![0u8; MAX_DATAGRAM_SIZE];
        let err = server.recv_from(&mut buf2).await.unwrap_err();
        assert!(matches!(err, Error::RepeatedSalt));
    }
}
