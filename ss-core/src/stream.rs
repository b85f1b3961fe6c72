#![forbid(unsafe_code)]

//! The TCP AEAD framing layer (C5): `ShadowedStream` wraps a byte stream
//! and speaks the record format from spec §4.5 — a per-direction salt
//! followed by `sealed_length || sealed_payload` records — with lazy,
//! independent reader/writer initialization since either peer may speak
//! first.

use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::crypto::{derive_subkey, AeadSession, CipherKind, PreSharedKey};
use crate::error::{Error, Result};
use crate::filter::SaltFilter;
use crate::socks::{self, Address, ByteSource};

/// Maximum plaintext payload per record: `0x3FFF` (top two length bits
/// reserved/zero).
pub const MAX_PAYLOAD_LEN: usize = 0x3FFF;

struct ReaderState {
    session: AeadSession,
    leftover: Vec<u8>,
    leftover_pos: usize,
}

/// Wraps any `AsyncRead + AsyncWrite` byte stream with the shadowsocks
/// AEAD record framing. Does not itself implement `AsyncRead`/`AsyncWrite`:
/// callers use `read`/`write_all` directly, which keeps the nonce/salt
/// state machine in linear async code.
pub struct ShadowedStream<S> {
    inner: S,
    psk: Arc<PreSharedKey>,
    kind: CipherKind,
    salt_filter: Arc<SaltFilter>,
    reader: Option<ReaderState>,
    writer: Option<AeadSession>,
}

impl<S> ShadowedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(inner: S, psk: Arc<PreSharedKey>, salt_filter: Arc<SaltFilter>) -> Self {
        let kind = psk.kind();
        Self {
            inner,
            psk,
            kind,
            salt_filter,
            reader: None,
            writer: None,
        }
    }

    /// Consume `self`, returning the wrapped stream. Used when the relay
    /// needs to apply a read/write deadline directly to the underlying
    /// socket (the "deadline poke" trick, spec §9) after the shadowed
    /// layer is done with it.
    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    async fn init_reader(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let salt_size = self.kind.salt_size();
        let mut salt = vec![0u8; salt_size];
        self.inner
            .read_exact(&mut salt)
            .await
            .map_err(|_| Error::Truncated)?;
        if self.salt_filter.contains(&salt).await {
            return Err(Error::RepeatedSalt);
        }
        let subkey = derive_subkey(self.psk.bytes(), &salt, self.kind);
        self.salt_filter.add(&salt).await;
        self.reader = Some(ReaderState {
            session: AeadSession::new(self.kind, &subkey),
            leftover: Vec::new(),
            leftover_pos: 0,
        });
        Ok(())
    }

    async fn init_writer(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let salt_size = self.kind.salt_size();
        let mut salt = vec![0u8; salt_size];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let subkey = derive_subkey(self.psk.bytes(), &salt, self.kind);
        self.inner.write_all(&salt).await?;
        self.salt_filter.add(&salt).await;
        self.writer = Some(AeadSession::new(self.kind, &subkey));
        Ok(())
    }

    /// Read and decrypt the next whole record into the reader's leftover
    /// buffer. Called only once the leftover buffer has been fully drained.
    async fn fill_record(&mut self) -> Result<()> {
        let tag_size = CipherKind::TAG_SIZE;
        let mut len_ct = vec![0u8; 2 + tag_size];
        self.inner
            .read_exact(&mut len_ct)
            .await
            .map_err(|_| Error::Truncated)?;
        let reader = self.reader.as_mut().expect("reader initialized by caller");
        let len_pt = reader.session.open(&len_ct)?;
        let len = (u16::from_be_bytes([len_pt[0], len_pt[1]]) & 0x3FFF) as usize;

        let mut payload_ct = vec![0u8; len + tag_size];
        self.inner
            .read_exact(&mut payload_ct)
            .await
            .map_err(|_| Error::Truncated)?;
        let reader = self.reader.as_mut().expect("reader initialized above");
        let payload = reader.session.open(&payload_ct)?;
        reader.leftover = payload;
        reader.leftover_pos = 0;
        Ok(())
    }

    /// Read up to `buf.len()` decrypted bytes, initializing the reader
    /// (and checking the salt against the replay filter) on first use.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.init_reader().await?;
        loop {
            let reader = self.reader.as_ref().expect("just initialized");
            if reader.leftover_pos < reader.leftover.len() {
                break;
            }
            self.fill_record().await?;
        }
        let reader = self.reader.as_mut().expect("just initialized");
        let available = &reader.leftover[reader.leftover_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        reader.leftover_pos += n;
        Ok(n)
    }

    /// Read exactly `n` decrypted bytes, looping over `read` as needed.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.read(&mut out[filled..]).await?;
            if read == 0 {
                return Err(Error::Truncated);
            }
            filled += read;
        }
        Ok(out)
    }

    /// Read one SOCKS `Address` from the decrypted stream. The first call
    /// on a fresh connection triggers reader initialization (and therefore
    /// the replay-filter salt check) before any bytes of the address are
    /// consumed.
    pub async fn read_address(&mut self) -> Result<Address> {
        socks::read_from(self).await
    }

    /// Encrypt and write `data`, splitting it into records of at most
    /// `MAX_PAYLOAD_LEN` plaintext bytes each. Initializes the writer
    /// (emitting a fresh salt) on first use.
    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        self.init_writer().await?;
        while !data.is_empty() {
            let chunk_len = data.len().min(MAX_PAYLOAD_LEN);
            let (chunk, rest) = data.split_at(chunk_len);
            data = rest;

            let writer = self.writer.as_mut().expect("just initialized");
            let len_field = (chunk_len as u16).to_be_bytes();
            let len_ct = writer.seal(&len_field)?;
            let payload_ct = writer.seal(chunk)?;

            self.inner.write_all(&len_ct).await?;
            self.inner.write_all(&payload_ct).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Split into independent read/write halves so a relay can drive both
    /// directions from separate tasks. The two halves share no AEAD state
    /// (reader and writer already use independent salts and sessions);
    /// only the underlying byte stream needs splitting, via
    /// `tokio::io::split`'s internal lock.
    pub fn split(self) -> (ShadowedReadHalf<S>, ShadowedWriteHalf<S>) {
        let (read_half, write_half) = tokio::io::split(self.inner);
        let reader = ShadowedReadHalf {
            inner: read_half,
            psk: self.psk.clone(),
            kind: self.kind,
            salt_filter: self.salt_filter.clone(),
            reader: self.reader,
        };
        let writer = ShadowedWriteHalf {
            inner: write_half,
            psk: self.psk,
            kind: self.kind,
            salt_filter: self.salt_filter,
            writer: self.writer,
        };
        (reader, writer)
    }
}

/// The read half produced by [`ShadowedStream::split`].
pub struct ShadowedReadHalf<S> {
    inner: ReadHalf<S>,
    psk: Arc<PreSharedKey>,
    kind: CipherKind,
    salt_filter: Arc<SaltFilter>,
    reader: Option<ReaderState>,
}

impl<S> ShadowedReadHalf<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    async fn init_reader(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let salt_size = self.kind.salt_size();
        let mut salt = vec![0u8; salt_size];
        self.inner
            .read_exact(&mut salt)
            .await
            .map_err(|_| Error::Truncated)?;
        if self.salt_filter.contains(&salt).await {
            return Err(Error::RepeatedSalt);
        }
        let subkey = derive_subkey(self.psk.bytes(), &salt, self.kind);
        self.salt_filter.add(&salt).await;
        self.reader = Some(ReaderState {
            session: AeadSession::new(self.kind, &subkey),
            leftover: Vec::new(),
            leftover_pos: 0,
        });
        Ok(())
    }

    async fn fill_record(&mut self) -> Result<()> {
        let tag_size = CipherKind::TAG_SIZE;
        let mut len_ct = vec![0u8; 2 + tag_size];
        self.inner
            .read_exact(&mut len_ct)
            .await
            .map_err(|_| Error::Truncated)?;
        let reader = self.reader.as_mut().expect("reader initialized by caller");
        let len_pt = reader.session.open(&len_ct)?;
        let len = (u16::from_be_bytes([len_pt[0], len_pt[1]]) & 0x3FFF) as usize;

        let mut payload_ct = vec![0u8; len + tag_size];
        self.inner
            .read_exact(&mut payload_ct)
            .await
            .map_err(|_| Error::Truncated)?;
        let reader = self.reader.as_mut().expect("reader initialized above");
        let payload = reader.session.open(&payload_ct)?;
        reader.leftover = payload;
        reader.leftover_pos = 0;
        Ok(())
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.init_reader().await?;
        loop {
            let reader = self.reader.as_ref().expect("just initialized");
            if reader.leftover_pos < reader.leftover.len() {
                break;
            }
            self.fill_record().await?;
        }
        let reader = self.reader.as_mut().expect("just initialized");
        let available = &reader.leftover[reader.leftover_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        reader.leftover_pos += n;
        Ok(n)
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.read(&mut out[filled..]).await?;
            if read == 0 {
                return Err(Error::Truncated);
            }
            filled += read;
        }
        Ok(out)
    }

    pub async fn read_address(&mut self) -> Result<Address> {
        socks::read_from(self).await
    }
}

#[async_trait]
impl<S> ByteSource for ShadowedReadHalf<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    async fn read_exact_n(&mut self, n: usize) -> Result<Vec<u8>> {
        self.read_exact(n).await
    }
}

/// The write half produced by [`ShadowedStream::split`].
pub struct ShadowedWriteHalf<S> {
    inner: WriteHalf<S>,
    psk: Arc<PreSharedKey>,
    kind: CipherKind,
    salt_filter: Arc<SaltFilter>,
    writer: Option<AeadSession>,
}

impl<S> ShadowedWriteHalf<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    async fn init_writer(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let salt_size = self.kind.salt_size();
        let mut salt = vec![0u8; salt_size];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let subkey = derive_subkey(self.psk.bytes(), &salt, self.kind);
        self.inner.write_all(&salt).await?;
        self.salt_filter.add(&salt).await;
        self.writer = Some(AeadSession::new(self.kind, &subkey));
        Ok(())
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        self.init_writer().await?;
        while !data.is_empty() {
            let chunk_len = data.len().min(MAX_PAYLOAD_LEN);
            let (chunk, rest) = data.split_at(chunk_len);
            data = rest;

            let writer = self.writer.as_mut().expect("just initialized");
            let len_field = (chunk_len as u16).to_be_bytes();
            let len_ct = writer.seal(&len_field)?;
            let payload_ct = writer.seal(chunk)?;

            self.inner.write_all(&len_ct).await?;
            self.inner.write_all(&payload_ct).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl<S> ByteSource for ShadowedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_exact_n(&mut self, n: usize) -> Result<Vec<u8>> {
        self.read_exact(n).await
    }
}
