use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Protocol-level failures of the AEAD framing, replay filter, and SOCKS
/// codec. Every variant here is per-connection (or per-datagram) fatal;
/// none of them should ever propagate past a single worker task.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("aead seal failed: {0}")]
    Seal(String),

    #[error("aead open failed: {0}")]
    Open(String),

    #[error("nonce space exhausted for this direction")]
    NonceOverflow,

    #[error("repeated salt, possible replay")]
    RepeatedSalt,

    #[error("truncated frame")]
    Truncated,

    #[error("packet too short")]
    PacketTooShort,

    #[error("empty packet")]
    EmptyPacket,

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("domain length missing")]
    DomainLengthMissing,

    #[error("domain name too long for SOCKS encoding: {0} bytes")]
    DomainTooLong(usize),

    #[error("socks command not supported: {0}")]
    CommandNotSupported(u8),
}

impl Error {
    /// Short kind tag for logging, per spec's "short kind tag and a
    /// one-line cause" error presentation rule.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::UnsupportedCipher(_) => "unsupported_cipher",
            Error::Seal(_) => "seal",
            Error::Open(_) => "open",
            Error::NonceOverflow => "nonce_overflow",
            Error::RepeatedSalt => "repeated_salt",
            Error::Truncated => "truncated",
            Error::PacketTooShort => "packet_too_short",
            Error::EmptyPacket => "empty_packet",
            Error::UnsupportedAddressType(_) => "unsupported_address_type",
            Error::DomainLengthMissing => "domain_length_missing",
            Error::DomainTooLong(_) => "domain_too_long",
            Error::CommandNotSupported(_) => "command_not_supported",
        }
    }

    /// True for errors that represent ordinary peer-initiated teardown
    /// (EOF, reset, timeout) rather than a protocol violation.
    pub fn is_transient_io(&self) -> bool {
        matches!(self, Error::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::BrokenPipe
        ))
    }
}
