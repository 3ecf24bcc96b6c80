use thiserror::Error;

/// Errors raised while parsing a command or packet off the wire.
///
/// All variants are recoverable: the caller logs and drops the offending datagram
/// rather than tearing down a connection over a single malformed packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid data: {reason}")]
    InvalidData { reason: &'static str },
    #[error("unknown command {0:?}")]
    UnknownCommand([u8; 2]),
    #[error("name field not NUL-terminated before end of packet")]
    NameNotNulTerminated,
    #[error("name field is not valid UTF-8")]
    Utf8,
}

/// Errors raised by session registry bookkeeping (§4.4). Never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("ssrc rebind for initiator {initiator_token:#x}: existing={existing:#x} attempted={attempted:#x}")]
    SsrcMismatch { initiator_token: u32, existing: u32, attempted: u32 },
}

/// Top-level error for fallible setup-time operations (socket bind, config load).
#[derive(Debug, Error)]
pub enum RtpMidiError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}
