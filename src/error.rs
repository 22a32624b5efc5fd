//! Error kinds for the trunk.

use thiserror::Error;

/// Errors the codec (wire encoding/signing, external to this crate) can report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode buffer too small, increase max_packet_size")]
    BufferTooSmall,
    #[error("packet shorter than RADIUS header ({0} bytes)")]
    ShortPacket(usize),
    #[error("signature verification failed")]
    BadSignature,
    #[error("unknown or unsupported packet code {0}")]
    UnknownCode(u8),
    #[error("Message-Authenticator missing or invalid")]
    MessageAuthenticatorFailed,
}

/// Top-level error type for the trunk.
#[derive(Debug, Error)]
pub enum RadiusClientError {
    #[error("socket I/O error: {0}")]
    SocketIo(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(CodecError),

    #[error("decoding error: {0}")]
    Decoding(CodecError),

    #[error("no free RADIUS ID on this connection")]
    TrackingFull,

    #[error("retry exhausted: {0:?}")]
    RetryExhausted(RetryExhaustion),

    #[error("trunk at capacity")]
    CapacityExhausted,

    #[error("all connections to the destination are dead")]
    DestinationUnavailable,

    #[error("protocol error reply, original packet code mismatch")]
    ProtocolErrorMismatch,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a retry engine gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryExhaustion {
    MaxRetransmitCount,
    MaxRetransmitDuration,
}

/// Result code the Dispatcher ultimately hands back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Updated,
    Reject,
    Handled,
    Fail,
    Noop,
}
