//! Error types for the obfs4 protocol.

use thiserror::Error;

/// Result type alias for obfs4 operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during obfs4 operations.
///
/// Every protocol-integrity failure is fatal: the connection transitions to
/// the broken state and no further frames are accepted. None of the variants
/// carry information that would let a peer distinguish one failure mode from
/// another on the wire.
#[derive(Error, Debug)]
pub enum Error {
    /// The handshake message failed validation (mark not found within the
    /// allowed window, MAC mismatch, or trailing garbage).
    #[error("handshake: invalid handshake")]
    InvalidHandshake,

    /// The handshake was a byte-identical replay of one seen recently.
    ///
    /// Indistinguishable from [`Error::InvalidHandshake`] to the peer.
    #[error("handshake: replayed handshake")]
    Replayed,

    /// The ntor key agreement failed (degenerate shared secret).
    #[error("handshake: ntor handshake failure")]
    NtorFailed,

    /// The server's AUTH value did not match the client's derived one.
    #[error("handshake: ntor AUTH mismatch")]
    AuthMismatch,

    /// AEAD authentication failed on a frame.
    #[error("framing: tag mismatch")]
    TagMismatch,

    /// A deobfuscated frame length fell outside the protocol bounds.
    #[error("framing: invalid frame length: {0}")]
    InvalidFrameLength(u16),

    /// An encoder payload exceeded the maximum frame payload length.
    #[error("framing: invalid payload length: {0}")]
    InvalidPayloadLength(usize),

    /// A decoded packet was shorter than the packet header, or its declared
    /// payload length exceeded the packet body.
    #[error("packet: invalid packet length: {0}")]
    InvalidPacketLength(usize),

    /// The per-direction frame counter would wrap.
    #[error("framing: nonce counter wrapped")]
    NonceWrapped,

    /// The operation is not valid in the connection's current state.
    #[error("connection: invalid state for operation")]
    InvalidState,

    /// The deadline flavor is not supported (only read deadlines are).
    #[error("connection: operation not supported")]
    NotSupported,

    /// A transport argument was missing or malformed.
    #[error("argument error: {0}")]
    Arg(String),

    /// The persisted server state was missing, partial, or malformed.
    #[error("state error: {0}")]
    State(String),

    /// Underlying transport I/O failure.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new argument error.
    pub fn arg(msg: impl Into<String>) -> Self {
        Error::Arg(msg.into())
    }

    /// Create a new state error.
    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    /// Check whether this error must tear down the connection.
    ///
    /// Everything except setup-time errors is fatal to an established
    /// connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Arg(_) | Error::State(_) | Error::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TagMismatch;
        assert_eq!(err.to_string(), "framing: tag mismatch");

        let err = Error::InvalidFrameLength(9000);
        assert_eq!(err.to_string(), "framing: invalid frame length: 9000");
    }

    #[test]
    fn test_error_fatality() {
        assert!(Error::TagMismatch.is_fatal());
        assert!(Error::NonceWrapped.is_fatal());
        assert!(!Error::arg("missing argument 'node-id'").is_fatal());
        assert!(!Error::NotSupported.is_fatal());
    }
}
