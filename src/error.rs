//! Error types for the relay and the peer adapter

use std::net::SocketAddr;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong on either side of the relay.
///
/// [`Error::ConnectionLost`], [`Error::FrameTooLarge`], [`Error::Io`] and
/// [`Error::Handshake`] end a control connection. The rest are logged and the
/// offending frame or datagram is dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad discriminant, truncated header or a length that disagrees with the
    /// bytes actually present.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Declared length above [`crate::model::frame::MAX_FRAME_LEN`].
    #[error("Frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(u32),

    /// Media datagram from an address no session has registered.
    #[error("No session registered for media address {0}")]
    UnregisteredSender(SocketAddr),

    /// Write to one session's handle failed during a fan-out.
    #[error("Delivery to {identity} failed: {source}")]
    PeerDelivery {
        /// Identity of the session that could not be reached
        identity: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// The control connection reached end of stream.
    #[error("Connection lost")]
    ConnectionLost,

    /// The raw identity exchange did not produce a usable name.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A structured payload is not an object or misses a required field.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Bad command-line argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary field inside a structured payload is not valid base64
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    /// Whether the connection that produced this error can keep going.
    ///
    /// A lost or unframed stream, a socket error and a failed handshake end
    /// the connection; everything else drops one frame or datagram.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::ConnectionLost | Error::FrameTooLarge(_) | Error::Io(_) | Error::Handshake(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stream_breaking_errors_are_fatal() {
        assert!(!Error::ConnectionLost.is_recoverable());
        assert!(!Error::FrameTooLarge(u32::MAX).is_recoverable());
        assert!(!Error::Handshake("empty identity".into()).is_recoverable());
        assert!(!Error::Io(std::io::ErrorKind::BrokenPipe.into()).is_recoverable());
        assert!(Error::MalformedFrame("bad kind".into()).is_recoverable());
        assert!(Error::InvalidPayload("not an object".into()).is_recoverable());
        assert!(Error::UnregisteredSender("127.0.0.1:9".parse().unwrap()).is_recoverable());
    }
}
