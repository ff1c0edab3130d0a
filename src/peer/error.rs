use thiserror::Error;

/// Errors that can occur during peer communication.
///
/// Every variant except `Io` describes something the remote side did wrong;
/// the connection that produced it is closed without retry.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// A fixed-size message arrived with the wrong length.
    #[error("bad length {length} for message id {id}")]
    BadLength { id: u8, length: usize },

    /// A frame announced a length above the accepted maximum.
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// A piece index at or beyond the torrent's piece count.
    #[error("piece index {0} out of range")]
    InvalidPieceIndex(u32),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Extension protocol error.
    #[error("extension error: {0}")]
    Extension(String),

    /// Error decoding bencode in extension messages.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}
