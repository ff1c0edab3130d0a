use bytes::{Buf, BytesMut};

use super::error::PeerError;
use super::message::Message;
use crate::constants::MAX_MESSAGE_SIZE;

/// Outcome of asking the decoder for the next message.
#[derive(Debug)]
pub enum ParseResult {
    /// A whole message was consumed from the buffer.
    Complete(Message),
    /// More bytes are needed.
    NeedMore,
    /// The stream is malformed; the connection must be closed.
    Violation(PeerError),
}

/// Splits an incoming byte stream into length-prefixed messages.
///
/// Bytes are appended with [`FrameDecoder::extend`] as they arrive from the
/// socket and drained one message at a time with [`FrameDecoder::next`].
/// After a violation the decoder stays poisoned.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame: usize,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limit(MAX_MESSAGE_SIZE)
    }

    pub fn with_limit(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
            poisoned: false,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> ParseResult {
        if self.poisoned {
            return ParseResult::Violation(PeerError::Protocol("stream already failed".into()));
        }
        if self.buf.len() < 4 {
            return ParseResult::NeedMore;
        }

        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > self.max_frame {
            self.poisoned = true;
            return ParseResult::Violation(PeerError::FrameTooLarge(length));
        }
        if self.buf.len() < 4 + length {
            self.buf.reserve(4 + length - self.buf.len());
            return ParseResult::NeedMore;
        }

        self.buf.advance(4);
        let body = self.buf.split_to(length).freeze();
        match Message::decode_body(body) {
            Ok(message) => ParseResult::Complete(message),
            Err(e) => {
                self.poisoned = true;
                ParseResult::Violation(e)
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
