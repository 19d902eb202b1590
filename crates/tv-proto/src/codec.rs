//! Length-prefixed framing: `LEN\r\nPAYLOAD`.
//!
//! LEN is the decimal byte length of PAYLOAD; PAYLOAD is one UTF-8 JSON
//! message.  Decoding surfaces three outcomes: a complete [`Message`],
//! need-more-bytes (`Ok(None)`), or a [`CodecError`] -- on error the owning
//! connection must be closed and its peer entry discarded.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Message, RpcError};

/// Upper bound on one frame; anything larger is a protocol violation.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Longest accepted decimal length prefix ("1048576" is 7 digits).
const MAX_PREFIX_DIGITS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed length prefix")]
    BadLengthPrefix,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("payload is not valid utf-8")]
    BadUtf8,
    #[error("{0}")]
    BadMessage(#[from] RpcError),
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Prefix,
    Payload(usize),
}

/// Codec for one control connection, usable with `Framed`.
#[derive(Debug, Default)]
pub struct RpcCodec {
    state: DecodeState,
}

impl RpcCodec {
    pub fn new() -> Self {
        RpcCodec::default()
    }
}

impl Decoder for RpcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            match self.state {
                DecodeState::Prefix => {
                    let Some(crlf) = find_crlf(src) else {
                        if src.len() > MAX_PREFIX_DIGITS {
                            return Err(CodecError::BadLengthPrefix);
                        }
                        return Ok(None);
                    };
                    if crlf == 0 || crlf > MAX_PREFIX_DIGITS {
                        return Err(CodecError::BadLengthPrefix);
                    }
                    let len = parse_decimal(&src[..crlf]).ok_or(CodecError::BadLengthPrefix)?;
                    if len > MAX_FRAME_LEN {
                        return Err(CodecError::FrameTooLarge(len));
                    }
                    src.advance(crlf + 2);
                    self.state = DecodeState::Payload(len);
                }
                DecodeState::Payload(len) => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(len);
                    self.state = DecodeState::Prefix;
                    let text =
                        std::str::from_utf8(&payload).map_err(|_| CodecError::BadUtf8)?;
                    return Ok(Some(Message::from_json(text)?));
                }
            }
        }
    }
}

impl Encoder<Message> for RpcCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = msg.to_json();
        if payload.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }
        let prefix = payload.len().to_string();
        dst.reserve(prefix.len() + 2 + payload.len());
        dst.put_slice(prefix.as_bytes());
        dst.put_slice(b"\r\n");
        dst.put_slice(payload.as_bytes());
        Ok(())
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_decimal(digits: &[u8]) -> Option<usize> {
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
