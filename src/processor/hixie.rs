//! Hixie draft 76 (version 0)
//!
//! The oldest draft still seen in the wild. The handshake is an MD5
//! challenge built from two space-and-digit keys plus eight trailing body
//! bytes; frames are sentinel-delimited UTF-8 text (`0x00 … 0xFF`) with no
//! control frames. `0xFF 0x00` closes the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};

use crate::error::{Error, Result};
use crate::http::{Request, Response, Uri};
use crate::message::{Message, MessageManager};
use crate::utf8::validate_utf8;

use super::Role;

const TEXT_START: u8 = 0x00;
const TEXT_END: u8 = 0xFF;

/// Handshake processor for draft-76
pub struct HixieProcessor {
    role: Role,
    max_message_size: usize,
}

impl HixieProcessor {
    /// Length of the key3 challenge bytes trailing the request headers
    pub const KEY3_LEN: usize = 8;

    pub(crate) fn new(role: Role, max_message_size: usize) -> Self {
        Self {
            role,
            max_message_size,
        }
    }

    /// Validate a server-side draft-76 request and fill in the response
    ///
    /// The 16-byte challenge digest trails the response headers raw, so the
    /// Content-Length header set by `set_body` is stripped again.
    pub fn validate_server(
        &self,
        request: &Request,
        uri: &Uri,
        response: &mut Response,
    ) -> Result<()> {
        if request.method() != "GET" {
            return Err(Error::HandshakeFailed("method must be GET"));
        }
        if !request.header_contains("Upgrade", "websocket") {
            return Err(Error::HandshakeFailed("missing Upgrade: WebSocket"));
        }
        if !request.header_contains("Connection", "upgrade") {
            return Err(Error::HandshakeFailed("missing Connection: Upgrade"));
        }

        let key1 = request
            .header("Sec-WebSocket-Key1")
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key1"))?;
        let key2 = request
            .header("Sec-WebSocket-Key2")
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key2"))?;
        let key3 = request.body();
        if key3.len() != Self::KEY3_LEN {
            return Err(Error::HandshakeFailed("missing key3 bytes"));
        }

        let digest = challenge_response(key1, key2, key3)?;

        let scheme = if uri.secure() { "wss" } else { "ws" };
        let location = format!("{}://{}{}", scheme, uri.authority(), uri.resource());

        response.set_status_reason(101, "WebSocket Protocol Handshake");
        response.replace_header("Upgrade", "WebSocket");
        response.replace_header("Connection", "Upgrade");
        if let Some(origin) = request.header("Origin") {
            response.replace_header("Sec-WebSocket-Origin", origin);
        }
        response.replace_header("Sec-WebSocket-Location", &location);
        response.set_body(Bytes::copy_from_slice(&digest));
        response.clear_content_length();
        Ok(())
    }

    /// Split into read and write halves for the data-transfer phase
    pub fn split(self) -> (HixieReader, HixieWriter) {
        (
            HixieReader {
                max_message_size: self.max_message_size,
            },
            HixieWriter { _role: self.role },
        )
    }
}

/// Compute the 16-byte draft-76 challenge digest
pub fn challenge_response(key1: &str, key2: &str, key3: &[u8]) -> Result<[u8; 16]> {
    let n1 = key_number(key1)?;
    let n2 = key_number(key2)?;

    let mut hasher = Md5::new();
    hasher.update(n1.to_be_bytes());
    hasher.update(n2.to_be_bytes());
    hasher.update(key3);
    Ok(hasher.finalize().into())
}

/// Decode a draft-76 key header: concatenated digits divided by space count
fn key_number(key: &str) -> Result<u32> {
    let mut number: u64 = 0;
    let mut spaces: u64 = 0;

    for c in key.chars() {
        if let Some(d) = c.to_digit(10) {
            number = number
                .checked_mul(10)
                .and_then(|n| n.checked_add(d as u64))
                .ok_or(Error::HandshakeFailed("key number overflow"))?;
        } else if c == ' ' {
            spaces += 1;
        }
    }

    if spaces == 0 {
        return Err(Error::HandshakeFailed("key contains no spaces"));
    }
    if number % spaces != 0 {
        return Err(Error::HandshakeFailed("key number not divisible by spaces"));
    }
    Ok((number / spaces) as u32)
}

/// Decoder for sentinel-delimited draft-76 frames
pub struct HixieReader {
    max_message_size: usize,
}

impl HixieReader {
    /// Produce the next complete message from the buffer, if any
    pub fn next(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        match first {
            TEXT_START => {
                let Some(end) = buf[1..].iter().position(|&b| b == TEXT_END) else {
                    if buf.len() > self.max_message_size + 1 {
                        return Err(Error::MessageTooLarge);
                    }
                    return Ok(None);
                };
                if end > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }

                buf.advance(1);
                let payload = buf.split_to(end).freeze();
                buf.advance(1);

                if !validate_utf8(&payload) {
                    return Err(Error::InvalidUtf8);
                }
                Ok(Some(Message::Text(payload)))
            }
            TEXT_END => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                if buf[1] != 0x00 {
                    return Err(Error::Protocol("binary frames not supported in draft-76"));
                }
                buf.advance(2);
                Ok(Some(Message::Close(None)))
            }
            _ => Err(Error::InvalidFrame("invalid draft-76 frame type")),
        }
    }
}

/// Encoder for sentinel-delimited draft-76 frames
pub struct HixieWriter {
    _role: Role,
}

impl HixieWriter {
    /// Frame a message into wire bytes
    ///
    /// Draft-76 carries text and the close sentinel only.
    pub fn prepare(&self, message: &Message, manager: &MessageManager) -> Result<Bytes> {
        let mut buf = manager.take();
        match message {
            Message::Text(b) => {
                buf.reserve(b.len() + 2);
                buf.put_u8(TEXT_START);
                buf.put_slice(b);
                buf.put_u8(TEXT_END);
            }
            Message::Close(_) => {
                buf.put_u8(TEXT_END);
                buf.put_u8(0x00);
            }
            _ => return Err(Error::Protocol("draft-76 supports text frames only")),
        }
        Ok(buf.freeze())
    }
}
