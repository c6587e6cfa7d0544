//! Hybi drafts 07/08 and RFC 6455 (versions 7, 8, 13)
//!
//! These drafts share the framed wire format; the handshake differs only in
//! the version number and the header that carries the origin
//! (`Sec-WebSocket-Origin` before version 13).

use base64::Engine;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{CloseReason, Error, Result};
use crate::frame::{encode_frame, Frame, FrameParser, OpCode};
use crate::http::{Request, Response};
use crate::mask::generate_mask;
use crate::message::{Message, MessageManager};
use crate::utf8::{validate_utf8, validate_utf8_partial};
use crate::WS_GUID;

use super::Role;

/// Compute the `Sec-WebSocket-Accept` value for a key: Base64(SHA-1(key + GUID))
#[inline]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generate a random `Sec-WebSocket-Key` (client side)
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    for chunk in bytes.chunks_exact_mut(4) {
        chunk.copy_from_slice(&generate_mask());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Handshake processor for the hybi family
pub struct HybiProcessor {
    version: u16,
    role: Role,
    max_frame_size: usize,
    max_message_size: usize,
}

impl HybiProcessor {
    pub(crate) fn new(
        version: u16,
        role: Role,
        max_frame_size: usize,
        max_message_size: usize,
    ) -> Self {
        Self {
            version,
            role,
            max_frame_size,
            max_message_size,
        }
    }

    /// The draft version this processor was built for
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Header carrying the origin for this draft version
    pub fn origin<'a>(&self, request: &'a Request) -> Option<&'a str> {
        if self.version >= 13 {
            request.header("Origin")
        } else {
            request.header("Sec-WebSocket-Origin")
        }
    }

    /// Validate a server-side upgrade request and fill in the 101 response
    pub fn validate_server(&self, request: &Request, response: &mut Response) -> Result<()> {
        if request.method() != "GET" {
            return Err(Error::HandshakeFailed("method must be GET"));
        }
        if !request.header_contains("Upgrade", "websocket") {
            return Err(Error::HandshakeFailed("missing Upgrade: websocket"));
        }
        if !request.header_contains("Connection", "upgrade") {
            return Err(Error::HandshakeFailed("missing Connection: Upgrade"));
        }
        if request.header("Host").is_none() {
            return Err(Error::HandshakeFailed("missing Host header"));
        }
        let key = request
            .header("Sec-WebSocket-Key")
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;

        response.set_status(101);
        response.replace_header("Upgrade", "websocket");
        response.replace_header("Connection", "Upgrade");
        response.replace_header("Sec-WebSocket-Accept", &accept_key(key));
        Ok(())
    }

    /// Build the client-side upgrade request; returns the wire bytes and the key
    pub fn build_client_request(&self, uri: &crate::http::Uri, user_agent: &str) -> (Bytes, String) {
        let key = generate_key();
        let raw = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: {}\r\nUser-Agent: {}\r\n\r\n",
            uri.resource(),
            uri.authority(),
            key,
            self.version,
            user_agent,
        );
        (Bytes::from(raw), key)
    }

    /// Verify the server's handshake response against the key we sent
    pub fn verify_client_response(&self, key: &str, response: &Response) -> Result<()> {
        if response.status() != 101 {
            return Err(Error::HandshakeFailed("expected 101 Switching Protocols"));
        }
        let accept = response
            .header("Sec-WebSocket-Accept")
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Accept"))?;
        if accept != accept_key(key) {
            return Err(Error::HandshakeFailed("invalid Sec-WebSocket-Accept"));
        }
        Ok(())
    }

    /// Split into read and write halves for the data-transfer phase
    pub fn split(self) -> (HybiReader, HybiWriter) {
        let expect_masked = self.role == Role::Server;
        (
            HybiReader {
                parser: FrameParser::new(self.max_frame_size, expect_masked),
                fragment_buf: BytesMut::new(),
                fragment_opcode: None,
                max_message_size: self.max_message_size,
            },
            HybiWriter { role: self.role },
        )
    }
}

/// Decoder: frames in, complete messages out
///
/// Holds the fragmentation state for message reassembly; control frames may
/// interleave with the fragments of a data message.
pub struct HybiReader {
    parser: FrameParser,
    fragment_buf: BytesMut,
    fragment_opcode: Option<OpCode>,
    max_message_size: usize,
}

impl HybiReader {
    /// Produce the next complete message from the buffer, if any
    pub fn next(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        while let Some(frame) = self.parser.parse(buf)? {
            if let Some(msg) = self.handle_frame(frame)? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.header.opcode {
            OpCode::Continuation => self.handle_continuation(frame),
            OpCode::Text | OpCode::Binary => self.handle_data(frame),
            OpCode::Close => Ok(Some(Message::Close(parse_close_payload(&frame.payload)?))),
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
        }
    }

    fn handle_data(&mut self, frame: Frame) -> Result<Option<Message>> {
        if self.fragment_opcode.is_some() {
            return Err(Error::Protocol("expected continuation frame"));
        }
        if frame.payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        let opcode = frame.header.opcode;
        if frame.header.fin {
            if opcode == OpCode::Text && !validate_utf8(&frame.payload) {
                return Err(Error::InvalidUtf8);
            }
            return Ok(Some(match opcode {
                OpCode::Text => Message::Text(frame.payload),
                _ => Message::Binary(frame.payload),
            }));
        }

        self.fragment_opcode = Some(opcode);
        self.fragment_buf.clear();
        self.fragment_buf.extend_from_slice(&frame.payload);
        if opcode == OpCode::Text && !validate_utf8_partial(&self.fragment_buf) {
            return Err(Error::InvalidUtf8);
        }
        Ok(None)
    }

    fn handle_continuation(&mut self, frame: Frame) -> Result<Option<Message>> {
        let opcode = self
            .fragment_opcode
            .ok_or(Error::Protocol("unexpected continuation frame"))?;

        if self.fragment_buf.len() + frame.payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }
        self.fragment_buf.extend_from_slice(&frame.payload);

        if !frame.header.fin {
            if opcode == OpCode::Text && !validate_utf8_partial(&self.fragment_buf) {
                return Err(Error::InvalidUtf8);
            }
            return Ok(None);
        }

        self.fragment_opcode = None;
        let data = self.fragment_buf.split().freeze();
        match opcode {
            OpCode::Text => {
                if !validate_utf8(&data) {
                    return Err(Error::InvalidUtf8);
                }
                Ok(Some(Message::Text(data)))
            }
            _ => Ok(Some(Message::Binary(data))),
        }
    }
}

fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(Error::Protocol("close payload of one byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseReason::is_valid_code(code) {
                return Err(Error::InvalidCloseCode(code));
            }
            let reason = &payload[2..];
            if !validate_utf8(reason) {
                return Err(Error::InvalidUtf8);
            }
            Ok(Some(CloseReason::new(
                code,
                String::from_utf8_lossy(reason).into_owned(),
            )))
        }
    }
}

/// Encoder: messages in, framed wire bytes out
///
/// Client writers mask every frame with a fresh key.
pub struct HybiWriter {
    role: Role,
}

impl HybiWriter {
    /// Frame a message into wire bytes
    pub fn prepare(&self, message: &Message, manager: &MessageManager) -> Result<Bytes> {
        let mask = (self.role == Role::Client).then(generate_mask);
        let mut buf = manager.take();

        match message {
            Message::Text(b) => encode_frame(&mut buf, OpCode::Text, b, true, mask),
            Message::Binary(b) => encode_frame(&mut buf, OpCode::Binary, b, true, mask),
            Message::Ping(b) => encode_frame(&mut buf, OpCode::Ping, b, true, mask),
            Message::Pong(b) => encode_frame(&mut buf, OpCode::Pong, b, true, mask),
            Message::Close(reason) => {
                let payload = match reason {
                    Some(r) => {
                        let mut p = BytesMut::with_capacity(2 + r.reason.len());
                        p.extend_from_slice(&r.code.to_be_bytes());
                        p.extend_from_slice(r.reason.as_bytes());
                        p.freeze()
                    }
                    None => Bytes::new(),
                };
                encode_frame(&mut buf, OpCode::Close, &payload, true, mask);
            }
        }

        Ok(buf.freeze())
    }
}
