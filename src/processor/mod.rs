//! Version-specific protocol processors
//!
//! A processor encapsulates everything that differs between WebSocket
//! protocol drafts: handshake validation and the frame codec. The version
//! set is closed (RFC 6455 as version 13, the compatible Hybi drafts 07/08,
//! and the legacy Hixie-76 as version 0), so dispatch is an enum rather than
//! a trait object.
//!
//! After the handshake a processor splits into a read half and a write
//! half: the read half (parser and fragmentation state) is owned by the
//! connection driver, while the write half lives under the write lock next
//! to the send queue so frame preparation is serialized with enqueueing.

pub mod hixie;
pub mod hybi;

pub use hixie::HixieProcessor;
pub use hybi::{accept_key, generate_key, HybiProcessor};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::http::{Request, Response, Uri};
use crate::message::{Message, MessageManager};
use crate::SUPPORTED_VERSIONS;

/// Endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client endpoints mask outgoing frames
    Client,
    /// Server endpoints must not mask
    Server,
}

/// Determine the protocol version requested by an opening handshake
///
/// `Sec-WebSocket-Version` may carry a comma-separated list; the highest
/// version we support wins. Hixie-76 predates the version header and is
/// recognized by its `Sec-WebSocket-Key1` challenge header instead.
pub fn negotiate_version(request: &Request) -> Result<u16> {
    match request.header("Sec-WebSocket-Version") {
        Some(value) => {
            let mut best: Option<u16> = None;
            for part in value.split(',') {
                if let Ok(v) = part.trim().parse::<u16>() {
                    if SUPPORTED_VERSIONS.contains(&v) && best.map_or(true, |b| v > b) {
                        best = Some(v);
                    }
                }
            }
            best.ok_or(Error::UnsupportedVersion)
        }
        None if request.header("Sec-WebSocket-Key1").is_some() => Ok(0),
        None => Err(Error::HandshakeFailed("missing Sec-WebSocket-Version")),
    }
}

/// Populate the failure response for an unsupported version
///
/// Sets status 400 and advertises the versions we do speak, as the RFC
/// requires.
pub fn set_version_failure(response: &mut Response) {
    response.set_status(400);
    let supported = SUPPORTED_VERSIONS
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    response.replace_header("Sec-WebSocket-Version", &supported);
}

/// A protocol processor for one negotiated version
pub enum Processor {
    /// Hybi drafts 07/08 and RFC 6455 (versions 7, 8, 13)
    Hybi(HybiProcessor),
    /// Hixie draft 76 (version 0)
    Hixie(HixieProcessor),
}

impl Processor {
    /// Create the processor for a negotiated version
    pub fn new(
        version: u16,
        role: Role,
        max_frame_size: usize,
        max_message_size: usize,
    ) -> Result<Processor> {
        match version {
            7 | 8 | 13 => Ok(Processor::Hybi(HybiProcessor::new(
                version,
                role,
                max_frame_size,
                max_message_size,
            ))),
            0 => Ok(Processor::Hixie(HixieProcessor::new(role, max_message_size))),
            _ => Err(Error::UnsupportedVersion),
        }
    }

    /// The negotiated protocol version
    pub fn version(&self) -> u16 {
        match self {
            Processor::Hybi(p) => p.version(),
            Processor::Hixie(_) => 0,
        }
    }

    /// Bytes of request body the handshake needs beyond the header block
    pub fn request_body_len(&self) -> usize {
        match self {
            Processor::Hybi(_) => 0,
            Processor::Hixie(_) => HixieProcessor::KEY3_LEN,
        }
    }

    /// Server side: validate the request and populate the success response
    pub fn validate_server(
        &self,
        request: &Request,
        uri: &Uri,
        response: &mut Response,
    ) -> Result<()> {
        match self {
            Processor::Hybi(p) => p.validate_server(request, response),
            Processor::Hixie(p) => p.validate_server(request, uri, response),
        }
    }

    /// The request's origin value, under the header name this version uses
    pub fn origin<'a>(&self, request: &'a Request) -> Option<&'a str> {
        match self {
            Processor::Hybi(p) => p.origin(request),
            Processor::Hixie(_) => request.header("Origin"),
        }
    }

    /// Client side: build the upgrade request; returns wire bytes and the key
    pub fn build_client_request(&self, uri: &Uri, user_agent: &str) -> Result<(Bytes, String)> {
        match self {
            Processor::Hybi(p) => Ok(p.build_client_request(uri, user_agent)),
            Processor::Hixie(_) => Err(Error::UnsupportedVersion),
        }
    }

    /// Client side: verify the server's response against the key we sent
    pub fn verify_client_response(&self, key: &str, response: &Response) -> Result<()> {
        match self {
            Processor::Hybi(p) => p.verify_client_response(key, response),
            Processor::Hixie(_) => Err(Error::UnsupportedVersion),
        }
    }

    /// Split into the driver-owned read half and the lock-guarded write half
    pub fn split(self) -> (FrameReader, FrameWriter) {
        match self {
            Processor::Hybi(p) => {
                let (r, w) = p.split();
                (FrameReader::Hybi(r), FrameWriter::Hybi(w))
            }
            Processor::Hixie(p) => {
                let (r, w) = p.split();
                (FrameReader::Hixie(r), FrameWriter::Hixie(w))
            }
        }
    }
}

/// Decoding half of a processor: bytes in, messages out
pub enum FrameReader {
    /// Hybi framing
    Hybi(hybi::HybiReader),
    /// Hixie sentinel framing
    Hixie(hixie::HixieReader),
}

impl FrameReader {
    /// Consume buffered bytes and produce the next complete message
    ///
    /// Returns `Ok(None)` when more input is needed; partial frames stay in
    /// `buf` (or in the reader's fragmentation state) across calls.
    pub fn next(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        match self {
            FrameReader::Hybi(r) => r.next(buf),
            FrameReader::Hixie(r) => r.next(buf),
        }
    }
}

/// Encoding half of a processor: messages in, wire bytes out
pub enum FrameWriter {
    /// Hybi framing
    Hybi(hybi::HybiWriter),
    /// Hixie sentinel framing
    Hixie(hixie::HixieWriter),
}

impl FrameWriter {
    /// Frame (and mask, client side) a message into wire bytes
    ///
    /// Fails for message kinds the negotiated version cannot carry, such as
    /// control frames on draft-76.
    pub fn prepare(&self, message: &Message, manager: &MessageManager) -> Result<Bytes> {
        match self {
            FrameWriter::Hybi(w) => w.prepare(message, manager),
            FrameWriter::Hixie(w) => w.prepare(message, manager),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(extra: &str) -> Request {
        let raw = format!(
            "GET /chat HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\n{}\r\n",
            extra
        );
        Request::parse(raw.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn negotiates_rfc6455() {
        let req = request("Sec-WebSocket-Key: abc\r\nSec-WebSocket-Version: 13\r\n");
        assert_eq!(negotiate_version(&req).unwrap(), 13);
    }

    #[test]
    fn negotiates_highest_from_list() {
        let req = request("Sec-WebSocket-Version: 8, 13, 99\r\n");
        assert_eq!(negotiate_version(&req).unwrap(), 13);

        let req = request("Sec-WebSocket-Version: 7, 8\r\n");
        assert_eq!(negotiate_version(&req).unwrap(), 8);
    }

    #[test]
    fn detects_hixie_by_challenge_header() {
        let req = request("Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n");
        assert_eq!(negotiate_version(&req).unwrap(), 0);
    }

    #[test]
    fn rejects_unknown_version() {
        let req = request("Sec-WebSocket-Version: 99\r\n");
        assert!(matches!(
            negotiate_version(&req),
            Err(Error::UnsupportedVersion)
        ));
    }

    #[test]
    fn version_failure_advertises_supported_set() {
        let mut response = Response::new();
        set_version_failure(&mut response);
        assert_eq!(response.status(), 400);
        assert_eq!(response.header("Sec-WebSocket-Version"), Some("0, 7, 8, 13"));
    }
}
