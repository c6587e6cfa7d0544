//! HTTP request/response handling for the opening handshake
//!
//! The core only speaks enough HTTP for the WebSocket upgrade exchange:
//! parsing the opening request (or response, client side) with `httparse`
//! and building the reply with an ordered, mutable header list. The
//! response object is exposed to the application during the `http` and
//! `validate` callbacks through the connection's header-mutation surface.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Maximum accepted HTTP header block size
pub const MAX_HEADER_SIZE: usize = 8192;

const MAX_HEADERS: usize = 48;

/// A parsed HTTP request (server side of the handshake)
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    resource: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Request {
    /// Try to parse a request from the front of `buf`
    ///
    /// Returns the owned request and the number of bytes consumed, or
    /// `Ok(None)` if the header block is not yet complete.
    pub fn parse(buf: &[u8]) -> Result<Option<(Request, usize)>> {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(Error::InvalidHttp("request too large"));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let method = req.method.unwrap_or("").to_string();
                let resource = req.path.unwrap_or("/").to_string();
                let headers = req
                    .headers
                    .iter()
                    .map(|h| {
                        let value = std::str::from_utf8(h.value)
                            .map_err(|_| Error::InvalidHttp("invalid header value"))?;
                        Ok((h.name.to_string(), value.to_string()))
                    })
                    .collect::<Result<Vec<_>>>()?;

                Ok(Some((
                    Request {
                        method,
                        resource,
                        headers,
                        body: Bytes::new(),
                    },
                    len,
                )))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(_) => Err(Error::InvalidHttp("failed to parse HTTP request")),
        }
    }

    /// Request method
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target (path and query)
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Look up a header, case-insensitively; returns the first match
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check whether a header's value contains `token` (ASCII, any case)
    pub fn header_contains(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|v| v.to_ascii_lowercase().contains(&token.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Request body (only present for Hixie-76, which trails an 8-byte key)
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Attach the trailing body bytes (Hixie-76 key3)
    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }
}

/// A mutable HTTP response (server side of the handshake)
///
/// Headers keep insertion order; `append_header` accumulates a
/// comma-separated list on an existing name, `replace_header` overwrites.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// Create an empty 200 response
    pub fn new() -> Self {
        Self {
            status: 200,
            reason: default_reason(200).to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Response status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Response reason phrase
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Set the status code; the reason phrase is looked up for known codes
    pub fn set_status(&mut self, code: u16) {
        self.status = code;
        self.reason = default_reason(code).to_string();
    }

    /// Set the status code and an explicit reason phrase
    pub fn set_status_reason(&mut self, code: u16, reason: impl Into<String>) {
        self.status = code;
        self.reason = reason.into();
    }

    /// Set the response body and the matching Content-Length header
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        let len = self.body.len().to_string();
        self.replace_header("Content-Length", &len);
    }

    /// Look up a header, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append a header value
    ///
    /// If the header exists the value joins the existing one as a
    /// comma-separated list; otherwise the header is added.
    pub fn append_header(&mut self, name: &str, value: &str) {
        if let Some((_, v)) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            v.push_str(", ");
            v.push_str(value);
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// Set a header, replacing any existing value
    pub fn replace_header(&mut self, name: &str, value: &str) {
        if let Some((_, v)) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            *v = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// Remove a header if present
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Drop the body without touching headers
    ///
    /// Used for the Hixie-76 challenge reply, which trails raw bytes with no
    /// Content-Length framing.
    pub fn clear_content_length(&mut self) {
        self.remove_header("Content-Length");
    }

    /// Serialize the response to wire bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.body.len());

        buf.put_slice(b"HTTP/1.1 ");
        buf.put_slice(self.status.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.reason.as_bytes());
        buf.put_slice(b"\r\n");

        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }

        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Try to parse a response from the front of `buf` (client side)
    ///
    /// Returns the response and the number of header bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<Option<(Response, usize)>> {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(Error::InvalidHttp("response too large"));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);

        match res.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let status = res.code.unwrap_or(0);
                let reason = res.reason.unwrap_or("").to_string();
                let headers = res
                    .headers
                    .iter()
                    .map(|h| {
                        let value = std::str::from_utf8(h.value)
                            .map_err(|_| Error::InvalidHttp("invalid header value"))?;
                        Ok((h.name.to_string(), value.to_string()))
                    })
                    .collect::<Result<Vec<_>>>()?;

                Ok(Some((
                    Response {
                        status,
                        reason,
                        headers,
                        body: Bytes::new(),
                    },
                    len,
                )))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(_) => Err(Error::InvalidHttp("failed to parse HTTP response")),
        }
    }
}

fn default_reason(code: u16) -> &'static str {
    match code {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Connection URI: scheme flag, authority, and resource
///
/// Built from the opening request once the handshake has been read;
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    secure: bool,
    host: String,
    port: u16,
    resource: String,
}

impl Uri {
    /// Create a URI from parts
    pub fn new(secure: bool, host: impl Into<String>, port: u16, resource: impl Into<String>) -> Self {
        Self {
            secure,
            host: host.into(),
            port,
            resource: resource.into(),
        }
    }

    /// Parse a `ws://` or `wss://` URI string
    pub fn parse(input: &str) -> Result<Uri> {
        let (secure, rest) = if let Some(rest) = input.strip_prefix("wss://") {
            (true, rest)
        } else if let Some(rest) = input.strip_prefix("ws://") {
            (false, rest)
        } else {
            return Err(Error::InvalidHttp("URI scheme must be ws or wss"));
        };

        let (authority, resource) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(Error::InvalidHttp("URI missing host"));
        }

        let (host, port) = split_authority(authority, secure)?;
        Ok(Uri::new(secure, host, port, resource))
    }

    /// Build the URI for an accepted server-side connection
    pub fn from_request(request: &Request, secure: bool) -> Result<Uri> {
        let authority = request
            .header("Host")
            .ok_or(Error::HandshakeFailed("missing Host header"))?;
        let (host, port) = split_authority(authority, secure)?;
        Ok(Uri::new(secure, host, port, request.resource()))
    }

    /// Whether the connection URI uses the secure scheme
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Host component
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, with the scheme default applied when absent
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resource (path and query) component
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The authority in `host` or `host:port` form, default ports elided
    pub fn authority(&self) -> String {
        let default = if self.secure { 443 } else { 80 };
        if self.port == default {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn split_authority(authority: &str, secure: bool) -> Result<(String, u16)> {
    let default = if secure { 443 } else { 80 };
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::InvalidHttp("invalid port"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default)),
    }
}
