//! The per-connection WebSocket state machine
//!
//! A [`Connection`] sits between a byte-oriented transport and the
//! application's [`Handler`], carrying the connection through the opening
//! handshake, data transfer, and the closing handshake.
//!
//! # Threading model
//!
//! [`Connection::run`] is the strand: it owns the transport and is the only
//! place callbacks fire, so callbacks for one connection never overlap.
//! Everything else on the surface may be called from any thread; calls that
//! need the strand (writes, interrupts, termination) enqueue work and signal
//! the driver over a channel.
//!
//! # Locks
//!
//! Two locks guard shared state: the state lock (session state and failure
//! status, held only for compare-and-set) and the write lock (send queue,
//! buffered-amount counter, and the processor's write half, held across
//! queue mutation and frame preparation). The state lock is never acquired
//! while the write lock is held, and no lock is held across I/O or a
//! callback.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};
use tracing::{debug, trace};

use crate::error::{CloseReason, Error, Result};
use crate::frame::OpCode;
use crate::handler::{Handler, NullHandler};
use crate::http::{Request, Response, Uri};
use crate::message::{Message, MessageManager, Outgoing};
use crate::processor::{negotiate_version, set_version_failure, FrameReader, Processor};
use crate::state::{FailStatus, Phase, Session, SessionCell, State};
use crate::utf8::validate_utf8;
use crate::{Config, MAX_CLOSE_REASON, MAX_CONTROL_PAYLOAD, SUPPORTED_VERSIONS};

pub use crate::processor::Role;

/// Wakeups posted to the driver task from any thread
enum Signal {
    /// The send queue went from empty to non-empty
    WriteFrame,
    /// Deliver one `on_interrupt` callback
    Interrupt,
    /// A ping was enqueued; arm the pong timer for this payload
    PingSent(Bytes),
    /// A close frame was enqueued; arm the closing-handshake timer
    CloseSent,
    /// Forcibly terminate the connection
    Terminate,
}

/// How the connection ended; picks the terminal callback
enum Terminal {
    /// Closing handshake completed
    Clean,
    /// We gave up waiting for the peer's close ack
    Dropped,
    /// Abnormal termination with the given status
    Failed(FailStatus),
}

/// Send-queue state, guarded by the write lock
struct WriteState {
    queue: VecDeque<Outgoing>,
    /// Payload bytes queued plus in flight; see [`Connection::buffered_amount`]
    buffered: usize,
    /// Payload size of the message currently being written, if any
    in_flight: Option<usize>,
    /// Write half of the processor, installed when the connection opens
    writer: Option<crate::processor::FrameWriter>,
}

/// Handshake artifacts: immutable once the connection is open
struct HttpState {
    request: Option<Request>,
    response: Response,
    uri: Option<Uri>,
    origin: Option<String>,
    version: Option<u16>,
}

/// Closing-handshake bookkeeping
#[derive(Default)]
struct CloseState {
    /// Code/reason this endpoint sent on the wire
    local: Option<CloseReason>,
    /// Code/reason received from the peer
    remote: Option<CloseReason>,
    /// Whether this endpoint initiated the closing handshake
    closed_by_me: bool,
    /// Whether this endpoint initiated an abnormal close
    failed_by_me: bool,
    /// Whether this endpoint dropped the transport without a complete handshake
    dropped_by_me: bool,
    close_sent: bool,
    close_received: bool,
}

struct Inner {
    role: Role,
    secure: bool,
    config: Config,
    session: SessionCell,
    write: Mutex<WriteState>,
    handler: Mutex<Arc<dyn Handler>>,
    http: Mutex<HttpState>,
    close: Mutex<CloseState>,
    signals: mpsc::UnboundedSender<Signal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    termination: Mutex<Option<Box<dyn FnOnce(&Connection) + Send>>>,
    terminated: AtomicBool,
    manager: MessageManager,
    client_uri: Option<Uri>,
}

/// A WebSocket connection
///
/// Cheap to clone; all clones refer to the same connection. The connection
/// stays alive while any clone or pending callback holds it; share
/// [`ConnectionHandle`]s instead of clones when a reference must not keep
/// the connection alive (routing tables, caches).
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// A weak, identity-only reference to a connection
///
/// Suitable for addressing a connection from outside the core without
/// extending its lifetime. Two handles compare equal when they refer to the
/// same connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Weak<Inner>,
}

impl ConnectionHandle {
    /// Get the connection back, if it is still alive
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ConnectionHandle {}

impl std::hash::Hash for ConnectionHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.as_ptr().hash(state);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConnectionHandle")
            .field(&self.inner.as_ptr())
            .finish()
    }
}

impl Connection {
    fn new(role: Role, secure: bool, config: Config, client_uri: Option<Uri>, handler: Arc<dyn Handler>) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let read_capacity = config.read_buffer_size;

        Connection {
            inner: Arc::new(Inner {
                role,
                secure,
                config,
                session: SessionCell::new(),
                write: Mutex::new(WriteState {
                    queue: VecDeque::new(),
                    buffered: 0,
                    in_flight: None,
                    writer: None,
                }),
                handler: Mutex::new(handler),
                http: Mutex::new(HttpState {
                    request: None,
                    response: Response::new(),
                    uri: client_uri.clone(),
                    origin: None,
                    version: None,
                }),
                close: Mutex::new(CloseState::default()),
                signals: tx,
                signal_rx: Mutex::new(Some(rx)),
                termination: Mutex::new(None),
                terminated: AtomicBool::new(false),
                manager: MessageManager::new(read_capacity),
                client_uri,
            }),
        }
    }

    /// Create a server-side connection over a plaintext transport
    pub fn server(config: Config, handler: Arc<dyn Handler>) -> Connection {
        Connection::new(Role::Server, false, config, None, handler)
    }

    /// Create a server-side connection over a TLS transport
    pub fn server_secure(config: Config, handler: Arc<dyn Handler>) -> Connection {
        Connection::new(Role::Server, true, config, None, handler)
    }

    /// Create a client-side connection targeting `uri`
    pub fn client(config: Config, uri: Uri, handler: Arc<dyn Handler>) -> Connection {
        let secure = uri.secure();
        Connection::new(Role::Client, secure, config, Some(uri), handler)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Endpoint role
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Externally visible connection state
    pub fn state(&self) -> State {
        self.inner.session.state()
    }

    /// Failure status; `Good` unless the connection failed
    pub fn fail_status(&self) -> FailStatus {
        self.inner.session.fail_status()
    }

    /// The configured user agent string
    pub fn user_agent(&self) -> &str {
        &self.inner.config.user_agent
    }

    /// A weak handle for addressing this connection
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Protocol versions this library can negotiate
    pub fn supported_versions(&self) -> &'static [u16] {
        SUPPORTED_VERSIONS
    }

    /// The negotiated protocol version, once known
    pub fn version(&self) -> Option<u16> {
        self.inner.http.lock().version
    }

    /// Payload bytes queued or in flight but not yet released to the transport
    ///
    /// Messages dropped by [`terminate`](Connection::terminate) leave this
    /// count without ever reaching the wire.
    pub fn buffered_amount(&self) -> usize {
        self.inner.write.lock().buffered
    }

    /// Origin value from the opening handshake
    pub fn origin(&self) -> Option<String> {
        self.inner.http.lock().origin.clone()
    }

    /// The parsed opening request (server side, after the handshake is read)
    pub fn request(&self) -> Option<Request> {
        self.inner.http.lock().request.clone()
    }

    /// Host component of the connection URI
    pub fn host(&self) -> Result<String> {
        self.with_uri(|uri| uri.host().to_string())
    }

    /// Port component of the connection URI
    pub fn port(&self) -> Result<u16> {
        self.with_uri(Uri::port)
    }

    /// Resource component of the connection URI
    pub fn resource(&self) -> Result<String> {
        self.with_uri(|uri| uri.resource().to_string())
    }

    /// Secure flag of the connection URI
    pub fn is_secure(&self) -> Result<bool> {
        self.with_uri(Uri::secure)
    }

    fn with_uri<T>(&self, f: impl FnOnce(&Uri) -> T) -> Result<T> {
        self.inner
            .http
            .lock()
            .uri
            .as_ref()
            .map(f)
            .ok_or(Error::InvalidState("handshake not yet read"))
    }

    /// Close code/reason this endpoint sent, if any
    pub fn local_close(&self) -> Option<CloseReason> {
        self.inner.close.lock().local.clone()
    }

    /// Close code/reason received from the peer, if any
    pub fn remote_close(&self) -> Option<CloseReason> {
        self.inner.close.lock().remote.clone()
    }

    /// Whether this endpoint initiated the closing handshake
    pub fn closed_by_me(&self) -> bool {
        self.inner.close.lock().closed_by_me
    }

    /// Whether this endpoint initiated an abnormal close
    pub fn failed_by_me(&self) -> bool {
        self.inner.close.lock().failed_by_me
    }

    /// Whether this endpoint dropped the transport before the handshake finished
    pub fn dropped_by_me(&self) -> bool {
        self.inner.close.lock().dropped_by_me
    }

    // ========================================================================
    // Response mutation (legal only inside the http/validate callbacks)
    // ========================================================================

    fn check_http_phase(&self) -> Result<()> {
        self.inner.session.check(
            Session::Connecting(Phase::ProcessHttpRequest),
            "response mutation is only legal inside the http and validate callbacks",
        )
    }

    /// Set the response status code
    pub fn set_status(&self, code: u16) -> Result<()> {
        self.check_http_phase()?;
        self.inner.http.lock().response.set_status(code);
        Ok(())
    }

    /// Set the response status code and an explicit reason phrase
    pub fn set_status_reason(&self, code: u16, reason: &str) -> Result<()> {
        self.check_http_phase()?;
        self.inner.http.lock().response.set_status_reason(code, reason);
        Ok(())
    }

    /// Set the response body (also sets Content-Length)
    pub fn set_body(&self, body: impl Into<Bytes>) -> Result<()> {
        self.check_http_phase()?;
        self.inner.http.lock().response.set_body(body);
        Ok(())
    }

    /// Append a response header value
    pub fn append_header(&self, name: &str, value: &str) -> Result<()> {
        self.check_http_phase()?;
        self.inner.http.lock().response.append_header(name, value);
        Ok(())
    }

    /// Set a response header, replacing any existing value
    pub fn replace_header(&self, name: &str, value: &str) -> Result<()> {
        self.check_http_phase()?;
        self.inner.http.lock().response.replace_header(name, value);
        Ok(())
    }

    /// Remove a response header
    pub fn remove_header(&self, name: &str) -> Result<()> {
        self.check_http_phase()?;
        self.inner.http.lock().response.remove_header(name);
        Ok(())
    }

    // ========================================================================
    // Control surface (any thread)
    // ========================================================================

    /// Queue a data message built from a payload and opcode
    ///
    /// Text payloads must be valid UTF-8. Legal only while the connection is
    /// open; messages queued before a `close` call are still written out.
    pub fn send(&self, payload: impl Into<Bytes>, opcode: OpCode) -> Result<()> {
        let payload = payload.into();
        let msg = match opcode {
            OpCode::Text => {
                if !validate_utf8(&payload) {
                    return Err(Error::InvalidUtf8);
                }
                Message::Text(payload)
            }
            OpCode::Binary => Message::Binary(payload),
            _ => return Err(Error::Protocol("send accepts data opcodes only")),
        };
        self.send_message(msg)
    }

    /// Queue a data message
    pub fn send_message(&self, msg: Message) -> Result<()> {
        if msg.is_control() {
            return Err(Error::Protocol("use ping/pong/close for control messages"));
        }
        if self.inner.session.state() != State::Open {
            return Err(Error::InvalidState("connection is not open"));
        }
        self.enqueue(Outgoing::new(msg))
    }

    /// Send a ping and arm the pong timer
    ///
    /// Feedback arrives via `on_pong` or `on_pong_timeout`.
    pub fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        self.enqueue_control_checked(Message::Ping(payload.clone()), false)?;
        self.signal(Signal::PingSent(payload))
    }

    /// Send an unsolicited pong
    pub fn pong(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.enqueue_control_checked(Message::Pong(payload.into()), false)
    }

    fn enqueue_control_checked(&self, msg: Message, terminal: bool) -> Result<()> {
        if msg.payload_len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol("control payload exceeds 125 bytes"));
        }
        if self.inner.session.state() != State::Open {
            return Err(Error::InvalidState("connection is not open"));
        }
        self.enqueue_control(msg, terminal)
    }

    /// Initiate the closing handshake
    ///
    /// The reason is truncated to 123 bytes. Messages queued before this
    /// call are written out first. `on_close` fires once the handshake
    /// completes, or once the close-handshake timer gives up waiting for the
    /// peer's acknowledgement.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        let reason = truncate_reason(reason);
        self.inner.session.advance_both(
            Session::Open,
            Session::Closing,
            "close requires an open connection",
        )?;

        let local = CloseReason::new(code, reason);
        let frame = {
            let mut c = self.inner.close.lock();
            c.local = Some(local.clone());
            c.closed_by_me = true;
            if self.inner.config.silent_close {
                Message::Close(None)
            } else {
                Message::Close(Some(local))
            }
        };

        self.enqueue_control(frame, false)?;
        self.signal(Signal::CloseSent)
    }

    /// Post an `on_interrupt` callback onto the strand
    ///
    /// Non-blocking; may be called from any thread. Each call delivers
    /// exactly one callback, and multiple interrupts may be in flight.
    pub fn interrupt(&self) -> Result<()> {
        self.signal(Signal::Interrupt)
    }

    /// Forcibly terminate the connection
    ///
    /// Idempotent. Queued messages are dropped without notification, timers
    /// are cancelled, and the terminal callback fires on the strand.
    pub fn terminate(&self) {
        let _ = self.signal(Signal::Terminate);
    }

    /// Swap the application handler
    ///
    /// Invokes `old.on_unload` then `new.on_load` before returning. A
    /// callback already executing keeps the old handler until it returns;
    /// every dispatch after this call uses the new one. May be called in any
    /// state and from any thread, including from inside a callback.
    pub fn set_handler(&self, new: Arc<dyn Handler>) {
        let old = {
            let mut h = self.inner.handler.lock();
            std::mem::replace(&mut *h, new.clone())
        };
        old.on_unload(self, &new);
        new.on_load(self, &old);
    }

    /// Register the endpoint's termination hook
    ///
    /// Runs once on the strand after the terminal callback, for
    /// endpoint-level bookkeeping.
    pub fn set_termination_handler<F>(&self, f: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        *self.inner.termination.lock() = Some(Box::new(f));
    }

    // ========================================================================
    // Write queue internals
    // ========================================================================

    fn signal(&self, signal: Signal) -> Result<()> {
        self.inner
            .signals
            .send(signal)
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Push a message and wake the pump if it was idle
    fn enqueue(&self, out: Outgoing) -> Result<()> {
        let idle = {
            let mut w = self.inner.write.lock();
            w.buffered += out.payload_len;
            w.queue.push_back(out);
            w.queue.len() == 1 && w.in_flight.is_none()
        };
        if idle {
            self.signal(Signal::WriteFrame)?;
        }
        Ok(())
    }

    /// Prepare a control frame under the write lock and enqueue it
    fn enqueue_control(&self, msg: Message, terminal: bool) -> Result<()> {
        let wire = {
            let w = self.inner.write.lock();
            let writer = w
                .writer
                .as_ref()
                .ok_or(Error::InvalidState("processor not yet selected"))?;
            writer.prepare(&msg, &self.inner.manager)?
        };
        let mut out = Outgoing::prepared(msg, wire);
        if terminal {
            out = out.terminal();
        }
        self.enqueue(out)
    }

    /// Pop and prepare the next message; at most one write in flight
    fn next_write(&self) -> Result<Option<PendingWrite>> {
        let mut w = self.inner.write.lock();
        if w.in_flight.is_some() {
            return Ok(None);
        }
        let Some(mut out) = w.queue.pop_front() else {
            return Ok(None);
        };

        let wire = match out.prepared.take() {
            Some(wire) => wire,
            None => {
                let prepared = w
                    .writer
                    .as_ref()
                    .ok_or(Error::InvalidState("processor not yet selected"))
                    .and_then(|writer| writer.prepare(&out.message, &self.inner.manager));
                match prepared {
                    Ok(wire) => wire,
                    Err(e) => {
                        w.buffered -= out.payload_len;
                        return Err(e);
                    }
                }
            }
        };

        w.in_flight = Some(out.payload_len);
        Ok(Some(PendingWrite {
            wire,
            offset: 0,
            payload_len: out.payload_len,
            terminal: out.terminal,
            is_close: matches!(out.message, Message::Close(_)),
        }))
    }

    /// Bookkeeping after a write fully drains to the transport
    fn complete_write(&self, done: PendingWrite) {
        {
            let mut w = self.inner.write.lock();
            w.buffered -= done.payload_len;
            w.in_flight = None;
        }
        if done.is_close {
            self.inner.close.lock().close_sent = true;
        }
        self.inner.manager.reclaim(done.wire);
    }

    // ========================================================================
    // Driver (the strand)
    // ========================================================================

    /// Drive the connection over `stream` until it terminates
    ///
    /// This is the connection's strand: the opening handshake, the read
    /// loop, the write pump, timers, and every callback run here. The future
    /// resolves after the terminal callback (`on_close` or `on_fail`) and
    /// the termination hook have run.
    pub async fn run<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(rx) = self.inner.signal_rx.lock().take() else {
            return;
        };
        let (mut rh, mut wh) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(self.inner.config.read_buffer_size);

        let reader = match self.inner.role {
            Role::Server => self.server_handshake(&mut rh, &mut wh, &mut read_buf).await,
            Role::Client => self.client_handshake(&mut rh, &mut wh, &mut read_buf).await,
        };

        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                debug!(error = %e, "handshake failed");
                self.finish(Terminal::Failed(fail_status_for(&e)));
                return;
            }
        };

        self.current_handler().on_open(self);
        self.drive(reader, rh, wh, rx, read_buf).await;
    }

    fn current_handler(&self) -> Arc<dyn Handler> {
        self.inner.handler.lock().clone()
    }

    /// Server side of the opening handshake
    ///
    /// Reads and validates the upgrade request, selects a processor by
    /// protocol version, runs the `http` and `validate` callbacks, and
    /// writes the response. On anything but a 101 the response is still
    /// written before the error propagates to the failure path.
    async fn server_handshake<R, W>(
        &self,
        rh: &mut R,
        wh: &mut W,
        buf: &mut BytesMut,
    ) -> Result<FrameReader>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let inner = &self.inner;
        let session = &inner.session;

        session.advance(
            Session::Connecting(Phase::UserInit),
            Session::Connecting(Phase::TransportInit),
            "transport init",
        )?;
        session.advance(
            Session::Connecting(Phase::TransportInit),
            Session::Connecting(Phase::ReadHttpRequest),
            "read request",
        )?;

        let mut request = tokio::time::timeout(inner.config.handshake_timeout, async {
            loop {
                if let Some((request, consumed)) = Request::parse(buf)? {
                    buf.advance(consumed);
                    return Ok::<Request, Error>(request);
                }
                if rh.read_buf(buf).await? == 0 {
                    return Err(Error::ConnectionClosed);
                }
            }
        })
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

        session.advance(
            Session::Connecting(Phase::ReadHttpRequest),
            Session::Connecting(Phase::ProcessHttpRequest),
            "process request",
        )?;

        // Processor selection by protocol version
        let processor = negotiate_version(&request).and_then(|version| {
            Processor::new(
                version,
                Role::Server,
                inner.config.max_frame_size,
                inner.config.max_message_size,
            )
        });
        let processor = match processor {
            Ok(p) => p,
            Err(e) => {
                {
                    let mut h = inner.http.lock();
                    set_version_failure(&mut h.response);
                    h.request = Some(request);
                }
                self.write_response(wh).await?;
                return Err(e);
            }
        };

        // Hixie-76 trails challenge bytes behind the header block
        let body_len = processor.request_body_len();
        if body_len > 0 {
            while buf.len() < body_len {
                if rh.read_buf(buf).await? == 0 {
                    return Err(Error::ConnectionClosed);
                }
            }
            request.set_body(buf.split_to(body_len).freeze());
        }

        let uri = Uri::from_request(&request, inner.secure)?;
        {
            let mut h = inner.http.lock();
            h.origin = processor.origin(&request).map(str::to_string);
            h.version = Some(processor.version());
            h.uri = Some(uri.clone());
            h.request = Some(request.clone());
        }

        // Protocol-level validation populates the 101 response
        let validated = {
            let mut h = inner.http.lock();
            processor.validate_server(&request, &uri, &mut h.response)
        };
        if let Err(e) = validated {
            {
                let mut h = inner.http.lock();
                if h.response.status() == 101 || h.response.status() == 200 {
                    h.response.set_status(400);
                }
            }
            self.write_response(wh).await?;
            return Err(e);
        }

        // Application-level inspection and rejection
        let handler = self.current_handler();
        handler.http(self);
        let accepted = handler.validate(self);
        if !accepted {
            let mut h = inner.http.lock();
            if h.response.status() == 101 {
                h.response.set_status(403);
            }
        }

        session.advance(
            Session::Connecting(Phase::ProcessHttpRequest),
            Session::Connecting(Phase::WriteHttpResponse),
            "write response",
        )?;
        let status = self.write_response(wh).await?;

        if status != 101 {
            return Err(Error::HandshakeFailed("connection rejected"));
        }

        let (reader, writer) = processor.split();
        inner.write.lock().writer = Some(writer);
        session.advance_both(
            Session::Connecting(Phase::WriteHttpResponse),
            Session::Open,
            "open",
        )?;
        trace!(version = self.version(), "connection open");
        Ok(reader)
    }

    /// Serialize the response (with the Server header) and hand it to the transport
    async fn write_response<W>(&self, wh: &mut W) -> Result<u16>
    where
        W: AsyncWrite + Unpin,
    {
        let (wire, status) = {
            let mut h = self.inner.http.lock();
            h.response
                .replace_header("Server", &self.inner.config.user_agent);
            (h.response.serialize(), h.response.status())
        };
        wh.write_all(&wire).await?;
        wh.flush().await?;
        trace!(status, "handshake response written");
        Ok(status)
    }

    /// Client side of the opening handshake
    async fn client_handshake<R, W>(
        &self,
        rh: &mut R,
        wh: &mut W,
        buf: &mut BytesMut,
    ) -> Result<FrameReader>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let inner = &self.inner;
        let session = &inner.session;

        session.advance(
            Session::Connecting(Phase::UserInit),
            Session::Connecting(Phase::TransportInit),
            "transport init",
        )?;
        session.advance(
            Session::Connecting(Phase::TransportInit),
            Session::Connecting(Phase::WriteHttpRequest),
            "write request",
        )?;

        let uri = inner
            .client_uri
            .clone()
            .ok_or(Error::InvalidState("client connection has no URI"))?;
        let processor = Processor::new(
            13,
            Role::Client,
            inner.config.max_frame_size,
            inner.config.max_message_size,
        )?;

        let (wire, key) = processor.build_client_request(&uri, &inner.config.user_agent)?;
        wh.write_all(&wire).await?;
        wh.flush().await?;

        session.advance(
            Session::Connecting(Phase::WriteHttpRequest),
            Session::Connecting(Phase::ReadHttpResponse),
            "read response",
        )?;

        let response = tokio::time::timeout(inner.config.handshake_timeout, async {
            loop {
                if let Some((response, consumed)) = Response::parse(buf)? {
                    buf.advance(consumed);
                    return Ok::<Response, Error>(response);
                }
                if rh.read_buf(buf).await? == 0 {
                    return Err(Error::ConnectionClosed);
                }
            }
        })
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

        processor.verify_client_response(&key, &response)?;
        {
            let mut h = inner.http.lock();
            h.version = Some(processor.version());
            h.response = response;
        }

        let (reader, writer) = processor.split();
        inner.write.lock().writer = Some(writer);
        session.advance_both(
            Session::Connecting(Phase::ReadHttpResponse),
            Session::Open,
            "open",
        )?;
        trace!("connection open");
        Ok(reader)
    }

    /// The data-transfer loop
    ///
    /// One read outstanding at a time, one write in flight at a time, both
    /// multiplexed with the signal channel and the pong and close timers.
    async fn drive<R, W>(
        &self,
        mut reader: FrameReader,
        mut rh: R,
        mut wh: W,
        mut rx: mpsc::UnboundedReceiver<Signal>,
        mut read_buf: BytesMut,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut pending: Option<PendingWrite> = None;
        let mut pong_timer: Option<(Bytes, Pin<Box<Sleep>>)> = None;
        let mut close_timer: Option<Pin<Box<Sleep>>> = None;
        let mut reading = true;

        // The handshake read may have pulled in frame bytes already
        if !read_buf.is_empty() {
            if let Some(terminal) =
                self.consume_input(&mut reader, &mut read_buf, &mut pong_timer, &mut close_timer, &mut reading)
            {
                self.finish(terminal);
                return;
            }
        }

        loop {
            if pending.is_none() {
                match self.next_write() {
                    Ok(next) => pending = next,
                    Err(e) => {
                        debug!(error = %e, "frame preparation failed");
                        self.finish(Terminal::Failed(FailStatus::Unknown));
                        return;
                    }
                }
            }

            tokio::select! {
                biased;

                signal = rx.recv() => {
                    match signal {
                        Some(Signal::WriteFrame) => {}
                        Some(Signal::Interrupt) => {
                            self.current_handler().on_interrupt(self);
                        }
                        Some(Signal::PingSent(payload)) => {
                            pong_timer =
                                Some((payload, Box::pin(sleep(self.inner.config.pong_timeout))));
                        }
                        Some(Signal::CloseSent) => {
                            close_timer =
                                Some(Box::pin(sleep(self.inner.config.close_handshake_timeout)));
                        }
                        Some(Signal::Terminate) | None => {
                            self.finish(Terminal::Failed(FailStatus::Unknown));
                            return;
                        }
                    }
                }

                result = async { write_some(&mut wh, pending.as_mut().unwrap()).await }, if pending.is_some() => {
                    match result {
                        Ok(true) => {
                            let done = pending.take().unwrap();
                            let terminal = done.terminal;
                            self.complete_write(done);
                            if terminal {
                                self.finish(Terminal::Clean);
                                return;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            debug!(error = %e, "transport write failed");
                            self.finish(Terminal::Failed(FailStatus::System));
                            return;
                        }
                    }
                }

                () = async { pong_timer.as_mut().unwrap().1.as_mut().await }, if pong_timer.is_some() => {
                    let (payload, _) = pong_timer.take().unwrap();
                    self.current_handler().on_pong_timeout(self, &payload);
                }

                () = async { close_timer.as_mut().unwrap().as_mut().await }, if close_timer.is_some() => {
                    self.inner.close.lock().dropped_by_me = true;
                    debug!("close handshake timed out, dropping transport");
                    self.finish(Terminal::Dropped);
                    return;
                }

                result = rh.read_buf(&mut read_buf), if reading => {
                    match result {
                        Ok(0) => {
                            let clean = {
                                let c = self.inner.close.lock();
                                c.close_sent && c.close_received
                            };
                            if clean {
                                self.finish(Terminal::Clean);
                            } else {
                                self.finish(Terminal::Failed(FailStatus::System));
                            }
                            return;
                        }
                        Ok(_) => {
                            if let Some(terminal) = self.consume_input(
                                &mut reader,
                                &mut read_buf,
                                &mut pong_timer,
                                &mut close_timer,
                                &mut reading,
                            ) {
                                self.finish(terminal);
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "transport read failed");
                            self.finish(Terminal::Failed(FailStatus::System));
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Drain buffered input through the processor and dispatch messages
    ///
    /// Returns the terminal outcome when the connection should end now. A
    /// remote protocol error instead starts the closing handshake with the
    /// matching RFC code and stops further reads; the terminal close frame
    /// finishes the connection once written.
    fn consume_input(
        &self,
        reader: &mut FrameReader,
        buf: &mut BytesMut,
        pong_timer: &mut Option<(Bytes, Pin<Box<Sleep>>)>,
        close_timer: &mut Option<Pin<Box<Sleep>>>,
        reading: &mut bool,
    ) -> Option<Terminal> {
        loop {
            match reader.next(buf) {
                Ok(Some(msg)) => match self.dispatch_message(msg, pong_timer) {
                    Ok(None) => continue,
                    Ok(Some(terminal)) => return Some(terminal),
                    Err(e) => return Some(Terminal::Failed(fail_status_for(&e))),
                },
                Ok(None) => return None,
                Err(e) => {
                    let Some(code) = e.close_code() else {
                        return Some(Terminal::Failed(fail_status_for(&e)));
                    };
                    debug!(error = %e, code, "remote protocol error");
                    *reading = false;
                    return self.start_error_close(code, close_timer);
                }
            }
        }
    }

    /// Begin the closing handshake in response to a remote protocol error
    fn start_error_close(
        &self,
        code: u16,
        close_timer: &mut Option<Pin<Box<Sleep>>>,
    ) -> Option<Terminal> {
        self.inner.session.set_fail(FailStatus::Websocket);
        let frame = {
            let mut c = self.inner.close.lock();
            c.failed_by_me = true;
            c.local = Some(CloseReason::new(code, ""));
            if self.inner.config.silent_close {
                Message::Close(None)
            } else {
                Message::Close(Some(CloseReason::new(code, "")))
            }
        };
        let _ = self
            .inner
            .session
            .advance_both(Session::Open, Session::Closing, "protocol error close");

        match self.enqueue_control(frame, true) {
            Ok(()) => {
                // Backstop in case the terminal write never drains
                *close_timer = Some(Box::pin(sleep(self.inner.config.close_handshake_timeout)));
                None
            }
            Err(_) => Some(Terminal::Failed(FailStatus::Websocket)),
        }
    }

    /// Route one inbound message: data to the handler, control internally
    fn dispatch_message(
        &self,
        msg: Message,
        pong_timer: &mut Option<(Bytes, Pin<Box<Sleep>>)>,
    ) -> Result<Option<Terminal>> {
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if self.inner.session.state() == State::Open {
                    self.current_handler().on_message(self, msg);
                }
                Ok(None)
            }
            Message::Ping(payload) => {
                if self.inner.session.state() == State::Open
                    && self.current_handler().on_ping(self, &payload)
                {
                    self.enqueue_control(Message::Pong(payload), false)?;
                }
                Ok(None)
            }
            Message::Pong(payload) => {
                let answers_ping = pong_timer
                    .as_ref()
                    .map(|(expected, _)| expected.as_ref() == payload.as_ref())
                    .unwrap_or(false);
                if answers_ping {
                    *pong_timer = None;
                }
                self.current_handler().on_pong(self, &payload);
                Ok(None)
            }
            Message::Close(reason) => self.handle_remote_close(reason),
        }
    }

    /// The closing-handshake state machine for an incoming close frame
    fn handle_remote_close(&self, reason: Option<CloseReason>) -> Result<Option<Terminal>> {
        let state = self.inner.session.state();
        {
            let mut c = self.inner.close.lock();
            c.close_received = true;
            c.remote = reason.clone();
        }

        match state {
            State::Open => {
                // Peer initiated: acknowledge, then terminate once the ack
                // write drains
                self.inner.session.advance_both(
                    Session::Open,
                    Session::Closing,
                    "remote close",
                )?;
                let ack = {
                    let mut c = self.inner.close.lock();
                    c.closed_by_me = false;
                    if self.inner.config.silent_close {
                        Message::Close(None)
                    } else {
                        c.local = reason.clone();
                        Message::Close(reason)
                    }
                };
                self.enqueue_control(ack, true)?;
                Ok(None)
            }
            State::Closing => {
                // We initiated and this is the acknowledgement
                Ok(Some(Terminal::Clean))
            }
            _ => {
                // A close frame is a protocol violation in any other state
                Err(Error::Protocol("close frame in illegal state"))
            }
        }
    }

    /// Terminate the connection exactly once
    ///
    /// Drops queued messages, fires the single terminal callback, runs the
    /// endpoint's termination hook, and swaps in a null handler so the
    /// application's handler (which usually owns a clone of the connection)
    /// can be reclaimed.
    fn finish(&self, terminal: Terminal) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Terminal::Failed(status) = terminal {
            self.inner.session.set_fail(status);
        }
        self.inner.session.force_closed();

        {
            let mut w = self.inner.write.lock();
            w.queue.clear();
            w.buffered = 0;
            w.in_flight = None;
        }

        let failed = self.inner.session.fail_status() != FailStatus::Good;
        debug!(failed, status = ?self.inner.session.fail_status(), "connection terminated");

        let handler = self.current_handler();
        if failed {
            handler.on_fail(self);
        } else {
            handler.on_close(self);
        }

        if let Some(hook) = self.inner.termination.lock().take() {
            hook(self);
        }

        *self.inner.handler.lock() = Arc::new(NullHandler);
    }
}

/// The message currently being written, with resume offset
struct PendingWrite {
    wire: Bytes,
    offset: usize,
    payload_len: usize,
    terminal: bool,
    is_close: bool,
}

/// Push more of the pending write to the transport
///
/// Returns `Ok(true)` once the whole frame has been handed off and flushed.
/// Cancellation-safe inside the driver's select loop: a cancelled attempt
/// leaves the offset untouched, and a call resumed after the payload has
/// already drained goes straight to the flush rather than submitting an
/// empty write (which a buffered transport would report as `Ok(0)`).
async fn write_some<W>(wh: &mut W, pending: &mut PendingWrite) -> std::io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    if pending.offset < pending.wire.len() {
        let n = wh.write(&pending.wire[pending.offset..]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        pending.offset += n;
        if pending.offset < pending.wire.len() {
            return Ok(false);
        }
    }
    wh.flush().await?;
    Ok(true)
}

fn fail_status_for(e: &Error) -> FailStatus {
    match e {
        Error::HandshakeTimeout => FailStatus::TimeoutWs,
        Error::Io(_) | Error::ConnectionClosed => FailStatus::System,
        _ => FailStatus::Websocket,
    }
}

/// Truncate a close reason to the wire limit, respecting UTF-8 boundaries
fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
