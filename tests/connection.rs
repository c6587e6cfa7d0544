//! End-to-end connection tests over an in-memory duplex transport
//!
//! The far side of each connection is scripted byte-by-byte: raw handshake
//! requests, masked frames in, parsed frames out. Handler callbacks are
//! forwarded into a channel so tests can assert on their exact order.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;

use webstrand::frame::{encode_frame, Frame, FrameParser, OpCode};
use webstrand::processor::accept_key;
use webstrand::{Config, Connection, FailStatus, Handler, Message, State, Uri};

const HANDSHAKE: &[u8] = b"GET /chat HTTP/1.1\r\n\
    Host: server.example.com\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\
    \r\n";

const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

/// Handler that forwards every callback into a channel
struct Recorder {
    label: &'static str,
    tx: mpsc::UnboundedSender<String>,
    auto_pong: bool,
}

impl Recorder {
    fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            label: "",
            tx,
            auto_pong: true,
        }
    }

    fn labelled(label: &'static str, tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            label,
            tx,
            auto_pong: true,
        }
    }

    fn emit(&self, event: String) {
        let _ = self.tx.send(if self.label.is_empty() {
            event
        } else {
            format!("{}:{}", self.label, event)
        });
    }
}

impl Handler for Recorder {
    fn on_open(&self, _con: &Connection) {
        self.emit("open".into());
    }

    fn on_message(&self, _con: &Connection, msg: Message) {
        match msg {
            Message::Text(b) => self.emit(format!("message:{}", String::from_utf8_lossy(&b))),
            Message::Binary(b) => self.emit(format!("binary:{}", b.len())),
            _ => unreachable!("control messages are never delivered to on_message"),
        }
    }

    fn on_ping(&self, _con: &Connection, payload: &[u8]) -> bool {
        self.emit(format!("ping:{}", String::from_utf8_lossy(payload)));
        self.auto_pong
    }

    fn on_pong(&self, _con: &Connection, payload: &[u8]) {
        self.emit(format!("pong:{}", String::from_utf8_lossy(payload)));
    }

    fn on_pong_timeout(&self, _con: &Connection, payload: &[u8]) {
        self.emit(format!("pong_timeout:{}", String::from_utf8_lossy(payload)));
    }

    fn on_close(&self, _con: &Connection) {
        self.emit("close".into());
    }

    fn on_fail(&self, _con: &Connection) {
        self.emit("fail".into());
    }

    fn on_interrupt(&self, _con: &Connection) {
        self.emit("interrupt".into());
    }

    fn on_load(&self, _con: &Connection, _old: &Arc<dyn Handler>) {
        self.emit("load".into());
    }

    fn on_unload(&self, _con: &Connection, _new: &Arc<dyn Handler>) {
        self.emit("unload".into());
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("event channel closed")
}

async fn read_headers(rh: &mut ReadHalf<DuplexStream>) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        rh.read_exact(&mut byte).await.expect("headers truncated");
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

/// Read one unmasked (server-sent) frame from the peer side
async fn read_server_frame(rh: &mut ReadHalf<DuplexStream>, buf: &mut BytesMut) -> Frame {
    read_frame(rh, buf, false).await
}

async fn read_frame(rh: &mut ReadHalf<DuplexStream>, buf: &mut BytesMut, masked: bool) -> Frame {
    let mut parser = FrameParser::new(1024 * 1024, masked);
    loop {
        if let Some(frame) = parser.parse(buf).unwrap() {
            return frame;
        }
        let n = timeout(Duration::from_secs(10), rh.read_buf(buf))
            .await
            .expect("timed out waiting for frame")
            .unwrap();
        assert_ne!(n, 0, "peer closed while waiting for frame");
    }
}

fn masked_frame(opcode: OpCode, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_frame(&mut buf, opcode, payload, true, Some(MASK));
    buf
}

fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    payload
}

struct Peer {
    rh: ReadHalf<DuplexStream>,
    wh: tokio::io::WriteHalf<DuplexStream>,
    buf: BytesMut,
}

/// Start a server connection and complete the RFC 6455 handshake for it
async fn open_server(
    config: Config,
    handler: Arc<dyn Handler>,
) -> (Connection, tokio::task::JoinHandle<()>, Peer) {
    open_server_with_capacity(config, handler, 64 * 1024).await
}

async fn open_server_with_capacity(
    config: Config,
    handler: Arc<dyn Handler>,
    capacity: usize,
) -> (Connection, tokio::task::JoinHandle<()>, Peer) {
    let (client, server) = tokio::io::duplex(capacity);
    let con = Connection::server(config, handler);
    let driver = tokio::spawn({
        let con = con.clone();
        async move { con.run(server).await }
    });

    let (mut rh, mut wh) = tokio::io::split(client);
    wh.write_all(HANDSHAKE).await.unwrap();
    let response = read_headers(&mut rh).await;
    assert!(response.starts_with("HTTP/1.1 101"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    (
        con,
        driver,
        Peer {
            rh,
            wh,
            buf: BytesMut::new(),
        },
    )
}

#[tokio::test]
async fn server_happy_path() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (con, driver, mut peer) = open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");
    assert_eq!(con.state(), State::Open);

    // introspection is available once the handshake has been read
    assert_eq!(con.host().unwrap(), "server.example.com");
    assert_eq!(con.port().unwrap(), 80);
    assert_eq!(con.resource().unwrap(), "/chat");
    assert!(!con.is_secure().unwrap());
    assert_eq!(con.version(), Some(13));

    // client sends a masked TEXT frame
    peer.wh
        .write_all(&masked_frame(OpCode::Text, b"Hello"))
        .await
        .unwrap();
    assert_eq!(next_event(&mut rx).await, "message:Hello");

    // server initiates the closing handshake
    con.close(1000, "bye").unwrap();
    assert_eq!(con.state(), State::Closing);
    assert!(con.closed_by_me());

    let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([frame.payload[0], frame.payload[1]]), 1000);
    assert_eq!(&frame.payload[2..], b"bye");

    // client acknowledges
    peer.wh
        .write_all(&masked_frame(OpCode::Close, &close_payload(1000, "bye")))
        .await
        .unwrap();

    assert_eq!(next_event(&mut rx).await, "close");
    driver.await.unwrap();
    assert_eq!(con.state(), State::Closed);
    assert_eq!(con.fail_status(), FailStatus::Good);
    assert_eq!(con.remote_close().unwrap().code, 1000);

    // exactly one terminal event: the channel yields nothing further
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn ping_pong_round_trip() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (con, _driver, mut peer) = open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    con.ping("ABC").unwrap();

    let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
    assert_eq!(frame.header.opcode, OpCode::Ping);
    assert_eq!(frame.payload.as_ref(), b"ABC");

    // peer echoes the payload
    peer.wh
        .write_all(&masked_frame(OpCode::Pong, b"ABC"))
        .await
        .unwrap();

    assert_eq!(next_event(&mut rx).await, "pong:ABC");
    assert_eq!(con.state(), State::Open);
}

#[tokio::test(start_paused = true)]
async fn pong_timeout_fires_and_connection_stays_open() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (con, _driver, mut peer) = open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    con.ping("X").unwrap();

    // the peer reads the ping but never answers
    let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
    assert_eq!(frame.header.opcode, OpCode::Ping);

    assert_eq!(next_event(&mut rx).await, "pong_timeout:X");
    assert_eq!(con.state(), State::Open);
}

#[tokio::test]
async fn incoming_ping_is_answered_by_default() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (_con, _driver, mut peer) =
        open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    peer.wh
        .write_all(&masked_frame(OpCode::Ping, b"probe"))
        .await
        .unwrap();

    assert_eq!(next_event(&mut rx).await, "ping:probe");
    let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
    assert_eq!(frame.header.opcode, OpCode::Pong);
    assert_eq!(frame.payload.as_ref(), b"probe");
}

#[tokio::test]
async fn interrupts_deliver_exactly_one_callback_each() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (con, _driver, _peer) = open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    // interrupts come from a non-strand thread
    let thread_con = con.clone();
    std::thread::spawn(move || {
        for _ in 0..3 {
            thread_con.interrupt().unwrap();
        }
    })
    .join()
    .unwrap();

    for _ in 0..3 {
        assert_eq!(next_event(&mut rx).await, "interrupt");
    }
    assert_eq!(con.state(), State::Open);
}

#[tokio::test]
async fn terminate_under_backpressure_fails_and_drains_bookkeeping() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    // a tiny transport buffer so writes jam immediately
    let (con, driver, _peer) =
        open_server_with_capacity(Config::default(), Arc::new(Recorder::new(tx)), 256).await;
    assert_eq!(next_event(&mut rx).await, "open");

    let payload = Bytes::from(vec![0x42u8; 1024]);
    for _ in 0..1000 {
        con.send(payload.clone(), OpCode::Binary).unwrap();
    }
    assert!(con.buffered_amount() > 0);

    con.terminate();

    assert_eq!(next_event(&mut rx).await, "fail");
    driver.await.unwrap();
    assert_eq!(con.buffered_amount(), 0);
    assert_eq!(con.state(), State::Closed);
    assert_eq!(con.fail_status(), FailStatus::Unknown);

    // no callback of any kind after termination
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn handler_swap_mid_stream() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let a = Arc::new(Recorder::labelled("A", tx.clone()));
    let b: Arc<dyn Handler> = Arc::new(Recorder::labelled("B", tx.clone()));
    drop(tx);

    let (con, _driver, mut peer) = open_server(Config::default(), a).await;
    assert_eq!(next_event(&mut rx).await, "A:open");

    peer.wh
        .write_all(&masked_frame(OpCode::Text, b"M1"))
        .await
        .unwrap();
    assert_eq!(next_event(&mut rx).await, "A:message:M1");

    // swap is synchronous: unload of the old, then load of the new
    con.set_handler(b);
    assert_eq!(next_event(&mut rx).await, "A:unload");
    assert_eq!(next_event(&mut rx).await, "B:load");

    peer.wh
        .write_all(&masked_frame(OpCode::Text, b"M2"))
        .await
        .unwrap();
    assert_eq!(next_event(&mut rx).await, "B:message:M2");
}

#[tokio::test]
async fn remote_close_is_acked_and_reported() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (con, driver, mut peer) = open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    peer.wh
        .write_all(&masked_frame(OpCode::Close, &close_payload(1001, "going away")))
        .await
        .unwrap();

    // the ack echoes the peer's code
    let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([frame.payload[0], frame.payload[1]]), 1001);

    assert_eq!(next_event(&mut rx).await, "close");
    driver.await.unwrap();
    assert!(!con.closed_by_me());
    assert_eq!(con.remote_close().unwrap().code, 1001);
    assert_eq!(con.remote_close().unwrap().reason, "going away");
}

#[tokio::test(start_paused = true)]
async fn close_handshake_timeout_forces_termination() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (con, driver, mut peer) = open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    con.close(1000, "bye").unwrap();
    let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
    assert_eq!(frame.header.opcode, OpCode::Close);

    // the peer never acks; the close timer drops the transport
    assert_eq!(next_event(&mut rx).await, "close");
    driver.await.unwrap();
    assert!(con.dropped_by_me());
    assert_eq!(con.local_close().unwrap().code, 1000);
    assert_eq!(con.state(), State::Closed);
}

#[tokio::test]
async fn long_close_reason_is_truncated_on_the_wire() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (con, _driver, mut peer) = open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    con.close(1000, &"r".repeat(200)).unwrap();

    let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(frame.payload.len(), 125);
    assert_eq!(frame.payload[2..].len(), 123);
}

#[tokio::test]
async fn invalid_utf8_closes_with_1007() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (con, driver, mut peer) = open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    peer.wh
        .write_all(&masked_frame(OpCode::Text, &[0xff, 0xfe]))
        .await
        .unwrap();

    let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([frame.payload[0], frame.payload[1]]), 1007);

    assert_eq!(next_event(&mut rx).await, "fail");
    driver.await.unwrap();
    assert_eq!(con.fail_status(), FailStatus::Websocket);
    assert!(con.failed_by_me());
}

#[tokio::test]
async fn oversized_control_frame_closes_with_1002() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (_con, driver, mut peer) =
        open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    // hand-built ping with a 16-bit length of 126
    let mut raw = vec![0x89, 0x80 | 126, 0x00, 126];
    raw.extend_from_slice(&MASK);
    raw.extend_from_slice(&[0u8; 126]);
    peer.wh.write_all(&raw).await.unwrap();

    let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([frame.payload[0], frame.payload[1]]), 1002);

    assert_eq!(next_event(&mut rx).await, "fail");
    driver.await.unwrap();
}

#[tokio::test]
async fn oversized_message_closes_with_1009() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = Config::builder().max_message_size(16).build();
    let (_con, driver, mut peer) = open_server(config, Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    peer.wh
        .write_all(&masked_frame(OpCode::Binary, &[0u8; 64]))
        .await
        .unwrap();

    let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([frame.payload[0], frame.payload[1]]), 1009);

    assert_eq!(next_event(&mut rx).await, "fail");
    driver.await.unwrap();
}

#[tokio::test]
async fn unsupported_version_gets_400_with_supported_list() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let con = Connection::server(Config::default(), Arc::new(Recorder::new(tx)));
    let driver = tokio::spawn({
        let con = con.clone();
        async move { con.run(server).await }
    });

    let (mut rh, mut wh) = tokio::io::split(client);
    wh.write_all(
        b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\n\
          Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 99\r\n\r\n",
    )
    .await
    .unwrap();

    let response = read_headers(&mut rh).await;
    assert!(response.starts_with("HTTP/1.1 400"));
    assert!(response.contains("Sec-WebSocket-Version: 0, 7, 8, 13"));

    assert_eq!(next_event(&mut rx).await, "fail");
    driver.await.unwrap();
    assert_eq!(con.state(), State::Closed);
    assert_eq!(con.fail_status(), FailStatus::Websocket);
}

#[tokio::test]
async fn validate_rejection_sends_403_and_fails() {
    struct Rejecting {
        tx: mpsc::UnboundedSender<String>,
    }

    impl Handler for Rejecting {
        fn validate(&self, _con: &Connection) -> bool {
            false
        }
        fn on_fail(&self, _con: &Connection) {
            let _ = self.tx.send("fail".into());
        }
    }

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let con = Connection::server(Config::default(), Arc::new(Rejecting { tx }));
    let driver = tokio::spawn({
        let con = con.clone();
        async move { con.run(server).await }
    });

    let (mut rh, mut wh) = tokio::io::split(client);
    wh.write_all(HANDSHAKE).await.unwrap();
    let response = read_headers(&mut rh).await;
    assert!(response.starts_with("HTTP/1.1 403"));

    assert_eq!(next_event(&mut rx).await, "fail");
    driver.await.unwrap();
}

#[tokio::test]
async fn http_callback_can_shape_the_response() {
    struct Shaping;

    impl Handler for Shaping {
        fn http(&self, con: &Connection) {
            con.append_header("X-Routing", "alpha").unwrap();
            con.append_header("X-Routing", "beta").unwrap();
            con.replace_header("X-Routing", "gamma").unwrap();
        }
    }

    let (client, server) = tokio::io::duplex(64 * 1024);
    let con = Connection::server(Config::default(), Arc::new(Shaping));
    let driver = tokio::spawn({
        let con = con.clone();
        async move { con.run(server).await }
    });

    let (mut rh, mut wh) = tokio::io::split(client);
    wh.write_all(HANDSHAKE).await.unwrap();
    let response = read_headers(&mut rh).await;
    assert!(response.starts_with("HTTP/1.1 101"));
    assert!(response.contains("X-Routing: gamma"));

    // mutation is illegal once the handshake phase is over
    assert!(con.set_status(500).is_err());
    con.terminate();
    driver.await.unwrap();
}

#[tokio::test]
async fn client_role_round_trip() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let uri = Uri::parse("ws://example.com/chat").unwrap();
    let con = Connection::client(Config::default(), uri, Arc::new(Recorder::new(tx)));
    let driver = tokio::spawn({
        let con = con.clone();
        async move { con.run(client_io).await }
    });

    let (mut rh, mut wh) = tokio::io::split(server_io);

    // script the server: parse the request, compute the accept key
    let request = read_headers(&mut rh).await;
    assert!(request.starts_with("GET /chat HTTP/1.1"));
    assert!(request.contains("Host: example.com"));
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("request carries a key");
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
         Connection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    wh.write_all(response.as_bytes()).await.unwrap();

    assert_eq!(next_event(&mut rx).await, "open");
    assert_eq!(con.host().unwrap(), "example.com");

    // client frames are masked on the wire
    con.send("from-client", OpCode::Text).unwrap();
    let mut buf = BytesMut::new();
    let frame = read_frame(&mut rh, &mut buf, true).await;
    assert_eq!(frame.header.opcode, OpCode::Text);
    assert!(frame.header.masked);
    assert_eq!(frame.payload.as_ref(), b"from-client");

    // server sends unmasked text back
    let mut out = BytesMut::new();
    encode_frame(&mut out, OpCode::Text, b"from-server", true, None);
    wh.write_all(&out).await.unwrap();
    assert_eq!(next_event(&mut rx).await, "message:from-server");

    // server initiates the close
    let mut out = BytesMut::new();
    encode_frame(&mut out, OpCode::Close, &close_payload(1000, ""), true, None);
    wh.write_all(&out).await.unwrap();

    let frame = read_frame(&mut rh, &mut buf, true).await;
    assert_eq!(frame.header.opcode, OpCode::Close);

    assert_eq!(next_event(&mut rx).await, "close");
    driver.await.unwrap();
    assert_eq!(con.state(), State::Closed);
}

#[tokio::test]
async fn messages_keep_enqueue_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (con, _driver, mut peer) = open_server(Config::default(), Arc::new(Recorder::new(tx))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    for i in 0..20 {
        con.send(format!("m{}", i), OpCode::Text).unwrap();
    }

    for i in 0..20 {
        let frame = read_server_frame(&mut peer.rh, &mut peer.buf).await;
        assert_eq!(frame.header.opcode, OpCode::Text);
        assert_eq!(frame.payload.as_ref(), format!("m{}", i).as_bytes());
    }
    assert_eq!(con.buffered_amount(), 0);
}

#[tokio::test]
async fn termination_handler_runs_last() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (con, driver, mut peer) = open_server(Config::default(), Arc::new(Recorder::new(tx.clone()))).await;
    assert_eq!(next_event(&mut rx).await, "open");

    con.set_termination_handler(move |con| {
        let _ = tx.send(format!("terminated:{:?}", con.state()));
    });

    con.close(1000, "").unwrap();
    peer.wh
        .write_all(&masked_frame(OpCode::Close, &close_payload(1000, "")))
        .await
        .unwrap();

    assert_eq!(next_event(&mut rx).await, "close");
    assert_eq!(next_event(&mut rx).await, "terminated:Closed");
    driver.await.unwrap();
}

#[tokio::test]
async fn hixie76_handshake_and_text_frames() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let con = Connection::server(Config::default(), Arc::new(Recorder::new(tx)));
    let driver = tokio::spawn({
        let con = con.clone();
        async move { con.run(server).await }
    });

    let (mut rh, mut wh) = tokio::io::split(client);
    wh.write_all(
        b"GET /demo HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade\r\n\
          Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\nUpgrade: WebSocket\r\n\
          Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\nOrigin: http://example.com\r\n\r\n\
          ^n:ds[4U",
    )
    .await
    .unwrap();

    let response = read_headers(&mut rh).await;
    assert!(response.starts_with("HTTP/1.1 101 WebSocket Protocol Handshake"));
    assert!(response.contains("Sec-WebSocket-Location: ws://example.com/demo"));

    // the 16-byte challenge digest trails the headers
    let mut digest = [0u8; 16];
    rh.read_exact(&mut digest).await.unwrap();
    assert_eq!(&digest, b"8jKS'y:G*Co,Wxa-");

    assert_eq!(next_event(&mut rx).await, "open");
    assert_eq!(con.version(), Some(0));
    assert_eq!(con.origin().as_deref(), Some("http://example.com"));

    // sentinel-framed text in both directions
    wh.write_all(b"\x00hello\xff").await.unwrap();
    assert_eq!(next_event(&mut rx).await, "message:hello");

    con.send("world", OpCode::Text).unwrap();
    let mut reply = [0u8; 7];
    rh.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"\x00world\xff");

    // pings do not exist in draft-76
    assert!(con.ping("x").is_err());

    // close sentinel from the peer
    wh.write_all(&[0xFF, 0x00]).await.unwrap();
    let mut ack = [0u8; 2];
    rh.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, &[0xFF, 0x00]);

    assert_eq!(next_event(&mut rx).await, "close");
    driver.await.unwrap();
}
