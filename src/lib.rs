//! # webstrand: per-connection WebSocket state machine
//!
//! A WebSocket endpoint core built around a single long-lived object per
//! connection. The [`Connection`] mediates between a byte-oriented transport
//! and a message-oriented application [`Handler`], carrying the connection
//! through the opening handshake, data transfer, and the closing handshake.
//!
//! ## Design
//!
//! - **Strand execution**: one driver task per connection owns the transport;
//!   every callback fires on it, never concurrently for the same connection.
//! - **Any-thread surface**: `send`, `ping`, `close`, `interrupt`,
//!   `set_handler` and the getters may be called from any thread.
//! - **Serialized write pump**: outgoing messages go through a FIFO queue
//!   with at most one write in flight; the buffered amount is observable for
//!   application-level backpressure.
//! - **Version negotiation**: RFC 6455 (version 13) plus the legacy drafts
//!   Hybi-07/08 and Hixie-76 (version 0).
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use webstrand::{Config, Connection, Handler, Message, OpCode};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&self, con: &Connection, msg: Message) {
//!         if let Message::Text(payload) = msg {
//!             con.send(payload, OpCode::Text).ok();
//!         }
//!     }
//! }
//!
//! let con = Connection::server(Config::default(), Arc::new(Echo));
//! tokio::spawn({
//!     let con = con.clone();
//!     async move { con.run(tcp_stream).await }
//! });
//! ```

use std::time::Duration;

pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod http;
pub mod mask;
pub mod message;
pub mod processor;
pub mod state;
pub mod utf8;

pub use connection::{Connection, ConnectionHandle, Role};
pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, OpCode};
pub use handler::{Handler, NullHandler};
pub use http::{Request, Response, Uri};
pub use message::Message;
pub use state::{FailStatus, State};

/// WebSocket GUID appended to the key when computing the accept hash
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket protocol versions this library can negotiate
pub const SUPPORTED_VERSIONS: &[u16] = &[0, 7, 8, 13];

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload that fits the 2-byte header form
pub const SMALL_PAYLOAD_THRESHOLD: usize = 125;

/// Largest payload that fits the 4-byte header form
pub const MEDIUM_PAYLOAD_THRESHOLD: usize = 65535;

/// Maximum control frame payload per RFC 6455 section 5.5
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Maximum close reason length: 125 minus the 2-byte status code
pub const MAX_CLOSE_REASON: usize = 123;

/// Default per-read buffer size
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Configuration for WebSocket connections
///
/// # Example
///
/// ```
/// use webstrand::Config;
/// use std::time::Duration;
///
/// let config = Config::builder()
///     .max_message_size(16 * 1024 * 1024)
///     .pong_timeout(Duration::from_secs(5))
///     .user_agent("my-server/1.0")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum assembled message size (default: 16MB)
    pub max_message_size: usize,
    /// Maximum single frame size (default: 16MB)
    pub max_frame_size: usize,
    /// Read buffer size per transport read (default: 16KB)
    pub read_buffer_size: usize,
    /// User agent string advertised during the handshake
    pub user_agent: String,
    /// Opening handshake timeout (default: 5s)
    pub handshake_timeout: Duration,
    /// Time to wait for a pong after sending a ping (default: 5s)
    pub pong_timeout: Duration,
    /// Time to wait for the peer's close acknowledgement (default: 5s)
    pub close_handshake_timeout: Duration,
    /// When set, outgoing close frames omit code and reason
    pub silent_close: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            read_buffer_size: READ_BUFFER_SIZE,
            user_agent: concat!("webstrand/", env!("CARGO_PKG_VERSION")).to_string(),
            handshake_timeout: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(5),
            close_handshake_timeout: Duration::from_secs(5),
            silent_close: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the maximum assembled message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the maximum single frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the per-read buffer size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the user agent string
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    /// Set the opening handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the pong timeout
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.config.pong_timeout = timeout;
        self
    }

    /// Set the closing handshake timeout
    pub fn close_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_handshake_timeout = timeout;
        self
    }

    /// Omit code and reason from outgoing close frames
    pub fn silent_close(mut self, silent: bool) -> Self {
        self.config.silent_close = silent;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{Connection, ConnectionHandle, Role};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::OpCode;
    pub use crate::handler::{Handler, NullHandler};
    pub use crate::message::Message;
    pub use crate::state::{FailStatus, State};
    pub use crate::Config;
}
