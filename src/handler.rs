//! Application handler facade
//!
//! A connection dispatches its lifecycle events to a [`Handler`]. Every
//! method has a default no-op implementation, so applications implement only
//! what they need. The handler can be swapped at any time with
//! [`Connection::set_handler`](crate::Connection::set_handler): callbacks
//! already executing finish against the old handler, and every dispatch
//! after the swap sees the new one.

use std::sync::Arc;

use crate::connection::Connection;
use crate::message::Message;

/// Application callback bundle for one connection
///
/// All callbacks run on the connection's strand: never two at once for the
/// same connection. `on_close` or `on_fail` is always the last callback,
/// and exactly one of them fires.
#[allow(unused_variables)]
pub trait Handler: Send + Sync {
    /// Server only: the handshake request has been parsed, before the upgrade
    ///
    /// Response mutation (`set_status`, `append_header`, ...) is legal here.
    fn http(&self, con: &Connection) {}

    /// Server only: accept or reject the connection after protocol validation
    ///
    /// Returning `false` rejects the handshake; the connection fails after
    /// the error response is written.
    fn validate(&self, con: &Connection) -> bool {
        true
    }

    /// The connection reached the OPEN state
    fn on_open(&self, con: &Connection) {}

    /// A validated data message arrived
    fn on_message(&self, con: &Connection, msg: Message) {}

    /// A ping arrived; return `true` to send the echoing pong
    fn on_ping(&self, con: &Connection, payload: &[u8]) -> bool {
        true
    }

    /// A pong arrived
    fn on_pong(&self, con: &Connection, payload: &[u8]) {}

    /// No pong arrived within the configured timeout for this ping payload
    fn on_pong_timeout(&self, con: &Connection, payload: &[u8]) {}

    /// The connection terminated cleanly
    fn on_close(&self, con: &Connection) {}

    /// The connection terminated abnormally; see
    /// [`Connection::fail_status`](crate::Connection::fail_status)
    fn on_fail(&self, con: &Connection) {}

    /// An [`interrupt`](crate::Connection::interrupt) signal was delivered
    fn on_interrupt(&self, con: &Connection) {}

    /// This handler was installed on the connection
    fn on_load(&self, con: &Connection, old: &Arc<dyn Handler>) {}

    /// This handler was replaced on the connection
    fn on_unload(&self, con: &Connection, new: &Arc<dyn Handler>) {}
}

/// A handler that ignores every event
pub struct NullHandler;

impl Handler for NullHandler {}
