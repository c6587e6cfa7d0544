//! Connection state controller
//!
//! Connection state is tracked at two levels. The external level is the
//! RFC 6455 view (`CONNECTING`/`OPEN`/`CLOSING`/`CLOSED`) and is part of the
//! public contract; it only ever advances. The finer internal level gates
//! operations to exact points in the lifecycle (e.g. response mutation is
//! only legal while the handshake request is being processed). Both levels
//! live in a single sum type so illegal pairs cannot be represented, and
//! transitions are compare-and-set under one lock so observers always see a
//! consistent pair.

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Externally visible connection state, per the RFC
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Opening handshake in progress
    Connecting = 0,
    /// Data transfer
    Open = 1,
    /// Closing handshake in progress
    Closing = 2,
    /// Connection finished
    Closed = 3,
}

/// Failure classification for a terminated connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailStatus {
    /// No failure
    #[default]
    Good,
    /// Transport-level error
    System,
    /// WebSocket protocol error
    Websocket,
    /// No failure information available
    Unknown,
    /// TLS handshake timed out
    TimeoutTls,
    /// WebSocket handshake timed out
    TimeoutWs,
}

/// Handshake sub-state within the external `Connecting` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    UserInit,
    TransportInit,
    ReadHttpRequest,
    WriteHttpRequest,
    ReadHttpResponse,
    WriteHttpResponse,
    ProcessHttpRequest,
}

/// The combined state: internal detail nested inside the external view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Session {
    Connecting(Phase),
    Open,
    Closing,
    Closed,
}

impl Session {
    /// Project out the external RFC state
    pub(crate) fn external(&self) -> State {
        match self {
            Session::Connecting(_) => State::Connecting,
            Session::Open => State::Open,
            Session::Closing => State::Closing,
            Session::Closed => State::Closed,
        }
    }
}

/// Shared state cell with compare-and-set transition primitives
///
/// The lock is held only for the compare-and-set or snapshot; never across
/// I/O or callbacks.
pub(crate) struct SessionCell {
    inner: Mutex<(Session, FailStatus)>,
}

impl SessionCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new((Session::Connecting(Phase::UserInit), FailStatus::Good)),
        }
    }

    /// Snapshot the external state
    pub(crate) fn state(&self) -> State {
        self.inner.lock().0.external()
    }

    /// Snapshot the failure status
    pub(crate) fn fail_status(&self) -> FailStatus {
        self.inner.lock().1
    }

    /// Require the current state to be exactly `want`
    ///
    /// A mismatch is a programmer error: the caller invoked an operation in
    /// a state where it is not legal.
    pub(crate) fn check(&self, want: Session, what: &'static str) -> Result<()> {
        if self.inner.lock().0 == want {
            Ok(())
        } else {
            Err(Error::InvalidState(what))
        }
    }

    /// Advance within the same external state
    pub(crate) fn advance(&self, from: Session, to: Session, what: &'static str) -> Result<()> {
        debug_assert_eq!(from.external(), to.external());
        self.transition(from, to, what)
    }

    /// Advance the internal and external state together
    ///
    /// The external state must move forward; `Connecting` may shortcut
    /// directly to `Closed` on failure.
    pub(crate) fn advance_both(&self, from: Session, to: Session, what: &'static str) -> Result<()> {
        debug_assert!(to.external() > from.external());
        self.transition(from, to, what)
    }

    fn transition(&self, from: Session, to: Session, what: &'static str) -> Result<()> {
        let mut guard = self.inner.lock();
        if guard.0 != from {
            return Err(Error::InvalidState(what));
        }
        guard.0 = to;
        Ok(())
    }

    /// Record the first failure; later failures keep the original status
    pub(crate) fn set_fail(&self, status: FailStatus) {
        let mut guard = self.inner.lock();
        if guard.1 == FailStatus::Good {
            guard.1 = status;
        }
    }

    /// Unconditionally enter `Closed`, returning the prior session state
    ///
    /// Used by terminate, which must win any race.
    pub(crate) fn force_closed(&self) -> Session {
        let mut guard = self.inner.lock();
        std::mem::replace(&mut guard.0, Session::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_ordering_is_monotone() {
        assert!(State::Connecting < State::Open);
        assert!(State::Open < State::Closing);
        assert!(State::Closing < State::Closed);
    }

    #[test]
    fn advance_requires_exact_current_state() {
        let cell = SessionCell::new();
        assert!(cell
            .advance(
                Session::Connecting(Phase::TransportInit),
                Session::Connecting(Phase::ReadHttpRequest),
                "read request",
            )
            .is_err());

        cell.advance(
            Session::Connecting(Phase::UserInit),
            Session::Connecting(Phase::TransportInit),
            "transport init",
        )
        .unwrap();
        assert_eq!(cell.state(), State::Connecting);
    }

    #[test]
    fn advance_both_moves_external_state() {
        let cell = SessionCell::new();
        cell.advance(
            Session::Connecting(Phase::UserInit),
            Session::Connecting(Phase::WriteHttpResponse),
            "handshake",
        )
        .unwrap();

        cell.advance_both(
            Session::Connecting(Phase::WriteHttpResponse),
            Session::Open,
            "open",
        )
        .unwrap();
        assert_eq!(cell.state(), State::Open);

        cell.advance_both(Session::Open, Session::Closing, "closing").unwrap();
        assert_eq!(cell.state(), State::Closing);
    }

    #[test]
    fn check_reports_mismatch() {
        let cell = SessionCell::new();
        assert!(cell
            .check(Session::Connecting(Phase::UserInit), "initial")
            .is_ok());
        assert!(matches!(
            cell.check(Session::Open, "must be open"),
            Err(Error::InvalidState("must be open"))
        ));
    }

    #[test]
    fn first_failure_wins() {
        let cell = SessionCell::new();
        assert_eq!(cell.fail_status(), FailStatus::Good);
        cell.set_fail(FailStatus::TimeoutWs);
        cell.set_fail(FailStatus::System);
        assert_eq!(cell.fail_status(), FailStatus::TimeoutWs);
    }

    #[test]
    fn force_closed_returns_prior() {
        let cell = SessionCell::new();
        let prior = cell.force_closed();
        assert_eq!(prior, Session::Connecting(Phase::UserInit));
        assert_eq!(cell.state(), State::Closed);
        assert_eq!(cell.force_closed(), Session::Closed);
    }
}
