//! Per-connection echo session.
//!
//! A session owns its stream and advances a small state machine each time the
//! multiplexer reports the stream ready:
//!
//! ```text
//!            frame complete           echo flushed
//! Reading ───────────────────▶ Echoing ───────────▶ Reading (multi)
//!    │                            │  └────────────▶ Closed  (single-shot, draining)
//!    │ EOF / error / sentinel     │ error
//!    ▼                            ▼
//! Closed ◀────────────────────────┘   any state ──cancel──▶ Closed(Cancelled)
//! ```
//!
//! Each step reads at most one chunk of `read_chunk_size` bytes. A step that
//! used its read without hitting would-block leaves [`EchoSession::wants_read`]
//! set, and the dispatcher steps the session again on a later cycle, since
//! the edge-triggered multiplexer will not report the remaining input. While
//! an echo is pending nothing more is read.

use crate::config::{Config, SessionMode};
use crate::protocols::echo::{Decoder, Frame, ParseResult};
use bytes::{Buf, BytesMut};
use mio::Interest;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, error, info, trace, warn};

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side (zero-length read).
    PeerClosed,
    /// Single-shot session finished its echo.
    Completed,
    /// Draining session finished its in-flight echo.
    Drained,
    /// Peer sent the failure sentinel.
    Sentinel,
    /// Message grew past the configured limit without a terminator.
    Overflow,
    /// I/O failure on the connection.
    Failed(io::ErrorKind),
    /// Force-closed when the drain deadline passed.
    Cancelled,
}

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accumulating bytes until a terminator arrives.
    Reading,
    /// Writing a frame back to the peer.
    Echoing,
    /// Connection released.
    Closed(CloseReason),
}

/// Lifecycle as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Draining,
    Finished,
}

/// Session tunables, taken from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub read_chunk_size: usize,
    pub max_message_size: usize,
    pub mode: SessionMode,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            read_chunk_size: config.read_chunk_size,
            max_message_size: config.max_message_size,
            mode: config.session_mode,
        }
    }
}

pub struct EchoSession<S> {
    /// Registry slot, set when the session is tracked.
    pub(crate) id: usize,
    /// Dropped together with the session, after deregistration.
    stream: S,
    peer: SocketAddr,
    state: SessionState,
    settings: SessionSettings,
    /// Bytes received but not yet framed.
    inbox: BytesMut,
    decoder: Decoder,
    /// Unsent tail of the frame being echoed.
    outbox: BytesMut,
    /// Last read hit would-block; wait for the next readable event.
    read_blocked: bool,
    /// Peer half-closed; finish buffered frames then close.
    eof: bool,
    draining: bool,
    echoed: u64,
}

impl<S> EchoSession<S> {
    pub fn new(stream: S, peer: SocketAddr, settings: SessionSettings) -> Self {
        Self {
            id: 0,
            stream,
            peer,
            state: SessionState::Reading,
            settings,
            inbox: BytesMut::with_capacity(settings.read_chunk_size),
            decoder: Decoder::new(settings.max_message_size),
            outbox: BytesMut::new(),
            read_blocked: false,
            eof: false,
            draining: false,
            echoed: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> SessionStatus {
        match self.state {
            SessionState::Closed(_) => SessionStatus::Finished,
            _ if self.draining => SessionStatus::Draining,
            _ => SessionStatus::Running,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed(_))
    }

    /// Number of frames echoed so far.
    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    /// The last step stopped at its read budget, so more input may be
    /// waiting on the socket without a new readiness event to announce it.
    pub fn wants_read(&self) -> bool {
        self.state == SessionState::Reading && !self.read_blocked && !self.eof
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Readiness the session waits on next, `None` once closed.
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            SessionState::Reading => Some(Interest::READABLE),
            SessionState::Echoing => Some(Interest::WRITABLE),
            SessionState::Closed(_) => None,
        }
    }

    /// Stop serving new messages. The in-flight message, if any, still
    /// completes; the session closes right after its echo.
    pub fn begin_drain(&mut self) {
        if !self.is_closed() {
            self.draining = true;
        }
    }

    /// Force-close during drain. A no-op on a closed session.
    pub fn cancel(&mut self) {
        if self.is_closed() {
            return;
        }
        info!(
            conn_id = self.id,
            peer = %self.peer,
            buffered = self.inbox.len(),
            "Drain deadline reached, closing session"
        );
        self.close(CloseReason::Cancelled);
    }

    /// Mark the session closed. Only the first call has any effect.
    ///
    /// The socket itself closes when the registry releases the session.
    pub fn close(&mut self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Closed(reason);
        self.inbox.clear();
        self.outbox.clear();
        self.decoder.reset();
        debug!(conn_id = self.id, peer = %self.peer, ?reason, echoed = self.echoed, "Session closed");
    }
}

impl<S: Read + Write> EchoSession<S> {
    /// Advance the session by one step after the multiplexer reported `ready`.
    ///
    /// A step reads at most one chunk, then echoes whatever complete frames
    /// the inbox holds until the echo is sent or the socket stops taking data.
    pub fn on_ready(&mut self, ready: Interest) -> SessionState {
        if ready.is_readable() {
            self.read_blocked = false;
        }
        self.advance();
        self.state
    }

    /// Close after an error the multiplexer observed on the connection.
    pub fn fail(&mut self, err: io::Error) -> SessionState {
        self.on_error(err);
        self.state
    }

    fn advance(&mut self) {
        let mut read = false;
        loop {
            match self.state {
                SessionState::Closed(_) => return,
                SessionState::Echoing => match self.flush() {
                    Ok(true) => self.finish_echo(),
                    Ok(false) => return,
                    Err(e) => return self.on_error(e),
                },
                SessionState::Reading => {
                    match self.decoder.decode(&mut self.inbox) {
                        ParseResult::Complete(Frame::Echo(frame)) => {
                            trace!(conn_id = self.id, bytes = frame.len(), "Frame complete");
                            self.outbox = frame;
                            self.state = SessionState::Echoing;
                        }
                        ParseResult::Complete(Frame::Boom) => {
                            error!(
                                conn_id = self.id,
                                peer = %self.peer,
                                echoed = self.echoed,
                                frame = "boom",
                                "Unexpected network error, failing session"
                            );
                            return self.close(CloseReason::Sentinel);
                        }
                        ParseResult::TooLarge => {
                            warn!(
                                conn_id = self.id,
                                peer = %self.peer,
                                buffered = self.inbox.len(),
                                limit = self.settings.max_message_size,
                                "Message exceeds size limit"
                            );
                            return self.close(CloseReason::Overflow);
                        }
                        ParseResult::Incomplete => {
                            if self.eof {
                                return self.close(CloseReason::PeerClosed);
                            }
                            if self.read_blocked || read {
                                return;
                            }
                            read = true;
                            if let Err(e) = self.fill() {
                                return self.on_error(e);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Read one bounded chunk into the inbox.
    fn fill(&mut self) -> io::Result<()> {
        let chunk = self.settings.read_chunk_size;
        let start = self.inbox.len();
        self.inbox.resize(start + chunk, 0);

        match self.stream.read(&mut self.inbox[start..]) {
            Ok(0) => {
                self.inbox.truncate(start);
                self.eof = true;
            }
            Ok(n) => {
                self.inbox.truncate(start + n);
                trace!(conn_id = self.id, bytes = n, "Read data");
            }
            Err(e) => {
                self.inbox.truncate(start);
                match e.kind() {
                    io::ErrorKind::WouldBlock => self.read_blocked = true,
                    io::ErrorKind::Interrupted => {}
                    _ => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Write as much of the outbox as the socket takes.
    ///
    /// Returns `true` once the outbox is empty.
    fn flush(&mut self) -> io::Result<bool> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbox.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn finish_echo(&mut self) {
        self.echoed += 1;
        trace!(conn_id = self.id, echoed = self.echoed, "Echo sent");

        if self.settings.mode == SessionMode::SingleShot {
            self.close(CloseReason::Completed);
        } else if self.draining {
            self.close(CloseReason::Drained);
        } else {
            self.state = SessionState::Reading;
        }
    }

    fn on_error(&mut self, err: io::Error) {
        if self.is_closed() {
            return;
        }
        warn!(
            conn_id = self.id,
            peer = %self.peer,
            state = ?self.state,
            error = %err,
            "Connection error"
        );
        self.close(CloseReason::Failed(err.kind()));
    }
}
