//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything runs on the calling thread. Connections interleave at step
//! granularity: each readiness event advances one session by one bounded
//! step, then the loop moves on to the next event. Sessions that stopped at
//! their read budget are kept on a runnable list and stepped again on the
//! next cycle, which then polls without waiting.
//!
//! ## Shutdown
//!
//! The loop polls with a bounded timeout so it re-checks the stop flag at
//! least once per `poll_timeout` even when no socket is active. Once a stop
//! is requested the listener is closed first, so later connection attempts
//! are refused, and the remaining sessions are drained against a single
//! deadline.

use crate::config::Config;
use crate::runtime::connection::ConnectionRegistry;
use crate::runtime::multiplexer::{Multiplexer, Readiness};
use crate::runtime::session::{CloseReason, EchoSession, SessionSettings, SessionState};
use crate::runtime::shutdown::{DrainReport, ShutdownCoordinator};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Maximum readiness events handled per poll.
const EVENTS_CAPACITY: usize = 1024;

/// Owns the listening socket, the multiplexer, and the session registry.
pub struct Dispatcher {
    /// `None` once the server stopped accepting.
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    mux: Multiplexer,
    registry: ConnectionRegistry<TcpStream>,
    settings: SessionSettings,
    poll_timeout: Duration,
    /// Reused between polls.
    ready: Vec<(Token, Readiness)>,
    /// Sessions with input left on the socket after their last step.
    runnable: Vec<usize>,
    /// An accept failed before the backlog was empty.
    retry_accept: bool,
}

impl Dispatcher {
    /// Bind the listening socket and register it for accept readiness.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let listener = create_listener(config.listen, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        let mut mux = Multiplexer::new(EVENTS_CAPACITY)?;
        mux.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(
            addr = %local_addr,
            backlog = config.backlog,
            max_connections = config.max_connections,
            mode = ?config.session_mode,
            "Listening"
        );

        Ok(Self {
            listener: Some(listener),
            local_addr,
            mux,
            registry: ConnectionRegistry::new(config.max_connections),
            settings: SessionSettings::from(config),
            poll_timeout: config.poll_timeout,
            ready: Vec::with_capacity(EVENTS_CAPACITY),
            runnable: Vec::new(),
            retry_accept: false,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_accepting(&self) -> bool {
        self.listener.is_some()
    }

    pub fn registry(&self) -> &ConnectionRegistry<TcpStream> {
        &self.registry
    }

    /// Serve until `coordinator` reports a stop, then drain.
    ///
    /// Errors are returned only for failures of the listener or the
    /// multiplexer; per-connection failures are handled by their session.
    pub fn run(&mut self, coordinator: &ShutdownCoordinator) -> io::Result<DrainReport> {
        while !coordinator.stop_requested() {
            self.poll_once(self.poll_timeout)?;
        }

        match coordinator.received_signal() {
            Some(signal) => info!(signal = signal.name(), "Shutdown signal received"),
            None => info!("Shutdown requested"),
        }

        self.stop_accepting();
        self.drain(coordinator)
    }

    /// Poll once, dispatch every ready event in the order reported, then
    /// step the sessions left runnable by the previous cycle.
    ///
    /// Returns the number of sessions that closed during this cycle.
    fn poll_once(&mut self, timeout: Duration) -> io::Result<usize> {
        let runnable = std::mem::take(&mut self.runnable);
        let timeout = if runnable.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend_from_slice(self.mux.poll(Some(timeout))?);

        if ready.is_empty() && runnable.is_empty() {
            trace!(sessions = self.registry.len(), "No events, waiting");
        }

        let mut closed = 0;
        for &(token, readiness) in &ready {
            match token {
                LISTENER_TOKEN => self.on_listener(readiness)?,
                Token(conn_id) => {
                    if self.drive(conn_id, readiness).is_some() {
                        closed += 1;
                    }
                }
            }
        }
        self.ready = ready;

        for conn_id in runnable {
            // Released, or hit would-block on an event earlier this cycle
            let pending = self
                .registry
                .get(conn_id)
                .is_some_and(|session| session.wants_read());
            if pending && self.drive(conn_id, Readiness::Ready(Interest::READABLE)).is_some() {
                closed += 1;
            }
        }
        self.runnable.sort_unstable();
        self.runnable.dedup();

        if self.retry_accept {
            self.retry_accept = false;
            self.accept_connections();
        }

        Ok(closed)
    }

    fn on_listener(&mut self, readiness: Readiness) -> io::Result<()> {
        let Some(listener) = self.listener.as_ref() else {
            return Ok(());
        };

        if readiness == Readiness::Error {
            let err = listener
                .take_error()?
                .unwrap_or_else(|| io::Error::other("listener error"));
            error!(error = %err, "Listening socket failed");
            return Err(err);
        }

        self.accept_connections();
        Ok(())
    }

    /// Accept until the backlog is empty.
    ///
    /// If an accept fails for any other reason, connections may still be
    /// queued with no further readiness edge to report them, so the next
    /// cycle tries again.
    fn accept_connections(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.registry.len() >= self.registry.capacity() {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    }

                    let session = EchoSession::new(stream, peer, self.settings);
                    let Some(conn_id) = self.registry.track(session) else {
                        warn!(peer = %peer, "Connection limit reached");
                        continue;
                    };

                    let Some(session) = self.registry.get_mut(conn_id) else {
                        continue;
                    };
                    if let Err(e) =
                        self.mux
                            .register(session.stream_mut(), Token(conn_id), Interest::READABLE)
                    {
                        warn!(conn_id, peer = %peer, error = %e, "Failed to register connection");
                        self.registry.untrack(conn_id);
                        continue;
                    }

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    error!(error = %e, "Accept failed, retrying next cycle");
                    self.retry_accept = true;
                    break;
                }
            }
        }
    }

    /// Advance the session behind `conn_id` by one step.
    ///
    /// Returns the close reason if the session ended.
    fn drive(&mut self, conn_id: usize, readiness: Readiness) -> Option<CloseReason> {
        // Stale event for a session released earlier in this cycle
        let session = self.registry.get_mut(conn_id)?;

        let state = match readiness {
            Readiness::Ready(interest) => session.on_ready(interest),
            Readiness::Error => {
                let err = match session.stream_mut().take_error() {
                    Ok(Some(err)) | Err(err) => err,
                    Ok(None) => io::Error::new(io::ErrorKind::ConnectionReset, "socket error"),
                };
                session.fail(err)
            }
        };

        let reason = match state {
            SessionState::Closed(reason) => reason,
            SessionState::Reading | SessionState::Echoing => {
                let interest = session.interest()?;
                match self
                    .mux
                    .register(session.stream_mut(), Token(conn_id), interest)
                {
                    Ok(()) => {
                        if session.wants_read() {
                            self.runnable.push(conn_id);
                        }
                        return None;
                    }
                    Err(e) => {
                        warn!(conn_id, error = %e, "Failed to update interest");
                        CloseReason::Failed(e.kind())
                    }
                }
            }
        };

        self.registry.release(conn_id, &mut self.mux, reason)
    }

    /// Deregister and close the listening socket.
    fn stop_accepting(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.mux.deregister(&mut listener, LISTENER_TOKEN) {
                debug!(error = %e, "Listener deregister failed");
            }
            info!(addr = %self.local_addr, "Stopped accepting connections");
        }
    }

    /// Keep serving open sessions until they all close or the deadline passes.
    fn drain(&mut self, coordinator: &ShutdownCoordinator) -> io::Result<DrainReport> {
        let mut drain = coordinator.begin_drain(&mut self.registry);

        while !self.registry.is_empty() && !drain.is_expired() {
            let timeout = drain.remaining().min(self.poll_timeout);
            let closed = self.poll_once(timeout)?;
            for _ in 0..closed {
                drain.session_finished();
            }
        }

        if !self.registry.is_empty() {
            info!(
                remaining = self.registry.len(),
                "Drain timeout elapsed, cancelling remaining sessions"
            );
        }

        Ok(coordinator.finish_drain(drain, &mut self.registry, &mut self.mux))
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR set before bind.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}
