//! Single-threaded readiness runtime.
//!
//! Built on mio (epoll on Linux, kqueue on macOS):
//! - `Multiplexer`: socket registration and readiness polling
//! - `ConnectionRegistry`: slab of live sessions keyed by poll token
//! - `EchoSession`: per-connection state machine
//! - `Dispatcher`: accept loop routing readiness events to sessions
//! - `ShutdownCoordinator`: signal handling and bounded drain

mod connection;
mod event_loop;
mod multiplexer;
mod session;
mod shutdown;

pub use connection::ConnectionRegistry;
pub use event_loop::Dispatcher;
pub use multiplexer::{Multiplexer, Readiness};
pub use session::{CloseReason, EchoSession, SessionSettings, SessionState, SessionStatus};
pub use shutdown::{Drain, DrainReport, ShutdownCoordinator, Signal, StopFlag};

use crate::config::Config;
use std::io;

/// Bind to the configured address and serve until `coordinator` stops us.
pub fn run(config: &Config, coordinator: &ShutdownCoordinator) -> io::Result<DrainReport> {
    let mut dispatcher = Dispatcher::bind(config)?;
    dispatcher.run(coordinator)
}
