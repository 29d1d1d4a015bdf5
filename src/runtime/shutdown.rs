//! Graceful shutdown: signal handling, stop flag, and session drain.
//!
//! SIGINT/SIGTERM handlers only flip an atomic; the event loop notices it on
//! its next iteration, which the poll timeout bounds. Draining then gives
//! every open session one shared deadline to finish before the rest are
//! cancelled.

use crate::runtime::connection::ConnectionRegistry;
use crate::runtime::multiplexer::Multiplexer;
use crate::runtime::session::CloseReason;
use mio::event::Source;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Set by the signal handler. Monotonic: once true, never false.
static SIGNALLED: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(sig: libc::c_int) {
    LAST_SIGNAL.store(sig, Ordering::Relaxed);
    SIGNALLED.store(true, Ordering::Release);
}

/// Termination signals the coordinator can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
        }
    }

    fn from_raw(sig: libc::c_int) -> Option<Self> {
        match sig {
            libc::SIGINT => Some(Signal::Interrupt),
            libc::SIGTERM => Some(Signal::Terminate),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

/// Shared request to stop the event loop.
///
/// Cheap to clone; any clone may request the stop from any thread.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    requested: Arc<AtomicBool>,
    follows_signals: bool,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
            || (self.follows_signals && SIGNALLED.load(Ordering::Acquire))
    }
}

/// Outcome of a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Sessions that closed on their own during the drain window.
    pub finished: usize,
    /// Sessions force-closed at the deadline.
    pub cancelled: usize,
}

/// An in-progress drain.
#[derive(Debug)]
pub struct Drain {
    started: Instant,
    deadline: Instant,
    report: DrainReport,
}

impl Drain {
    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Count a session that closed by itself while draining.
    pub fn session_finished(&mut self) {
        self.report.finished += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

pub struct ShutdownCoordinator {
    stop: StopFlag,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        Self::with_stop_flag(StopFlag::new(), drain_timeout)
    }

    /// Use an existing flag, e.g. one another thread holds a clone of.
    pub fn with_stop_flag(stop: StopFlag, drain_timeout: Duration) -> Self {
        Self {
            stop,
            drain_timeout,
        }
    }

    /// Route `signals` to the stop flag.
    pub fn install(&mut self, signals: &[Signal]) -> io::Result<()> {
        for signal in signals {
            let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            // SAFETY: the handler only performs atomic stores.
            let previous = unsafe { libc::signal(signal.raw(), handler) };
            if previous == libc::SIG_ERR {
                return Err(io::Error::last_os_error());
            }
            info!(signal = signal.name(), "Installed shutdown handler");
        }
        self.stop.follows_signals = true;
        Ok(())
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Signal that triggered the stop, if one did.
    pub fn received_signal(&self) -> Option<Signal> {
        if self.stop.follows_signals && SIGNALLED.load(Ordering::Acquire) {
            Signal::from_raw(LAST_SIGNAL.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Put every tracked session into draining mode and start the clock.
    pub fn begin_drain<S>(&self, registry: &mut ConnectionRegistry<S>) -> Drain {
        for (_, session) in registry.iter_mut() {
            session.begin_drain();
        }

        info!(
            sessions = registry.len(),
            timeout_ms = self.drain_timeout.as_millis() as u64,
            "Draining sessions"
        );

        let started = Instant::now();
        Drain {
            started,
            deadline: started + self.drain_timeout,
            report: DrainReport::default(),
        }
    }

    /// Cancel whatever is still tracked and finish the drain.
    ///
    /// Safe to call with sessions that already closed: each id is released
    /// at most once.
    pub fn finish_drain<S: Source>(
        &self,
        mut drain: Drain,
        registry: &mut ConnectionRegistry<S>,
        mux: &mut Multiplexer,
    ) -> DrainReport {
        for id in registry.all() {
            match registry.release(id, mux, CloseReason::Cancelled) {
                Some(CloseReason::Cancelled) => drain.report.cancelled += 1,
                Some(_) => drain.report.finished += 1,
                None => {}
            }
        }

        info!(
            finished = drain.report.finished,
            cancelled = drain.report.cancelled,
            elapsed_ms = drain.elapsed().as_millis() as u64,
            "Drain complete"
        );
        drain.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_shared_between_clones() {
        let flag = StopFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_requested());

        clone.request();
        assert!(flag.is_requested());
    }

    #[test]
    fn test_stop_flag_crosses_threads() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let flag = coordinator.stop_flag();

        std::thread::spawn(move || flag.request()).join().unwrap();
        assert!(coordinator.stop_requested());
    }

    #[test]
    fn test_signal_sets_flag() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.install(&[Signal::Terminate]).unwrap();

        // Flags that do not follow signals are unaffected
        let detached = StopFlag::new();

        // SAFETY: our handler is installed for SIGTERM.
        unsafe {
            libc::raise(libc::SIGTERM);
        }

        assert!(coordinator.stop_requested());
        assert_eq!(coordinator.received_signal(), Some(Signal::Terminate));
        assert!(!detached.is_requested());
    }

    #[test]
    fn test_drain_deadline() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(30));
        let mut registry: ConnectionRegistry<mio::net::TcpStream> = ConnectionRegistry::new(4);
        let mut mux = Multiplexer::new(4).unwrap();

        let drain = coordinator.begin_drain(&mut registry);
        assert!(!drain.is_expired());
        assert!(drain.remaining() <= Duration::from_millis(30));

        std::thread::sleep(Duration::from_millis(40));
        assert!(drain.is_expired());
        assert_eq!(drain.remaining(), Duration::ZERO);

        let report = coordinator.finish_drain(drain, &mut registry, &mut mux);
        assert_eq!(report, DrainReport::default());
    }
}
