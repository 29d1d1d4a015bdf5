//! Readiness multiplexer over mio (epoll on Linux, kqueue on macOS).
//!
//! Keeps its own table of watched sources so callers can ask what is
//! registered, and turns raw mio events into a small [`Readiness`] value.
//! A timed-out poll is an empty slice, never an error.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::time::Duration;

/// What a ready source may do without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The source can make progress on the given interest.
    Ready(Interest),
    /// The OS flagged an error on the source. Reported once per registration.
    Error,
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    interest: Interest,
    errored: bool,
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    watched: HashMap<Token, Watch>,
    ready: Vec<(Token, Readiness)>,
}

impl Multiplexer {
    /// Create a multiplexer returning at most `capacity` events per poll.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            watched: HashMap::new(),
            ready: Vec::with_capacity(capacity),
        })
    }

    /// Watch `source` under `token`, or replace the interest of an existing watch.
    pub fn register<S>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        match self.watched.get_mut(&token) {
            Some(watch) => {
                if watch.interest != interest {
                    self.poll.registry().reregister(source, token, interest)?;
                    watch.interest = interest;
                }
            }
            None => {
                self.poll.registry().register(source, token, interest)?;
                self.watched.insert(
                    token,
                    Watch {
                        interest,
                        errored: false,
                    },
                );
            }
        }
        Ok(())
    }

    /// Stop watching `source`. Unknown tokens are ignored.
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        if self.watched.remove(&token).is_some() {
            self.poll.registry().deregister(source)?;
        }
        Ok(())
    }

    /// Whether `token` is currently watched.
    pub fn is_registered(&self, token: Token) -> bool {
        self.watched.contains_key(&token)
    }

    /// Current interest for `token`.
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.watched.get(&token).map(|w| w.interest)
    }

    /// Number of watched sources.
    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    /// Wait up to `timeout` (forever if `None`) for ready sources.
    ///
    /// Events come back in the order the OS reported them. An empty slice
    /// means the timeout expired or the wait was interrupted by a signal.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<&[(Token, Readiness)]> {
        self.ready.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(&self.ready),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let token = event.token();
            // Stale events for sources dropped earlier in this cycle
            let Some(watch) = self.watched.get_mut(&token) else {
                continue;
            };

            if event.is_error() {
                if !watch.errored {
                    watch.errored = true;
                    self.ready.push((token, Readiness::Error));
                }
                continue;
            }
            if watch.errored {
                continue;
            }

            // Hang-ups surface as readable so the next read observes EOF
            let readable = event.is_readable() || event.is_read_closed();
            let writable = event.is_writable() || event.is_write_closed();
            let interest = match (readable, writable) {
                (true, true) => Interest::READABLE | Interest::WRITABLE,
                (true, false) => Interest::READABLE,
                (false, true) => Interest::WRITABLE,
                (false, false) => continue,
            };
            self.ready.push((token, Readiness::Ready(interest)));
        }

        Ok(&self.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::io::Write;
    use std::time::Instant;

    const LISTENER: Token = Token(0);
    const CLIENT: Token = Token(1);

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_timeout_is_empty() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut listener = listener();
        mux.register(&mut listener, LISTENER, Interest::READABLE)
            .unwrap();

        let start = Instant::now();
        let ready = mux.poll(Some(Duration::from_millis(50))).unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_listener_readable_on_connect() {
        let mut mux = Multiplexer::new(16).unwrap();
        let mut listener = listener();
        let addr = listener.local_addr().unwrap();
        mux.register(&mut listener, LISTENER, Interest::READABLE)
            .unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let ready = mux.poll(Some(Duration::from_millis(100))).unwrap();
            if let Some((token, readiness)) = ready.first() {
                assert_eq!(*token, LISTENER);
                assert!(matches!(readiness, Readiness::Ready(i) if i.is_readable()));
                break;
            }
            assert!(Instant::now() < deadline, "listener never became readable");
        }
    }

    #[test]
    fn test_register_tracks_interest() {
        let mut mux = Multiplexer::new(16).unwrap();
        let listener = listener();
        let addr = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();

        mux.register(&mut stream, CLIENT, Interest::READABLE).unwrap();
        assert!(mux.is_registered(CLIENT));
        assert_eq!(mux.interest(CLIENT), Some(Interest::READABLE));

        mux.register(&mut stream, CLIENT, Interest::WRITABLE).unwrap();
        assert_eq!(mux.interest(CLIENT), Some(Interest::WRITABLE));
        assert_eq!(mux.len(), 1);

        mux.deregister(&mut stream, CLIENT).unwrap();
        assert!(!mux.is_registered(CLIENT));

        // Second deregister is a no-op
        mux.deregister(&mut stream, CLIENT).unwrap();
        assert!(mux.is_empty());
    }

    #[test]
    fn test_client_writable_then_readable() {
        let mut mux = Multiplexer::new(16).unwrap();
        let listener = listener();
        let addr = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();
        mux.register(&mut stream, CLIENT, Interest::WRITABLE).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let ready = mux.poll(Some(Duration::from_millis(100))).unwrap();
            if ready
                .iter()
                .any(|(t, r)| *t == CLIENT && matches!(r, Readiness::Ready(i) if i.is_writable()))
            {
                break;
            }
            assert!(Instant::now() < deadline, "client never became writable");
        }

        let (mut accepted, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        mux.register(&mut stream, CLIENT, Interest::READABLE).unwrap();
        accepted.write_all(b"hi\r\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let ready = mux.poll(Some(Duration::from_millis(100))).unwrap();
            if ready
                .iter()
                .any(|(t, r)| *t == CLIENT && matches!(r, Readiness::Ready(i) if i.is_readable()))
            {
                break;
            }
            assert!(Instant::now() < deadline, "client never became readable");
        }
    }
}
