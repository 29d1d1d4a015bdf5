//! graceful-echo: a single-threaded echo server with graceful shutdown
//!
//! One thread multiplexes every client connection over OS readiness
//! notification (epoll/kqueue via mio). Clients send `\r\n`-terminated
//! messages and get each one echoed back byte for byte.
//!
//! Features:
//! - Fragment accumulation and pipelined messages per connection
//! - `boom\r\n` sentinel that simulates a server-side failure
//! - SIGINT/SIGTERM stop accepting and drain open sessions against a deadline
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use error::{Error, Result};
