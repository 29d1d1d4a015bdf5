//! Echo protocol implementation.
//!
//! Line-framed echo service:
//! - Client sends: `<data>\r\n`
//! - Server echoes: `<data>\r\n`, byte for byte
//!
//! A frame may arrive split across any number of reads; nothing is echoed
//! until its terminator has been received. Several frames may also arrive in
//! one read and are answered in order.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  hello\r\n
//! Response: hello\r\n
//! ```
//!
//! Special commands:
//! - `boom\r\n` - Simulated server-side failure. Nothing is echoed and the
//!   server closes the connection.

pub mod parser;

pub use parser::{Decoder, Frame, ParseResult, SENTINEL, TERMINATOR};
