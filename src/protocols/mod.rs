//! Protocol implementations.
//!
//! Each protocol has a parser module used by the runtime event loop.
//!
//! - `echo`: `\r\n`-framed echo service with a failure sentinel

pub mod echo;
