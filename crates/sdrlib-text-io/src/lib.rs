//! Structured-text framing and reply correlation shared by sdrlib drivers.
//!
//! Driven processes answer on their command channel with newline-terminated
//! JSON records. Commands and replies share one ordered byte stream, so
//! replies are matched to requests purely by position.
//!
//! # Architecture
//!
//! - [`protocol`] -- line framing with partial-read buffering, one-time
//!   header skip, and record classification (reply vs. async event)
//! - [`correlator`] -- pending command queue and FIFO reply-handler queue

pub mod correlator;
pub mod protocol;

pub use correlator::{Correlator, Dispatch, ReplyHandler, ReplyPolicy};
pub use protocol::{LineDecoder, Record, parse_record};
