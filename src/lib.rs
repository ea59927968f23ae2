//! Termquery
//!
//! The ANSI escape-sequence request/response machinery of a terminal UI:
//! send CSI queries (cursor position, device attributes, window size...) to
//! the terminal and reliably match its asynchronous replies back to the
//! originating request, while ordinary keyboard and mouse input keeps
//! flowing on the same stream.
//!
//! - `sequence`: query descriptors and outgoing requests
//! - `parser`: character classifier separating replies from user input
//! - `scheduler`: admission control for outgoing requests
//! - `config`: timing configuration

pub mod config;
pub mod parser;
pub mod scheduler;
pub mod sequence;

pub use config::{ConfigError, TimingConfig};
pub use parser::{ExpectError, Expecter, ParserState, ResponseParser};
pub use scheduler::RequestScheduler;
pub use sequence::{AnsiSequence, QueryRequest, CSI};
