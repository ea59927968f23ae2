//! ANSI response classifier
//!
//! A stateful parser that watches a terminal input stream for CSI reply
//! sequences and routes them to registered expectations, while everything
//! else (keystrokes, mouse reports nobody asked for) flows through to the
//! normal input pipeline.

mod expectation;
mod state;

pub use expectation::{ExpectError, Expecter};
pub use state::{ParserState, ResponseParser};
