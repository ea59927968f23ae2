//! Classifier state machine
//!
//! Decides, character by character, whether input belongs to an escape
//! sequence and if so whether that sequence is a reply someone is waiting
//! for, a late reply to a request already given up on, or an unrelated
//! sequence (e.g. a mouse report) to pass through untouched.
//!
//! # State machine
//!
//! - `Normal`: plain characters are emitted immediately; ESC is held.
//! - `ExpectingBracket`: a `[` continues into `InResponse`; a second ESC
//!   releases the first as a bare keypress; anything else releases
//!   everything held.
//! - `InResponse`: every character is held until the buffer resolves as a
//!   tracked reply, a known-shape CSI sequence, or the caller forces a
//!   release.
//!
//! The parser never errors: ambiguous input degrades to pass-through once
//! the buffer provably is not a tracked reply, and input that never
//! resolves stays held until [`ResponseParser::release`].

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::expectation::{ExpectError, Expectation, Expecter, PersistentExpectation};
use crate::sequence::{AbandonedFn, ResponseFn, CSI};

const ESC: char = '\x1b';

// Valid finals on CSI replies, per
// https://invisible-island.net/xterm/ctlseqs/ctlseqs.html#h3-Functions-using-CSI-_-ordered-by-the-final-character_s
// No N or O.
const KNOWN_TERMINATORS: &[char] = &[
    '@', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', //
    'P', 'Q', 'R', 'S', 'T', 'W', 'X', 'Z', //
    '^', '`', '~', //
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', //
    'l', 'm', 'n', //
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

fn is_known_terminator(c: char) -> bool {
    KNOWN_TERMINATORS.contains(&c)
}

/// Classifier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Passing input straight through.
    Normal,
    /// Saw ESC, waiting to see if a `[` follows.
    ExpectingBracket,
    /// Inside a suspected CSI sequence, holding until it resolves.
    InResponse,
}

/// The response parser.
///
/// Generic over an opaque per-character payload `T` so hosts can carry
/// metadata (source device, timestamps...) through the pipeline untouched;
/// the state machine itself only looks at the `char` projection. Use
/// `ResponseParser<()>` and [`ResponseParser::process_str`] for plain text.
pub struct ResponseParser<T> {
    state: ParserState,
    /// Stamped on every state transition, for staleness decisions.
    state_changed_at: Instant,
    /// Characters accumulated since leaving `Normal`.
    held: Vec<(char, T)>,
    /// Replies we are waiting on. First match wins.
    expected: Vec<Expectation>,
    /// Expectations given up on; a reply still dispatches, once.
    late: Vec<Expectation>,
    /// Continuously-matching expectations (e.g. mouse reports).
    persistent: Vec<PersistentExpectation>,
    /// Optional hook for complete sequences nobody is waiting for.
    unexpected_handler: Option<Box<dyn FnMut(&str) -> bool>>,
}

impl<T> Default for ResponseParser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResponseParser<T> {
    /// Create a parser in the `Normal` state.
    pub fn new() -> Self {
        Self {
            state: ParserState::Normal,
            state_changed_at: Instant::now(),
            held: Vec::new(),
            expected: Vec::new(),
            late: Vec::new(),
            persistent: Vec::new(),
            unexpected_handler: None,
        }
    }

    /// Current classifier state.
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// When the state last changed. Hosts use this to time out a held
    /// bare-Esc keypress.
    pub fn state_changed_at(&self) -> Instant {
        self.state_changed_at
    }

    /// Install a hook consulted for complete, known-shape sequences that
    /// match no expectation. Returning `true` swallows the sequence instead
    /// of releasing it to the input stream.
    pub fn swallow_unexpected(&mut self, handler: impl FnMut(&str) -> bool + 'static) {
        self.unexpected_handler = Some(Box::new(handler));
    }

    /// Register a continuously-matching expectation for `terminator`.
    /// Matching sequences are swallowed and the callback fires every time.
    pub fn expect_persistent(
        &mut self,
        terminator: &str,
        on_response: impl FnMut(&str) + 'static,
    ) -> Result<(), ExpectError> {
        if self.persistent.iter().any(|p| p.terminator == terminator) {
            return Err(ExpectError::DuplicatePersistent(terminator.to_string()));
        }
        self.persistent.push(PersistentExpectation {
            terminator: terminator.to_string(),
            on_response: Box::new(on_response),
        });
        Ok(())
    }

    /// Remove a persistent expectation.
    pub fn stop_persistent(&mut self, terminator: &str) {
        self.persistent.retain(|p| p.terminator != terminator);
    }

    /// Classify a stream of (character, payload) pairs, returning those
    /// approved for normal input processing. Characters withheld here may
    /// be emitted by a later call once their sequence resolves.
    pub fn process_input(&mut self, input: impl IntoIterator<Item = (char, T)>) -> Vec<(char, T)> {
        let mut output = Vec::new();
        for (ch, payload) in input {
            self.process_one(ch, payload, &mut output);
        }
        output
    }

    /// Force out whatever is held and reset to `Normal`. Called by hosts
    /// that have given up waiting (e.g. Esc keypress timeout) and want the
    /// held characters treated as ordinary input.
    pub fn release(&mut self) -> Vec<(char, T)> {
        let held = std::mem::take(&mut self.held);
        self.set_state(ParserState::Normal);
        held
    }

    /// [`ResponseParser::release`], but only when the parser has sat in a
    /// non-`Normal` state for longer than `timeout`.
    pub fn release_if_stale(&mut self, timeout: Duration) -> Option<Vec<(char, T)>> {
        if self.state != ParserState::Normal && self.state_changed_at.elapsed() > timeout {
            trace!(state = ?self.state, "releasing stale held input");
            return Some(self.release());
        }
        None
    }

    fn process_one(&mut self, ch: char, payload: T, output: &mut Vec<(char, T)>) {
        match self.state {
            ParserState::Normal => {
                if ch == ESC {
                    self.set_state(ParserState::ExpectingBracket);
                    self.held.push((ch, payload));
                } else {
                    output.push((ch, payload));
                }
            }
            ParserState::ExpectingBracket => {
                if ch == ESC {
                    // The held ESC was a bare keypress; give it back and
                    // start over on the new one.
                    self.release_held(ParserState::ExpectingBracket, output);
                    self.held.push((ch, payload));
                } else if ch == '[' {
                    self.set_state(ParserState::InResponse);
                    self.held.push((ch, payload));
                } else {
                    self.release_held(ParserState::Normal, output);
                    output.push((ch, payload));
                }
            }
            ParserState::InResponse => {
                self.held.push((ch, payload));
                if self.should_release_held() {
                    self.release_held(ParserState::Normal, output);
                }
            }
        }
    }

    /// Decide what to do with the held buffer after each `InResponse`
    /// character. Returns `true` only when the buffer should go back to the
    /// input stream; matched replies are dispatched and swallowed here.
    fn should_release_held(&mut self) -> bool {
        let cur = self.held_string();

        if let Some(idx) = self.expected.iter().position(|e| e.matches(&cur)) {
            let mut expectation = self.expected.remove(idx);
            debug!(terminator = %expectation.terminator, reply = ?cur, "dispatching reply");
            (expectation.on_response)(&cur);
            self.reset();
            return false;
        }

        // A reply to a request we already gave up on. Dispatch it anyway so
        // a slow terminal's answer is not lost, then forget the entry.
        if let Some(idx) = self.late.iter().position(|e| e.matches(&cur)) {
            let mut expectation = self.late.remove(idx);
            debug!(terminator = %expectation.terminator, reply = ?cur, "dispatching late reply");
            (expectation.on_response)(&cur);
            self.reset();
            return false;
        }

        if let Some(idx) = self.persistent.iter().position(|p| p.matches(&cur)) {
            trace!(reply = ?cur, "dispatching persistent match");
            (self.persistent[idx].on_response)(&cur);
            self.reset();
            return false;
        }

        // A complete CSI sequence nobody asked about, e.g. mouse activity.
        let last = cur.chars().last().unwrap_or('\0');
        if is_known_terminator(last) && cur.starts_with(CSI) {
            self.set_state(ParserState::Normal);

            if let Some(handler) = self.unexpected_handler.as_mut() {
                if handler(&cur) {
                    debug!(sequence = ?cur, "unexpected sequence swallowed by handler");
                    self.held.clear();
                    return false;
                }
            }

            trace!(sequence = ?cur, "unexpected sequence released to input");
            return true;
        }

        // Not enough information yet.
        false
    }

    fn held_string(&self) -> String {
        self.held.iter().map(|(c, _)| *c).collect()
    }

    fn release_held(&mut self, new_state: ParserState, output: &mut Vec<(char, T)>) {
        output.append(&mut self.held);
        self.set_state(new_state);
    }

    fn reset(&mut self) {
        self.set_state(ParserState::Normal);
        self.held.clear();
    }

    /// Single transition point; every state change stamps the timestamp.
    fn set_state(&mut self, state: ParserState) {
        self.state_changed_at = Instant::now();
        self.state = state;
    }
}

impl ResponseParser<()> {
    /// Classify plain text, returning the characters approved for normal
    /// input processing.
    pub fn process_str(&mut self, input: &str) -> String {
        self.process_input(input.chars().map(|c| (c, ())))
            .into_iter()
            .map(|(c, ())| c)
            .collect()
    }

    /// String form of [`ResponseParser::release`].
    pub fn release_str(&mut self) -> String {
        self.release().into_iter().map(|(c, ())| c).collect()
    }
}

impl<T> Expecter for ResponseParser<T> {
    fn expect_response(
        &mut self,
        terminator: &str,
        on_response: ResponseFn,
        on_abandoned: Option<AbandonedFn>,
    ) {
        self.expected.push(Expectation {
            terminator: terminator.to_string(),
            on_response,
            on_abandoned,
        });
    }

    fn is_expecting(&self, terminator: &str) -> bool {
        self.expected
            .iter()
            .any(|e| e.terminator.chars().any(|c| terminator.contains(c)))
    }

    fn stop_expecting(&mut self, terminator: &str) {
        let mut i = 0;
        while i < self.expected.len() {
            if self.expected[i].terminator == terminator {
                let mut expectation = self.expected.remove(i);
                debug!(terminator, "demoting expectation to late");
                if let Some(abandoned) = expectation.on_abandoned.take() {
                    abandoned();
                }
                self.late.push(expectation);
            } else {
                i += 1;
            }
        }
    }
}
