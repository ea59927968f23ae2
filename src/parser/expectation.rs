//! Expectation records and the scheduler-facing seam
//!
//! An expectation ties a reply terminator to the callback waiting on it.
//! Oneshot expectations are consumed by their first match; persistent ones
//! (e.g. SGR mouse reports) fire on every match and stay registered.

use crate::sequence::{AbandonedFn, ResponseFn};

/// A oneshot expectation: consumed by its first matching reply.
pub(crate) struct Expectation {
    pub(crate) terminator: String,
    pub(crate) on_response: ResponseFn,
    pub(crate) on_abandoned: Option<AbandonedFn>,
}

impl Expectation {
    /// Whether `held` looks like this expectation's reply.
    pub(crate) fn matches(&self, held: &str) -> bool {
        !self.terminator.is_empty() && held.ends_with(&self.terminator)
    }
}

/// A continuously-matching expectation, never consumed.
pub(crate) struct PersistentExpectation {
    pub(crate) terminator: String,
    pub(crate) on_response: ResponseFn,
}

impl PersistentExpectation {
    pub(crate) fn matches(&self, held: &str) -> bool {
        !self.terminator.is_empty() && held.ends_with(&self.terminator)
    }
}

/// Errors from expectation registration.
#[derive(Debug, thiserror::Error)]
pub enum ExpectError {
    #[error("a persistent expectation for terminator {0:?} is already registered")]
    DuplicatePersistent(String),
}

/// The contract the request scheduler holds against the parser: register an
/// expectation when a request is sent, probe for terminator collisions
/// before sending, and demote expectations the terminal never answered.
pub trait Expecter {
    /// Register a oneshot expectation for `terminator`. Multiple
    /// registrations of the same terminator are allowed; the first match
    /// wins. `on_abandoned` fires if the expectation is later demoted by
    /// [`Expecter::stop_expecting`] without a reply.
    fn expect_response(
        &mut self,
        terminator: &str,
        on_response: ResponseFn,
        on_abandoned: Option<AbandonedFn>,
    );

    /// Whether an outstanding expectation collides with `terminator`. Any
    /// shared character counts as a collision, deliberately conservative:
    /// two in-flight requests with overlapping terminators could have their
    /// replies misattributed.
    fn is_expecting(&self, terminator: &str) -> bool;

    /// Give up on oneshot expectations whose terminator equals
    /// `terminator` exactly, moving them to the late-response table so a
    /// slow reply can still be dispatched instead of corrupting input.
    fn stop_expecting(&mut self, terminator: &str);
}
