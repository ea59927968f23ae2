//! ANSI query descriptors and outgoing requests
//!
//! An [`AnsiSequence`] is the immutable template for one terminal query:
//! the bytes to transmit and the terminator character(s) that identify the
//! reply. A [`QueryRequest`] pairs a descriptor with the callbacks to run
//! when the reply arrives (or when the request is given up on).
//!
//! The constructors on [`AnsiSequence`] cover the queries terminals answer
//! in practice; anything else can be built with [`AnsiSequence::new`].

use std::fmt;

/// Control Sequence Introducer, the `ESC [` prefix that begins most ANSI
/// terminal query/response sequences.
pub const CSI: &str = "\x1b[";

/// Callback invoked with the full reply text (CSI prefix included).
pub type ResponseFn = Box<dyn FnMut(&str)>;

/// Callback invoked when a request is abandoned without a reply.
pub type AbandonedFn = Box<dyn FnOnce()>;

/// Immutable description of a terminal query.
///
/// Many descriptors may share a terminator (e.g. all the `t` window
/// reports); `value` disambiguates them for documentation purposes and for
/// callers inspecting replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnsiSequence {
    request: String,
    terminator: String,
    value: Option<String>,
}

impl AnsiSequence {
    /// Create a descriptor from raw request text and its reply terminator.
    pub fn new(request: impl Into<String>, terminator: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            terminator: terminator.into(),
            value: None,
        }
    }

    /// Create a descriptor whose reply carries a distinguishing leading
    /// value after the CSI prefix (e.g. the `8` in `ESC [ 8 ; h ; w t`).
    pub fn with_value(
        request: impl Into<String>,
        terminator: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            request: request.into(),
            terminator: terminator.into(),
            value: Some(value.into()),
        }
    }

    /// The text to transmit to the terminal.
    pub fn request(&self) -> &str {
        &self.request
    }

    /// The trailing character(s) that identify this query's reply.
    pub fn terminator(&self) -> &str {
        &self.terminator
    }

    /// Expected leading value of the reply payload, if any.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Primary device attributes (DA1). Reply is `ESC [ ? ... c`.
    pub fn device_attributes() -> Self {
        Self::new(format!("{CSI}0c"), "c")
    }

    /// Secondary device attributes (DA2). Reply is `ESC [ > ... c`.
    pub fn secondary_device_attributes() -> Self {
        Self::new(format!("{CSI}>0c"), "c")
    }

    /// Cursor position report (DECXCPR). Reply is `ESC [ ? y ; x R`.
    pub fn cursor_position_report() -> Self {
        Self::new(format!("{CSI}?6n"), "R")
    }

    /// Window size in pixels. Reply is `ESC [ 4 ; height ; width t`.
    pub fn window_size_pixels() -> Self {
        Self::new(format!("{CSI}14t"), "t")
    }

    /// Sixel graphics geometry. Reply is `ESC [ 6 ; height ; width t`.
    pub fn sixel_resolution() -> Self {
        Self::new(format!("{CSI}16t"), "t")
    }

    /// Text area size in characters. Reply is `ESC [ 8 ; rows ; cols t`.
    pub fn text_area_size() -> Self {
        Self::with_value(format!("{CSI}18t"), "t", "8")
    }
}

/// An outgoing query: a descriptor plus the callbacks that resolve it.
///
/// `on_response` fires exactly once if a matching reply arrives, with the
/// raw reply text. `on_abandoned` fires at most once if the request is
/// given up on (stale eviction or queue cancellation) before any reply.
pub struct QueryRequest {
    sequence: AnsiSequence,
    on_response: ResponseFn,
    on_abandoned: Option<AbandonedFn>,
}

impl QueryRequest {
    /// Create a request for `sequence`, resolving through `on_response`.
    pub fn new(sequence: AnsiSequence, on_response: impl FnMut(&str) + 'static) -> Self {
        Self {
            sequence,
            on_response: Box::new(on_response),
            on_abandoned: None,
        }
    }

    /// Attach a callback to run if the request is abandoned unanswered.
    pub fn on_abandoned(mut self, callback: impl FnOnce() + 'static) -> Self {
        self.on_abandoned = Some(Box::new(callback));
        self
    }

    /// The descriptor this request was built from.
    pub fn sequence(&self) -> &AnsiSequence {
        &self.sequence
    }

    /// Shorthand for the descriptor's terminator.
    pub fn terminator(&self) -> &str {
        self.sequence.terminator()
    }

    /// Split into the descriptor and callbacks for hand-off to the parser's
    /// expectation table.
    pub(crate) fn into_parts(self) -> (AnsiSequence, ResponseFn, Option<AbandonedFn>) {
        (self.sequence, self.on_response, self.on_abandoned)
    }

    /// Resolve as abandoned, firing `on_abandoned` if one was attached.
    pub(crate) fn abandon(self) {
        if let Some(callback) = self.on_abandoned {
            callback();
        }
    }
}

impl fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRequest")
            .field("sequence", &self.sequence)
            .field("on_abandoned", &self.on_abandoned.is_some())
            .finish()
    }
}
