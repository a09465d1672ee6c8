//! Error types for the session runtime.
//!
//! Errors are layered the way the runtime is:
//!
//! - [`WireError`] - encoding/decoding failures and the fatal
//!   command-exceeds-page condition.
//! - [`Error`] - anything that can surface inside a window's reactive
//!   scope (wire failures, bad input ports, application errors). This is
//!   the error type effect and memo bodies return; an `Err` is routed to
//!   the nearest error handler on the context chain.
//! - [`SessionError`] - transport/server-level failures (I/O, WebSocket
//!   handshake).

use thiserror::Error;

/// Failures in the binary command/argument codec.
#[derive(Debug, Error)]
pub enum WireError {
    /// A single command was staged that cannot fit in one output page.
    ///
    /// This is a fatal configuration error: the page size must be raised
    /// (or the template shrunk) at build time. It is never recovered at
    /// runtime.
    #[error("command of {size} bytes exceeds page size {page_size}")]
    CommandTooLarge { size: usize, page_size: usize },

    /// Input ended before a complete value could be read.
    #[error("truncated message at byte {offset}")]
    Truncated { offset: usize },

    /// An unknown value tag was encountered while decoding.
    #[error("unknown value tag {tag} at byte {offset}")]
    UnknownTag { tag: u8, offset: usize },

    /// A string payload was not valid UTF-8.
    #[error("invalid utf-8 in string payload")]
    InvalidUtf8,

    /// A content value referenced bytes outside the message string buffer.
    #[error("string buffer reference out of bounds")]
    BadStringRef,

    /// A value is too large for its fixed-width wire field.
    #[error("value too large to encode: {0}")]
    Oversize(&'static str),
}

/// Anything that can go wrong inside a window's reactive scope.
///
/// Effect and memo bodies return `Result<_, Error>`; the runtime delivers
/// an `Err` to the nearest `on_error` handler in the context-parent chain,
/// or logs it at the top level. The failing subtree is disposed; siblings
/// and the window itself stay alive.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A reactive operation that requires an active node (`on_cleanup`,
    /// `provide_context`, `on_error`) was called outside of one.
    #[error("reactive operation outside an active node")]
    NoActiveNode,

    /// An input message named a transmit port with no registered handler.
    #[error("unknown handler port {0}")]
    UnknownPort(u16),

    /// A sequence operation referenced an id this window does not own.
    #[error("unknown sequence {0}")]
    UnknownSequence(u16),

    /// A sequence operation addressed slots outside the region.
    #[error("sequence index out of range")]
    SequenceRange,

    /// Application-level error raised by user code inside an effect.
    #[error(transparent)]
    App(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an application error for propagation through the graph.
    pub fn app(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::App(err.into())
    }
}

/// Transport/server-level failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("session loop is no longer running")]
    LoopGone,
}
