//! # weft
//!
//! Server-driven UI runtime for Rust.
//!
//! Application state and rendering logic live on the server; the browser
//! is a thin binary-protocol interpreter applying incremental DOM
//! patches. The session runtime is three tightly coupled pieces:
//!
//! ```text
//! WebSocket bytes ─> SessionManager ─> Window ─> Reactive Graph
//!                     (rate limit,      (decode    (signals/memos/
//!                      fair loop)        input)     effects)
//!                                           │           │ schedules
//!                                           ▼           ▼
//!                    socket <─ pooled pages <─ wire codec <─ effects
//!                              (resumable,     (tokens,
//!                               replayable)     tagged values)
//! ```
//!
//! - [`reactive`] - fine-grained dependency graph: signals, memos,
//!   effects, depth-ordered scheduling, contexts and error handlers.
//! - [`wire`] - the binary command/argument format and the per-window
//!   token compression table.
//! - [`buffer`] - the process-wide page pool behind every window's
//!   resumable output stream.
//! - [`window`] - the per-client session: blocks, anchors, sequences,
//!   input handlers, reconnection offsets.
//! - [`server`] - the cooperative session loop, rate limiting, liveness,
//!   and the WebSocket transport.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use weft::{Config, SessionManager, View};
//!
//! let root: weft::RootFn = Arc::new(|cx| {
//!     let (count, set_count) = cx.create_signal(0i64);
//!     let bump = cx.create_handler(move |cx, _args| {
//!         set_count.update(cx, |n| n + 1);
//!         Ok(())
//!     });
//!     let _ = bump; // wired into a block's event bindings
//!     Ok(View::dynamic(move |cx| Ok(View::Int(count.get(cx)))))
//! });
//!
//! let handle = SessionManager::spawn(Config::default(), root)?;
//! // hand `handle` to weft::server::transport::serve(listener, handle)
//! # Ok::<(), weft::SessionError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod reactive;
pub mod server;
pub mod window;
pub mod wire;

pub use config::{Config, RateLimit};
pub use error::{Error, SessionError, WireError};
pub use reactive::{Cx, Memo, NodeId, ReadSignal, Runtime, WriteSignal};
pub use server::{ConnectOutcome, ConnectParams, ServerHandle, SessionManager};
pub use window::{
    Block, ClientFunction, ClientInfo, ElementBinding, ElementRef, ElementUpdate, EventBinding,
    HandlerRef, RootFn, Sequence, Shell, Template, View, Window, WindowId,
};
pub use wire::{EventFlags, EventKind, Value};
