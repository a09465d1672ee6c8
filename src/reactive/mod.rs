//! Fine-grained reactive dependency graph.
//!
//! Signals (state cells), memos (cached derived values) and effects
//! (side-effecting computations) form a graph whose edges are discovered
//! by running code: reading a signal inside an effect registers a
//! dependency; writing a signal schedules its observers.
//!
//! # Architecture
//!
//! ```text
//! WriteSignal::set ──> observers FRESH→QUEUED ──> WorkQueue (by depth)
//!                                                      │ poll()
//!                                                      ▼
//!                         clean_node ──> run closure ──> new edges
//! ```
//!
//! All nodes live in one generational arena per runtime, addressed by
//! [`NodeId`]; source/observer relations are index sets, so disposal is
//! "remove the id from every referenced set, then free the slot" - no
//! reference-counting cycles.
//!
//! There is no implicit global "current computation". Every operation
//! goes through [`Cx`], which carries the runtime plus the environment
//! effects act on (`Env = Shell` for a live window, `()` in tests), so
//! the single-owner discipline is checked by the borrow checker instead
//! of by convention.
//!
//! # Execution order
//!
//! The work queue is ordered by node depth (creation distance from the
//! root), FIFO within a depth, so a parent effect always re-runs - and
//! disposes/recreates its children - before a now-stale child would run.
//! Disposed nodes still resident in the queue are skipped lazily at poll
//! time rather than eagerly removed.

mod arena;
mod queue;
mod runtime;

pub use arena::{NodeId, UpdateState};
pub use runtime::{Cx, Memo, ReadSignal, Runtime, WriteSignal};
