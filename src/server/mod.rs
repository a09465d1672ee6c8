//! Session manager - the cooperative loop that owns every window.
//!
//! One dedicated thread runs a current-thread tokio runtime with a
//! single loop over all windows of the process. Two FIFO lists drive
//! scheduling:
//!
//! ```text
//!              Connect/Message/Disconnect (mpsc)
//!                           │
//!                           ▼
//!            ┌── pending_input: windows with buffered frames
//!   loop ────┤
//!            └── pending_work: windows with queued reactive work
//! ```
//!
//! A window's buffered input is always fully drained (decode → signal
//! writes) before its reactive work runs, and the bytes produced by that
//! work flush before the next batch for the same window - so within one
//! window, events apply in receipt order and recomputation completes
//! between event batches. Different windows interleave arbitrarily.
//!
//! When both lists are empty the loop suspends on the command channel
//! and the liveness-sweep timer. The sweep pings connected windows,
//! disconnects those with overdue pongs, destroys windows disconnected
//! past the timeout, and evicts every disconnected window eagerly while
//! the low-memory flag is set.

mod rate;
pub mod transport;

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::buffer::PagePool;
use crate::config::Config;
use crate::error::SessionError;
use crate::window::{ClientInfo, RootFn, Window, WindowId};

use self::rate::TokenBucket;

/// Parameters of one connection attempt, parsed from the handshake.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// `None` requests a new window; `Some` requests a reconnect.
    pub window_id: Option<WindowId>,
    /// Last output-stream offset the client acknowledged.
    pub read_offset: u64,
    pub info: ClientInfo,
    pub ip: IpAddr,
}

/// Result of a connection attempt, mapped to WebSocket close codes by
/// the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accepted { window_id: WindowId },
    /// Close 3001: the client must hard-reload.
    UnknownWindow,
    /// Close 3010: the client must not retry.
    RateLimited,
}

pub(crate) enum Command {
    Connect {
        params: ConnectParams,
        sink: UnboundedSender<Vec<u8>>,
        reply: oneshot::Sender<ConnectOutcome>,
    },
    Message {
        window: WindowId,
        data: Vec<u8>,
    },
    Disconnect {
        window: WindowId,
    },
    /// Explicit client close: the window is torn down, not parked.
    Close {
        window: WindowId,
    },
}

/// Cloneable handle for transports and embedders to reach the loop.
#[derive(Clone)]
pub struct ServerHandle {
    tx: UnboundedSender<Command>,
}

impl ServerHandle {
    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.tx.send(command).map_err(|_| SessionError::LoopGone)
    }

    /// Submit a connection attempt and await its outcome.
    pub async fn connect(
        &self,
        params: ConnectParams,
        sink: UnboundedSender<Vec<u8>>,
    ) -> Result<ConnectOutcome, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Connect {
            params,
            sink,
            reply,
        })?;
        response.await.map_err(|_| SessionError::LoopGone)
    }

    /// Forward one inbound binary frame.
    pub fn message(&self, window: WindowId, data: Vec<u8>) -> Result<(), SessionError> {
        self.send(Command::Message { window, data })
    }

    /// Report a dropped transport; the window stays resumable.
    pub fn disconnect(&self, window: WindowId) {
        let _ = self.send(Command::Disconnect { window });
    }

    /// Report an explicit client close; the window is destroyed.
    pub fn close(&self, window: WindowId) {
        let _ = self.send(Command::Close { window });
    }
}

struct WindowEntry {
    window: Window,
    msg_bucket: TokenBucket,
    in_input_list: bool,
    in_work_list: bool,
}

/// Owns all windows of the process. See the module docs for the loop's
/// scheduling contract.
pub struct SessionManager {
    cfg: Config,
    pool: Arc<PagePool>,
    root: RootFn,
    windows: HashMap<WindowId, WindowEntry>,
    pending_input: VecDeque<WindowId>,
    pending_work: VecDeque<WindowId>,
    rx: UnboundedReceiver<Command>,
    create_buckets: HashMap<IpAddr, TokenBucket>,
    dropped_messages: u64,
}

impl SessionManager {
    /// Build a manager plus the handle that feeds it.
    pub fn new(cfg: Config, root: RootFn) -> (Self, ServerHandle) {
        let (tx, rx) = unbounded_channel();
        let pool = Arc::new(PagePool::new(cfg.page_size));
        (
            Self {
                cfg,
                pool,
                root,
                windows: HashMap::new(),
                pending_input: VecDeque::new(),
                pending_work: VecDeque::new(),
                rx,
                create_buckets: HashMap::new(),
                dropped_messages: 0,
            },
            ServerHandle { tx },
        )
    }

    /// Spawn the loop on a dedicated thread with its own current-thread
    /// runtime. Windows are not `Send`; they live and die on this thread.
    pub fn spawn(cfg: Config, root: RootFn) -> Result<ServerHandle, SessionError> {
        let (tx, rx) = unbounded_channel();
        let handle = ServerHandle { tx };
        std::thread::Builder::new()
            .name("weft-session".to_string())
            .spawn(move || {
                let manager = Self {
                    pool: Arc::new(PagePool::new(cfg.page_size)),
                    cfg,
                    root,
                    windows: HashMap::new(),
                    pending_input: VecDeque::new(),
                    pending_work: VecDeque::new(),
                    rx,
                    create_buckets: HashMap::new(),
                    dropped_messages: 0,
                };
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        error!(target: "weft::server", %err, "session runtime build failed");
                        return;
                    }
                };
                rt.block_on(manager.run());
                info!(target: "weft::server", "session loop exited");
            })
            .map_err(SessionError::Io)?;
        Ok(handle)
    }

    /// The cooperative loop. Returns when every handle is dropped and the
    /// backlog is drained.
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.cfg.ping_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut closed = false;

        loop {
            // Absorb every queued command before servicing, so input
            // enqueued during a busy stretch is seen promptly.
            while !closed {
                match self.rx.try_recv() {
                    Ok(command) => self.handle_command(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => closed = true,
                }
            }

            if self.service_next() {
                continue;
            }
            if closed {
                return;
            }

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => closed = true,
                },
                _ = sweep.tick() => self.liveness_sweep(),
            }
        }
    }

    /// Service one window batch: pending input first, then pending work.
    /// Returns false when both lists are empty.
    pub fn service_next(&mut self) -> bool {
        if let Some(id) = self.pending_input.pop_front() {
            if let Some(entry) = self.windows.get_mut(&id) {
                entry.in_input_list = false;
                entry.window.drain_input();
                entry.window.run_work();
                entry.window.flush_tick();
            }
            return true;
        }
        if let Some(id) = self.pending_work.pop_front() {
            if let Some(entry) = self.windows.get_mut(&id) {
                entry.in_work_list = false;
                entry.window.run_work();
                entry.window.flush_tick();
            }
            return true;
        }
        false
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                params,
                sink,
                reply,
            } => {
                let outcome = self.apply_new_connection(params, sink);
                let _ = reply.send(outcome);
            }
            Command::Message { window, data } => self.enqueue_message(window, data),
            Command::Disconnect { window } => self.disconnect_window(&window),
            Command::Close { window } => self.destroy_window(&window),
        }
    }

    /// Create-or-reconnect. Creation is gated by the per-IP bucket; a
    /// reconnect replays unacknowledged pages from the client's offset.
    pub fn apply_new_connection(
        &mut self,
        params: ConnectParams,
        sink: UnboundedSender<Vec<u8>>,
    ) -> ConnectOutcome {
        match params.window_id {
            Some(id) => match self.windows.get_mut(&id) {
                Some(entry) => {
                    if entry.window.reconnect(sink, params.read_offset) {
                        self.mark_work(&id);
                        ConnectOutcome::Accepted { window_id: id }
                    } else {
                        // The stream it needs is gone; the window cannot
                        // serve this client again.
                        self.destroy_window(&id);
                        ConnectOutcome::UnknownWindow
                    }
                }
                None => ConnectOutcome::UnknownWindow,
            },
            None => {
                let bucket = self
                    .create_buckets
                    .entry(params.ip)
                    .or_insert_with(|| TokenBucket::new(self.cfg.create_rate));
                if !bucket.try_acquire() {
                    warn!(target: "weft::server", ip = %params.ip, "window creation rate limited");
                    return ConnectOutcome::RateLimited;
                }
                match Window::new(
                    self.cfg.clone(),
                    self.pool.clone(),
                    params.info,
                    self.root.clone(),
                    sink,
                ) {
                    Ok(window) => {
                        let id = window.id().clone();
                        self.windows.insert(
                            id.clone(),
                            WindowEntry {
                                window,
                                msg_bucket: TokenBucket::new(self.cfg.message_rate),
                                in_input_list: false,
                                in_work_list: false,
                            },
                        );
                        self.mark_work(&id);
                        ConnectOutcome::Accepted { window_id: id }
                    }
                    Err(err) => {
                        error!(target: "weft::server", %err, "window creation failed");
                        ConnectOutcome::UnknownWindow
                    }
                }
            }
        }
    }

    /// Buffer one inbound frame for a window, subject to its message
    /// budget. Over-budget frames are dropped and counted, never queued.
    pub fn enqueue_message(&mut self, id: WindowId, data: Vec<u8>) {
        let Some(entry) = self.windows.get_mut(&id) else {
            return;
        };
        if !entry.msg_bucket.try_acquire() {
            self.dropped_messages += 1;
            debug!(target: "weft::server", id = %id, "input dropped over message budget");
            return;
        }
        entry.window.enqueue_input(data);
        if !entry.in_input_list {
            entry.in_input_list = true;
            self.pending_input.push_back(id);
        }
    }

    /// Mark a window disconnected, leaving its state intact for a
    /// reconnect.
    pub fn disconnect_window(&mut self, id: &WindowId) {
        if let Some(entry) = self.windows.get_mut(id) {
            entry.window.disconnect();
        }
    }

    /// Ping connected windows, demote those with overdue pongs, destroy
    /// those disconnected past the timeout - or immediately, regardless
    /// of timeout, while the low-memory flag is set.
    pub fn liveness_sweep(&mut self) {
        let now = Instant::now();
        let low_memory = self.cfg.low_memory.load(Ordering::Relaxed);
        let mut expired = Vec::new();

        for (id, entry) in self.windows.iter_mut() {
            if entry.window.is_connected() {
                if now.duration_since(entry.window.last_pong()) > self.cfg.pong_timeout {
                    entry.window.disconnect();
                } else {
                    entry.window.send_ping();
                }
            }
            if !entry.window.is_connected() {
                let timed_out = entry
                    .window
                    .disconnected_at()
                    .map(|at| now.duration_since(at) > self.cfg.destroy_timeout)
                    .unwrap_or(false);
                if timed_out || low_memory {
                    expired.push(id.clone());
                }
            }
        }

        for id in expired {
            self.destroy_window(&id);
        }
    }

    fn destroy_window(&mut self, id: &WindowId) {
        if let Some(mut entry) = self.windows.remove(id) {
            entry.window.destroy();
            info!(
                target: "weft::server",
                id = %id,
                dropped_messages = self.dropped_messages,
                "window evicted"
            );
        }
    }

    fn mark_work(&mut self, id: &WindowId) {
        if let Some(entry) = self.windows.get_mut(id) {
            if !entry.in_work_list {
                entry.in_work_list = true;
                self.pending_work.push_back(id.clone());
            }
        }
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Frames dropped over budget since startup.
    pub fn dropped_message_count(&self) -> u64 {
        self.dropped_messages
    }

    /// Direct access to a window, for embedders driving without the loop.
    pub fn window_mut(&mut self, id: &WindowId) -> Option<&mut Window> {
        self.windows.get_mut(id).map(|entry| &mut entry.window)
    }
}
