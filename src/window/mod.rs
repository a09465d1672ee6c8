//! Window - one client's server-side session.
//!
//! A window owns a reactive runtime (the application's state graph), the
//! paged output stream that carries wire commands to the browser, the
//! token table, and the handler/block/sequence registries. The session
//! manager drives it in ticks: drain buffered input (decode → signal
//! writes), drain reactive work (effect runs → command emission), then
//! flush everything produced this tick as one mutation group.
//!
//! # Connection state machine
//!
//! ```text
//! CONNECTED ──(no pong / socket drop)──> DISCONNECTED
//!     ▲                                       │
//!     └───(reconnect, replay from offset)─────┤
//!                                             └─(timeout / low memory)─> DESTROYED
//! ```
//!
//! While disconnected the window keeps running and keeps writing into its
//! pages; a reconnect rewinds the flush cursor to the client's
//! acknowledged offset and resends the byte-identical tail.

mod block;
mod output;
mod sequence;

pub use block::{
    Block, ClientFunction, ElementBinding, ElementRef, ElementUpdate, EventBinding, HandlerRef,
    Template, View,
};
pub use sequence::Sequence;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use slab::Slab;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

use crate::buffer::PagePool;
use crate::config::Config;
use crate::error::{Error, WireError};
use crate::reactive::{Cx, NodeId, ReadSignal, Runtime, WriteSignal};
use crate::wire::{
    self, decode_message, encode_values, TokenTable, Value, OP_ATTACH_ANCHOR,
    OP_ATTACH_EVENT_V2, OP_ELEMENT_UPDATE, OP_INIT_BLOCK, OP_INIT_SEQUENCE,
    OP_INIT_WINDOW, OP_INSTALL_CLIENT_FUNCTION, OP_INSTALL_TEMPLATE, OP_MODIFY_HEAD,
    OP_MODIFY_SEQUENCE, OP_MODIFY_TOKENMAP, OP_PING, OP_REMOVE_BLOCKS,
    OP_RUN_CLIENT_FUNCTION, PORT_FIRST_USER, PORT_PATH, PORT_PONG, PORT_VIEWPORT,
    TOKEN_BIT, WINDOW_ID_LEN,
};

use self::sequence::SequenceState;

/// The application entry point: builds the root view inside the window's
/// reactive scope. Shared across windows; called once per window on its
/// root effect's first run.
pub type RootFn = Arc<dyn Fn(&mut Cx<'_, Shell>) -> Result<View, Error> + Send + Sync>;

/// Block id 0 terminates `REMOVE_BLOCKS` lists; id 1 is the implicit
/// root block the client mounts at. Allocation starts above both.
pub(crate) const ROOT_BLOCK_ID: u16 = 1;
const FIRST_BLOCK_ID: u16 = 2;

const ID_ALPHABET: &[u8; 64] =
    b"useandom26T198340PX75pxJACKVERYMINDBUSHWOLFGQZbfghjklqvwyzrict_-";

// =============================================================================
// WindowId
// =============================================================================

/// 21-character URL-safe window identifier, fixed-size on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowId(String);

impl WindowId {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let id: String = (0..WINDOW_ID_LEN)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Parse a client-supplied id. Anything but 21 ASCII bytes is
    /// rejected.
    pub fn parse(s: &str) -> Option<Self> {
        (s.len() == WINDOW_ID_LEN && s.is_ascii()).then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-reported state captured from the connection handshake.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub viewport: (u16, u16),
    pub path: String,
    pub cookie: Option<String>,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            viewport: (0, 0),
            path: "/".to_string(),
            cookie: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connected,
    Disconnected,
}

// =============================================================================
// Shell - everything effects act on
// =============================================================================

pub(crate) type HandlerFn = Box<dyn FnMut(&mut Cx<'_, Shell>, Vec<Value>) -> Result<(), Error>>;

/// The non-graph half of a window: output stream, token table, handler
/// and block registries, connection state. Effects receive `&mut Shell`
/// through their [`Cx`] and emit commands against it.
pub struct Shell {
    id: WindowId,
    cfg: Config,
    out: output::OutputStream,
    tokens: TokenTable,
    /// Command staging buffer; single owner, reused per command.
    cmd_buf: Vec<u8>,

    handlers: Slab<Option<HandlerFn>>,
    templates_installed: HashSet<u16>,
    client_fns_installed: HashSet<u16>,

    next_block_id: u16,
    free_block_ids: Vec<u16>,
    pub(crate) sequences: HashMap<u16, SequenceState>,

    /// Blocks whose deletes were queued this tick.
    delete_queue: Vec<u16>,
    /// Deletes queued last tick; flushed this tick so the browser has
    /// read past every possible use of the anchor.
    deferred_deletes: Vec<u16>,

    sink: Option<UnboundedSender<Vec<u8>>>,
    state: ConnState,
    last_pong: Instant,
    disconnected_at: Option<Instant>,

    viewport: Option<(ReadSignal<(u16, u16)>, WriteSignal<(u16, u16)>)>,
    path: Option<(ReadSignal<String>, WriteSignal<String>)>,
    cookie: Option<String>,
}

impl Shell {
    fn new(
        id: WindowId,
        cfg: Config,
        pool: Arc<PagePool>,
        info: &ClientInfo,
        sink: UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            cfg,
            out: output::OutputStream::new(pool),
            tokens: TokenTable::new(),
            cmd_buf: Vec::with_capacity(256),
            handlers: Slab::new(),
            templates_installed: HashSet::new(),
            client_fns_installed: HashSet::new(),
            next_block_id: FIRST_BLOCK_ID,
            free_block_ids: Vec::new(),
            sequences: HashMap::new(),
            delete_queue: Vec::new(),
            deferred_deletes: Vec::new(),
            sink: Some(sink),
            state: ConnState::Connected,
            last_pong: Instant::now(),
            disconnected_at: None,
            viewport: None,
            path: None,
            cookie: info.cookie.clone(),
        }
    }

    pub fn id(&self) -> &WindowId {
        &self.id
    }

    /// Cookie header captured at connect time.
    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    pub(crate) fn viewport_signal(&self) -> Option<ReadSignal<(u16, u16)>> {
        self.viewport.map(|(r, _)| r)
    }

    pub(crate) fn path_signal(&self) -> Option<ReadSignal<String>> {
        self.path.map(|(r, _)| r)
    }

    pub(crate) fn alloc_block_id(&mut self) -> u16 {
        if let Some(id) = self.free_block_ids.pop() {
            return id;
        }
        let id = self.next_block_id;
        self.next_block_id = self.next_block_id.wrapping_add(1).max(FIRST_BLOCK_ID);
        id
    }

    /// Queue a block for deletion. The delete command goes out one tick
    /// after the queueing tick, unless the buffer fills first.
    pub(crate) fn queue_block_delete(&mut self, id: u16) {
        self.delete_queue.push(id);
        if self.delete_queue.len() >= self.cfg.delete_buffer_cap {
            let ids = std::mem::take(&mut self.delete_queue);
            if let Err(err) = self.emit_remove_blocks(&ids) {
                error!(target: "weft::window", %err, "flushing full delete buffer failed");
            }
            self.free_block_ids.extend_from_slice(&ids);
        }
    }

    pub(crate) fn template_installed(&self, id: u16) -> bool {
        self.templates_installed.contains(&id)
    }

    pub(crate) fn mark_template_installed(&mut self, id: u16) {
        self.templates_installed.insert(id);
    }

    pub(crate) fn client_fn_installed(&self, id: u16) -> bool {
        self.client_fns_installed.contains(&id)
    }

    pub(crate) fn mark_client_fn_installed(&mut self, id: u16) {
        self.client_fns_installed.insert(id);
    }

    pub(crate) fn register_handler(&mut self, f: HandlerFn) -> (usize, u16) {
        let key = self.handlers.insert(Some(f));
        (key, key as u16 + PORT_FIRST_USER)
    }

    pub(crate) fn remove_handler(&mut self, key: usize) {
        self.handlers.try_remove(key);
    }

    // =========================================================================
    // Command emission
    // =========================================================================

    /// Commit the staged command, streaming any new token assignments
    /// first so the client's table is extended before first use.
    fn commit_cmd(&mut self) -> Result<(), WireError> {
        self.flush_new_tokens()?;
        let buf = std::mem::take(&mut self.cmd_buf);
        let result = self.out.commit(&buf);
        self.cmd_buf = buf;
        result
    }

    fn flush_new_tokens(&mut self) -> Result<(), WireError> {
        if !self.tokens.has_pending() {
            return Ok(());
        }
        let pending = self.tokens.take_pending();
        let mut buf = Vec::with_capacity(pending.iter().map(|t| t.len() + 1).sum::<usize>() + 2);
        buf.push(OP_MODIFY_TOKENMAP);
        for token in &pending {
            buf.push(token.len() as u8);
            buf.extend_from_slice(token.as_bytes());
        }
        buf.push(0);
        self.out.commit(&buf)
    }

    /// Stage a token-or-string field: interned strings travel as a 2-byte
    /// id with the top bit set, everything else as a length-prefixed raw
    /// string.
    fn stage_token_or_str(&mut self, s: &str) -> Result<(), WireError> {
        match self.tokens.intern(s) {
            Some(id) => self.cmd_buf.extend_from_slice(&(TOKEN_BIT | id).to_le_bytes()),
            None => {
                if s.len() >= TOKEN_BIT as usize {
                    return Err(WireError::Oversize("string field"));
                }
                self.cmd_buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
                self.cmd_buf.extend_from_slice(s.as_bytes());
            }
        }
        Ok(())
    }

    fn emit_init_window(&mut self) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_INIT_WINDOW);
        self.cmd_buf.extend_from_slice(self.id.as_str().as_bytes());
        self.commit_cmd()
    }

    pub(crate) fn emit_ping(&mut self) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_PING);
        self.commit_cmd()
    }

    pub(crate) fn emit_install_template(&mut self, template: &Template) -> Result<(), WireError> {
        if template.tree.len() > u16::MAX as usize || template.scripts.len() > u16::MAX as usize {
            return Err(WireError::Oversize("template payload"));
        }
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_INSTALL_TEMPLATE);
        self.cmd_buf.extend_from_slice(&template.id.to_le_bytes());
        self.cmd_buf
            .extend_from_slice(&(template.tokens.len() as u16).to_le_bytes());
        // The template's token names map to this window's table; ids are
        // streamed (via commit_cmd) before the command that cites them.
        for name in &template.tokens {
            match self.tokens.intern(name) {
                Some(id) => self.cmd_buf.extend_from_slice(&(TOKEN_BIT | id).to_le_bytes()),
                None => return Err(WireError::Oversize("template token")),
            }
        }
        self.cmd_buf
            .extend_from_slice(&(template.tree.len() as u16).to_le_bytes());
        self.cmd_buf.extend_from_slice(&template.tree);
        self.cmd_buf
            .extend_from_slice(&(template.scripts.len() as u16).to_le_bytes());
        self.cmd_buf.extend_from_slice(&template.scripts);
        self.commit_cmd()
    }

    pub(crate) fn emit_init_block(&mut self, block: u16, template: u16) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_INIT_BLOCK);
        self.cmd_buf.extend_from_slice(&block.to_le_bytes());
        self.cmd_buf.extend_from_slice(&template.to_le_bytes());
        self.commit_cmd()
    }

    pub(crate) fn emit_attach_text(
        &mut self,
        block: u16,
        anchor: u16,
        text: &str,
    ) -> Result<(), WireError> {
        if text.len() >= TOKEN_BIT as usize {
            return Err(WireError::Oversize("anchor text"));
        }
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_ATTACH_ANCHOR);
        self.cmd_buf.extend_from_slice(&block.to_le_bytes());
        self.cmd_buf.extend_from_slice(&anchor.to_le_bytes());
        self.cmd_buf.extend_from_slice(&(text.len() as u16).to_le_bytes());
        self.cmd_buf.extend_from_slice(text.as_bytes());
        self.commit_cmd()
    }

    pub(crate) fn emit_attach_block(
        &mut self,
        block: u16,
        anchor: u16,
        child: u16,
    ) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_ATTACH_ANCHOR);
        self.cmd_buf.extend_from_slice(&block.to_le_bytes());
        self.cmd_buf.extend_from_slice(&anchor.to_le_bytes());
        self.cmd_buf.extend_from_slice(&(TOKEN_BIT | child).to_le_bytes());
        self.commit_cmd()
    }

    pub(crate) fn emit_attach_event(
        &mut self,
        block: u16,
        binding: &EventBinding,
    ) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_ATTACH_EVENT_V2);
        self.cmd_buf.extend_from_slice(&block.to_le_bytes());
        self.cmd_buf.push(binding.target);
        self.cmd_buf.push(binding.event as u8);
        self.cmd_buf.push(binding.flags.bits());
        self.cmd_buf.extend_from_slice(&binding.client_fn.to_le_bytes());
        {
            let mut buf = std::mem::take(&mut self.cmd_buf);
            let result = encode_values(&mut buf, &binding.args);
            self.cmd_buf = buf;
            result?;
        }
        self.commit_cmd()
    }

    pub(crate) fn emit_element_update(
        &mut self,
        block: u16,
        target: u8,
        update: &ElementUpdate,
    ) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_ELEMENT_UPDATE);
        self.cmd_buf.extend_from_slice(&block.to_le_bytes());
        self.cmd_buf.push(target);
        match update {
            ElementUpdate::SetAttribute { name, value } => {
                self.cmd_buf.push(wire::UPDATE_MODE_SET_ATTRIBUTE);
                self.stage_token_or_str(name)?;
                self.stage_token_or_str(value)?;
            }
            ElementUpdate::SetStyle { name, value } => {
                self.cmd_buf.push(wire::UPDATE_MODE_SET_STYLE);
                self.stage_token_or_str(name)?;
                self.stage_token_or_str(value)?;
            }
            ElementUpdate::MultiStyle { props } => {
                if props.len() > u8::MAX as usize {
                    return Err(WireError::Oversize("style batch"));
                }
                self.cmd_buf.push(wire::UPDATE_MODE_MULTI_STYLE);
                self.cmd_buf.push(props.len() as u8);
                for (name, value) in props {
                    self.stage_token_or_str(name)?;
                    self.stage_token_or_str(value)?;
                }
            }
            ElementUpdate::RemoveAttribute { name } => {
                self.cmd_buf.push(wire::UPDATE_MODE_REMOVE_ATTRIBUTE);
                self.stage_token_or_str(name)?;
            }
            ElementUpdate::RemoveStyle { name } => {
                self.cmd_buf.push(wire::UPDATE_MODE_REMOVE_STYLE);
                self.stage_token_or_str(name)?;
            }
        }
        self.commit_cmd()
    }

    pub(crate) fn emit_remove_blocks(&mut self, ids: &[u16]) -> Result<(), WireError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_REMOVE_BLOCKS);
        for id in ids {
            self.cmd_buf.extend_from_slice(&id.to_le_bytes());
        }
        self.cmd_buf.extend_from_slice(&0u16.to_le_bytes());
        self.commit_cmd()
    }

    pub(crate) fn emit_init_sequence(&mut self, id: u16, len: u16) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_INIT_SEQUENCE);
        self.cmd_buf.extend_from_slice(&id.to_le_bytes());
        self.cmd_buf.extend_from_slice(&len.to_le_bytes());
        self.commit_cmd()
    }

    pub(crate) fn emit_modify_sequence(
        &mut self,
        id: u16,
        op: u8,
        index: u16,
        count: u16,
    ) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_MODIFY_SEQUENCE);
        self.cmd_buf.extend_from_slice(&id.to_le_bytes());
        self.cmd_buf.push(op);
        self.cmd_buf.extend_from_slice(&index.to_le_bytes());
        self.cmd_buf.extend_from_slice(&count.to_le_bytes());
        self.commit_cmd()
    }

    pub(crate) fn emit_install_client_fn(
        &mut self,
        function: &ClientFunction,
    ) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_INSTALL_CLIENT_FUNCTION);
        self.cmd_buf.extend_from_slice(&function.id.to_le_bytes());
        let payload = [
            Value::Array(
                function
                    .arg_names
                    .iter()
                    .map(|n| Value::Str(n.clone()))
                    .collect(),
            ),
            Value::Str(function.body.clone()),
        ];
        {
            let mut buf = std::mem::take(&mut self.cmd_buf);
            let result = encode_values(&mut buf, &payload);
            self.cmd_buf = buf;
            result?;
        }
        self.commit_cmd()
    }

    pub(crate) fn emit_run_client_fn(
        &mut self,
        id: u16,
        args: &[Value],
    ) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_RUN_CLIENT_FUNCTION);
        self.cmd_buf.extend_from_slice(&id.to_le_bytes());
        {
            let mut buf = std::mem::take(&mut self.cmd_buf);
            let result = encode_values(&mut buf, args);
            self.cmd_buf = buf;
            result?;
        }
        self.commit_cmd()
    }

    pub(crate) fn emit_modify_head(&mut self, command: &Value) -> Result<(), WireError> {
        self.cmd_buf.clear();
        self.cmd_buf.push(OP_MODIFY_HEAD);
        {
            let mut buf = std::mem::take(&mut self.cmd_buf);
            let result = encode_values(&mut buf, std::slice::from_ref(command));
            self.cmd_buf = buf;
            result?;
        }
        self.commit_cmd()
    }
}

// =============================================================================
// Window
// =============================================================================

/// One client session: reactive runtime + shell, driven by the session
/// manager.
pub struct Window {
    rt: Runtime<Shell>,
    shell: Shell,
    input: VecDeque<Vec<u8>>,
    root_id: Option<NodeId>,
}

impl Window {
    /// Create a window for a fresh connection: emits `INIT_WINDOW`, wires
    /// the client-state signals, and schedules the root effect. The first
    /// work drain renders the initial tree.
    pub fn new(
        cfg: Config,
        pool: Arc<PagePool>,
        info: ClientInfo,
        root: RootFn,
        sink: UnboundedSender<Vec<u8>>,
    ) -> Result<Self, Error> {
        let id = WindowId::random();
        let mut shell = Shell::new(id, cfg, pool, &info, sink);
        shell.emit_init_window()?;

        let mut window = Self {
            rt: Runtime::new(),
            shell,
            input: VecDeque::new(),
            root_id: None,
        };

        {
            let mut cx = window.rt.with_env(&mut window.shell);
            let viewport = cx.create_signal(info.viewport);
            let path = cx.create_signal(info.path.clone());
            cx.env.viewport = Some(viewport);
            cx.env.path = Some(path);

            let root_id = cx.create_effect(move |cx| {
                let view = root.as_ref()(cx)?;
                cx.attach(ROOT_BLOCK_ID, 0, view)
            });
            window.root_id = Some(root_id);
        }

        debug!(target: "weft::window", id = %window.shell.id, "window created");
        Ok(window)
    }

    pub fn id(&self) -> &WindowId {
        self.shell.id()
    }

    pub fn is_connected(&self) -> bool {
        self.shell.state == ConnState::Connected
    }

    pub fn last_pong(&self) -> Instant {
        self.shell.last_pong
    }

    pub fn disconnected_at(&self) -> Option<Instant> {
        self.shell.disconnected_at
    }

    pub fn has_pending_work(&self) -> bool {
        self.rt.has_pending_work()
    }

    pub fn has_pending_input(&self) -> bool {
        !self.input.is_empty()
    }

    /// Buffer one inbound frame for the next input drain.
    pub fn enqueue_input(&mut self, data: Vec<u8>) {
        self.input.push_back(data);
    }

    /// Decode and apply every buffered frame, in receipt order. Input is
    /// fully applied before reactive work runs, so recomputation sees the
    /// whole batch.
    pub fn drain_input(&mut self) {
        while let Some(frame) = self.input.pop_front() {
            self.process_input(&frame);
        }
    }

    /// Decode one frame and dispatch it: pong/ack, reserved client-state
    /// ports, or an application handler run untracked inside this
    /// window's reactive scope. Malformed frames are dropped; the window
    /// survives.
    pub fn process_input(&mut self, data: &[u8]) {
        let message = match decode_message(data) {
            Ok(m) => m,
            Err(err) => {
                warn!(target: "weft::window", id = %self.shell.id, %err, "dropping malformed input frame");
                return;
            }
        };

        match message.port {
            PORT_PONG => {
                self.shell.last_pong = Instant::now();
                if let Some(offset) = message.args.first().and_then(Value::as_int) {
                    if offset >= 0 {
                        self.shell.out.ack(offset as u64);
                    }
                }
            }
            PORT_VIEWPORT => {
                let w = message.args.first().and_then(Value::as_int);
                let h = message.args.get(1).and_then(Value::as_int);
                if let (Some(w), Some(h), Some((_, set))) = (w, h, self.shell.viewport) {
                    let mut cx = self.rt.with_env(&mut self.shell);
                    set.set(&mut cx, (w as u16, h as u16));
                }
            }
            PORT_PATH => {
                let path = message.args.first().and_then(|v| v.as_str().map(str::to_string));
                if let (Some(path), Some((_, set))) = (path, self.shell.path) {
                    let mut cx = self.rt.with_env(&mut self.shell);
                    set.set(&mut cx, path);
                }
            }
            port => {
                let key = (port - PORT_FIRST_USER) as usize;
                let Some(mut handler) = self
                    .shell
                    .handlers
                    .get_mut(key)
                    .and_then(Option::take)
                else {
                    warn!(target: "weft::window", id = %self.shell.id, %port, "input for unknown handler port");
                    return;
                };

                let result = {
                    let mut cx = self.rt.with_env(&mut self.shell);
                    cx.untrack(|cx| handler(cx, message.args))
                };
                // Restore unless the handler deregistered itself (or its
                // slot was reused) during the call.
                if let Some(slot) = self.shell.handlers.get_mut(key) {
                    if slot.is_none() {
                        *slot = Some(handler);
                    }
                }
                if let Err(err) = result {
                    error!(target: "weft::window", id = %self.shell.id, %port, %err, "input handler failed");
                }
            }
        }
    }

    /// Run queued reactive work to quiescence.
    pub fn run_work(&mut self) {
        let mut cx = self.rt.with_env(&mut self.shell);
        cx.flush();
    }

    /// End-of-tick flush: emit last tick's deferred block deletes, rotate
    /// the delete buffers, and ship everything staged this tick as one
    /// mutation group.
    pub fn flush_tick(&mut self) {
        let deferred = std::mem::take(&mut self.shell.deferred_deletes);
        if !deferred.is_empty() {
            if let Err(err) = self.shell.emit_remove_blocks(&deferred) {
                error!(target: "weft::window", id = %self.shell.id, %err, "emitting block deletes failed");
            }
            self.shell.free_block_ids.extend_from_slice(&deferred);
        }
        self.shell.deferred_deletes = std::mem::take(&mut self.shell.delete_queue);
        self.send_pending();
    }

    fn send_pending(&mut self) {
        if self.shell.sink.is_none() {
            return;
        }
        if let Some(bytes) = self.shell.out.take_unflushed() {
            let delivered = self
                .shell
                .sink
                .as_ref()
                .map(|sink| sink.send(bytes).is_ok())
                .unwrap_or(false);
            if !delivered {
                debug!(target: "weft::window", id = %self.shell.id, "sink gone, marking disconnected");
                self.disconnect();
            }
        }
    }

    /// Emit a liveness ping and push it out immediately. Runs a full
    /// tick flush, so deferred block deletes also drain on the ping
    /// period even when the window is otherwise idle.
    pub fn send_ping(&mut self) {
        if let Err(err) = self.shell.emit_ping() {
            error!(target: "weft::window", id = %self.shell.id, %err, "emitting ping failed");
        }
        self.flush_tick();
    }

    /// Rebind a reconnecting client: rewind the flush cursor to its
    /// acknowledged offset and resend the tail. Fails when the offset is
    /// unreplayable (already pruned or ahead of the stream).
    pub fn reconnect(&mut self, sink: UnboundedSender<Vec<u8>>, read_offset: u64) -> bool {
        if !self.shell.out.resume_from(read_offset) {
            warn!(
                target: "weft::window",
                id = %self.shell.id,
                read_offset,
                "reconnect offset not replayable"
            );
            return false;
        }
        self.shell.sink = Some(sink);
        self.shell.state = ConnState::Connected;
        self.shell.disconnected_at = None;
        self.shell.last_pong = Instant::now();
        debug!(target: "weft::window", id = %self.shell.id, read_offset, "window reconnected");
        self.send_pending();
        true
    }

    /// Mark the window disconnected, leaving all state (and unacked
    /// pages) intact for a possible reconnect.
    pub fn disconnect(&mut self) {
        if self.shell.state == ConnState::Disconnected {
            return;
        }
        self.shell.sink = None;
        self.shell.state = ConnState::Disconnected;
        self.shell.disconnected_at = Some(Instant::now());
        debug!(
            target: "weft::window",
            id = %self.shell.id,
            unacked = self.shell.out.write_offset() - self.shell.out.read_offset(),
            "window disconnected"
        );
    }

    /// Tear the window down: dispose the reactive root (running every
    /// cleanup exactly once) and return all pages to the pool.
    pub fn destroy(&mut self) {
        if let Some(root) = self.root_id.take() {
            let mut cx = self.rt.with_env(&mut self.shell);
            cx.dispose(root);
        }
        self.shell.handlers.clear();
        self.shell.sequences.clear();
        self.shell.sink = None;
        debug!(
            target: "weft::window",
            id = %self.shell.id,
            pages = self.shell.out.page_count(),
            "window destroyed"
        );
        self.shell.out.release_all();
    }

    /// Mutable reactive access for embedders and tests: run `f` with this
    /// window as the active context, then drain the work it scheduled and
    /// flush the tick.
    pub fn with_cx<R>(&mut self, f: impl FnOnce(&mut Cx<'_, Shell>) -> R) -> R {
        let mut cx = self.rt.with_env(&mut self.shell);
        let out = f(&mut cx);
        cx.flush();
        self.flush_tick();
        out
    }
}
