//! Blocks, anchors and the attachable `View` union.
//!
//! A block is one installed DOM template plus its live anchors and
//! targets, addressed by an id the client shares. Anything that can land
//! in an anchor is a [`View`] variant, matched exhaustively at attach
//! time; the `Dyn` variant wraps a closure in an effect so the anchor
//! re-attaches whatever the closure returns whenever its dependencies
//! change - this is how conditional and dynamic children stay live.

use tracing::warn;

use super::Shell;
use crate::error::Error;
use crate::reactive::Cx;
use crate::wire::{EventFlags, EventKind, Value};

/// Compiler artifact: one compiled JSX block template. Registered at
/// startup and installed into each window on first use.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: u16,
    /// Token names the template's tree bytes index into, in order.
    pub tokens: Vec<String>,
    /// Serialized element tree.
    pub tree: Vec<u8>,
    /// Serialized element scripts (inline event setup).
    pub scripts: Vec<u8>,
}

impl Template {
    pub fn new(id: u16, tokens: Vec<String>, tree: Vec<u8>, scripts: Vec<u8>) -> Self {
        Self {
            id,
            tokens,
            tree,
            scripts,
        }
    }
}

/// Compiler artifact: a client-side function body, installed per window
/// on first use and invoked with server-bound arguments.
#[derive(Debug, Clone)]
pub struct ClientFunction {
    pub id: u16,
    pub arg_names: Vec<String>,
    pub body: String,
}

/// Opaque reference to a server-side input handler; encodes as
/// [`Value::Handler`] in event and client-function arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRef(pub u16);

impl From<HandlerRef> for Value {
    fn from(h: HandlerRef) -> Self {
        Value::Handler(h.0)
    }
}

/// Reference to a live element inside an installed block:
/// `(blockId, targetId)`. Encodes as [`Value::Ref`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementRef {
    pub block: u16,
    pub target: u8,
}

impl From<ElementRef> for Value {
    fn from(r: ElementRef) -> Self {
        Value::Ref(r.block, r.target)
    }
}

/// A live block installed in a window.
#[derive(Debug, Clone)]
pub struct Block {
    pub(crate) id: u16,
    /// Element refs requested at creation, in request order.
    pub refs: Vec<ElementRef>,
}

impl Block {
    pub fn id(&self) -> u16 {
        self.id
    }
}

/// One event listener wired at block creation. `args` are the
/// server-bound values the client sends back on invocation; by
/// convention at least one is a [`HandlerRef`].
pub struct EventBinding {
    pub target: u8,
    pub event: EventKind,
    pub flags: EventFlags,
    pub client_fn: u16,
    pub args: Vec<Value>,
}

/// A reactive style/attribute update produced by an element effect.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementUpdate {
    SetAttribute { name: String, value: String },
    SetStyle { name: String, value: String },
    MultiStyle { props: Vec<(String, String)> },
    RemoveAttribute { name: String },
    RemoveStyle { name: String },
}

/// A per-target reactive binding: the closure re-runs when its
/// dependencies change and its result is emitted as `ELEMENT_UPDATE`.
pub struct ElementBinding {
    pub target: u8,
    pub f: Box<dyn FnMut(&mut Cx<'_, Shell>) -> Result<ElementUpdate, Error>>,
}

impl ElementBinding {
    pub fn new(
        target: u8,
        f: impl FnMut(&mut Cx<'_, Shell>) -> Result<ElementUpdate, Error> + 'static,
    ) -> Self {
        Self {
            target,
            f: Box::new(f),
        }
    }
}

// =============================================================================
// View
// =============================================================================

/// Everything that can be attached to an anchor.
pub enum View {
    /// Clears the anchor.
    Empty,
    Text(String),
    Int(i64),
    Block(Block),
    /// Runs once in the current scope and attaches its result.
    Component(Box<dyn FnOnce(&mut Cx<'_, Shell>) -> Result<View, Error>>),
    /// Wrapped in an effect: re-attaches its result when dependencies
    /// change.
    Dyn(Box<dyn FnMut(&mut Cx<'_, Shell>) -> Result<View, Error>>),
    /// Becomes a managed sequence region seeded with these items.
    Many(Vec<View>),
    /// An existing sequence region.
    Seq(super::Sequence),
}

impl View {
    pub fn text(s: impl Into<String>) -> Self {
        View::Text(s.into())
    }

    pub fn component(
        f: impl FnOnce(&mut Cx<'_, Shell>) -> Result<View, Error> + 'static,
    ) -> Self {
        View::Component(Box::new(f))
    }

    pub fn dynamic(
        f: impl FnMut(&mut Cx<'_, Shell>) -> Result<View, Error> + 'static,
    ) -> Self {
        View::Dyn(Box::new(f))
    }
}

impl From<&str> for View {
    fn from(s: &str) -> Self {
        View::Text(s.to_string())
    }
}

impl From<String> for View {
    fn from(s: String) -> Self {
        View::Text(s)
    }
}

impl From<i64> for View {
    fn from(n: i64) -> Self {
        View::Int(n)
    }
}

impl From<Block> for View {
    fn from(b: Block) -> Self {
        View::Block(b)
    }
}

impl From<super::Sequence> for View {
    fn from(s: super::Sequence) -> Self {
        View::Seq(s)
    }
}

// =============================================================================
// Window-scoped operations
// =============================================================================

impl<'a> Cx<'a, Shell> {
    /// Attach a view to `(block, anchor)`, dispatching on the variant.
    pub fn attach(&mut self, block: u16, anchor: u16, view: View) -> Result<(), Error> {
        match view {
            View::Empty => self.env.emit_attach_text(block, anchor, "")?,
            View::Text(text) => self.env.emit_attach_text(block, anchor, &text)?,
            View::Int(n) => self.env.emit_attach_text(block, anchor, &n.to_string())?,
            View::Block(child) => self.env.emit_attach_block(block, anchor, child.id)?,
            View::Component(f) => {
                let inner = f(self)?;
                self.attach(block, anchor, inner)?;
            }
            View::Dyn(mut f) => {
                self.create_effect(move |cx| {
                    let inner = f(cx)?;
                    cx.attach(block, anchor, inner)
                });
            }
            View::Many(items) => {
                let seq = self.create_sequence(items)?;
                self.env.emit_attach_block(block, anchor, seq.id())?;
            }
            View::Seq(seq) => self.env.emit_attach_block(block, anchor, seq.id())?,
        }
        Ok(())
    }

    /// Install a block: template install (once per window), `INIT_BLOCK`,
    /// event wiring, per-target reactive element effects, anchor
    /// attachment, and a cleanup that queues the block's deletion when
    /// the owning node is disposed.
    pub fn create_block(
        &mut self,
        template: &Template,
        anchors: Vec<View>,
        events: Vec<EventBinding>,
        element_effects: Vec<ElementBinding>,
        ref_targets: &[u8],
    ) -> Result<Block, Error> {
        if !self.env.template_installed(template.id) {
            self.env.emit_install_template(template)?;
            self.env.mark_template_installed(template.id);
        }

        let block_id = self.env.alloc_block_id();
        self.env.emit_init_block(block_id, template.id)?;

        for binding in &events {
            self.env.emit_attach_event(block_id, binding)?;
        }

        for binding in element_effects {
            let ElementBinding { target, mut f } = binding;
            self.create_effect(move |cx| {
                let update = f(cx)?;
                cx.env.emit_element_update(block_id, target, &update)?;
                Ok(())
            });
        }

        for (index, view) in anchors.into_iter().enumerate() {
            self.attach(block_id, index as u16, view)?;
        }

        // Owned by the creating node; a block created outside any node is
        // window-permanent.
        let _ = self.on_cleanup(move |cx| {
            cx.env.queue_block_delete(block_id);
        });

        Ok(Block {
            id: block_id,
            refs: ref_targets
                .iter()
                .map(|&target| ElementRef {
                    block: block_id,
                    target,
                })
                .collect(),
        })
    }

    /// Register an input handler owned by the active node; it is
    /// released when that node is disposed. The returned [`HandlerRef`]
    /// is the transmit port the client invokes.
    pub fn create_handler(
        &mut self,
        f: impl FnMut(&mut Cx<'_, Shell>, Vec<Value>) -> Result<(), Error> + 'static,
    ) -> HandlerRef {
        let (key, port) = self.env.register_handler(Box::new(f));
        if self
            .on_cleanup(move |cx| cx.env.remove_handler(key))
            .is_err()
        {
            warn!(target: "weft::window", port, "handler registered outside any node lives for the window lifetime");
        }
        HandlerRef(port)
    }

    /// Run a compiled client function with server-bound arguments,
    /// installing it into this window first if needed.
    pub fn run_client_function(
        &mut self,
        function: &ClientFunction,
        args: Vec<Value>,
    ) -> Result<(), Error> {
        if !self.env.client_fn_installed(function.id) {
            self.env.emit_install_client_fn(function)?;
            self.env.mark_client_fn_installed(function.id);
        }
        self.env.emit_run_client_fn(function.id, &args)?;
        Ok(())
    }

    /// Emit an arbitrary head-mutation command object.
    pub fn modify_head(&mut self, command: Value) -> Result<(), Error> {
        self.env.emit_modify_head(&command)?;
        Ok(())
    }

    /// Set the document title.
    pub fn set_title(&mut self, title: &str) -> Result<(), Error> {
        self.modify_head(Value::Object(vec![
            ("op".to_string(), Value::str("title")),
            ("value".to_string(), Value::str(title)),
        ]))
    }

    /// Client viewport size, reported on connect and on resize.
    pub fn viewport(&self) -> crate::reactive::ReadSignal<(u16, u16)> {
        self.env
            .viewport_signal()
            .expect("window signals are wired at creation")
    }

    /// Current client path, updated by client-side navigation.
    pub fn client_path(&self) -> crate::reactive::ReadSignal<String> {
        self.env
            .path_signal()
            .expect("window signals are wired at creation")
    }
}
