//! Graph operations: create/read/write/schedule/dispose.
//!
//! [`Runtime`] owns the arena and the work queue. [`Cx`] couples a
//! mutable borrow of the runtime with the environment effects act on;
//! every graph operation takes it explicitly, so "which window is
//! active" is a compile-time fact rather than a global pointer.
//!
//! Closure execution uses take-out/run/restore: the node's closure is
//! moved out of the arena, run against a fresh `Cx`, and put back if the
//! node survived the run. This lets the closure create nodes (which needs
//! the arena) without aliasing.

use std::any::Any;
use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::error;

use super::arena::{Arena, CleanupFn, ErrorHandler, Node, NodeId, NodeKind, UpdateState};
use super::queue::WorkQueue;
use crate::error::Error;

fn eq_any<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// One reactive graph: arena, work queue, and the tracking cursor.
pub struct Runtime<Env> {
    arena: Arena<Env>,
    queue: WorkQueue,
    /// Node currently executing; reads register it as an observer.
    active: Option<NodeId>,
    tracking: bool,
}

impl<Env: 'static> Runtime<Env> {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            queue: WorkQueue::new(),
            active: None,
            tracking: true,
        }
    }

    /// Pair this runtime with its environment for a batch of operations.
    pub fn with_env<'a>(&'a mut self, env: &'a mut Env) -> Cx<'a, Env> {
        Cx { rt: self, env }
    }

    /// True when queued nodes are waiting to run. May report true for
    /// entries that turn out to be stale; the flush then does nothing.
    pub fn has_pending_work(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Number of live nodes (diagnostics and tests).
    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    /// Verify source/observer symmetry across the whole arena: for every
    /// node N and source S, `S ∈ N.sources ⇔ N ∈ S.observers`.
    #[cfg(test)]
    pub(crate) fn assert_edge_symmetry(&self) {
        for (id, node) in self.arena.iter() {
            for source in &node.sources {
                let source_node = self
                    .arena
                    .get(*source)
                    .expect("source edge to a freed node");
                assert!(
                    source_node.observers.contains(&id),
                    "{id:?} lists {source:?} as source, but the reverse edge is missing"
                );
            }
            for observer in &node.observers {
                let observer_node = self
                    .arena
                    .get(*observer)
                    .expect("observer edge to a freed node");
                assert!(
                    observer_node.sources.contains(&id),
                    "{id:?} lists {observer:?} as observer, but the reverse edge is missing"
                );
            }
        }
    }

    /// Queue a node if it is `Fresh`. Idempotent: a `Queued` or
    /// `Destroyed` node is left alone.
    pub(crate) fn schedule(&mut self, id: NodeId) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        if node.state != UpdateState::Fresh {
            return;
        }
        node.state = UpdateState::Queued;
        let depth = node.depth;
        self.queue.push(id, depth);
    }

    /// Pop the next runnable node, discarding stale entries.
    fn poll(&mut self) -> Option<NodeId> {
        while let Some(id) = self.queue.pop() {
            if let Some(node) = self.arena.get(id) {
                if node.state == UpdateState::Queued {
                    return Some(id);
                }
            }
        }
        None
    }

    fn track_read(&mut self, source: NodeId) {
        if !self.tracking {
            return;
        }
        let Some(observer) = self.active else {
            return;
        };
        if observer == source || !self.arena.contains(source) {
            return;
        }
        if let Some(node) = self.arena.get_mut(observer) {
            node.sources.insert(source);
        } else {
            return;
        }
        if let Some(node) = self.arena.get_mut(source) {
            node.observers.insert(observer);
        }
    }
}

impl<Env: 'static> Default for Runtime<Env> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Reading half of a signal. `Copy`; capture it in closures freely.
pub struct ReadSignal<T> {
    id: NodeId,
    _t: PhantomData<fn() -> T>,
}

/// Writing half of a signal. `Copy`.
pub struct WriteSignal<T> {
    id: NodeId,
    _t: PhantomData<fn(T)>,
}

/// A cached derived value. `Copy`.
pub struct Memo<T> {
    id: NodeId,
    _t: PhantomData<fn() -> T>,
}

impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ReadSignal<T> {}

impl<T> Clone for WriteSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for WriteSignal<T> {}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Memo<T> {}

impl<T: Clone + 'static> ReadSignal<T> {
    /// Read the current value, registering the active node as an
    /// observer (a no-op when untracked or outside any node).
    pub fn get<Env: 'static>(&self, cx: &mut Cx<'_, Env>) -> T {
        cx.rt.track_read(self.id);
        self.peek(cx)
    }

    /// Read without registering a dependency.
    pub fn peek<Env: 'static>(&self, cx: &Cx<'_, Env>) -> T {
        let node = cx.rt.arena.get(self.id).expect("read of a disposed signal");
        match &node.kind {
            NodeKind::Signal { value, .. } => value
                .downcast_ref::<T>()
                .expect("signal value type mismatch")
                .clone(),
            _ => unreachable!("ReadSignal handle pointing at a non-signal node"),
        }
    }
}

impl<T: PartialEq + 'static> WriteSignal<T> {
    /// Replace the value. Equal writes (by `PartialEq`) schedule nothing;
    /// a change queues every `Fresh` observer exactly once.
    pub fn set<Env: 'static>(&self, cx: &mut Cx<'_, Env>, value: T) {
        // Writes to a disposed signal are dropped: the owning subtree is
        // gone and its observers with it.
        let Some(node) = cx.rt.arena.get_mut(self.id) else {
            return;
        };
        let NodeKind::Signal { value: slot, eq } = &mut node.kind else {
            return;
        };
        if eq(slot.as_ref(), &value) {
            return;
        }
        *slot = Box::new(value);
        let observers: Vec<NodeId> = node.observers.iter().copied().collect();
        for observer in observers {
            cx.rt.schedule(observer);
        }
    }

    /// Compute the next value from the current one, then `set` it.
    pub fn update<Env: 'static>(&self, cx: &mut Cx<'_, Env>, f: impl FnOnce(&T) -> T)
    where
        T: Clone,
    {
        let Some(node) = cx.rt.arena.get(self.id) else {
            return;
        };
        let NodeKind::Signal { value, .. } = &node.kind else {
            return;
        };
        let current = value
            .downcast_ref::<T>()
            .expect("signal value type mismatch");
        let next = f(current);
        self.set(cx, next);
    }
}

impl<T: Clone + 'static> Memo<T> {
    /// Read the cached value, registering a dependency. Never recomputes
    /// on pull; recomputation happens when the scheduler processes the
    /// memo's own queued state. The only exception is a read that lands
    /// before the scheduled first run, which computes inline once.
    pub fn get<Env: 'static>(&self, cx: &mut Cx<'_, Env>) -> T {
        cx.rt.track_read(self.id);

        let ready = matches!(
            cx.rt.arena.get(self.id),
            Some(Node {
                kind: NodeKind::Memo { value: Some(_), .. },
                ..
            })
        );
        if !ready {
            cx.run_node(self.id);
        }

        let node = cx.rt.arena.get(self.id).expect("read of a disposed memo");
        match &node.kind {
            NodeKind::Memo { value: Some(v), .. } => v
                .downcast_ref::<T>()
                .expect("memo value type mismatch")
                .clone(),
            NodeKind::Memo { value: None, .. } => {
                // First run failed; surfaced through the error chain
                // already. There is no value to hand out.
                panic!("memo read after its first run failed")
            }
            _ => unreachable!("Memo handle pointing at a non-memo node"),
        }
    }
}

// =============================================================================
// Cx - the explicit reactive context
// =============================================================================

/// A mutable view over one runtime plus the environment its effects act
/// on. All graph operations go through this.
pub struct Cx<'a, Env> {
    pub(crate) rt: &'a mut Runtime<Env>,
    pub env: &'a mut Env,
}

impl<'a, Env: 'static> Cx<'a, Env> {
    // =========================================================================
    // Node creation
    // =========================================================================

    fn insert_node(&mut self, kind: NodeKind<Env>) -> NodeId {
        let parent = self.rt.active;
        let depth = parent
            .and_then(|p| self.rt.arena.get(p))
            .map(|n| n.depth + 1)
            .unwrap_or(0);
        let id = self.rt.arena.insert(Node::new(kind, depth, parent));
        if let Some(p) = parent {
            if let Some(parent_node) = self.rt.arena.get_mut(p) {
                parent_node.children.push(id);
            }
        }
        id
    }

    /// Create a state cell owned by the active node.
    pub fn create_signal<T: PartialEq + 'static>(
        &mut self,
        value: T,
    ) -> (ReadSignal<T>, WriteSignal<T>) {
        let id = self.insert_node(NodeKind::Signal {
            value: Box::new(value),
            eq: eq_any::<T>,
        });
        (
            ReadSignal {
                id,
                _t: PhantomData,
            },
            WriteSignal {
                id,
                _t: PhantomData,
            },
        )
    }

    /// Create a cached derived value; scheduled for an immediate first
    /// run.
    pub fn create_memo<T, F>(&mut self, mut f: F) -> Memo<T>
    where
        T: PartialEq + Clone + 'static,
        F: FnMut(&mut Cx<'_, Env>) -> Result<T, Error> + 'static,
    {
        let wrapped: super::arena::MemoFn<Env> =
            Box::new(move |cx| f(cx).map(|v| Box::new(v) as Box<dyn Any>));
        let id = self.insert_node(NodeKind::Memo {
            value: None,
            f: Some(wrapped),
            eq: eq_any::<T>,
        });
        self.rt.schedule(id);
        Memo {
            id,
            _t: PhantomData,
        }
    }

    /// Create a side-effecting computation; scheduled to run.
    ///
    /// Returns the node id so owners (the window, sequence slots) can
    /// dispose the subtree explicitly.
    pub fn create_effect<F>(&mut self, f: F) -> NodeId
    where
        F: FnMut(&mut Cx<'_, Env>) -> Result<(), Error> + 'static,
    {
        let id = self.insert_node(NodeKind::Effect {
            f: Some(Box::new(f)),
        });
        self.rt.schedule(id);
        id
    }

    /// Effect variant that folds a value through successive runs.
    pub fn create_effect_with<T, F>(&mut self, mut f: F, initial: T) -> NodeId
    where
        T: Clone + 'static,
        F: FnMut(&mut Cx<'_, Env>, T) -> Result<T, Error> + 'static,
    {
        let mut acc = initial;
        self.create_effect(move |cx| {
            let next = f(cx, acc.clone())?;
            acc = next;
            Ok(())
        })
    }

    // =========================================================================
    // Active-node services
    // =========================================================================

    /// Register a callback for when the active node is next disposed or
    /// re-run.
    pub fn on_cleanup(
        &mut self,
        f: impl FnOnce(&mut Cx<'_, Env>) + 'static,
    ) -> Result<(), Error> {
        let active = self.rt.active.ok_or(Error::NoActiveNode)?;
        let node = self.rt.arena.get_mut(active).ok_or(Error::NoActiveNode)?;
        node.cleanups.push(Box::new(f) as CleanupFn<Env>);
        Ok(())
    }

    /// Run `f` with dependency registration suspended. The prior tracking
    /// state is restored on every exit path.
    pub fn untrack<R>(&mut self, f: impl FnOnce(&mut Cx<'_, Env>) -> R) -> R {
        let prev = self.rt.tracking;
        self.rt.tracking = false;
        let out = f(self);
        self.rt.tracking = prev;
        out
    }

    /// Provide a context value on the active node, visible to its
    /// descendants unless shadowed.
    pub fn provide_context<T: 'static>(&mut self, value: T) -> Result<(), Error> {
        let active = self.rt.active.ok_or(Error::NoActiveNode)?;
        let node = self.rt.arena.get_mut(active).ok_or(Error::NoActiveNode)?;
        node.contexts
            .get_or_insert_with(HashMap::new)
            .insert(TypeId::of::<T>(), Rc::new(value));
        Ok(())
    }

    /// Look up a context value by walking the parent chain from the
    /// active node.
    pub fn use_context<T: 'static>(&self) -> Option<Rc<T>> {
        let mut cursor = self.rt.active;
        while let Some(id) = cursor {
            let node = self.rt.arena.get(id)?;
            if let Some(contexts) = &node.contexts {
                if let Some(v) = contexts.get(&TypeId::of::<T>()) {
                    return v.clone().downcast::<T>().ok();
                }
            }
            cursor = node.parent;
        }
        None
    }

    /// Install an error handler on the active node. Errors from any
    /// descendant effect/memo are delivered to the nearest handler up the
    /// chain.
    pub fn on_error(
        &mut self,
        f: impl FnMut(&mut Cx<'_, Env>, &Error) + 'static,
    ) -> Result<(), Error> {
        let active = self.rt.active.ok_or(Error::NoActiveNode)?;
        let node = self.rt.arena.get_mut(active).ok_or(Error::NoActiveNode)?;
        node.error_handler = Some(Rc::new(RefCell::new(f)) as ErrorHandler<Env>);
        Ok(())
    }

    // =========================================================================
    // Scheduling and execution
    // =========================================================================

    /// Drain the work queue, shallowest nodes first. Work scheduled by
    /// the running nodes themselves is drained too.
    pub fn flush(&mut self) {
        while let Some(id) = self.rt.poll() {
            self.run_node(id);
        }
    }

    pub(crate) fn run_node(&mut self, id: NodeId) {
        // Drop stale edges and children from the previous run; resets
        // state to Fresh.
        self.clean_node(id);

        enum Taken<Env> {
            Effect(super::arena::EffectFn<Env>),
            Memo(super::arena::MemoFn<Env>),
        }

        let taken = match self.rt.arena.get_mut(id) {
            Some(node) => match &mut node.kind {
                NodeKind::Effect { f } => f.take().map(Taken::Effect),
                NodeKind::Memo { f, .. } => f.take().map(Taken::Memo),
                // Signals carry no computation and are never queued.
                NodeKind::Signal { .. } => None,
            },
            None => None,
        };
        let Some(taken) = taken else {
            return;
        };

        let prev_active = self.rt.active;
        let prev_tracking = self.rt.tracking;
        self.rt.active = Some(id);
        self.rt.tracking = true;

        match taken {
            Taken::Effect(mut f) => {
                let result = f(self);
                self.rt.active = prev_active;
                self.rt.tracking = prev_tracking;
                if let Some(node) = self.rt.arena.get_mut(id) {
                    if let NodeKind::Effect { f: slot } = &mut node.kind {
                        *slot = Some(f);
                    }
                }
                if let Err(err) = result {
                    self.fail_node(id, err);
                }
            }
            Taken::Memo(mut f) => {
                let result = f(self);
                self.rt.active = prev_active;
                self.rt.tracking = prev_tracking;
                match result {
                    Ok(new_value) => {
                        let mut changed = false;
                        if let Some(node) = self.rt.arena.get_mut(id) {
                            if let NodeKind::Memo { value, f: slot, eq } = &mut node.kind {
                                changed = match value {
                                    Some(old) => !eq(old.as_ref(), new_value.as_ref()),
                                    None => true,
                                };
                                *value = Some(new_value);
                                *slot = Some(f);
                            }
                        }
                        if changed {
                            let observers: Vec<NodeId> = self
                                .rt
                                .arena
                                .get(id)
                                .map(|n| n.observers.iter().copied().collect())
                                .unwrap_or_default();
                            for observer in observers {
                                self.rt.schedule(observer);
                            }
                        }
                    }
                    Err(err) => {
                        if let Some(node) = self.rt.arena.get_mut(id) {
                            if let NodeKind::Memo { f: slot, .. } = &mut node.kind {
                                *slot = Some(f);
                            }
                        }
                        self.fail_node(id, err);
                    }
                }
            }
        }
    }

    /// A node body returned `Err`: drop whatever the failed run
    /// registered (edges, children, cleanups), then deliver the error to
    /// the nearest handler up the context chain.
    fn fail_node(&mut self, id: NodeId, err: Error) {
        self.clean_node(id);

        let mut cursor = Some(id);
        let mut handler = None;
        while let Some(node_id) = cursor {
            let Some(node) = self.rt.arena.get(node_id) else {
                break;
            };
            if let Some(h) = &node.error_handler {
                handler = Some(h.clone());
                break;
            }
            cursor = node.parent;
        }

        match handler {
            Some(h) => {
                let prev_active = self.rt.active;
                let prev_tracking = self.rt.tracking;
                self.rt.active = None;
                self.rt.tracking = false;
                match h.try_borrow_mut() {
                    Ok(mut f) => (&mut *f)(self, &err),
                    // The handler itself errored into its own scope;
                    // don't recurse into it.
                    Err(_) => error!(target: "weft::reactive", %err, "error handler re-entered"),
                }
                self.rt.active = prev_active;
                self.rt.tracking = prev_tracking;
            }
            None => {
                error!(target: "weft::reactive", %err, "unhandled error in reactive node");
            }
        }
    }

    /// Disposal bookkeeping for a node about to re-run: (1) drop its
    /// source edges symmetrically, (2) dispose children recursively,
    /// (3) run its cleanups, (4) reset state to `Fresh`.
    fn clean_node(&mut self, id: NodeId) {
        let Some(node) = self.rt.arena.get_mut(id) else {
            return;
        };
        let sources = std::mem::take(&mut node.sources);
        node.contexts = None;
        node.error_handler = None;
        for source in sources {
            if let Some(source_node) = self.rt.arena.get_mut(source) {
                source_node.observers.swap_remove(&id);
            }
        }

        let children = self
            .rt
            .arena
            .get_mut(id)
            .map(|n| std::mem::take(&mut n.children))
            .unwrap_or_default();
        for child in children {
            self.dispose(child);
        }

        let cleanups = self
            .rt
            .arena
            .get_mut(id)
            .map(|n| std::mem::take(&mut n.cleanups))
            .unwrap_or_default();
        for cleanup in cleanups {
            cleanup(self);
        }

        if let Some(node) = self.rt.arena.get_mut(id) {
            node.state = UpdateState::Fresh;
        }
    }

    /// Destroy a node and its whole subtree: children are disposed (their
    /// cleanups run exactly once) before the node's own cleanups, then
    /// every edge referencing the node is dropped and its slot freed.
    pub fn dispose(&mut self, id: NodeId) {
        let Some(node) = self.rt.arena.get_mut(id) else {
            return;
        };
        if node.state == UpdateState::Destroyed {
            return;
        }
        node.state = UpdateState::Destroyed;

        let sources = std::mem::take(&mut node.sources);
        let observers = std::mem::take(&mut node.observers);
        let children = std::mem::take(&mut node.children);

        for source in sources {
            if let Some(source_node) = self.rt.arena.get_mut(source) {
                source_node.observers.swap_remove(&id);
            }
        }
        for observer in observers {
            if let Some(observer_node) = self.rt.arena.get_mut(observer) {
                observer_node.sources.swap_remove(&id);
            }
        }

        for child in children {
            self.dispose(child);
        }

        let cleanups = self
            .rt
            .arena
            .get_mut(id)
            .map(|n| std::mem::take(&mut n.cleanups))
            .unwrap_or_default();
        for cleanup in cleanups {
            cleanup(self);
        }

        self.rt.arena.remove(id);
    }
}
