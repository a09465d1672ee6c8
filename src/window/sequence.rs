//! Sequence - a managed, reorderable region of anchors inside a block.
//!
//! Structural changes travel as `MODIFY_SEQUENCE {op, index, count}`,
//! index-only and cheap; content lands per slot through the normal
//! attach path. Separating the two lets a large reorder move anchors
//! without re-encoding unchanged item content.
//!
//! Server-side, every slot is wrapped in a one-shot effect whose only
//! job is ownership: disposing it tears down exactly that slot's content
//! (nested blocks, dynamic effects, handlers) and nothing else.

use tracing::warn;

use super::block::View;
use super::Shell;
use crate::error::Error;
use crate::reactive::{Cx, NodeId};
use crate::wire::{SEQ_OP_INSERT, SEQ_OP_REMOVE, SEQ_OP_REPLACE, SEQ_OP_SWAP};

/// Handle to a sequence region. `Copy`; the state lives in the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequence {
    id: u16,
}

/// Per-window bookkeeping: the owner node of each occupied slot.
pub(crate) struct SequenceState {
    pub(crate) slots: Vec<NodeId>,
}

impl Sequence {
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Open room at `index` and attach `items` into the new slots.
    pub fn insert(
        &self,
        cx: &mut Cx<'_, Shell>,
        index: u16,
        items: Vec<View>,
    ) -> Result<(), Error> {
        let len = self.len(cx)?;
        if index as usize > len {
            return Err(Error::SequenceRange);
        }
        let count = items.len() as u16;
        if count == 0 {
            return Ok(());
        }
        cx.env
            .emit_modify_sequence(self.id, SEQ_OP_INSERT, index, count)?;

        let mut new_slots = Vec::with_capacity(items.len());
        for (offset, item) in items.into_iter().enumerate() {
            new_slots.push(attach_slot(cx, self.id, index + offset as u16, item));
        }
        let state = cx
            .env
            .sequences
            .get_mut(&self.id)
            .ok_or(Error::UnknownSequence(self.id))?;
        state.slots.splice(index as usize..index as usize, new_slots);
        Ok(())
    }

    /// Drop `count` slots starting at `index`, disposing their content.
    /// Surviving items are not re-attached; the client shifts anchors.
    pub fn remove(&self, cx: &mut Cx<'_, Shell>, index: u16, count: u16) -> Result<(), Error> {
        let len = self.len(cx)?;
        let start = index as usize;
        let end = start + count as usize;
        if end > len {
            return Err(Error::SequenceRange);
        }
        if count == 0 {
            return Ok(());
        }
        cx.env
            .emit_modify_sequence(self.id, SEQ_OP_REMOVE, index, count)?;

        let removed: Vec<NodeId> = {
            let state = cx
                .env
                .sequences
                .get_mut(&self.id)
                .ok_or(Error::UnknownSequence(self.id))?;
            state.slots.drain(start..end).collect()
        };
        for slot in removed {
            cx.dispose(slot);
        }
        Ok(())
    }

    /// Replace the content of existing slots starting at `index`.
    pub fn replace(
        &self,
        cx: &mut Cx<'_, Shell>,
        index: u16,
        items: Vec<View>,
    ) -> Result<(), Error> {
        let len = self.len(cx)?;
        let start = index as usize;
        let end = start + items.len();
        if end > len {
            return Err(Error::SequenceRange);
        }
        if items.is_empty() {
            return Ok(());
        }
        cx.env
            .emit_modify_sequence(self.id, SEQ_OP_REPLACE, index, items.len() as u16)?;

        let old: Vec<NodeId> = {
            let state = cx
                .env
                .sequences
                .get_mut(&self.id)
                .ok_or(Error::UnknownSequence(self.id))?;
            state.slots[start..end].to_vec()
        };
        for slot in old {
            cx.dispose(slot);
        }
        let mut new_slots = Vec::with_capacity(items.len());
        for (offset, item) in items.into_iter().enumerate() {
            new_slots.push(attach_slot(cx, self.id, index + offset as u16, item));
        }
        if let Some(state) = cx.env.sequences.get_mut(&self.id) {
            state.slots.splice(start..end, new_slots);
        }
        Ok(())
    }

    /// Swap the slots at `a` and `b`.
    pub fn swap(&self, cx: &mut Cx<'_, Shell>, a: u16, b: u16) -> Result<(), Error> {
        let len = self.len(cx)?;
        if a as usize >= len || b as usize >= len {
            return Err(Error::SequenceRange);
        }
        if a == b {
            return Ok(());
        }
        cx.env.emit_modify_sequence(self.id, SEQ_OP_SWAP, a, b)?;
        if let Some(state) = cx.env.sequences.get_mut(&self.id) {
            state.slots.swap(a as usize, b as usize);
        }
        Ok(())
    }

    /// Current number of occupied slots.
    pub fn len(&self, cx: &Cx<'_, Shell>) -> Result<usize, Error> {
        cx.env
            .sequences
            .get(&self.id)
            .map(|s| s.slots.len())
            .ok_or(Error::UnknownSequence(self.id))
    }
}

/// One-shot owner effect for a slot's content.
fn attach_slot(cx: &mut Cx<'_, Shell>, seq_id: u16, index: u16, item: View) -> NodeId {
    let mut item = Some(item);
    cx.create_effect(move |cx| {
        match item.take() {
            Some(view) => cx.attach(seq_id, index, view),
            // The owner effect has no dependencies and never re-runs;
            // this arm exists only for completeness.
            None => Ok(()),
        }
    })
}

impl<'a> Cx<'a, Shell> {
    /// Create a sequence region seeded with `items`. Owned by the active
    /// node: disposal tears down every slot and queues the region's
    /// deletion.
    pub fn create_sequence(&mut self, items: Vec<View>) -> Result<Sequence, Error> {
        let id = self.env.alloc_block_id();
        self.env.emit_init_sequence(id, items.len() as u16)?;
        self.env
            .sequences
            .insert(id, SequenceState { slots: Vec::new() });

        let seq = Sequence { id };
        let mut slots = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            slots.push(attach_slot(self, id, index as u16, item));
        }
        if let Some(state) = self.env.sequences.get_mut(&id) {
            state.slots = slots;
        }

        if self
            .on_cleanup(move |cx| {
                if let Some(state) = cx.env.sequences.remove(&id) {
                    for slot in state.slots {
                        cx.dispose(slot);
                    }
                }
                cx.env.queue_block_delete(id);
            })
            .is_err()
        {
            warn!(target: "weft::window", seq = id, "sequence created outside any node lives for the window lifetime");
        }
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PagePool;
    use crate::config::Config;
    use crate::window::{ClientInfo, RootFn, Window};
    use crate::wire::{OP_MODIFY_SEQUENCE, SEQ_OP_REMOVE};
    use std::sync::Arc;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn seq_window() -> (Window, UnboundedReceiver<Vec<u8>>, Sequence) {
        let (tx, rx) = unbounded_channel();
        let slot: Arc<std::sync::Mutex<Option<Sequence>>> = Arc::new(std::sync::Mutex::new(None));
        let slot_in_root = slot.clone();
        let root: RootFn = Arc::new(move |cx| {
            let seq = cx.create_sequence(vec![
                View::from("a"),
                View::from("b"),
                View::from("c"),
            ])?;
            *slot_in_root.lock().unwrap() = Some(seq);
            Ok(View::Seq(seq))
        });
        let mut window = Window::new(
            Config::default(),
            Arc::new(PagePool::new(4096)),
            ClientInfo::default(),
            root,
            tx,
        )
        .expect("window creation");
        window.run_work();
        window.flush_tick();
        let seq = slot.lock().unwrap().take().expect("root ran");
        (window, rx, seq)
    }

    fn drain(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn test_remove_emits_one_structural_op_and_no_reattach() {
        let (mut window, mut rx, seq) = seq_window();
        drain(&mut rx);

        window.with_cx(|cx| seq.remove(cx, 1, 1)).unwrap();
        let bytes = drain(&mut rx);

        // Exactly one MODIFY_SEQUENCE(REMOVE, 1, 1); nothing re-attached.
        assert_eq!(bytes[0], OP_MODIFY_SEQUENCE);
        assert_eq!(bytes[3], SEQ_OP_REMOVE);
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 1);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 1);
        assert!(!bytes.windows(1).any(|w| w == b"a"));
        assert!(!bytes.windows(1).any(|w| w == b"c"));

        window.with_cx(|cx| {
            assert_eq!(seq.len(cx).unwrap(), 2);
        });
    }

    #[test]
    fn test_insert_attaches_only_new_slots() {
        let (mut window, mut rx, seq) = seq_window();
        drain(&mut rx);

        window
            .with_cx(|cx| seq.insert(cx, 1, vec![View::from("x"), View::from("y")]))
            .unwrap();
        let bytes = drain(&mut rx);

        assert!(bytes.windows(1).any(|w| w == b"x"));
        assert!(bytes.windows(1).any(|w| w == b"y"));
        assert!(!bytes.windows(1).any(|w| w == b"a"));
        window.with_cx(|cx| {
            assert_eq!(seq.len(cx).unwrap(), 5);
        });
    }

    #[test]
    fn test_swap_is_index_only() {
        let (mut window, mut rx, seq) = seq_window();
        drain(&mut rx);

        window.with_cx(|cx| seq.swap(cx, 0, 2)).unwrap();
        let bytes = drain(&mut rx);
        assert_eq!(bytes[0], OP_MODIFY_SEQUENCE);
        // Only the structural command: 1 + 2 + 1 + 2 + 2 bytes.
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let (mut window, _rx, seq) = seq_window();
        window.with_cx(|cx| {
            assert!(matches!(seq.remove(cx, 2, 2), Err(Error::SequenceRange)));
            assert!(matches!(seq.swap(cx, 0, 3), Err(Error::SequenceRange)));
        });
    }
}
