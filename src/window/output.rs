//! The window's output stream - pooled pages, offsets, replay.
//!
//! Commands are staged by the shell into a single-owner scratch buffer
//! and committed here whole. A command never spans pages: when the open
//! page cannot hold it, the page is sealed (possibly with slack) and a
//! fresh one is drawn from the pool. Logical offsets count only used
//! bytes, so the stream is gap-free regardless of slack.
//!
//! Three offsets describe the stream:
//!
//! ```text
//!        read_offset         flushed_offset        write_offset
//!  ──────────┴─────────────────────┴───────────────────┴──────>
//!   prunable pages         sent, unacked         staged this tick
//! ```
//!
//! Replay after a reconnect rewinds `flushed_offset` to the client's
//! acknowledged position and resends the tail; the bytes are still in
//! their pages, so the resent tail is byte-for-byte what an uninterrupted
//! connection would have carried.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffer::{Page, PagePool};
use crate::error::WireError;

pub(crate) struct OutputStream {
    pool: Arc<PagePool>,
    pages: VecDeque<Page>,
    /// Next logical byte to be written.
    write_offset: u64,
    /// Highest client-acknowledged position; pages wholly below it are
    /// returned to the pool.
    read_offset: u64,
    /// Position up to which bytes have been handed to the current sink.
    flushed_offset: u64,
}

impl OutputStream {
    pub fn new(pool: Arc<PagePool>) -> Self {
        Self {
            pool,
            pages: VecDeque::new(),
            write_offset: 0,
            read_offset: 0,
            flushed_offset: 0,
        }
    }

    #[inline]
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    #[inline]
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Oldest logical offset still held in a page.
    pub fn floor(&self) -> u64 {
        self.pages
            .front()
            .map(Page::head_offset)
            .unwrap_or(self.write_offset)
    }

    /// Append one whole command to the stream.
    pub fn commit(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let page_size = self.pool.page_size();
        if bytes.len() > page_size {
            return Err(WireError::CommandTooLarge {
                size: bytes.len(),
                page_size,
            });
        }

        let need_new_page = match self.pages.back() {
            Some(p) => p.is_sealed() || p.remaining() < bytes.len(),
            None => true,
        };
        if need_new_page {
            if let Some(p) = self.pages.back_mut() {
                if !p.is_sealed() {
                    p.seal();
                }
            }
            self.pages
                .push_back(Page::open(self.pool.acquire(), self.write_offset));
        }

        let page = self
            .pages
            .back_mut()
            .expect("open page ensured above");
        page.push(bytes);
        self.write_offset += bytes.len() as u64;
        Ok(())
    }

    /// Advance the acknowledged position and return fully-acked sealed
    /// pages to the pool. Never prunes the open page.
    pub fn ack(&mut self, offset: u64) {
        let offset = offset.min(self.write_offset);
        if offset <= self.read_offset {
            return;
        }
        self.read_offset = offset;
        self.prune();
    }

    fn prune(&mut self) {
        while let Some(front) = self.pages.front() {
            let fully_acked = front.is_sealed()
                && self.read_offset >= front.head_offset() + front.final_size() as u64;
            if !fully_acked {
                break;
            }
            if let Some(page) = self.pages.pop_front() {
                self.pool.release(page.into_buf());
            }
        }
    }

    /// Collect `[flushed_offset, write_offset)` and mark it flushed.
    /// Returns `None` when nothing is pending.
    pub fn take_unflushed(&mut self) -> Option<Vec<u8>> {
        if self.flushed_offset >= self.write_offset {
            return None;
        }
        let from = self.flushed_offset;
        let to = self.write_offset;
        let mut out = Vec::with_capacity((to - from) as usize);
        for page in &self.pages {
            out.extend_from_slice(page.slice_logical(from, to));
        }
        self.flushed_offset = to;
        Some(out)
    }

    /// Rewind the flush cursor to a reconnecting client's acknowledged
    /// offset so the tail is resent. Fails when the offset is ahead of
    /// the stream or already pruned (a stale client that cannot be
    /// resumed).
    pub fn resume_from(&mut self, offset: u64) -> bool {
        if offset > self.write_offset || offset < self.floor() {
            return false;
        }
        if offset > self.read_offset {
            self.read_offset = offset;
            self.prune();
        }
        self.flushed_offset = offset;
        true
    }

    /// Return every page to the pool (window teardown).
    pub fn release_all(&mut self) {
        while let Some(page) = self.pages.pop_front() {
            self.pool.release(page.into_buf());
        }
    }

    /// Number of retained pages (diagnostics and tests).
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(page_size: usize) -> OutputStream {
        OutputStream::new(Arc::new(PagePool::new(page_size)))
    }

    #[test]
    fn test_commit_spills_to_new_page() {
        let mut s = stream(8);
        s.commit(b"aaaaaa").unwrap(); // 6 of 8
        s.commit(b"bbbb").unwrap(); // does not fit, new page
        assert_eq!(s.page_count(), 2);
        assert_eq!(s.write_offset(), 10);
        // First page sealed with slack; offsets stay gap-free.
        assert_eq!(s.take_unflushed().unwrap(), b"aaaaaabbbb");
    }

    #[test]
    fn test_oversized_command_is_fatal() {
        let mut s = stream(8);
        let err = s.commit(&[0u8; 9]).unwrap_err();
        assert!(matches!(err, WireError::CommandTooLarge { size: 9, page_size: 8 }));
        // The stream itself is untouched.
        assert_eq!(s.write_offset(), 0);
    }

    #[test]
    fn test_ack_prunes_only_fully_acked_sealed_pages() {
        let pool = Arc::new(PagePool::new(8));
        let mut s = OutputStream::new(pool.clone());
        s.commit(b"aaaaaa").unwrap();
        s.commit(b"bbbbbb").unwrap(); // seals page 1
        assert_eq!(s.page_count(), 2);

        // Partially acked first page: nothing released.
        s.ack(3);
        assert_eq!(s.page_count(), 2);
        assert_eq!(pool.idle_count(), 0);

        // Past the first page: page 1 released, open page 2 retained.
        s.ack(7);
        assert_eq!(s.page_count(), 1);
        assert_eq!(pool.idle_count(), 1);

        // Acking the open page end must not release it.
        s.ack(12);
        assert_eq!(s.page_count(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_resume_replays_identical_tail() {
        let mut s = stream(8);
        s.commit(b"aaaa").unwrap();
        s.commit(b"bbbb").unwrap();
        s.commit(b"cccc").unwrap();
        let full = s.take_unflushed().unwrap();
        assert_eq!(full, b"aaaabbbbcccc");

        // Client comes back having read only 6 bytes.
        assert!(s.resume_from(6));
        let tail = s.take_unflushed().unwrap();
        assert_eq!(tail, &full[6..], "replayed tail must be byte-identical");
    }

    #[test]
    fn test_resume_from_pruned_offset_fails() {
        let mut s = stream(4);
        s.commit(b"aaaa").unwrap();
        s.commit(b"bbbb").unwrap();
        s.ack(4); // first page released
        assert!(!s.resume_from(2), "offset below the floor is unreplayable");
        assert!(s.resume_from(4));
        assert!(!s.resume_from(99), "offset ahead of the stream is invalid");
    }

    #[test]
    fn test_release_all_returns_buffers() {
        let pool = Arc::new(PagePool::new(8));
        let mut s = OutputStream::new(pool.clone());
        s.commit(b"aaaaaaaa").unwrap();
        s.commit(b"bb").unwrap();
        assert_eq!(s.page_count(), 2);
        s.release_all();
        assert_eq!(s.page_count(), 0);
        assert_eq!(pool.idle_count(), 2);
    }
}
