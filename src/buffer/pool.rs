//! Process-wide pool of reusable byte pages.

use parking_lot::Mutex;

/// A shared pool of fixed-size byte buffers.
///
/// Buffers are handed out on demand and recycled on release; the pool
/// grows to the high-water mark of concurrent pages and then stops
/// allocating. Cleared lazily: a recycled buffer is overwritten by its
/// next writer, so release does not zero it.
pub struct PagePool {
    page_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl PagePool {
    /// Create a pool producing buffers of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Size of every buffer this pool produces.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Take a buffer from the pool, allocating if none is free.
    pub fn acquire(&self) -> Box<[u8]> {
        if let Some(buf) = self.free.lock().pop() {
            return buf;
        }
        vec![0u8; self.page_size].into_boxed_slice()
    }

    /// Return a buffer for reuse.
    ///
    /// Buffers of the wrong size (from a reconfigured pool) are dropped
    /// instead of being recycled.
    pub fn release(&self, buf: Box<[u8]>) {
        if buf.len() == self.page_size {
            self.free.lock().push(buf);
        }
    }

    /// Number of buffers currently sitting idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_reuses() {
        let pool = PagePool::new(64);
        let a = pool.acquire();
        assert_eq!(a.len(), 64);
        assert_eq!(pool.idle_count(), 0);

        pool.release(a);
        assert_eq!(pool.idle_count(), 1);

        let _b = pool.acquire();
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_wrong_size_buffer_dropped() {
        let pool = PagePool::new(64);
        pool.release(vec![0u8; 32].into_boxed_slice());
        assert_eq!(pool.idle_count(), 0);
    }
}
