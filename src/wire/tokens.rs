//! Per-window token compression table.
//!
//! Recurring short strings (element tags, attribute and style names,
//! common style values) are assigned small integer ids the first time a
//! window uses them. On the wire a token travels as a 2-byte id with the
//! top bit set; a raw string is a length-prefixed payload with the top
//! bit clear. The client maintains the mirror table by arrival order, so
//! every new assignment must be streamed via `MODIFY_TOKENMAP` before its
//! first use - callers intern first, flush the table, then emit the
//! command that references the ids.

use indexmap::IndexMap;

use super::TOKEN_BIT;

/// Strings longer than this are never tokenized; they go raw.
pub const MAX_TOKEN_LEN: usize = 64;

/// Token ids are 15-bit (the top bit is the wire marker).
const MAX_TOKENS: usize = (TOKEN_BIT - 1) as usize;

/// One window's string→id dictionary.
///
/// Ids are assigned densely in first-seen order, which is also the order
/// entries appear in `MODIFY_TOKENMAP` commands, so client and server
/// tables stay index-aligned by construction.
#[derive(Default)]
pub struct TokenTable {
    map: IndexMap<String, u16>,
    /// Ids assigned since the last flush, in assignment order.
    pending: Vec<String>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or assign the id for `s`.
    ///
    /// Returns `None` when `s` is not tokenizable (empty, too long, or
    /// the table is full); the caller emits it as a raw string instead.
    pub fn intern(&mut self, s: &str) -> Option<u16> {
        if let Some(&id) = self.map.get(s) {
            return Some(id);
        }
        // Empty strings would collide with the MODIFY_TOKENMAP
        // terminator; they go raw.
        if s.is_empty() || s.len() > MAX_TOKEN_LEN || self.map.len() >= MAX_TOKENS {
            return None;
        }
        let id = self.map.len() as u16;
        self.map.insert(s.to_string(), id);
        self.pending.push(s.to_string());
        Some(id)
    }

    /// True if assignments are waiting to be streamed to the client.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drain assignments made since the last flush, in id order.
    pub fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    /// Number of assigned tokens.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense_and_stable() {
        let mut t = TokenTable::new();
        assert_eq!(t.intern("div"), Some(0));
        assert_eq!(t.intern("class"), Some(1));
        assert_eq!(t.intern("div"), Some(0));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_pending_drains_in_assignment_order() {
        let mut t = TokenTable::new();
        t.intern("div");
        t.intern("span");
        t.intern("div");
        assert!(t.has_pending());
        assert_eq!(t.take_pending(), vec!["div".to_string(), "span".to_string()]);
        assert!(!t.has_pending());

        // A re-intern after flush is not pending again.
        t.intern("span");
        assert!(!t.has_pending());
    }

    #[test]
    fn test_long_and_empty_strings_not_tokenized() {
        let mut t = TokenTable::new();
        let long = "x".repeat(MAX_TOKEN_LEN + 1);
        assert_eq!(t.intern(&long), None);
        assert_eq!(t.intern(""), None);
        assert!(t.is_empty());
    }
}
