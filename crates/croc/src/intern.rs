//! Per-VM string interning.
//!
//! Every string the VM touches is interned exactly once: equal byte sequences
//! always resolve to the same [`StringId`], so string equality and identity
//! are both a single integer comparison. Each entry also precomputes its
//! codepoint count, since the language indexes and slices strings by
//! codepoint while storing them as UTF-8 bytes.
//!
//! The interner is populated by the lexer (identifiers and literals) and by
//! runtime string creation (concatenation, host pushes). Entries live for the
//! VM lifetime; the table is the owner of record for string storage.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Index into the interner's storage.
///
/// Uses `u32` to keep `Value` small; four billion unique strings is more than
/// sufficient for a single VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) struct StringId(u32);

impl StringId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Reconstructs a StringId from a constant-pool operand. The caller is
    /// responsible for the index being valid for this VM's interner.
    #[inline]
    pub fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

#[derive(Debug)]
struct InternedStr {
    text: Box<str>,
    /// Number of Unicode scalar values in `text`.
    cp_len: usize,
}

/// The intern table: string storage plus the bytes-to-id lookup map.
#[derive(Debug, Default)]
pub(crate) struct Interns {
    strings: Vec<InternedStr>,
    map: AHashMap<Box<str>, StringId>,
}

impl Interns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `s`, returning the id shared by every equal byte sequence.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.map.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("intern table overflow"));
        self.strings.push(InternedStr {
            text: s.into(),
            cp_len: s.chars().count(),
        });
        self.map.insert(s.into(), id);
        id
    }

    #[inline]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()].text
    }

    /// Byte length of the interned string.
    #[inline]
    pub fn byte_len(&self, id: StringId) -> usize {
        self.strings[id.index()].text.len()
    }

    /// Codepoint length of the interned string.
    #[inline]
    pub fn cp_len(&self, id: StringId) -> usize {
        self.strings[id.index()].cp_len
    }

    /// Number of interned strings; used by heap statistics.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Character at codepoint index `idx` (already bounds-checked by the caller).
    pub fn char_at(&self, id: StringId, idx: usize) -> Option<char> {
        self.get(id).chars().nth(idx)
    }

    /// Slices by codepoint indices `lo..hi` and interns the result.
    ///
    /// The fast path scans bytes directly since the stored text is known-valid
    /// UTF-8; callers have already normalized and bounds-checked the indices.
    pub fn slice(&mut self, id: StringId, lo: usize, hi: usize) -> StringId {
        let text = self.get(id);
        let start = byte_offset_of_cp(text, lo);
        let end = byte_offset_of_cp(text, hi);
        let piece = text[start..end].to_owned();
        self.intern(&piece)
    }

    /// Concatenates already-interned strings by byte concatenation. The
    /// resulting codepoint count is the sum of the components' counts, so no
    /// revalidation is needed.
    pub fn concat(&mut self, ids: &[StringId]) -> StringId {
        let mut buf = String::new();
        for &id in ids {
            buf.push_str(self.get(id));
        }
        self.intern(&buf)
    }
}

/// Byte offset of the `cp`-th codepoint in pre-validated UTF-8.
fn byte_offset_of_cp(s: &str, cp: usize) -> usize {
    if cp == 0 {
        return 0;
    }
    s.char_indices().nth(cp).map_or(s.len(), |(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_share_an_id() {
        let mut interns = Interns::new();
        let a = interns.intern("hello");
        let b = interns.intern("hello");
        let c = interns.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interns.get(a), "hello");
    }

    #[test]
    fn codepoint_length_is_precomputed() {
        let mut interns = Interns::new();
        let id = interns.intern("héllo");
        assert_eq!(interns.byte_len(id), 6);
        assert_eq!(interns.cp_len(id), 5);
    }

    #[test]
    fn slicing_is_by_codepoint() {
        let mut interns = Interns::new();
        let id = interns.intern("héllo");
        let sliced = interns.slice(id, 1, 3);
        assert_eq!(interns.get(sliced), "él");
    }

    #[test]
    fn concat_reuses_existing_entries() {
        let mut interns = Interns::new();
        let hel = interns.intern("hel");
        let lo = interns.intern("lo");
        let whole = interns.intern("hello");
        assert_eq!(interns.concat(&[hel, lo]), whole);
    }
}
