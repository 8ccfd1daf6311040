//! String interning with integer handles.
//!
//! [`StringPool`] is append-only storage; a stored string never moves, so an
//! index handed out stays valid for the pool's lifetime. [`SymbolTable`] adds
//! a hash lookup over the pool plus discard tracking, which lets a baker that
//! compacts its output record which symbols no longer need to be emitted and
//! by how many bytes the output shrank.

use anyhow::bail;
use std::collections::{HashMap, HashSet};

/// Handle to an interned string.
pub type SymbolId = u32;

/// Append-only interned string storage.
#[derive(Default)]
pub struct StringPool {
    strings: Vec<Box<str>>,
    total_bytes: usize,
}

impl StringPool {
    /// Stores a copy of `value` and returns its index. Duplicates are stored
    /// again; deduplication is the [`SymbolTable`]'s job.
    pub fn add(&mut self, value: &str) -> usize {
        self.strings.push(value.into());
        // The NUL terminator each string costs in a compacted output.
        self.total_bytes += value.len() + 1;
        self.strings.len() - 1
    }

    /// Returns the string at `index`.
    pub fn get(&self, index: usize) -> &str {
        &self.strings[index]
    }

    /// Number of stored strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Total bytes stored, counting one terminator per string.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

/// A [`StringPool`] with hash-indexed lookup and discard accounting.
pub struct SymbolTable {
    pool: StringPool,
    lookup: HashMap<String, SymbolId>,
    discarded: HashSet<SymbolId>,
    discarded_bytes: usize,
    case_sensitive: bool,
}

impl SymbolTable {
    /// Creates a case-sensitive table.
    pub fn new() -> Self {
        Self::with_case_sensitivity(true)
    }

    /// Creates a table whose lookups fold ASCII case.
    pub fn new_case_insensitive() -> Self {
        Self::with_case_sensitivity(false)
    }

    fn with_case_sensitivity(case_sensitive: bool) -> Self {
        Self {
            pool: StringPool::default(),
            lookup: HashMap::new(),
            discarded: HashSet::new(),
            discarded_bytes: 0,
            case_sensitive,
        }
    }

    fn key_for(&self, value: &str) -> String {
        if self.case_sensitive {
            value.to_owned()
        } else {
            value.to_ascii_lowercase()
        }
    }

    /// Interns `value`, returning the existing id if it is already present.
    pub fn add(&mut self, value: &str) -> anyhow::Result<SymbolId> {
        let key = self.key_for(value);
        if let Some(&id) = self.lookup.get(&key) {
            return Ok(id);
        }

        if self.pool.len() >= (SymbolId::MAX - 1) as usize {
            bail!("Symbol table overflow; cannot intern more than {} strings.", SymbolId::MAX - 1);
        }

        let id = self.pool.add(value) as SymbolId;
        self.lookup.insert(key, id);
        Ok(id)
    }

    /// Returns the interned string for `id`.
    ///
    /// # Panics
    /// Panics when `id` was never returned by [`SymbolTable::add`].
    pub fn get(&self, id: SymbolId) -> &str {
        assert!(
            (id as usize) < self.pool.len(),
            "invalid symbol id {id} (table holds {} symbols)",
            self.pool.len()
        );
        self.pool.get(id as usize)
    }

    /// Looks `value` up without interning it.
    pub fn find(&self, value: &str) -> Option<SymbolId> {
        self.lookup.get(&self.key_for(value)).copied()
    }

    /// Records that the symbol no longer needs to appear in a compacted
    /// output. Unknown ids and repeat calls are ignored.
    pub fn mark_discarded(&mut self, id: SymbolId) {
        if (id as usize) >= self.pool.len() {
            return;
        }
        if self.discarded.insert(id) {
            self.discarded_bytes += self.pool.get(id as usize).len() + 1;
        }
    }

    /// Whether [`SymbolTable::mark_discarded`] was called for `id`.
    pub fn is_discarded(&self, id: SymbolId) -> bool {
        self.discarded.contains(&id)
    }

    /// Total interned bytes, counting one terminator per string.
    pub fn total_bytes(&self) -> usize {
        self.pool.total_bytes()
    }

    /// Bytes belonging to discarded symbols.
    pub fn discarded_bytes(&self) -> usize {
        self.discarded_bytes
    }

    /// Bytes that still need to appear in a compacted output.
    pub fn retained_bytes(&self) -> usize {
        self.pool.total_bytes() - self.discarded_bytes
    }

    /// Number of interned symbols.
    pub fn total_count(&self) -> usize {
        self.pool.len()
    }

    /// Number of discarded symbols.
    pub fn discarded_count(&self) -> usize {
        self.discarded.len()
    }

    /// Number of retained symbols.
    pub fn retained_count(&self) -> usize {
        self.pool.len() - self.discarded.len()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
