//! Global symbol table (§4.3).
//!
//! A chained hash table keyed by symbol name. Buckets are a power of two so
//! the hash can be masked instead of divided; the hash itself is a cheap
//! sum-of-bytes, matching the source material's `rtems_rtl_symbol_hash`.
use crate::error::{duplicate_symbol, Result};
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashMap;

bitflags::bitflags! {
    /// Binding/visibility bits carried alongside a symbol table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymFlags: u32 {
        /// A weak symbol: may be overridden by a later strong definition,
        /// and does not itself reject a later weak duplicate.
        const WEAK = 1 << 0;
    }
}

/// One entry in the global symbol table: a resolved name bound to an
/// address and the object that owns it.
#[derive(Debug, Clone)]
pub struct SymEntry {
    pub value: usize,
    pub owner: u64,
    pub flags: SymFlags,
}

/// Sum-of-bytes hash over a symbol name, matching the source RTL's simple,
/// cheap hash (`rtems_rtl_symbol_hash`). Not used for anything security
/// sensitive, just bucket placement.
pub fn hash_name(name: &str) -> u32 {
    name.bytes().fold(0u32, |h, b| h.wrapping_add(b as u32))
}

/// The global symbol table every loaded object's symbols (that are meant to
/// be externally visible) are inserted into and resolved against.
pub struct SymTab {
    buckets: usize,
    table: HashMap<String, SymEntry>,
}

impl SymTab {
    /// `buckets` is rounded up to the next power of two if it isn't one
    /// already (§4.3 names "32-256" as a typical range); hashbrown manages
    /// the actual table growth, so `buckets` only sets the initial
    /// reservation.
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1).next_power_of_two();
        SymTab {
            buckets,
            table: HashMap::with_capacity(buckets),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Look up a global symbol by name.
    pub fn lookup(&self, name: &str) -> Option<&SymEntry> {
        self.table.get(name)
    }

    /// Insert a symbol, applying the weak/strong duplicate policy:
    /// - strong vs. absent: inserted.
    /// - strong vs. existing weak: overrides it.
    /// - strong vs. existing strong: rejected as `DuplicateSymbol`.
    /// - weak vs. absent: inserted.
    /// - weak vs. existing (weak or strong): the existing definition wins,
    ///   the new one is silently dropped.
    pub fn insert(
        &mut self,
        name: &str,
        value: usize,
        owner: u64,
        flags: SymFlags,
    ) -> Result<()> {
        if let Some(existing) = self.table.get(name) {
            let existing_weak = existing.flags.contains(SymFlags::WEAK);
            let incoming_weak = flags.contains(SymFlags::WEAK);
            if incoming_weak {
                return Ok(());
            }
            if !existing_weak {
                return Err(duplicate_symbol(alloc::format!(
                    "duplicate strong symbol: {name}"
                )));
            }
            // strong overrides existing weak
        }
        self.table.insert(
            String::from(name),
            SymEntry {
                value,
                owner,
                flags,
            },
        );
        Ok(())
    }

    /// Remove every symbol owned by `owner` (called on object unload).
    /// Returns the removed names, in case a caller wants to log them.
    pub fn erase_owner(&mut self, owner: u64) -> Vec<String> {
        let dead: Vec<String> = self
            .table
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(k, _)| k.clone())
            .collect();
        for name in &dead {
            self.table.remove(name);
        }
        dead
    }
}
