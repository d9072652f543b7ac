//! Open-addressed string table
//!
//! Maps interned strings to values with linear probing and tombstones.
//! Keys are heap ids of interned strings, so key equality is id equality;
//! each entry caches the key's FNV-1a hash so the table never needs to
//! reach back into the heap. Capacity is always a power of two and the
//! table grows at 75% load (tombstones included).
//!
//! The intern table itself is one of these, probed by content through
//! [`crate::heap::Heap::find_string`]; the GC's weak pass walks the raw
//! entries and tombstones any key that did not survive marking.

use crate::heap::ObjId;
use crate::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

/// A single bucket. An empty bucket has no key and a null value; a
/// tombstone has no key and a true value.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub key: Option<ObjId>,
    pub hash: u32,
    pub value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    hash: 0,
    value: Value::NULL,
};

#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<Entry>,
    // Live entries plus tombstones, per the load-factor contract.
    count: usize,
}

impl Table {
    pub fn new() -> Table {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    fn find_slot(entries: &[Entry], key: ObjId, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.value.is_null() {
                        // Truly empty; reuse an earlier tombstone if we saw one.
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(existing) if existing == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![EMPTY; capacity];

        self.count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let dest = Table::find_slot(&entries, key, entry.hash);
                entries[dest] = *entry;
                self.count += 1;
            }
        }

        self.entries = entries;
    }

    pub fn insert(&mut self, key: ObjId, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            let capacity = if self.entries.len() < 8 {
                8
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(capacity);
        }

        let index = Table::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[index];

        let is_new = entry.key.is_none();
        if is_new && entry.value.is_null() {
            self.count += 1;
        }

        entry.key = Some(key);
        entry.hash = hash;
        entry.value = value;
        is_new
    }

    pub fn get(&self, key: ObjId, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        let index = Table::find_slot(&self.entries, key, hash);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    pub fn contains(&self, key: ObjId, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    pub fn delete(&mut self, key: ObjId, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = Table::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }

        // Leave a tombstone so probe chains stay intact.
        entry.key = None;
        entry.hash = 0;
        entry.value = Value::TRUE;
        true
    }

    /// Overwrite the value of an existing key without changing table shape.
    /// Returns false if the key is absent.
    pub fn set_existing(&mut self, key: ObjId, hash: u32, value: Value) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = Table::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.value = value;
        true
    }

    /// Copy every live entry into `to`, keeping `self` intact.
    pub fn copy_into(&self, to: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                to.insert(key, entry.hash, entry.value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjId, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Raw bucket access for the intern probe and the GC weak pass.
    pub(crate) fn raw_entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Tombstone every entry whose key fails the predicate. Used by the GC
    /// to drop interned strings that did not survive marking.
    pub(crate) fn retain_keys(&mut self, mut keep: impl FnMut(ObjId) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !keep(key) {
                    entry.key = None;
                    entry.hash = 0;
                    entry.value = Value::TRUE;
                }
            }
        }
    }

    /// Approximate byte footprint, for the allocator's accounting.
    pub(crate) fn byte_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> (ObjId, u32) {
        // Test keys reuse the id as a hash; collisions are forced by masking.
        (ObjId(n), n.wrapping_mul(2_654_435_761))
    }

    #[test]
    fn insert_then_get() {
        let mut table = Table::new();
        let (k, h) = key(1);
        assert!(table.insert(k, h, Value::number(42.0)));
        assert_eq!(table.get(k, h), Some(Value::number(42.0)));
        assert!(!table.insert(k, h, Value::number(7.0)));
        assert_eq!(table.get(k, h), Some(Value::number(7.0)));
    }

    #[test]
    fn missing_key_is_none() {
        let mut table = Table::new();
        let (k1, h1) = key(1);
        let (k2, h2) = key(2);
        assert_eq!(table.get(k1, h1), None);
        table.insert(k1, h1, Value::TRUE);
        assert_eq!(table.get(k2, h2), None);
    }

    #[test]
    fn delete_leaves_probe_chain_usable() {
        let mut table = Table::new();
        // Same hash forces all three into one probe chain.
        let ids = [ObjId(10), ObjId(11), ObjId(12)];
        for id in ids {
            table.insert(id, 5, Value::object(id));
        }
        assert!(table.delete(ids[1], 5));
        assert_eq!(table.get(ids[1], 5), None);
        // The entry past the tombstone must still be reachable.
        assert_eq!(table.get(ids[2], 5), Some(Value::object(ids[2])));
        // And the tombstone slot is reused on reinsert.
        assert!(table.insert(ids[1], 5, Value::NULL));
        assert_eq!(table.get(ids[1], 5), Some(Value::NULL));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut table = Table::new();
        for n in 0..100 {
            let (k, h) = key(n);
            table.insert(k, h, Value::number(n as f64));
        }
        for n in 0..100 {
            let (k, h) = key(n);
            assert_eq!(table.get(k, h), Some(Value::number(n as f64)));
        }
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn copy_into_copies_live_entries_only() {
        let mut from = Table::new();
        let (k1, h1) = key(1);
        let (k2, h2) = key(2);
        from.insert(k1, h1, Value::TRUE);
        from.insert(k2, h2, Value::FALSE);
        from.delete(k1, h1);

        let mut to = Table::new();
        from.copy_into(&mut to);
        assert_eq!(to.get(k1, h1), None);
        assert_eq!(to.get(k2, h2), Some(Value::FALSE));
    }

    #[test]
    fn retain_keys_tombstones_rejects() {
        let mut table = Table::new();
        for n in 0..10 {
            let (k, h) = key(n);
            table.insert(k, h, Value::NULL);
        }
        table.retain_keys(|k| k.0 % 2 == 0);
        for n in 0..10 {
            let (k, h) = key(n);
            assert_eq!(table.get(k, h).is_some(), n % 2 == 0);
        }
    }
}
