//! Open-addressing hash table with tombstones.
//!
//! One implementation backs three distinct uses: the string intern table,
//! the VM's globals table, and every user-level `Table` value. Keys are
//! always interned strings (by [`ObjRef`]); callers that only have a raw
//! `&str` use [`XanTable::find_string`] to look an interned key up without
//! allocating.

use crate::value::{ObjRef, Value};

const TABLE_MAX_LOAD: f64 = 0.75;

fn grow_capacity(cap: usize) -> usize {
    if cap < 8 { 8 } else { cap * 2 }
}

/// FNV-1a, matching the original string hash exactly so that hashing a byte
/// sequence twice always yields the same bucket.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Clone, Debug)]
struct Entry {
    /// `None` key + `Value::Nil` value = truly empty slot.
    /// `None` key + non-nil value = tombstone.
    key: Option<ObjRef>,
    key_hash: u32,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: None,
            key_hash: 0,
            value: Value::Nil,
        }
    }

    fn is_truly_empty(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Nil)
    }
}

#[derive(Clone, Debug, Default)]
pub struct XanTable {
    count: usize,
    entries: Vec<Entry>,
}

impl XanTable {
    pub fn new() -> Self {
        XanTable {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn capacity_mask(&self) -> usize {
        self.entries.len().wrapping_sub(1)
    }

    fn adjust_capacity(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mask = new_capacity - 1;
        let mut new_count = 0;
        for e in &self.entries {
            let Some(key) = e.key else { continue };
            let mut index = (e.key_hash as usize) & mask;
            loop {
                if new_entries[index].key.is_none() {
                    break;
                }
                index = (index + 1) & mask;
            }
            new_entries[index] = Entry {
                key: Some(key),
                key_hash: e.key_hash,
                value: e.value,
            };
            new_count += 1;
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    fn find_slot(&self, key: ObjRef, key_hash: u32) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.capacity_mask();
        let mut index = (key_hash as usize) & mask;
        loop {
            let e = &self.entries[index];
            if e.is_truly_empty() {
                return None;
            }
            if e.key == Some(key) {
                return Some(index);
            }
            index = (index + 1) & mask;
        }
    }

    pub fn get(&self, key: ObjRef, key_hash: u32) -> Option<Value> {
        self.find_slot(key, key_hash).map(|i| self.entries[i].value)
    }

    /// Returns `true` if this inserted a brand new key (as opposed to
    /// overwriting an existing one).
    pub fn set(&mut self, key: ObjRef, key_hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            let cap = grow_capacity(self.entries.len());
            self.adjust_capacity(cap);
        }
        let mask = self.capacity_mask();
        let mut index = (key_hash as usize) & mask;
        let mut tombstone: Option<usize> = None;
        let slot = loop {
            let e = &self.entries[index];
            if e.key.is_none() {
                if e.is_truly_empty() {
                    break tombstone.unwrap_or(index);
                } else if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if e.key == Some(key) {
                break index;
            }
            index = (index + 1) & mask;
        };
        let is_new_key = self.entries[slot].key.is_none();
        if is_new_key && self.entries[slot].is_truly_empty() {
            self.count += 1;
        }
        self.entries[slot] = Entry {
            key: Some(key),
            key_hash,
            value,
        };
        is_new_key
    }

    pub fn delete(&mut self, key: ObjRef, key_hash: u32) -> bool {
        let Some(index) = self.find_slot(key, key_hash) else {
            return false;
        };
        self.entries[index] = Entry {
            key: None,
            key_hash: 0,
            value: Value::Bool(true),
        };
        true
    }

    /// Copies every entry of `other` into `self`, used by `OP_INHERIT` to
    /// give a subclass its own independent copy of the superclass methods.
    pub fn add_all(&mut self, other: &XanTable) {
        for e in &other.entries {
            if let Some(key) = e.key {
                self.set(key, e.key_hash, e.value);
            }
        }
    }

    /// Look up an interned string by its raw bytes without needing an
    /// `ObjRef` key in hand; used by the interner itself to dedupe.
    pub fn find_string(
        &self,
        bytes: &[u8],
        hash: u32,
        text_of: impl Fn(ObjRef) -> Option<Vec<u8>>,
    ) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.capacity_mask();
        let mut index = (hash as usize) & mask;
        loop {
            let e = &self.entries[index];
            if e.is_truly_empty() {
                return None;
            }
            if let Some(key) = e.key {
                if e.key_hash == hash {
                    if let Some(text) = text_of(key) {
                        if text == bytes {
                            return Some(key);
                        }
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(i: u32) -> ObjRef {
        ObjRef::from_index(i as usize)
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let mut t = XanTable::new();
        assert!(t.set(k(1), fnv1a(b"a"), Value::Number(1.0)));
        assert!(!t.set(k(1), fnv1a(b"a"), Value::Number(2.0)));
        assert_eq!(t.get(k(1), fnv1a(b"a")), Some(Value::Number(2.0)));
        assert!(t.delete(k(1), fnv1a(b"a")));
        assert_eq!(t.get(k(1), fnv1a(b"a")), None);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = XanTable::new();
        for i in 0..100u32 {
            t.set(k(i), i.wrapping_mul(2654435761), Value::Number(i as f64));
        }
        assert_eq!(t.count(), 100);
        for i in 0..100u32 {
            assert_eq!(
                t.get(k(i), i.wrapping_mul(2654435761)),
                Some(Value::Number(i as f64))
            );
        }
    }

    #[test]
    fn tombstone_reuse_keeps_probing_correct() {
        let mut t = XanTable::new();
        for i in 0..8u32 {
            t.set(k(i), i, Value::Number(i as f64));
        }
        t.delete(k(3), 3);
        // Re-inserting after a delete must not shadow a surviving key that
        // probed past the tombstone.
        t.set(k(8), 0, Value::Number(8.0));
        assert_eq!(t.get(k(0), 0), Some(Value::Number(0.0)));
        assert_eq!(t.get(k(8), 0), Some(Value::Number(8.0)));
    }

    #[test]
    fn fnv1a_matches_known_vector() {
        assert_eq!(fnv1a(b""), 2166136261);
    }
}
