use crate::memory::grow_capacity;
use crate::objects::object_string::ObjectString;
use crate::value::{is_nil, make_bool_value, make_nil_value, Value};

const TABLE_MAX_LOAD_NUMERATOR: usize = 3;
const TABLE_MAX_LOAD_DENOMINATOR: usize = 4;

#[derive(Clone, Copy)]
struct Entry {
    key: *mut ObjectString,
    value: Value,
}

impl Entry {
    fn empty() -> Entry {
        Entry {
            key: std::ptr::null_mut(),
            value: make_nil_value(),
        }
    }
}

/// Open-addressing hash table keyed by interned string pointers. Keys
/// compare by identity; probing is linear with power-of-two capacity.
/// Deletions leave tombstones (null key, `true` value) so probe chains stay
/// intact, and `count` includes tombstones to bound probe length.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: vec![],
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of live entries (tombstones excluded).
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.key.is_null()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by the backing array, for allocation accounting.
    pub fn entries_size(&self) -> usize {
        self.capacity() * std::mem::size_of::<Entry>()
    }

    fn find_entry(entries: &[Entry], key: *mut ObjectString) -> usize {
        let capacity = entries.len();
        let hash = unsafe { (*key).hash } as usize;
        let mut index = hash & (capacity - 1);
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            if entry.key.is_null() {
                if is_nil(&entry.value) {
                    // Empty entry; a passed tombstone is reusable.
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return index;
            }

            index = (index + 1) & (capacity - 1);
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::empty(); capacity];

        // Rehash live entries only; tombstones are dropped here.
        self.count = 0;
        for entry in &self.entries {
            if entry.key.is_null() {
                continue;
            }

            let dest = Self::find_entry(&entries, entry.key);
            entries[dest] = *entry;
            self.count += 1;
        }

        self.entries = entries;
    }

    pub fn get(&self, key: *mut ObjectString) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        if entry.key.is_null() {
            return None;
        }
        Some(entry.value)
    }

    /// Insert or overwrite. Returns whether the key was newly added.
    pub fn set(&mut self, key: *mut ObjectString, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DENOMINATOR
            > self.capacity() * TABLE_MAX_LOAD_NUMERATOR
        {
            let capacity = grow_capacity!(self.capacity());
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_null();
        // Only count fully empty slots; reusing a tombstone keeps the count.
        if is_new_key && is_nil(&entry.value) {
            self.count += 1;
        }

        entry.key = key;
        entry.value = value;
        is_new_key
    }

    pub fn delete(&mut self, key: *mut ObjectString) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }

        // Place a tombstone in the entry.
        entry.key = std::ptr::null_mut();
        entry.value = make_bool_value(true);
        true
    }

    /// Byte-wise lookup used only by the interning table; all other callers
    /// compare keys by identity.
    pub fn find_string(&self, content: &str, hash: u32) -> Option<*mut ObjectString> {
        if self.count == 0 {
            return None;
        }

        let capacity = self.capacity();
        let mut index = hash as usize & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                // A truly empty slot ends the probe chain; tombstones don't.
                if is_nil(&entry.value) {
                    return None;
                }
            } else {
                let key = unsafe { &*entry.key };
                if key.hash == hash && key.content == content {
                    return Some(entry.key);
                }
            }

            index = (index + 1) & (capacity - 1);
        }
    }

    /// Bulk copy of live entries; used by `INHERIT`.
    pub fn add_all(&mut self, from: &Table) {
        for (key, value) in from.iter() {
            self.set(key, *value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut ObjectString, &Value)> {
        self.entries
            .iter()
            .filter(|entry| !entry.key.is_null())
            .map(|entry| (entry.key, &entry.value))
    }
}
