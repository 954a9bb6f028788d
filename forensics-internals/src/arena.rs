//! Compacting key/value arena backing the attribute store.
//!
//! All key and value bytes live in one contiguous buffer, packed in insertion
//! order with no gaps between entries:
//!
//! ```text
//! | key0 \0 value0 \0 | key1 \0 value1 \0 | ... | unused |
//! ^ entries[0].offset ^ entries[1].offset       ^ used
//! ```
//!
//! Removing an entry shifts every trailing byte down by the freed size and
//! rewrites every later entry's offset by the same delta, so the buffer never
//! fragments. Offsets stay private to this module.

use crate::{
    allocator::{AllocError, SharedAllocator},
    fixed::FixedBuf,
    util::{TERMINATOR_SIZE, stored_str, write_terminated},
};

/// Location of one key/value pair inside the arena buffer.
#[derive(Copy, Clone, Debug, Default)]
struct Entry {
    offset: usize,
    key_len: usize,
    value_len: usize,
}

impl Entry {
    /// Bytes this entry occupies, terminators included.
    #[inline]
    fn size(&self) -> usize {
        self.key_len + self.value_len + 2 * TERMINATOR_SIZE
    }

    #[inline]
    fn key_range(&self) -> core::ops::Range<usize> {
        self.offset..self.offset + self.key_len
    }

    #[inline]
    fn value_range(&self) -> core::ops::Range<usize> {
        let start = self.offset + self.key_len + TERMINATOR_SIZE;
        start..start + self.value_len
    }
}

/// Error returned when an attribute does not fit into the arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttributeError {
    /// Every entry slot is in use.
    SlotsExhausted {
        /// The configured number of slots.
        max_count: usize,
    },
    /// The byte buffer has too little room left for the pair.
    BufferExhausted {
        /// Bytes the pair needs, terminators included.
        needed: usize,
        /// Bytes still free in the buffer.
        available: usize,
    },
}

impl core::fmt::Display for AttributeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SlotsExhausted { max_count } => {
                write!(f, "all {max_count} attribute slots are in use")
            }
            Self::BufferExhausted { needed, available } => write!(
                f,
                "attribute needs {needed} bytes but only {available} are available"
            ),
        }
    }
}

impl core::error::Error for AttributeError {}

/// A bounded set of unique string key/value pairs packed into one buffer.
pub struct AttributeArena {
    entries: FixedBuf<Entry>,
    count: usize,
    buf: FixedBuf<u8>,
    used: usize,
}

impl AttributeArena {
    /// Creates an arena with room for `max_count` pairs and `buf_size` bytes.
    pub fn new_in(
        max_count: usize,
        buf_size: usize,
        allocator: &SharedAllocator,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            entries: FixedBuf::new_in(max_count, Entry::default(), allocator)?,
            count: 0,
            buf: FixedBuf::new_in(buf_size, 0, allocator)?,
            used: 0,
        })
    }

    /// Returns `true` if either capacity is zero, in which case the owning
    /// store is expected to ignore all updates.
    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.entries.capacity() == 0 || self.buf.capacity() == 0
    }

    /// Returns the number of stored pairs.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if no pairs are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the maximum number of pairs.
    #[inline]
    pub fn max_count(&self) -> usize {
        self.entries.capacity()
    }

    /// Returns the number of buffer bytes in use.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Returns the total size of the byte buffer.
    #[inline]
    pub fn capacity_bytes(&self) -> usize {
        self.buf.capacity()
    }

    /// Returns the number of bytes a pair occupies once stored.
    #[inline]
    pub fn encoded_size(key: &str, value: &str) -> usize {
        key.len() + value.len() + 2 * TERMINATOR_SIZE
    }

    /// Looks up the value stored for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        let index = self.find(key)?;
        Some(self.value_at(index))
    }

    /// Returns the pair at `index` in insertion order.
    pub fn get_index(&self, index: usize) -> Option<(&str, &str)> {
        (index < self.count).then(|| (self.key_at(index), self.value_at(index)))
    }

    /// Iterates over all pairs in insertion order.
    pub fn iter(&self) -> AttributeIter<'_> {
        AttributeIter {
            arena: self,
            index: 0,
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// A replaced key moves to the end of the insertion order. If the new pair
    /// does not fit, the previous value has already been removed.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), AttributeError> {
        self.remove(key);
        self.append(key, value)
    }

    /// Removes `key`, returning `true` if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.find(key) {
            Some(index) => {
                self.clear_index(index);
                true
            }
            None => false,
        }
    }

    /// Removes every pair.
    pub fn clear(&mut self) {
        self.entries.fill(Entry::default());
        self.count = 0;
        self.used = 0;
    }

    fn find(&self, key: &str) -> Option<usize> {
        (0..self.count).find(|&index| self.key_at(index) == key)
    }

    fn key_at(&self, index: usize) -> &str {
        let range = self.entries[index].key_range();
        // SAFETY: the range covers a key copied from a `&str` in `append` and
        // moved as a whole by `clear_index`.
        unsafe { stored_str(&self.buf[range]) }
    }

    fn value_at(&self, index: usize) -> &str {
        let range = self.entries[index].value_range();
        // SAFETY: the range covers a value copied from a `&str` in `append`
        // and moved as a whole by `clear_index`.
        unsafe { stored_str(&self.buf[range]) }
    }

    fn clear_index(&mut self, index: usize) {
        let removed = self.entries[index];
        let size = removed.size();

        // fill in the hole in the buffer
        let tail_start = removed.offset + size;
        self.buf.copy_within(tail_start..self.used, removed.offset);
        self.used -= size;

        // fill in the hole in the entries and repoint them
        for fix_index in index + 1..self.count {
            let entry = self.entries[fix_index];
            self.entries[fix_index - 1] = Entry {
                offset: entry.offset - size,
                ..entry
            };
        }
        self.count -= 1;
        self.entries[self.count] = Entry::default();
    }

    fn append(&mut self, key: &str, value: &str) -> Result<(), AttributeError> {
        if self.count >= self.entries.capacity() {
            return Err(AttributeError::SlotsExhausted {
                max_count: self.entries.capacity(),
            });
        }

        let needed = Self::encoded_size(key, value);
        let available = self.buf.capacity() - self.used;
        if needed > available {
            return Err(AttributeError::BufferExhausted { needed, available });
        }

        let offset = self.used;
        let key_size = write_terminated(&mut self.buf[offset..], key);
        write_terminated(&mut self.buf[offset + key_size..], value);
        self.used += needed;

        self.entries[self.count] = Entry {
            offset,
            key_len: key.len(),
            value_len: value.len(),
        };
        self.count += 1;
        Ok(())
    }
}

impl core::fmt::Debug for AttributeArena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Iterator over the pairs of an [`AttributeArena`], in insertion order.
#[derive(Clone)]
pub struct AttributeIter<'a> {
    arena: &'a AttributeArena,
    index: usize,
}

impl<'a> Iterator for AttributeIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.arena.get_index(self.index)?;
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.arena.count - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for AttributeIter<'_> {}
