//! Variable-record ring buffer backing the breadcrumb trail.
//!
//! The ring is an arena plus an index: a fixed array of slots, each describing
//! one record, over a fixed byte buffer with a read and a write cursor.
//!
//! # Record layout
//!
//! ```text
//! | len table: (key_len, value_len) * n | name \0 | key0 \0 value0 \0 | ... |
//! ```
//!
//! The length table takes two machine words per metadata pair. A record is
//! always written contiguously; when it does not fit before the end of the
//! buffer the writer wraps to offset zero and the unused tail is skipped.
//!
//! # Cursor invariants
//!
//! - The read cursor is the offset of the oldest live record, and the write
//!   cursor is the end of the newest one. Both are zero when the ring is
//!   empty.
//! - If the ring is non-empty and `write <= read`, the live region wraps and
//!   the only free bytes are `write..read`.
//! - Evicting the oldest record moves the read cursor past exactly that
//!   record's bytes, landing on the next record (or on offset zero when the
//!   writer had wrapped there).

use core::mem::size_of;

use crate::{
    allocator::{AllocError, SharedAllocator},
    fixed::FixedBuf,
    util::{TERMINATOR_SIZE, stored_str, write_terminated},
};

/// Size of one length-table word.
const WORD: usize = size_of::<usize>();

/// Index entry describing one live record.
///
/// Slots are opaque outside this crate: they can be copied into a snapshot
/// and resolved again through [`BreadcrumbRing::resolve`], nothing more.
#[derive(Copy, Clone, Debug, Default)]
pub struct BreadcrumbSlot {
    offset: usize,
    size: usize,
    meta_count: usize,
    repeat: usize,
}

/// What [`BreadcrumbRing::push`] did with a breadcrumb.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BreadcrumbOutcome {
    /// A new record was written.
    Stored,
    /// The breadcrumb equals the newest record, whose repetition count was
    /// incremented.
    Coalesced,
    /// The breadcrumb is larger than the whole buffer and was discarded.
    Dropped,
    /// The ring has zero capacity.
    Disabled,
}

/// A bounded trail of named events with metadata.
pub struct BreadcrumbRing {
    slots: FixedBuf<BreadcrumbSlot>,
    /// Slot index the next record goes into.
    next: usize,
    /// Number of live slots.
    count: usize,
    buf: FixedBuf<u8>,
    read: usize,
    write: usize,
}

impl BreadcrumbRing {
    /// Creates a ring with `max_count` slots over `buf_size` bytes.
    pub fn new_in(
        max_count: usize,
        buf_size: usize,
        allocator: &SharedAllocator,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            slots: FixedBuf::new_in(max_count, BreadcrumbSlot::default(), allocator)?,
            next: 0,
            count: 0,
            buf: FixedBuf::new_in(buf_size, 0, allocator)?,
            read: 0,
            write: 0,
        })
    }

    /// Returns `true` if either capacity is zero.
    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.slots.capacity() == 0 || self.buf.capacity() == 0
    }

    /// Returns the number of live records.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if there are no live records.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the slot capacity.
    #[inline]
    pub fn max_count(&self) -> usize {
        self.slots.capacity()
    }

    /// Returns the byte capacity.
    #[inline]
    pub fn capacity_bytes(&self) -> usize {
        self.buf.capacity()
    }

    /// Returns the number of bytes a breadcrumb occupies once stored.
    pub fn encoded_size(name: &str, meta: &[(&str, &str)]) -> usize {
        let mut size = 2 * WORD * meta.len();
        size += name.len() + TERMINATOR_SIZE;
        for (key, value) in meta {
            size += key.len() + TERMINATOR_SIZE;
            size += value.len() + TERMINATOR_SIZE;
        }
        size
    }

    /// Records a breadcrumb, evicting the oldest records as needed.
    pub fn push(&mut self, name: &str, meta: &[(&str, &str)]) -> BreadcrumbOutcome {
        if self.is_disabled() {
            return BreadcrumbOutcome::Disabled;
        }

        // compare against the newest record to see if we can just denote repetition
        if let Some(last) = self.newest_index() {
            if self.resolve(&self.slots[last]).matches(name, meta) {
                let slot = &mut self.slots[last];
                slot.repeat = slot.repeat.saturating_add(1);
                return BreadcrumbOutcome::Coalesced;
            }
        }

        let required = Self::encoded_size(name, meta);
        if required > self.buf.capacity() {
            return BreadcrumbOutcome::Dropped;
        }

        if self.count >= self.slots.capacity() {
            self.evict_oldest();
        }

        let offset = loop {
            if let Some(offset) = self.alloc(required) {
                break offset;
            }
            if self.count == 0 {
                // An empty ring always has room for anything up to its capacity.
                return BreadcrumbOutcome::Dropped;
            }
            self.evict_oldest();
        };

        let record = &mut self.buf[offset..offset + required];
        for (index, (key, value)) in meta.iter().enumerate() {
            write_word(record, 2 * index, key.len());
            write_word(record, 2 * index + 1, value.len());
        }
        let mut cursor = 2 * WORD * meta.len();
        cursor += write_terminated(&mut record[cursor..], name);
        for (key, value) in meta {
            cursor += write_terminated(&mut record[cursor..], key);
            cursor += write_terminated(&mut record[cursor..], value);
        }
        debug_assert_eq!(cursor, required);

        self.slots[self.next] = BreadcrumbSlot {
            offset,
            size: required,
            meta_count: meta.len(),
            repeat: 1,
        };
        self.next = (self.next + 1) % self.slots.capacity();
        self.count += 1;
        BreadcrumbOutcome::Stored
    }

    /// Copies the live slots, oldest first, into `out`.
    ///
    /// Returns the number of slots copied, which is capped by `out.len()`.
    pub fn snapshot_into(&self, out: &mut [BreadcrumbSlot]) -> usize {
        let copied = self.count.min(out.len());
        for (index, dest) in out[..copied].iter_mut().enumerate() {
            *dest = self.slots[self.live_index(index)];
        }
        copied
    }

    /// Resolves a slot taken from this ring into a readable breadcrumb.
    ///
    /// A slot that no longer matches the ring's contents resolves to an empty
    /// breadcrumb rather than panicking.
    pub fn resolve(&self, slot: &BreadcrumbSlot) -> BreadcrumbRef<'_> {
        slot.offset
            .checked_add(slot.size)
            .and_then(|end| self.buf.get(slot.offset..end))
            .and_then(|record| BreadcrumbRef::decode(record, slot.meta_count, slot.repeat))
            .unwrap_or(BreadcrumbRef::EMPTY)
    }

    /// Iterates over the live records, oldest first.
    pub fn iter(&self) -> BreadcrumbIter<'_> {
        BreadcrumbIter {
            ring: self,
            index: 0,
        }
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.slots.fill(BreadcrumbSlot::default());
        self.next = 0;
        self.count = 0;
        self.read = 0;
        self.write = 0;
    }

    /// Slot index of the `index`-th live record, counting from the oldest.
    #[inline]
    fn live_index(&self, index: usize) -> usize {
        let capacity = self.slots.capacity();
        (self.next + capacity - self.count + index) % capacity
    }

    fn newest_index(&self) -> Option<usize> {
        (self.count > 0).then(|| self.live_index(self.count - 1))
    }

    /// Reserves `size` contiguous bytes at the write cursor.
    fn alloc(&mut self, size: usize) -> Option<usize> {
        let capacity = self.buf.capacity();
        let (write, read) = (self.write, self.read);

        let offset = if self.count == 0 {
            0
        } else if write <= read {
            // the live region wraps; only `write..read` is free
            if write + size > read {
                return None;
            }
            write
        } else if write + size <= capacity {
            write
        } else if size <= read {
            // wrap around and skip the unused tail
            0
        } else {
            return None;
        };

        if offset + size > capacity {
            return None;
        }
        self.write = offset + size;
        Some(offset)
    }

    fn evict_oldest(&mut self) {
        if self.count == 0 {
            return;
        }
        let first = self.live_index(0);
        let evicted = self.slots[first];
        self.slots[first] = BreadcrumbSlot::default();
        self.count -= 1;

        if self.count == 0 {
            self.read = 0;
            self.write = 0;
        } else {
            let next_offset = self.slots[self.live_index(0)].offset;
            let end = evicted.offset + evicted.size;
            // either the next record starts right after the evicted one, or
            // the writer wrapped to the start of the buffer
            debug_assert!(next_offset == end || next_offset == 0);
            self.read = next_offset;
        }
    }
}

impl core::fmt::Debug for BreadcrumbRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

fn write_word(record: &mut [u8], index: usize, value: usize) {
    record[index * WORD..(index + 1) * WORD].copy_from_slice(&value.to_ne_bytes());
}

fn read_word(record: &[u8], index: usize) -> Option<usize> {
    let bytes = record.get(index * WORD..(index + 1) * WORD)?;
    let mut word = [0u8; WORD];
    word.copy_from_slice(bytes);
    Some(usize::from_ne_bytes(word))
}

/// A borrowed view of one stored breadcrumb.
#[derive(Copy, Clone)]
pub struct BreadcrumbRef<'a> {
    record: &'a [u8],
    meta_count: usize,
    name_len: usize,
    repeat: usize,
}

impl<'a> BreadcrumbRef<'a> {
    const EMPTY: Self = Self {
        record: &[0],
        meta_count: 0,
        name_len: 0,
        repeat: 0,
    };

    fn decode(record: &'a [u8], meta_count: usize, repeat: usize) -> Option<Self> {
        let table = meta_count.checked_mul(2 * WORD)?;
        let mut meta_bytes = 0usize;
        for index in 0..2 * meta_count {
            meta_bytes = meta_bytes
                .checked_add(read_word(record, index)?)?
                .checked_add(TERMINATOR_SIZE)?;
        }
        let name_len = record
            .len()
            .checked_sub(table)?
            .checked_sub(meta_bytes)?
            .checked_sub(TERMINATOR_SIZE)?;
        Some(Self {
            record,
            meta_count,
            name_len,
            repeat,
        })
    }

    /// Returns the breadcrumb's name.
    pub fn name(&self) -> &'a str {
        let start = 2 * WORD * self.meta_count;
        // SAFETY: the range covers the name copied from a `&str` by
        // `BreadcrumbRing::push`, as validated by `decode`.
        unsafe { stored_str(&self.record[start..start + self.name_len]) }
    }

    /// Returns how many times in a row this breadcrumb was added.
    pub fn count(&self) -> usize {
        self.repeat
    }

    /// Returns the number of metadata pairs.
    pub fn metadata_len(&self) -> usize {
        self.meta_count
    }

    /// Iterates over the metadata pairs in the order they were given.
    pub fn metadata(&self) -> MetadataIter<'a> {
        MetadataIter {
            record: self.record,
            index: 0,
            meta_count: self.meta_count,
            cursor: 2 * WORD * self.meta_count + self.name_len + TERMINATOR_SIZE,
        }
    }

    /// Looks up the value of the first metadata pair with the given key.
    pub fn metadata_value(&self, key: &str) -> Option<&'a str> {
        self.metadata().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    fn matches(&self, name: &str, meta: &[(&str, &str)]) -> bool {
        self.meta_count == meta.len()
            && self.name() == name
            && self
                .metadata()
                .zip(meta)
                .all(|((key, value), (other_key, other_value))| {
                    key == *other_key && value == *other_value
                })
    }
}

impl core::fmt::Debug for BreadcrumbRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Breadcrumb")
            .field("name", &self.name())
            .field("metadata", &DebugMetadata(*self))
            .field("count", &self.repeat)
            .finish()
    }
}

struct DebugMetadata<'a>(BreadcrumbRef<'a>);

impl core::fmt::Debug for DebugMetadata<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.0.metadata()).finish()
    }
}

/// Iterator over the metadata pairs of a [`BreadcrumbRef`].
#[derive(Clone)]
pub struct MetadataIter<'a> {
    record: &'a [u8],
    index: usize,
    meta_count: usize,
    cursor: usize,
}

impl<'a> Iterator for MetadataIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.meta_count {
            return None;
        }
        let key_len = read_word(self.record, 2 * self.index)?;
        let value_len = read_word(self.record, 2 * self.index + 1)?;

        let key_start = self.cursor;
        let value_start = key_start + key_len + TERMINATOR_SIZE;
        self.cursor = value_start + value_len + TERMINATOR_SIZE;
        self.index += 1;

        let key = self.record.get(key_start..key_start + key_len)?;
        let value = self.record.get(value_start..value_start + value_len)?;
        // SAFETY: both ranges cover strings copied from `&str`s by
        // `BreadcrumbRing::push`, located through the record's length table.
        let pair = unsafe { (stored_str(key), stored_str(value)) };
        Some(pair)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.meta_count - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for MetadataIter<'_> {}

/// Iterator over the live records of a [`BreadcrumbRing`], oldest first.
#[derive(Clone)]
pub struct BreadcrumbIter<'a> {
    ring: &'a BreadcrumbRing,
    index: usize,
}

impl<'a> Iterator for BreadcrumbIter<'a> {
    type Item = BreadcrumbRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.ring.count {
            return None;
        }
        let slot = &self.ring.slots[self.ring.live_index(self.index)];
        self.index += 1;
        Some(self.ring.resolve(slot))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.ring.count - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BreadcrumbIter<'_> {}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::allocator::{SystemAllocator, shared_allocator};

    fn ring(max_count: usize, buf_size: usize) -> BreadcrumbRing {
        BreadcrumbRing::new_in(max_count, buf_size, &shared_allocator(SystemAllocator)).unwrap()
    }

    #[test]
    fn test_full_wrapped_ring_rejects_writes() {
        // three@8..14 and four@0..5 leave the cursors at read=8, write=5
        let mut ring = ring(8, 16);
        for name in ["one", "two", "three", "four"] {
            ring.push(name, &[]);
        }
        assert_eq!((ring.read, ring.write), (8, 5));

        // exactly fills write..read
        assert_eq!(ring.push("ab", &[]), BreadcrumbOutcome::Stored);
        assert_eq!((ring.read, ring.write), (8, 8));

        // write == read on a non-empty ring means full: the oldest must go
        assert_eq!(ring.push("x", &[]), BreadcrumbOutcome::Stored);
        let names: Vec<_> = ring.iter().map(|crumb| crumb.name()).collect();
        assert_eq!(names, ["four", "ab", "x"]);
    }

    #[test]
    fn test_read_cursor_skips_wrap_gap() {
        let mut ring = ring(8, 16);
        for name in ["one", "two", "three", "four"] {
            ring.push(name, &[]);
        }
        // evicting `three` must land the read cursor on `four` at offset 0,
        // not in the unused tail at 14..16
        ring.evict_oldest();
        assert_eq!(ring.read, 0);

        // the tail after `four` is free again: 5..16 holds two 5-byte records
        assert_eq!(ring.push("five", &[]), BreadcrumbOutcome::Stored);
        assert_eq!(ring.push("sixx", &[]), BreadcrumbOutcome::Stored);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_evicting_last_record_resets_cursors() {
        let mut ring = ring(1, 16);
        ring.push("abc", &[]);
        ring.push("defgh", &[]);
        assert_eq!(ring.len(), 1);
        assert_eq!((ring.read, ring.write), (0, 6));
    }

    #[test]
    fn test_record_layout() {
        let mut ring = ring(2, 64);
        ring.push("n", &[("k", "vv")]);
        let size = BreadcrumbRing::encoded_size("n", &[("k", "vv")]);
        assert_eq!(size, 2 * WORD + 2 + 2 + 3);
        assert_eq!(read_word(&ring.buf, 0), Some(1));
        assert_eq!(read_word(&ring.buf, 1), Some(2));
        assert_eq!(&ring.buf[2 * WORD..size], b"n\x00k\x00vv\x00");
    }

    #[test]
    fn test_stale_slot_resolves_empty() {
        let ring = ring(2, 8);
        let slot = BreadcrumbSlot {
            offset: 4,
            size: 100,
            meta_count: 3,
            repeat: 1,
        };
        let crumb = ring.resolve(&slot);
        assert_eq!(crumb.name(), "");
        assert_eq!(crumb.metadata().count(), 0);
    }
}
