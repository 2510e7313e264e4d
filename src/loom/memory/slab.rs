//! Fixed-size-entry slab with O(1) acquire and release.

use bytemuck::Pod;
use thiserror::Error;

use crate::loom::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlabError {
    #[error("slab of {0} entries is exhausted")]
    Exhausted(usize),
    #[error("address {0:#x} is not an entry of this slab")]
    InvalidPointer(usize),
    #[error("entry {0:#x} is not checked out")]
    NotCheckedOut(usize),
    #[error("invalid slab geometry: entry size {size}, alignment {align}, entries {count}")]
    Geometry {
        size: usize,
        align: usize,
        count: usize,
    },
    #[error("slab size overflows")]
    Overflow,
    #[error("record of {0} bytes does not fit an entry of {1} bytes")]
    Record(usize, usize),
}

impl SlabError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SlabError::Exhausted(_) => ErrorKind::LimitExceeded,
            SlabError::InvalidPointer(_) | SlabError::NotCheckedOut(_) => ErrorKind::InvalidArgs,
            SlabError::Geometry { .. } | SlabError::Record(..) => ErrorKind::InvalidArgs,
            SlabError::Overflow => ErrorKind::IntegerOverflow,
        }
    }
}

/// Address of a slab entry. Every entry lives at `base + index * entry_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlabEntry(pub usize);

#[derive(Debug)]
pub struct Slab {
    entry_size: usize,
    alignment: usize,
    max_entries: usize,
    /// Backing storage; never resized, so `base` stays valid.
    storage: Box<[u8]>,
    /// Offset of the first aligned byte in `storage`.
    start: usize,
    base: usize,
    free: Vec<usize>,
    checked_out: Vec<bool>,
}

impl Slab {
    /// Reserves `max_entries` entries of `entry_size` bytes, each rounded up to `alignment`.
    pub fn new(entry_size: usize, max_entries: usize, alignment: usize) -> Result<Self, SlabError> {
        let geometry = SlabError::Geometry {
            size: entry_size,
            align: alignment,
            count: max_entries,
        };
        if entry_size == 0 || max_entries == 0 || !alignment.is_power_of_two() {
            return Err(geometry);
        }
        let entry_size = entry_size
            .checked_next_multiple_of(alignment)
            .ok_or(SlabError::Overflow)?;
        let bytes = entry_size
            .checked_mul(max_entries)
            .and_then(|x| x.checked_add(alignment))
            .ok_or(SlabError::Overflow)?;

        let storage = vec![0u8; bytes].into_boxed_slice();
        let addr = storage.as_ptr() as usize;
        let start = addr.next_multiple_of(alignment) - addr;
        let base = addr + start;

        // lowest address on top of the stack
        let free = (0..max_entries).rev().map(|i| base + i * entry_size).collect();
        let checked_out = vec![false; max_entries];

        log::trace!("slab constructed: {max_entries} × {entry_size} bytes at {base:#x}");
        Ok(Self {
            entry_size,
            alignment,
            max_entries,
            storage,
            start,
            base,
            free,
            checked_out,
        })
    }

    #[inline]
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Address of the first entry.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Bytes spanned by all entries.
    #[inline]
    pub fn span(&self) -> usize {
        self.entry_size * self.max_entries
    }

    /// Number of entries currently checked out.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.max_entries - self.free.len()
    }

    pub fn acquire(&mut self) -> Result<SlabEntry, SlabError> {
        let addr = self
            .free
            .pop()
            .ok_or(SlabError::Exhausted(self.max_entries))?;
        let index = (addr - self.base) / self.entry_size;
        self.checked_out[index] = true;
        Ok(SlabEntry(addr))
    }

    pub fn release(&mut self, entry: SlabEntry) -> Result<(), SlabError> {
        let index = self.index(entry)?;
        if !self.checked_out[index] {
            return Err(SlabError::NotCheckedOut(entry.0));
        }
        self.checked_out[index] = false;
        self.free.push(entry.0);
        Ok(())
    }

    /// Stores a plain record into a checked-out entry.
    pub fn write<T: Pod>(&mut self, entry: SlabEntry, record: &T) -> Result<(), SlabError> {
        let bytes = bytemuck::bytes_of(record);
        let range = self.range(entry, bytes.len())?;
        self.storage[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Loads a plain record from a checked-out entry.
    pub fn read<T: Pod>(&self, entry: SlabEntry) -> Result<T, SlabError> {
        let range = self.range(entry, size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&self.storage[range]))
    }

    /// Iterates over the addresses of all checked-out entries.
    pub fn outstanding_entries(&self) -> impl Iterator<Item = SlabEntry> + '_ {
        self.checked_out
            .iter()
            .enumerate()
            .filter(|&(_, &checked)| checked)
            .map(|(index, _)| SlabEntry(self.base + index * self.entry_size))
    }

    fn index(&self, entry: SlabEntry) -> Result<usize, SlabError> {
        let SlabEntry(addr) = entry;
        let end = self.base + self.max_entries * self.entry_size;
        if addr < self.base || addr >= end || (addr - self.base) % self.entry_size != 0 {
            return Err(SlabError::InvalidPointer(addr));
        }
        Ok((addr - self.base) / self.entry_size)
    }

    fn range(&self, entry: SlabEntry, len: usize) -> Result<std::ops::Range<usize>, SlabError> {
        if len > self.entry_size {
            return Err(SlabError::Record(len, self.entry_size));
        }
        let index = self.index(entry)?;
        if !self.checked_out[index] {
            return Err(SlabError::NotCheckedOut(entry.0));
        }
        let offset = self.start + index * self.entry_size;
        Ok(offset..offset + len)
    }
}
