//! Argument buffer pool: one pre-reserved arena per device, carved first-fit into blocks.

use derive_more::Display;
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loom::{ErrorKind, device::DeviceId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("insufficient buffer on device {device}: requested {requested} bytes, largest free block {largest}")]
    InsufficientBuffer {
        device: DeviceId,
        requested: usize,
        largest: usize,
    },
    #[error("zero-sized block requested")]
    ZeroSize,
    #[error("block size overflows")]
    Overflow,
    #[error("block {0} is not live in this pool")]
    InvalidHandle(BlockHandle),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::InsufficientBuffer { .. } => ErrorKind::InsufficientBuffer,
            PoolError::ZeroSize => ErrorKind::InvalidArgs,
            PoolError::Overflow => ErrorKind::IntegerOverflow,
            PoolError::InvalidHandle(_) => ErrorKind::InvalidHandle,
        }
    }
}

/// Identifies one live block. Handles from an older epoch of the same device never match.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{device}:{epoch}:{serial}")]
pub struct BlockHandle {
    pub device: DeviceId,
    pub epoch: u64,
    pub serial: u64,
}

/// A block handed out by a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub handle: BlockHandle,
    /// Device address of the first byte.
    pub addr: usize,
    pub offset: usize,
    pub size: usize,
}

/// A contiguous device address range reserved by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Arena {
    pub base: usize,
    pub size: usize,
}

impl Arena {
    #[inline]
    pub fn contains(&self, addr: usize, size: usize) -> bool {
        addr >= self.base && addr.saturating_add(size) <= self.base + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    offset: usize,
    size: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolStats {
    pub arena: usize,
    pub used: usize,
    pub peak: usize,
    pub live_blocks: usize,
    pub free_regions: usize,
    pub largest_free: usize,
    pub acquired: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub struct Pool {
    device: DeviceId,
    epoch: u64,
    arena: Arena,
    granule: usize,
    /// Free regions, sorted by offset and never adjacent.
    free: Vec<Region>,
    live: HashMap<u64, Region>,
    serial: u64,
    used: usize,
    peak: usize,
    acquired: u64,
    failed: u64,
}

impl Pool {
    pub fn new(device: DeviceId, epoch: u64, arena: Arena, granule: usize) -> Self {
        let granule = granule.max(1).next_power_of_two();
        let free = match arena.size {
            0 => vec![],
            size => vec![Region { offset: 0, size }],
        };
        Self {
            device,
            epoch,
            arena,
            granule,
            free,
            live: HashMap::default(),
            serial: 0,
            used: 0,
            peak: 0,
            acquired: 0,
            failed: 0,
        }
    }

    #[inline]
    pub fn arena(&self) -> Arena {
        self.arena
    }

    #[inline]
    pub fn free_left(&self) -> usize {
        self.arena.size - self.used
    }

    /// Returns `true` if no block is live.
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.live.is_empty()
    }

    /// Rounds a request up to its tier: a multiple of a power of two no smaller than
    /// an eighth of the request, and never finer than the granule.
    pub fn tiered(&self, size: usize) -> Result<usize, PoolError> {
        if size == 0 {
            return Err(PoolError::ZeroSize);
        }
        let step = size
            .checked_next_power_of_two()
            .map_or(1 << (usize::BITS - 4), |x| x >> 3)
            .max(self.granule);
        size.checked_next_multiple_of(step).ok_or(PoolError::Overflow)
    }

    pub fn get_block(&mut self, size: usize) -> Result<Block, PoolError> {
        let size = self.tiered(size)?;
        let Some(index) = self.free.iter().position(|region| region.size >= size) else {
            self.failed += 1;
            let largest = self.largest_free();
            log::debug!("device {} buffer exhausted: {size} > {largest}", self.device);
            return Err(PoolError::InsufficientBuffer {
                device: self.device,
                requested: size,
                largest,
            });
        };

        let region = &mut self.free[index];
        let offset = region.offset;
        region.offset += size;
        region.size -= size;
        if region.size == 0 {
            self.free.remove(index);
        }

        self.serial += 1;
        self.live.insert(self.serial, Region { offset, size });
        self.used += size;
        self.peak = self.peak.max(self.used);
        self.acquired += 1;

        let handle = BlockHandle {
            device: self.device,
            epoch: self.epoch,
            serial: self.serial,
        };
        let addr = self.arena.base + offset;
        log::trace!("block {handle} acquired: {size} bytes at {addr:#x}");
        Ok(Block {
            handle,
            addr,
            offset,
            size,
        })
    }

    pub fn release_block(&mut self, handle: BlockHandle) -> Result<(), PoolError> {
        if handle.device != self.device || handle.epoch != self.epoch {
            return Err(PoolError::InvalidHandle(handle));
        }
        let region = self
            .live
            .remove(&handle.serial)
            .ok_or(PoolError::InvalidHandle(handle))?;
        self.used -= region.size;

        let index = self.free.partition_point(|x| x.offset < region.offset);
        self.free.insert(index, region);

        // merge with the right neighbor, then the left one
        if index + 1 < self.free.len() {
            let next = self.free[index + 1];
            if region.offset + region.size == next.offset {
                self.free[index].size += next.size;
                self.free.remove(index + 1);
            }
        }
        if index > 0 {
            let prev = self.free[index - 1];
            if prev.offset + prev.size == region.offset {
                self.free[index - 1].size += self.free[index].size;
                self.free.remove(index);
            }
        }

        log::trace!("block {handle} released: {} bytes", region.size);
        Ok(())
    }

    /// Looks up a live block by handle.
    pub fn block(&self, handle: BlockHandle) -> Option<Block> {
        if handle.device != self.device || handle.epoch != self.epoch {
            return None;
        }
        self.live.get(&handle.serial).map(|region| Block {
            handle,
            addr: self.arena.base + region.offset,
            offset: region.offset,
            size: region.size,
        })
    }

    /// Largest number of blocks the arena can hold at once, one granule each.
    #[inline]
    pub fn max_blocks(&self) -> usize {
        self.arena.size / self.granule
    }

    #[inline]
    pub fn largest_free(&self) -> usize {
        self.free.iter().map(|x| x.size).max().unwrap_or(0)
    }

    /// For each power-of-two tier from the arena size down to the granule, the number of
    /// blocks of exactly that size the free list could hand out right now.
    pub fn size_tiers(&self) -> Vec<(usize, usize)> {
        let top = match self.arena.size {
            0 => return vec![],
            size if size.is_power_of_two() => size,
            size => size.next_power_of_two() >> 1,
        };
        std::iter::successors(Some(top), |&x| (x > self.granule).then_some(x >> 1))
            .filter(|&tier| tier >= self.granule)
            .map(|tier| (tier, self.free.iter().map(|x| x.size / tier).sum()))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            arena: self.arena.size,
            used: self.used,
            peak: self.peak,
            live_blocks: self.live.len(),
            free_regions: self.free.len(),
            largest_free: self.largest_free(),
            acquired: self.acquired,
            failed: self.failed,
        }
    }

    /// Prints the free list in a human-readable format.
    pub fn print_pretty(&self) -> String {
        self.free
            .iter()
            .map(|x| format!("[{:#x}, +{})", self.arena.base + x.offset, x.size))
            .join(" ")
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "arena {} B, used {} B (peak {} B), {} live blocks, {} free regions (largest {} B), {} acquired, {} failed",
            self.arena,
            self.used,
            self.peak,
            self.live_blocks,
            self.free_regions,
            self.largest_free,
            self.acquired,
            self.failed
        )
    }
}
