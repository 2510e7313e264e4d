//! Allocators backing device buffers and metadata.

pub mod cache;
pub mod pinned;
pub mod pool;
pub mod slab;

pub use cache::{CacheKey, ConstCache};
pub use pinned::{PinState, PinnedMemory};
pub use pool::{Arena, Block, BlockHandle, Pool, PoolStats};
pub use slab::{Slab, SlabEntry};
