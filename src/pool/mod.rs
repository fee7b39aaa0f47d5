//! Fixed-tier buffer allocator with over-sized spill (`spec.md` §3, §4.1).
//!
//! Grounded in the teacher's intrusive buffer/chain allocator
//! (`allocator/buffer.rs`, `allocator/chain.rs`), simplified: ownership of a
//! leased [`Buffer`] is tracked by the Rust borrow checker instead of an
//! intrusive linked list, so double-release is a compile-time impossibility
//! rather than a runtime invariant to police.

mod buffer;
mod tier;

pub use buffer::Buffer;
use tier::Tier;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Process-wide singleton allocator for receive/transmit buffers.
///
/// Tiers are tried smallest-sufficient-first; a request that exceeds every
/// tier falls back to an over-sized allocation (bounded by
/// [`ServerConfig::max_over_sized`]); beyond that, allocation fails.
pub struct PacketPool {
    tiers: Vec<Tier>,
    max_over_sized: usize,
    quota_per_tier: usize,
    out_of_pooled_memory_count: AtomicU64,
}

impl PacketPool {
    pub fn new(config: &ServerConfig) -> Self {
        let mut capacities = config.pool_tiers.clone();
        capacities.sort_unstable();
        capacities.dedup();
        let tiers = capacities.into_iter().map(Tier::new).collect();
        Self {
            tiers,
            max_over_sized: config.max_over_sized,
            quota_per_tier: config.pool_buffers_per_tier,
            out_of_pooled_memory_count: AtomicU64::new(0),
        }
    }

    /// Returns a buffer of capacity >= `min_capacity`, drawn from the
    /// smallest sufficient tier if one has a free entry, else a freshly
    /// allocated tiered buffer, else an over-sized buffer if permitted,
    /// else [`Error::OutOfPooledMemory`].
    pub fn allocate(&self, min_capacity: usize) -> Result<Buffer> {
        if let Some((index, tier)) =
            self.tiers.iter().enumerate().find(|(_, tier)| tier.capacity() >= min_capacity)
        {
            let data = tier.take_or_alloc();
            return Ok(Buffer::pooled(index, data, min_capacity));
        }

        if min_capacity <= self.max_over_sized {
            return Ok(Buffer::over_sized(min_capacity));
        }

        self.out_of_pooled_memory_count.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(requested = min_capacity, "packet pool exhausted");
        Err(Error::OutOfPooledMemory { requested: min_capacity })
    }

    /// Returns `buffer` to its tier's free-list, dropping it instead if the
    /// tier's free-list quota is already met, or if the buffer was
    /// over-sized to begin with.
    pub fn release(&self, buffer: Buffer) {
        if let Some(index) = buffer.tier_index() {
            self.tiers[index].give_back(buffer.into_raw(), self.quota_per_tier);
        }
        // Over-sized buffers carry no tier and are simply dropped.
    }

    /// Number of times allocation has failed with [`Error::OutOfPooledMemory`],
    /// tracked for operational visibility (`spec.md` §4.1).
    pub fn out_of_pooled_memory_count(&self) -> u64 {
        self.out_of_pooled_memory_count.load(Ordering::Relaxed)
    }

    pub fn max_over_sized(&self) -> usize {
        self.max_over_sized
    }
}
