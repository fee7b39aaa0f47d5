//! Defines the leased [`Buffer`] returned by [`super::PacketPool::allocate`].

/// A leased, possibly-reused byte buffer.
///
/// Carries the tier it was drawn from (`None` for an over-sized spill
/// allocation) so [`super::PacketPool::release`] knows where, if anywhere,
/// to return the storage.
pub struct Buffer {
    tier: Option<usize>,
    data: Box<[u8]>,
    len: usize,
}

impl Buffer {
    pub(super) fn pooled(tier: usize, data: Box<[u8]>, len: usize) -> Self {
        debug_assert!(len <= data.len());
        Self { tier: Some(tier), data, len }
    }

    pub(super) fn over_sized(len: usize) -> Self {
        Self { tier: None, data: vec![0u8; len].into_boxed_slice(), len }
    }

    pub(super) fn tier_index(&self) -> Option<usize> {
        self.tier
    }

    pub(super) fn into_raw(self) -> Box<[u8]> {
        self.data
    }

    /// Total storage capacity, which may exceed the length last requested.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Logical length in use (<= [`Self::capacity`]).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrinks or grows the logical length in use, without touching storage.
    ///
    /// # Panics
    /// Panics if `len` exceeds [`Self::capacity`].
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len(), "buffer set_len exceeds capacity");
        self.len = len;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Full backing storage, including any capacity beyond the logical
    /// length (used when growing into the buffer, e.g. while reassembling
    /// RPC fragments).
    pub fn full_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("tier", &self.tier)
            .field("capacity", &self.data.len())
            .field("len", &self.len)
            .finish()
    }
}
