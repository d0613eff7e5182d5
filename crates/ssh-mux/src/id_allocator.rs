use bitvec::prelude::*;
use ssh_mux_proto::LocalChannelId;

pub(crate) trait Id: Copy + From<u32> + Into<u32> {}

impl Id for LocalChannelId {}

/// Monotonic channel ID allocator.
///
/// IDs are handed out in increasing order, wrapping arithmetically at
/// `u32::MAX`. A freed ID becomes reusable, but is only picked up again once
/// the cursor wraps around to it, so a freshly released ID is never reissued
/// while late messages for it may still be in flight.
pub(crate) struct IdAllocator<T: Id> {
    taken: BitVec,
    next: u32,
    in_use: u64,
    _pd: std::marker::PhantomData<T>,
}

impl<T: Id> Default for IdAllocator<T> {
    fn default() -> Self {
        Self {
            taken: BitVec::new(),
            next: 0,
            in_use: 0,
            _pd: std::marker::PhantomData,
        }
    }
}

const ID_SPACE: u64 = 1 << 32;

impl<T: Id> IdAllocator<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates the next ID.
    ///
    /// Returns `None` when every ID is taken.
    pub(crate) fn alloc(&mut self) -> Option<T> {
        if self.in_use == ID_SPACE {
            return None;
        }

        // A free bit exists, so this scan terminates after at most one wrap.
        loop {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);

            let idx = candidate as usize;
            if idx >= self.taken.len() {
                self.taken.resize(idx + 1, false);
            }
            if !self.taken[idx] {
                self.taken.set(idx, true);
                self.in_use += 1;
                return Some(T::from(candidate));
            }
        }
    }

    /// Frees an ID.
    ///
    /// Freed IDs are reclaimed once the allocation cursor wraps back around.
    pub(crate) fn free(&mut self, id: T) {
        let idx = usize::try_from(Into::<u32>::into(id)).unwrap_or(usize::MAX);
        if idx < self.taken.len() && self.taken[idx] {
            self.taken.set(idx, false);
            self.in_use -= 1;
        }
    }

    #[cfg(test)]
    fn with_cursor(next: u32) -> Self {
        Self {
            next,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    #[test]
    fn allocates_monotonically() {
        let mut allocator = IdAllocator::<LocalChannelId>::new();
        for expected in 0..16u32 {
            assert_eq!(Some(LocalChannelId::from(expected)), allocator.alloc());
        }
    }

    #[test]
    fn freed_id_is_not_reissued_before_wrap() {
        let mut allocator = IdAllocator::<LocalChannelId>::new();
        let first = allocator.alloc().unwrap();
        let _second = allocator.alloc().unwrap();
        allocator.free(first);

        // The cursor keeps moving forward even though ID 0 is free again.
        assert_eq!(Some(LocalChannelId::from(2)), allocator.alloc());
        assert_eq!(Some(LocalChannelId::from(3)), allocator.alloc());
    }

    #[test]
    fn wraps_and_skips_ids_still_in_use() {
        let mut allocator = IdAllocator::<LocalChannelId>::with_cursor(u32::MAX - 1);
        let near_end = allocator.alloc().unwrap();
        assert_eq!(u32::from(near_end), u32::MAX - 1);

        // Occupy the low IDs the wrap will scan over.
        allocator.taken.resize(2, false);
        allocator.taken.set(0, true);
        allocator.taken.set(1, true);
        allocator.in_use += 2;

        assert_eq!(Some(LocalChannelId::from(u32::MAX)), allocator.alloc());
        assert_eq!(Some(LocalChannelId::from(2)), allocator.alloc());
    }

    #[test]
    fn double_free_is_ignored() {
        let mut allocator = IdAllocator::<LocalChannelId>::new();
        let id = allocator.alloc().unwrap();
        allocator.free(id);
        allocator.free(id);
        assert_eq!(0, allocator.in_use);
    }
}
