// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

/// Wrapping position over a fixed keyspace of `size` slots.
///
/// `position` is always in `[0, size)`. A cycle of size zero is unbounded:
/// it never moves and every advance reports a completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCycle {
    position: u64,
    size: u64,
}

impl KeyCycle {
    pub fn new(size: u64) -> Self {
        Self::with_offset(size, 0)
    }

    pub fn with_offset(size: u64, offset: u64) -> Self {
        let position = if size == 0 { 0 } else { offset % size };
        Self { position, size }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Moves forward by `n` slots. Returns true iff the move reached or
    /// passed the end of the keyspace.
    pub fn advance(&mut self, n: u64) -> bool {
        if self.size == 0 {
            return true;
        }
        if n == 0 {
            return false;
        }
        let next = self.position + n;
        self.position = next % self.size;
        next >= self.size
    }

    /// Whether advancing by `n` would complete a cycle.
    pub fn is_next_complete(&self, n: u64) -> bool {
        self.size == 0 || (n > 0 && self.position + n >= self.size)
    }

    /// The next `n` positions, starting at the current one, without moving.
    pub fn peek(&self, n: u64) -> Vec<u64> {
        (0..n)
            .map(|i| {
                if self.size == 0 {
                    self.position + i
                } else {
                    (self.position + i) % self.size
                }
            })
            .collect()
    }
}

/// Decides the commit cadence: a write commits synchronously when the cursor
/// sits at position zero, i.e. once every `size` writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitCursor(KeyCycle);

impl CommitCursor {
    pub fn new(commits_per_sync: u64, offset: u64) -> Self {
        Self(KeyCycle::with_offset(commits_per_sync, offset))
    }

    /// Staggers users across the cycle so they don't all sync at once: user
    /// `index` out of `user_count` starts at
    /// `round(index / (user_count - 1) * commits_per_sync)`.
    pub fn for_user(index: u64, user_count: u64, commits_per_sync: u64) -> Self {
        let offset = if user_count > 1 {
            let fraction = index as f64 / (user_count - 1) as f64;
            (fraction * commits_per_sync as f64).round() as u64
        } else {
            0
        };
        Self::new(commits_per_sync, offset)
    }

    pub fn position(&self) -> u64 {
        self.0.position()
    }

    /// A zero-sized cursor never asks for a synchronous commit.
    pub fn is_sync_due(&self) -> bool {
        self.0.size() > 0 && self.0.position() == 0
    }

    pub fn advance(&mut self) {
        self.0.advance(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_exactly_on_wrap() {
        for size in 1..10 {
            let mut cycle = KeyCycle::new(size);
            for step in 1..=size {
                let completed = cycle.advance(1);
                assert_eq!(completed, step == size, "size {size} step {step}");
                assert!(cycle.position() < size);
            }
            assert_eq!(cycle.position(), 0);
        }
    }

    #[test]
    fn large_advance_wraps() {
        let mut cycle = KeyCycle::with_offset(5, 3);
        assert!(cycle.is_next_complete(2));
        assert!(cycle.advance(7));
        assert_eq!(cycle.position(), 0);
        assert!(!cycle.advance(0));
        assert_eq!(cycle.position(), 0);
    }

    #[test]
    fn zero_size_is_always_complete() {
        let mut cycle = KeyCycle::new(0);
        assert!(cycle.advance(0));
        assert!(cycle.advance(3));
        assert!(cycle.is_next_complete(0));
        assert_eq!(cycle.position(), 0);
        assert_eq!(cycle.peek(3), vec![0, 1, 2]);
    }

    #[test]
    fn peek_wraps_without_moving() {
        let cycle = KeyCycle::with_offset(5, 3);
        assert_eq!(cycle.peek(3), vec![3, 4, 0]);
        assert_eq!(cycle.position(), 3);
    }

    #[test]
    fn syncs_once_per_cycle() {
        for offset in 0..4 {
            let mut cursor = CommitCursor::new(4, offset);
            let mut syncs = 0;
            for _ in 0..4 {
                if cursor.is_sync_due() {
                    syncs += 1;
                }
                cursor.advance();
            }
            assert_eq!(syncs, 1, "offset {offset}");
        }
        assert!(!CommitCursor::new(0, 0).is_sync_due());
    }

    #[test]
    fn users_are_staggered() {
        assert_eq!(CommitCursor::for_user(0, 5, 10).position(), 0);
        assert_eq!(CommitCursor::for_user(2, 5, 10).position(), 5);
        // The last user lands on a full cycle, which wraps to zero.
        assert_eq!(CommitCursor::for_user(4, 5, 10).position(), 0);
        assert_eq!(CommitCursor::for_user(0, 1, 10).position(), 0);
    }
}
