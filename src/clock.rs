//! Logical change clock.
//!
//! Timestamps only advance when someone has observed the current one: two invalidations that
//! happen without anybody reading the clock in between share a timestamp.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// A logical timestamp.
pub type TimeStamp = u64;

/// The first timestamp ever issued.
pub const TS_BERESHIT: TimeStamp = 1;

/// The session clock.
#[derive(Debug)]
pub struct UpdateClock {
    last: AtomicU64,
    observed: AtomicBool,
    active: AtomicU64,
    determine_depth: AtomicU32,
}

impl Default for UpdateClock {
    fn default() -> Self {
        Self {
            last: AtomicU64::new(TS_BERESHIT),
            observed: AtomicBool::new(false),
            active: AtomicU64::new(0),
            determine_depth: AtomicU32::new(0),
        }
    }
}

impl UpdateClock {
    /// Create a clock at [`TS_BERESHIT`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the last issued timestamp without observing it.
    pub fn peek(&self) -> TimeStamp {
        self.last.load(Ordering::Acquire)
    }

    /// Read the last issued timestamp and mark it as observed.
    pub fn last_ts(&self) -> TimeStamp {
        self.observed.store(true, Ordering::Release);
        self.peek()
    }

    /// Issue a timestamp newer than anything observed so far.
    pub fn fresh_ts(&self) -> TimeStamp {
        if self.observed.swap(false, Ordering::AcqRel) {
            self.last.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.peek()
        }
    }

    /// The timestamp to stamp an invalidation with right now.
    pub fn active_ts(&self) -> TimeStamp {
        let active = self.active.load(Ordering::Acquire);
        if active != 0 {
            return active;
        }
        if self.determine_depth.load(Ordering::Acquire) > 0 {
            return self.last_ts();
        }
        self.fresh_ts()
    }

    /// Scope during which [`active_ts`](Self::active_ts) returns `ts`.
    pub fn change_source(&self, ts: TimeStamp) -> ChangeSourceLock<'_> {
        let previous = self.active.swap(ts, Ordering::AcqRel);
        ChangeSourceLock {
            clock: self,
            previous,
        }
    }

    /// Scope during which invalidations reuse the last issued timestamp.
    pub fn determine_change(&self) -> DetermineChangeLock<'_> {
        self.determine_depth.fetch_add(1, Ordering::AcqRel);
        DetermineChangeLock { clock: self }
    }
}

/// Guard returned by [`UpdateClock::change_source`].
#[must_use]
pub struct ChangeSourceLock<'a> {
    clock: &'a UpdateClock,
    previous: TimeStamp,
}

impl Drop for ChangeSourceLock<'_> {
    fn drop(&mut self) {
        self.clock.active.store(self.previous, Ordering::Release);
    }
}

/// Guard returned by [`UpdateClock::determine_change`].
#[must_use]
pub struct DetermineChangeLock<'a> {
    clock: &'a UpdateClock,
}

impl Drop for DetermineChangeLock<'_> {
    fn drop(&mut self) {
        self.clock.determine_depth.fetch_sub(1, Ordering::AcqRel);
    }
}
