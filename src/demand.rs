//! Counting of actively computed targets.
//!
//! Every actor that holds supplier interest counts as one active target. The counter reports its
//! value through `tracing` and the session's [`StateChangeNotifier`], throttled to one message
//! per report interval, and can be silenced by a notification block.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::lock_level::{LeveledMutex, LockLevel};
use crate::notify::StateChangeNotifier;

#[derive(Debug, Default)]
struct DemandState {
    remaining: u32,
    max: u32,
    last_report: Option<Instant>,
    block_depth: u32,
    count_at_block: u32,
}

/// Session-wide count of active targets.
pub struct DemandCounter {
    state: LeveledMutex<DemandState>,
    notifier: Arc<dyn StateChangeNotifier>,
    report_interval: Duration,
}

impl std::fmt::Debug for DemandCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemandCounter")
            .field("remaining", &self.remaining())
            .field("report_interval", &self.report_interval)
            .finish_non_exhaustive()
    }
}

/// Text for a demand report.
pub fn demand_message(remaining: u32, max: u32) -> String {
    match remaining {
        0 => "No active DataItems".to_string(),
        1 => "1 active DataItem".to_string(),
        n => format!("{}/{} active DataItems", n, max),
    }
}

impl DemandCounter {
    /// Create a counter reporting to `notifier` at most once per `report_interval`.
    pub fn new(notifier: Arc<dyn StateChangeNotifier>, report_interval: Duration) -> Self {
        Self {
            state: LeveledMutex::with_default(LockLevel::NotifyTargetCount, "NotifyTargetCount"),
            notifier,
            report_interval,
        }
    }

    /// Current number of active targets.
    pub fn remaining(&self) -> u32 {
        self.state.lock().remaining
    }

    /// Highest count since the counter last dropped to zero.
    pub fn max(&self) -> u32 {
        self.state.lock().max
    }

    /// Register one more active target.
    pub fn inc(&self) {
        let mut state = self.state.lock();
        state.remaining += 1;
        state.max = state.max.max(state.remaining);
        self.report(&mut state, false);
    }

    /// Unregister an active target.
    pub fn dec(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.remaining > 0, "demand counter underflow");
        state.remaining = state.remaining.saturating_sub(1);
        let force = state.remaining == 0;
        self.report(&mut state, force);
        if state.remaining == 0 {
            state.max = 0;
        }
    }

    /// Suppress reports until the returned guard drops; a changed count is then reported once.
    pub fn notification_block(&self) -> NotificationBlock<'_> {
        let mut state = self.state.lock();
        if state.block_depth == 0 {
            state.count_at_block = state.remaining;
        }
        state.block_depth += 1;
        NotificationBlock { counter: self }
    }

    fn report(&self, state: &mut DemandState, force: bool) {
        if state.block_depth > 0 {
            return;
        }
        let now = Instant::now();
        if !force {
            if let Some(last) = state.last_report {
                if now.duration_since(last) < self.report_interval {
                    return;
                }
            }
        }
        state.last_report = Some(now);
        info!(
            remaining = state.remaining,
            max = state.max,
            "{}",
            demand_message(state.remaining, state.max)
        );
        self.notifier.on_demand_count(state.remaining, state.max);
    }

    fn leave_block(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.block_depth > 0);
        state.block_depth -= 1;
        if state.block_depth == 0 && state.remaining != state.count_at_block {
            self.report(&mut state, true);
        }
    }
}

/// Guard returned by [`DemandCounter::notification_block`].
#[must_use]
pub struct NotificationBlock<'a> {
    counter: &'a DemandCounter,
}

impl Drop for NotificationBlock<'_> {
    fn drop(&mut self) {
        self.counter.leave_block();
    }
}
