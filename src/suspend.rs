//! Cooperative suspension.
//!
//! The meta thread walks the graph on behalf of a caller that may want control back before the
//! walk completes (a UI that has input pending, a user cancelling). Nothing is preempted: long
//! walks poll [`SuspendController::must_suspend`] and return [`VisitState::SuspendedOrFailed`]
//! when it says so. Whatever was committed before the suspension stays committed, so callers
//! simply repeat the request after [`SuspendController::resume`].
//!
//! Blocker scopes turn suspension off for a region that has to complete in one go.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::ThreadId;

use tracing::{debug, warn};

use crate::demand::{DemandCounter, NotificationBlock};

/// Maximum number of warnings reported between two resumes.
pub const MAX_REPORTED_WARNINGS: usize = 4;

/// Outcome of a suspendible step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum VisitState {
    /// The step completed.
    Ready,
    /// The step was suspended or failed; inspect the failure state to tell which.
    SuspendedOrFailed,
}

impl VisitState {
    /// Returns `true` for [`VisitState::Ready`].
    pub fn is_ready(self) -> bool {
        self == VisitState::Ready
    }
}

/// Hook telling the controller whether user input is waiting.
pub type WaitingMessagesHook = Box<dyn Fn() -> bool + Send + Sync>;

/// Suspension state of one session.
pub struct SuspendController {
    meta_thread: ThreadId,
    last_result: AtomicBool,
    must_suspend: AtomicBool,
    progress_made: AtomicBool,
    suspend_level: AtomicU32,
    block_level: AtomicU32,
    reported_warnings: AtomicUsize,
    waiting_messages: Option<WaitingMessagesHook>,
}

impl std::fmt::Debug for SuspendController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendController")
            .field("last_result", &self.last_result.load(Ordering::Relaxed))
            .field("must_suspend", &self.must_suspend.load(Ordering::Relaxed))
            .field("progress_made", &self.progress_made.load(Ordering::Relaxed))
            .field("suspend_level", &self.suspend_level.load(Ordering::Relaxed))
            .field("block_level", &self.block_level.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SuspendController {
    /// Create a controller owned by `meta_thread`.
    pub fn new(meta_thread: ThreadId, waiting_messages: Option<WaitingMessagesHook>) -> Self {
        Self {
            meta_thread,
            last_result: AtomicBool::new(false),
            must_suspend: AtomicBool::new(false),
            progress_made: AtomicBool::new(false),
            suspend_level: AtomicU32::new(0),
            block_level: AtomicU32::new(0),
            reported_warnings: AtomicUsize::new(0),
            waiting_messages,
        }
    }

    fn on_meta_thread(&self) -> bool {
        std::thread::current().id() == self.meta_thread
    }

    /// Whether suspension is currently disabled. Always `true` off the meta thread.
    pub fn is_blocked(&self) -> bool {
        !self.on_meta_thread() || self.block_level.load(Ordering::Acquire) > 0
    }

    /// Whether the running walk should stop now.
    ///
    /// Once this returned `true` it keeps doing so until [`resume`](Self::resume). Before any
    /// progress was made since the last resume it returns `false`, so every walk gets somewhere.
    pub fn must_suspend(&self) -> bool {
        if self.is_blocked() {
            return false;
        }
        if self.last_result.load(Ordering::Acquire) {
            return true;
        }
        if !self.progress_made.load(Ordering::Acquire) {
            return false;
        }
        if self.must_suspend.swap(false, Ordering::AcqRel) {
            self.last_result.store(true, Ordering::Release);
            return true;
        }
        let waiting = self.waiting_messages.as_ref().is_some_and(|hook| hook());
        if self.suspend_level.load(Ordering::Acquire) > 0 || waiting {
            self.last_result.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Whether the last walk stopped because of a suspension.
    pub fn did_suspend(&self) -> bool {
        !self.is_blocked() && self.last_result.load(Ordering::Acquire)
    }

    /// Request a suspension at the next check.
    pub fn do_suspend(&self) {
        self.must_suspend.store(true, Ordering::Release);
    }

    /// Clear all suspension state before starting a new walk.
    pub fn resume(&self) {
        self.last_result.store(false, Ordering::Release);
        self.progress_made.store(false, Ordering::Release);
        self.must_suspend.store(false, Ordering::Release);
        let reported = self.reported_warnings.swap(0, Ordering::AcqRel);
        if reported > MAX_REPORTED_WARNINGS {
            debug!("Skipped {} warnings.....", reported - MAX_REPORTED_WARNINGS);
        }
    }

    /// Record that some actor's progress increased.
    pub fn mark_progress(&self) {
        if !self.is_blocked() {
            self.progress_made.store(true, Ordering::Release);
        }
    }

    /// Whether any progress was recorded since the last resume.
    pub fn progress_made(&self) -> bool {
        self.progress_made.load(Ordering::Acquire)
    }

    /// Count a warning report; returns `false` when it should be skipped.
    pub fn admit_warning(&self) -> bool {
        self.reported_warnings.fetch_add(1, Ordering::AcqRel) < MAX_REPORTED_WARNINGS
    }

    /// Force [`must_suspend`](Self::must_suspend) to report `true` while the guard lives.
    pub fn suspend_level(&self) -> SuspendLevel<'_> {
        self.suspend_level.fetch_add(1, Ordering::AcqRel);
        SuspendLevel { controller: self }
    }

    fn enter_block(&self) -> bool {
        if !self.on_meta_thread() {
            return false;
        }
        self.block_level.fetch_add(1, Ordering::AcqRel) == 0
    }

    fn leave_block(&self) {
        self.block_level.fetch_sub(1, Ordering::AcqRel);
    }

    /// Open a blocker scope of the given kind.
    pub fn blocker<'a>(
        &'a self,
        kind: BlockerKind,
        demand: &'a DemandCounter,
    ) -> SuspendBlocker<'a> {
        let on_meta = self.on_meta_thread();
        let outermost = self.enter_block();
        let notification = (on_meta && outermost && kind != BlockerKind::Plain)
            .then(|| demand.notification_block());
        let fence = (on_meta && kind == BlockerKind::Fenced).then(|| demand.remaining());
        SuspendBlocker {
            controller: self,
            demand,
            on_meta,
            fence,
            _notification: notification,
        }
    }
}

/// Guard returned by [`SuspendController::suspend_level`].
#[must_use]
pub struct SuspendLevel<'a> {
    controller: &'a SuspendController,
}

impl Drop for SuspendLevel<'_> {
    fn drop(&mut self) {
        self.controller.suspend_level.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Kinds of blocker scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockerKind {
    /// Only disables suspension.
    Plain,
    /// Also silences demand reports while it is the outermost blocker.
    Silent,
    /// Silent, and warns when interest acquired inside the scope outlives it.
    Fenced,
}

/// A scope during which [`SuspendController::must_suspend`] returns `false`.
#[must_use]
pub struct SuspendBlocker<'a> {
    controller: &'a SuspendController,
    demand: &'a DemandCounter,
    on_meta: bool,
    fence: Option<u32>,
    _notification: Option<NotificationBlock<'a>>,
}

impl Drop for SuspendBlocker<'_> {
    fn drop(&mut self) {
        if let Some(before) = self.fence {
            let after = self.demand.remaining();
            if after > before {
                warn!(
                    before,
                    after, "interest acquired inside a fenced scope outlived it"
                );
            }
        }
        if self.on_meta {
            self.controller.leave_block();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use std::sync::Arc;
    use std::time::Duration;

    fn controller() -> SuspendController {
        SuspendController::new(std::thread::current().id(), None)
    }

    fn demand() -> DemandCounter {
        DemandCounter::new(Arc::new(NoopNotifier), Duration::ZERO)
    }

    #[test]
    fn test_no_suspend_without_progress() {
        let c = controller();
        c.do_suspend();
        assert!(!c.must_suspend());
        c.mark_progress();
        assert!(c.must_suspend());
        assert!(c.did_suspend());
    }

    #[test]
    fn test_sticky_until_resume() {
        let c = controller();
        c.mark_progress();
        c.do_suspend();
        assert!(c.must_suspend());
        assert!(c.must_suspend());
        c.resume();
        assert!(!c.must_suspend());
        assert!(!c.did_suspend());
        assert!(!c.progress_made());
    }

    #[test]
    fn test_blocker_disables() {
        let c = controller();
        let d = demand();
        c.mark_progress();
        c.do_suspend();
        {
            let _b = c.blocker(BlockerKind::Plain, &d);
            c.mark_progress();
            assert!(!c.must_suspend());
            assert!(!c.did_suspend());
            {
                let _nested = c.blocker(BlockerKind::Fenced, &d);
                assert!(c.is_blocked());
            }
            assert!(c.is_blocked());
        }
        assert!(!c.is_blocked());
        assert!(c.must_suspend());
    }

    #[test]
    fn test_suspend_level_and_hook() {
        let c = controller();
        c.mark_progress();
        {
            let _level = c.suspend_level();
            assert!(c.must_suspend());
        }
        c.resume();
        c.mark_progress();
        assert!(!c.must_suspend());

        let hooked = SuspendController::new(std::thread::current().id(), Some(Box::new(|| true)));
        hooked.mark_progress();
        assert!(hooked.must_suspend());
    }

    #[test]
    fn test_other_thread_is_blocked() {
        let c = Arc::new(controller());
        c.mark_progress();
        c.do_suspend();
        let remote = c.clone();
        let (blocked, must) =
            std::thread::spawn(move || (remote.is_blocked(), remote.must_suspend()))
                .join()
                .unwrap();
        assert!(blocked);
        assert!(!must);
    }

    #[test]
    fn test_warning_throttle() {
        let c = controller();
        let admitted = (0..10).filter(|_| c.admit_warning()).count();
        assert_eq!(admitted, MAX_REPORTED_WARNINGS);
        c.resume();
        assert!(c.admit_warning());
    }
}
