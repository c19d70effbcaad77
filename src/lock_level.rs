//! Leveled locks.
//!
//! Every mutex in this crate carries a [`LockLevel`]. A thread may only acquire a lock whose
//! level is strictly deeper than the deepest level it already holds, so a lock-order deadlock
//! cannot be written without tripping the check. [`LockLevel::ActorSection`] is the single
//! exception: sections of *different* actors may nest, because interest acquisition walks from a
//! dependent into its suppliers while the dependent's section is held.
//!
//! Violations are programming errors and panic.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

/// Lock levels, ordered from outer to inner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    /// Per-actor section guarding the 0→1 and 1→0 interest edges. Outermost.
    ActorSection = 1,
    /// Child lists of tree items.
    TreeFlags,
    /// The session's registry of pinned configuration roots.
    ItemRegister,
    /// The fail-reason side table.
    FailSection,
    /// The supplier-interest map.
    MoveSupplInterest,
    /// The demand counter.
    NotifyTargetCount,
    /// Interest counts. Innermost.
    CountSection,
}

impl LockLevel {
    fn nests(self) -> bool {
        matches!(self, LockLevel::ActorSection)
    }
}

#[derive(Clone, Copy)]
struct Held {
    level: LockLevel,
    key: usize,
    name: &'static str,
}

thread_local! {
    static HELD_LOCKS: RefCell<Vec<Held>> = const { RefCell::new(Vec::new()) };
}

fn enter_level(level: LockLevel, key: usize, name: &'static str) {
    HELD_LOCKS.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(top) = held.last() {
            let allowed =
                top.level < level || (top.level == level && level.nests() && top.key != key);
            if !allowed {
                panic!(
                    "lock order violation: acquiring {} ({:?}) while holding {} ({:?})",
                    name, level, top.name, top.level
                );
            }
        }
        held.push(Held { level, key, name });
    });
}

fn leave_level(key: usize) {
    HELD_LOCKS.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|h| h.key == key) {
            held.remove(pos);
        }
    });
}

/// Number of leveled locks held by the current thread.
pub fn held_lock_count() -> usize {
    HELD_LOCKS.with(|held| held.borrow().len())
}

/// Deepest level held by the current thread.
pub fn deepest_held_level() -> Option<LockLevel> {
    HELD_LOCKS.with(|held| held.borrow().last().map(|h| h.level))
}

/// A `parking_lot` mutex tagged with a [`LockLevel`].
pub struct LeveledMutex<T> {
    level: LockLevel,
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> LeveledMutex<T> {
    /// Create a mutex at `level`; `name` shows up in violation messages.
    pub const fn new(level: LockLevel, name: &'static str, value: T) -> Self {
        Self {
            level,
            name,
            inner: Mutex::new(value),
        }
    }

    /// The level of this mutex.
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Acquire the mutex, checking the level order first.
    pub fn lock(&self) -> LeveledGuard<'_, T> {
        let key = self as *const Self as usize;
        enter_level(self.level, key, self.name);
        LeveledGuard {
            key,
            guard: self.inner.lock(),
        }
    }

    /// Consume the mutex and return the value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> LeveledMutex<T> {
    /// Create a mutex holding `T::default()`.
    pub fn with_default(level: LockLevel, name: &'static str) -> Self {
        Self::new(level, name, T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for LeveledMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeveledMutex")
            .field("level", &self.level)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`LeveledMutex::lock`].
pub struct LeveledGuard<'a, T> {
    key: usize,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for LeveledGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LeveledGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for LeveledGuard<'_, T> {
    fn drop(&mut self) {
        leave_level(self.key);
    }
}
