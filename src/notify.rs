//! State change notifications.
//!
//! A [`StateChangeNotifier`] observes the lifecycle of tree items and the demand counter. Every
//! method has an empty default body, so implementations only override what they need; the
//! default [`NoopNotifier`] costs nothing.
//!
//! # Example
//!
//! ```
//! use dms_actor::{NotificationCode, Session, StateChangeNotifier};
//! use std::sync::Arc;
//!
//! struct PrintNotifier;
//!
//! impl StateChangeNotifier for PrintNotifier {
//!     fn on_state_change(&self, item: &str, code: NotificationCode) {
//!         println!("{item}: {code:?}");
//!     }
//! }
//!
//! let session = Session::builder().notifier(Arc::new(PrintNotifier)).build();
//! # drop(session);
//! ```

use crate::actor::FailType;

/// What happened to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationCode {
    /// The item object is about to be freed.
    Deleting,
    /// A child was added.
    NewSubItem,
    /// Meta-info became available.
    MetaInfoReady,
    /// Data passed validation.
    Validated,
    /// Data was committed.
    Committed,
    /// The item was invalidated.
    Invalidated,
    /// A failure was recorded.
    Failed(FailType),
    /// A derived payload was dropped.
    DataReleased,
    /// The keep-data flag was cleared during teardown.
    KeepDataReleased,
    /// An auto-delete pin was released.
    PinReleased,
}

/// Observer for item state changes and demand counts.
///
/// Implementations must not take any lock of this crate: notifications may be sent while a
/// leveled lock is held.
pub trait StateChangeNotifier: Send + Sync + 'static {
    /// Called when an item changes state.
    #[inline]
    fn on_state_change(&self, item: &str, code: NotificationCode) {
        let _ = (item, code);
    }

    /// Called when the number of actively computed items is reported.
    #[inline]
    fn on_demand_count(&self, active: u32, max: u32) {
        let _ = (active, max);
    }
}

/// Notifier that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl StateChangeNotifier for NoopNotifier {}
