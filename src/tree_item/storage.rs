//! The boundary to storage managers.

use std::fmt;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use super::{DataValue, TreeItem};
use crate::clock::TimeStamp;

/// Reads and writes item payloads from and to some external store.
///
/// Attached to a non-root item with [`TreeItem::set_storage_manager`]; it then serves that item
/// and every descendant that has no storage manager of its own.
pub trait StorageManager: Send + Sync + fmt::Debug + 'static {
    /// Name used in messages.
    fn name(&self) -> &str;

    /// Fill the payload of `item`. The payload slot is locked, so `item.data()` must not be called
    /// from here.
    fn read_item(&self, item: &TreeItem, lock: &mut ReadLock<'_>) -> anyhow::Result<()>;

    /// Persist the payload of `item`.
    fn write_item(&self, item: &TreeItem, lock: &WriteLock<'_>) -> anyhow::Result<()>;

    /// Timestamp at which the stored source of `item` last changed, if the store tracks that.
    ///
    /// A value newer than the item's own change timestamp invalidates it.
    #[inline]
    fn last_change(&self, item: &TreeItem) -> Option<TimeStamp> {
        let _ = item;
        None
    }
}

/// Exclusive access to an item's payload slot while it is being read from storage.
pub struct ReadLock<'a> {
    pub(super) slot: RwLockWriteGuard<'a, Option<DataValue>>,
}

impl ReadLock<'_> {
    /// Store the payload that was read.
    pub fn set(&mut self, value: DataValue) {
        *self.slot = Some(value);
    }

    /// Whether a payload has been stored.
    pub fn is_set(&self) -> bool {
        self.slot.is_some()
    }
}

/// Shared access to an item's payload while it is being written to storage.
pub struct WriteLock<'a> {
    pub(super) slot: RwLockReadGuard<'a, Option<DataValue>>,
}

impl WriteLock<'_> {
    /// The payload to persist.
    pub fn data(&self) -> Option<&DataValue> {
        self.slot.as_ref()
    }

    /// The payload downcast to `T`.
    pub fn data_as<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.slot.as_ref().and_then(|value| value.downcast_ref::<T>())
    }
}
