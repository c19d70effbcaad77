//! Tree item status flags and their propagation to descendants.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use super::TreeItem;

bitflags! {
    /// Status flags of a [`TreeItem`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TreeItemStatus: u32 {
        /// Part of a cache subtree.
        const IS_CACHE_ITEM = 1 << 0;
        /// Created by the system rather than by configuration.
        const IS_ENDOGENOUS = 1 << 1;
        /// Pinned in the session's item register.
        const AUTO_DELETE_DISABLED = 1 << 2;
        /// Derived data is kept when demand drops.
        const KEEP_DATA = 1 << 3;
        /// Derived data is written to storage on commit.
        const STORE_DATA = 1 << 4;
        /// Data may be freed after use.
        const FREE_DATA = 1 << 5;
        /// Hidden by itself.
        const IS_HIDDEN = 1 << 6;
        /// Hidden by itself or by an ancestor.
        const IN_HIDDEN = 1 << 7;
        /// A template definition.
        const IS_TEMPLATE = 1 << 8;
        /// A template or inside one.
        const IN_TEMPLATE = 1 << 9;
        /// An alias kept for backward compatibility.
        const DEPRECATED = 1 << 10;

        /// Flags a new child copies from its parent.
        const INHERITED = Self::IN_TEMPLATE.bits()
            | Self::IS_CACHE_ITEM.bits()
            | Self::IN_HIDDEN.bits()
            | Self::KEEP_DATA.bits()
            | Self::FREE_DATA.bits()
            | Self::STORE_DATA.bits()
            | Self::AUTO_DELETE_DISABLED.bits();
    }
}

#[derive(Debug, Default)]
pub(crate) struct AtomicStatus(AtomicU32);

impl AtomicStatus {
    pub fn new(status: TreeItemStatus) -> Self {
        Self(AtomicU32::new(status.bits()))
    }

    pub fn get(&self) -> TreeItemStatus {
        TreeItemStatus::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub fn contains(&self, flag: TreeItemStatus) -> bool {
        self.get().contains(flag)
    }

    /// Set or clear `flag`; returns whether anything changed.
    pub fn set(&self, flag: TreeItemStatus, value: bool) -> bool {
        let previous = if value {
            self.0.fetch_or(flag.bits(), Ordering::AcqRel)
        } else {
            self.0.fetch_and(!flag.bits(), Ordering::AcqRel)
        };
        TreeItemStatus::from_bits_truncate(previous).contains(flag) != value
    }
}

/// Set `flag` on `root` and all its descendants.
///
/// With an `own` flag, the propagated value is `inherited || item has own`, so a descendant that
/// sets `own` by itself keeps the flag even when an ancestor clears it. Subtrees whose value did
/// not change are skipped. Returns the items whose flag changed, in pre-order.
pub(crate) fn propagate(
    root: &Arc<TreeItem>,
    flag: TreeItemStatus,
    own: Option<TreeItemStatus>,
    inherited: bool,
) -> Vec<Arc<TreeItem>> {
    let mut changed = Vec::new();
    let mut stack = vec![(root.clone(), inherited)];
    while let Some((item, inherited)) = stack.pop() {
        let value = inherited || own.is_some_and(|own| item.status.contains(own));
        if !item.status.set(flag, value) {
            continue;
        }
        for child in item.children().into_iter().rev() {
            stack.push((child, value));
        }
        changed.push(item);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_reports_change() {
        let status = AtomicStatus::default();
        assert!(status.set(TreeItemStatus::KEEP_DATA, true));
        assert!(!status.set(TreeItemStatus::KEEP_DATA, true));
        assert!(status.contains(TreeItemStatus::KEEP_DATA));
        assert!(status.set(TreeItemStatus::KEEP_DATA, false));
        assert!(!status.set(TreeItemStatus::KEEP_DATA, false));
    }

    #[test]
    fn test_inherited_mask() {
        let inherited = TreeItemStatus::INHERITED;
        assert!(inherited.contains(TreeItemStatus::IN_HIDDEN));
        assert!(!inherited.contains(TreeItemStatus::IS_HIDDEN));
        assert!(!inherited.contains(TreeItemStatus::IS_ENDOGENOUS));
        assert!(!inherited.contains(TreeItemStatus::DEPRECATED));
    }
}
