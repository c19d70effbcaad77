//! Path resolution.
//!
//! Paths are `/` separated. A leading `/` starts at the root, `.` stays and `..` goes to the
//! parent. The first plain segment of a relative path is looked up in scope: in the item
//! itself, then in each ancestor. Later segments name direct sub-items. Lookups that find no
//! sub-item fall back to the sub-items of the referred item.

use std::sync::Arc;

use super::TreeItem;
use crate::error::{ActorError, ActorResult};
use crate::session::Session;

/// Upper bound on referred-item hops followed by one lookup.
const MAX_REFERRAL_DEPTH: usize = 64;

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

impl TreeItem {
    /// The sub-item called `name`, following referred items when this item has none.
    pub fn get_item(&self, name: &str) -> Option<Arc<TreeItem>> {
        if let Some(child) = self.get_child(name) {
            return Some(child);
        }
        let mut referred = self.referred_item();
        for _ in 0..MAX_REFERRAL_DEPTH {
            let item = referred?;
            if let Some(child) = item.get_child(name) {
                return Some(child);
            }
            referred = item.referred_item();
        }
        None
    }

    fn find_in_scope(self: &Arc<Self>, name: &str) -> Option<Arc<TreeItem>> {
        let mut scope = Some(self.clone());
        while let Some(item) = scope {
            if let Some(found) = item.get_item(name) {
                return Some(found);
            }
            scope = item.parent();
        }
        None
    }

    /// Resolve `path` relative to this item.
    pub fn find_item(self: &Arc<Self>, path: &str) -> Option<Arc<TreeItem>> {
        let absolute = path.starts_with('/');
        let mut current = if absolute { self.root() } else { self.clone() };
        let mut in_scope = !absolute;
        for segment in segments(path) {
            current = match segment {
                "." => current,
                ".." => current.parent()?,
                name if in_scope => current.find_in_scope(name)?,
                name => current.get_item(name)?,
            };
            in_scope = false;
        }
        Some(current)
    }

    /// Resolve `path`, failing with [`ActorError::ItemNotFound`].
    pub fn find_item_or_err(self: &Arc<Self>, path: &str) -> ActorResult<Arc<TreeItem>> {
        self.find_item(path).ok_or_else(|| ActorError::ItemNotFound {
            path: path.to_string(),
        })
    }

    /// Resolve `path` as direct sub-items, creating the missing ones.
    ///
    /// Only allowed inside [`Session::creation_context`].
    pub fn create_item_from_path(
        self: &Arc<Self>,
        session: &Session,
        path: &str,
    ) -> ActorResult<Arc<TreeItem>> {
        if !session.in_creation_context() {
            return Err(ActorError::CreationOutsideContext);
        }
        let mut current = if path.starts_with('/') {
            self.root()
        } else {
            self.clone()
        };
        for segment in segments(path) {
            current = match segment {
                "." => current,
                ".." => current.parent().ok_or_else(|| ActorError::ItemNotFound {
                    path: path.to_string(),
                })?,
                name => match current.get_child(name) {
                    Some(child) => child,
                    None => current.create_child(session, name)?,
                },
            };
        }
        Ok(current)
    }

    /// The path from the root, e.g. `/a/b`. The root itself has an empty full name.
    pub fn full_name(&self) -> String {
        let Some(mut parent) = self.parent() else {
            return String::new();
        };
        let mut names = vec![self.name().to_string()];
        while let Some(grand_parent) = parent.parent() {
            names.push(parent.name().to_string());
            parent = grand_parent;
        }
        names.iter().rev().map(|name| format!("/{name}")).collect()
    }

    /// The path of this item relative to `base`, if `base` is an ancestor.
    pub fn relative_name(&self, base: &TreeItem) -> Option<String> {
        let own = self.full_name();
        let base = base.full_name();
        if base.is_empty() {
            return Some(own.trim_start_matches('/').to_string());
        }
        own.strip_prefix(&base)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
    }
}
