//! Named, hierarchically contained actors.
//!
//! A [`TreeItem`] is an [`Actor`] that lives in a namespace. Besides its parent it can depend on
//! domain and values units, explicitly added suppliers, the items named by its calculation rule
//! and integrity check, and a referred item whose result it aliases.
//!
//! # Ownership
//!
//! A child keeps its parent alive; a parent only knows its children by name. An item that is
//! not referenced any more frees itself (auto-delete) unless it is pinned with
//! [`TreeItem::disable_auto_delete`], which is what configuration trees do.
//!
//! # Data
//!
//! Payloads are `Arc<dyn Any + Send + Sync>`. Source items get theirs through
//! [`TreeItem::set_data`]; derived items compute it during commit from their calculator, their
//! storage manager or their referred item, and drop it again when demand goes away.

mod flags;
mod path;
mod storage;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::actor::{
    base, Actor, ActorCore, ActorExt, ActorRef, FailType, ProgressState, SupplierFailure,
    SupplierVisitFlags, SupplierVisitor, TransState, UpdateLock,
};
use crate::clock::TimeStamp;
use crate::error::{ActorError, ActorResult, FailReason};
use crate::garbage::Garbage;
use crate::lock_level::{LeveledMutex, LockLevel};
use crate::notify::NotificationCode;
use crate::session::Session;
use crate::suspend::VisitState;

pub use flags::TreeItemStatus;
pub use storage::{ReadLock, StorageManager, WriteLock};

use flags::{propagate, AtomicStatus};

/// An item payload.
pub type DataValue = Arc<dyn Any + Send + Sync>;

/// A parsed calculation rule.
pub trait Calculator: Send + Sync + fmt::Debug + 'static {
    /// The expression this calculator was parsed from.
    fn expr(&self) -> &str;

    /// Paths of the items the calculation reads, resolved relative to the calculated item.
    fn supplier_names(&self) -> &[String];

    /// Compute the payload of `item`. `suppliers` matches [`supplier_names`](Self::supplier_names)
    /// and every supplier is committed.
    fn calculate(&self, item: &TreeItem, suppliers: &[Arc<TreeItem>])
        -> anyhow::Result<DataValue>;
}

/// Turns expressions into calculators.
pub trait CalculatorFactory: Send + Sync + 'static {
    /// Parse `expr`, the calculation rule or integrity check of `item`.
    fn parse(&self, item: &TreeItem, expr: &str) -> anyhow::Result<Arc<dyn Calculator>>;
}

#[derive(Debug, Default)]
struct Resolved {
    calculator: Option<Arc<dyn Calculator>>,
    suppliers: Vec<Weak<TreeItem>>,
    check: Option<Arc<dyn Calculator>>,
    check_suppliers: Vec<Weak<TreeItem>>,
}

fn upgrade_all(items: &[Weak<TreeItem>]) -> ActorResult<Vec<Arc<TreeItem>>> {
    items
        .iter()
        .map(|item| {
            item.upgrade().ok_or_else(|| ActorError::ItemNotFound {
                path: "<deleted item>".to_string(),
            })
        })
        .collect()
}

fn validate_name(name: &str) -> ActorResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(ActorError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// A named node of the model namespace.
pub struct TreeItem {
    core: ActorCore,
    name: String,
    self_ref: Weak<TreeItem>,
    parent: Option<Arc<TreeItem>>,
    children: LeveledMutex<Vec<(String, Weak<TreeItem>)>>,
    status: AtomicStatus,
    expr: RwLock<String>,
    integrity_check: RwLock<Option<String>>,
    resolved: RwLock<Option<Arc<Resolved>>>,
    explicit_suppliers: RwLock<Vec<Weak<TreeItem>>>,
    domain_unit: RwLock<Weak<TreeItem>>,
    values_unit: RwLock<Weak<TreeItem>>,
    referred: RwLock<Option<Arc<TreeItem>>>,
    back_ref: RwLock<Weak<TreeItem>>,
    storage: RwLock<Option<Arc<dyn StorageManager>>>,
    data: RwLock<Option<DataValue>>,
    pin_key: Mutex<Option<usize>>,
}

impl fmt::Debug for TreeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeItem")
            .field("name", &self.source_name())
            .field("core", &self.core)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl TreeItem {
    fn new(
        session: &Session,
        name: &str,
        parent: Option<Arc<TreeItem>>,
        status: TreeItemStatus,
    ) -> Arc<Self> {
        let passor = status.contains(TreeItemStatus::IN_TEMPLATE)
            || parent.as_ref().is_some_and(|p| p.core.is_passor());
        Arc::new_cyclic(|self_ref| TreeItem {
            core: if passor {
                ActorCore::new_passor(session)
            } else {
                ActorCore::new(session)
            },
            name: name.to_string(),
            self_ref: self_ref.clone(),
            parent,
            children: LeveledMutex::new(LockLevel::TreeFlags, "TreeFlags", Vec::new()),
            status: AtomicStatus::new(status),
            expr: RwLock::new(String::new()),
            integrity_check: RwLock::new(None),
            resolved: RwLock::new(None),
            explicit_suppliers: RwLock::new(Vec::new()),
            domain_unit: RwLock::new(Weak::new()),
            values_unit: RwLock::new(Weak::new()),
            referred: RwLock::new(None),
            back_ref: RwLock::new(Weak::new()),
            storage: RwLock::new(None),
            data: RwLock::new(None),
            pin_key: Mutex::new(None),
        })
    }

    /// Create a root item.
    pub fn create_root(session: &Session, name: &str) -> Arc<TreeItem> {
        let root = TreeItem::new(session, name, None, TreeItemStatus::empty());
        debug!(root = name, "created root");
        root
    }

    /// Create a sub-item called `name`.
    ///
    /// The child inherits [`TreeItemStatus::INHERITED`] flags and passor-ness from this item; a
    /// child of a pinned item is pinned as well.
    pub fn create_child(
        self: &Arc<Self>,
        session: &Session,
        name: &str,
    ) -> ActorResult<Arc<TreeItem>> {
        validate_name(name)?;
        let mut status = self.status.get() & TreeItemStatus::INHERITED;
        if status.contains(TreeItemStatus::IS_CACHE_ITEM) {
            status |= TreeItemStatus::IS_ENDOGENOUS;
        }
        let child = {
            let mut children = self.children.lock();
            if children
                .iter()
                .any(|(existing, child)| existing == name && child.strong_count() > 0)
            {
                return Err(ActorError::DuplicateName {
                    name: name.to_string(),
                });
            }
            children.retain(|(_, child)| child.strong_count() > 0);
            let child = TreeItem::new(session, name, Some(self.clone()), status);
            children.push((name.to_string(), Arc::downgrade(&child)));
            child
        };
        if status.contains(TreeItemStatus::AUTO_DELETE_DISABLED) {
            child.pin(session);
        }
        self.notify(session, NotificationCode::NewSubItem);
        Ok(child)
    }

    /// The item's own name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The containing item.
    pub fn parent(&self) -> Option<Arc<TreeItem>> {
        self.parent.clone()
    }

    /// The root of the tree this item is in.
    pub fn root(self: &Arc<Self>) -> Arc<TreeItem> {
        let mut root = self.clone();
        while let Some(parent) = root.parent() {
            root = parent;
        }
        root
    }

    /// Live sub-items in creation order.
    pub fn children(&self) -> Vec<Arc<TreeItem>> {
        self.children
            .lock()
            .iter()
            .filter_map(|(_, child)| child.upgrade())
            .collect()
    }

    /// The sub-item called `name`, without following referred items.
    pub fn get_child(&self, name: &str) -> Option<Arc<TreeItem>> {
        self.children
            .lock()
            .iter()
            .filter(|(existing, _)| existing == name)
            .find_map(|(_, child)| child.upgrade())
    }

    /// The first sub-item.
    pub fn first_child(&self) -> Option<Arc<TreeItem>> {
        self.children
            .lock()
            .iter()
            .find_map(|(_, child)| child.upgrade())
    }

    /// The sub-item of the parent that was created after this one.
    pub fn next_sibling(&self) -> Option<Arc<TreeItem>> {
        let siblings = self.parent.as_ref()?.children.lock();
        let position = siblings
            .iter()
            .position(|(_, sibling)| std::ptr::eq(sibling.as_ptr(), self))?;
        let next = siblings[position + 1..]
            .iter()
            .find_map(|(_, sibling)| sibling.upgrade());
        next
    }

    /// This item and all its descendants, parents before children.
    pub fn subtree(self: &Arc<Self>) -> Vec<Arc<TreeItem>> {
        let mut items = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(item) = stack.pop() {
            stack.extend(item.children().into_iter().rev());
            items.push(item);
        }
        items
    }

    /// Current status flags.
    pub fn status(&self) -> TreeItemStatus {
        self.status.get()
    }

    fn self_arc(&self) -> ActorResult<Arc<TreeItem>> {
        self.self_ref.upgrade().ok_or_else(|| ActorError::ItemNotFound {
            path: self.source_name(),
        })
    }

    fn notify(&self, session: &Session, code: NotificationCode) {
        session
            .notifier()
            .on_state_change(&self.source_name(), code);
    }

    // ==================== configuration ====================

    /// The calculation rule.
    pub fn expr(&self) -> String {
        self.expr.read().clone()
    }

    /// Replace the calculation rule. The calculator is rebuilt lazily.
    pub fn set_expr(&self, session: &Session, expr: impl Into<String>) {
        let expr = expr.into();
        if *self.expr.read() == expr {
            return;
        }
        *self.expr.write() = expr;
        *self.resolved.write() = None;
        self.invalidate(session);
    }

    /// Replace the integrity check, an expression that must evaluate to `true` for the item to
    /// validate.
    pub fn set_integrity_check(&self, session: &Session, expr: Option<String>) {
        *self.integrity_check.write() = expr;
        *self.resolved.write() = None;
        self.invalidate(session);
    }

    /// Add an explicit supplier.
    pub fn add_supplier(&self, session: &Session, supplier: &Arc<TreeItem>) {
        self.explicit_suppliers
            .write()
            .push(Arc::downgrade(supplier));
        self.invalidate(session);
    }

    /// Explicit suppliers that are still alive.
    pub fn explicit_suppliers(&self) -> Vec<Arc<TreeItem>> {
        self.explicit_suppliers
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Set the domain unit of a data-bearing item.
    pub fn set_domain_unit(&self, session: &Session, unit: &Arc<TreeItem>) {
        *self.domain_unit.write() = Arc::downgrade(unit);
        self.invalidate(session);
    }

    /// Set the values unit of a data-bearing item.
    pub fn set_values_unit(&self, session: &Session, unit: &Arc<TreeItem>) {
        *self.values_unit.write() = Arc::downgrade(unit);
        self.invalidate(session);
    }

    /// The domain unit.
    pub fn domain_unit(&self) -> Option<Arc<TreeItem>> {
        self.domain_unit.read().upgrade()
    }

    /// The values unit.
    pub fn values_unit(&self) -> Option<Arc<TreeItem>> {
        self.values_unit.read().upgrade()
    }

    /// Mark this item as a deprecated alias of its referred item.
    pub fn set_deprecated(&self, value: bool) {
        self.status.set(TreeItemStatus::DEPRECATED, value);
    }

    /// Attach a storage manager. Roots cannot have one.
    pub fn set_storage_manager(
        &self,
        session: &Session,
        manager: Option<Arc<dyn StorageManager>>,
    ) -> ActorResult<()> {
        if self.parent.is_none() {
            if let Some(manager) = &manager {
                return Err(ActorError::StorageManagerOnRoot {
                    name: manager.name().to_string(),
                });
            }
        }
        *self.storage.write() = manager;
        self.invalidate(session);
        Ok(())
    }

    /// The storage manager attached to this item.
    pub fn storage_manager(&self) -> Option<Arc<dyn StorageManager>> {
        self.storage.read().clone()
    }

    /// The storage manager serving this item: its own, or the nearest ancestor's.
    pub fn storage_parent_manager(&self) -> Option<Arc<dyn StorageManager>> {
        if let Some(manager) = self.storage_manager() {
            return Some(manager);
        }
        let mut ancestor = self.parent();
        while let Some(item) = ancestor {
            if let Some(manager) = item.storage_manager() {
                return Some(manager);
            }
            ancestor = item.parent();
        }
        None
    }

    // ==================== referred item ====================

    /// The item whose result this item aliases.
    pub fn referred_item(&self) -> Option<Arc<TreeItem>> {
        self.referred.read().clone()
    }

    /// The item that refers to this cache root.
    pub fn back_ref(&self) -> Option<Arc<TreeItem>> {
        self.back_ref.read().upgrade()
    }

    /// Alias the result of `target`, or stop aliasing.
    ///
    /// While this item is in demand, interest moves from the old target to the new one: the new
    /// target is acquired before the swap, the old one released after it.
    pub fn set_referred_item(
        self: &Arc<Self>,
        session: &Session,
        target: Option<Arc<TreeItem>>,
    ) -> ActorResult<()> {
        let same = match (&*self.referred.read(), &target) {
            (Some(current), Some(target)) => Arc::ptr_eq(current, target),
            (None, None) => true,
            _ => false,
        };
        if same {
            return Ok(());
        }
        let previous = loop {
            let in_demand = self.core.interest_count() > 0;
            if in_demand {
                if let Some(target) = &target {
                    target.inc_interest(session)?;
                }
            }
            let swapped = {
                let _count = session.count_section();
                if (self.core.interest_count() > 0) == in_demand {
                    Some(std::mem::replace(&mut *self.referred.write(), target.clone()))
                } else {
                    None
                }
            };
            match swapped {
                Some(previous) => break previous.map(|previous| (previous, in_demand)),
                None => {
                    if let (true, Some(target)) = (in_demand, &target) {
                        drop(Garbage::release(session, target.clone()));
                    }
                }
            }
        };

        let mut garbage = Garbage::new();
        if let Some((previous, held)) = previous {
            if previous.is_cache_root()
                && previous.back_ref().is_some_and(|b| Arc::ptr_eq(&b, self))
            {
                *previous.back_ref.write() = Weak::new();
            }
            if held {
                garbage.merge(Garbage::release(session, previous));
            } else {
                garbage.defer(previous);
            }
        }
        if let Some(target) = &target {
            if target.is_cache_root() {
                *target.back_ref.write() = Arc::downgrade(self);
            }
            target.determine_state(session);
            if self.status.contains(TreeItemStatus::KEEP_DATA) {
                target.set_keep_data(session, true);
            }
        }
        self.invalidate(session);
        drop(garbage);
        Ok(())
    }

    fn is_cache_root(&self) -> bool {
        self.status.contains(TreeItemStatus::IS_CACHE_ITEM)
            && !self
                .parent
                .as_ref()
                .is_some_and(|p| p.status.contains(TreeItemStatus::IS_CACHE_ITEM))
    }

    // ==================== data ====================

    /// Whether the payload is computed rather than set.
    pub fn is_derived(&self) -> bool {
        !self.expr.read().is_empty()
            || self.referred.read().is_some()
            || self.storage_parent_manager().is_some()
    }

    /// The current payload.
    pub fn data(&self) -> Option<DataValue> {
        self.data.read().clone()
    }

    /// The current payload downcast to `T`.
    pub fn data_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data().and_then(|value| value.downcast::<T>().ok())
    }

    /// Replace the payload of a source item. Dependents see the change.
    pub fn set_data(&self, session: &Session, value: DataValue) {
        self.invalidate(session);
        *self.data.write() = Some(value);
    }

    fn is_part_of_interest(&self) -> bool {
        if self.core.interest_count() > 0 {
            return true;
        }
        if !self.status.contains(TreeItemStatus::IS_CACHE_ITEM) {
            return false;
        }
        let mut ancestor = self.parent();
        while let Some(item) = ancestor {
            if item.core.interest_count() > 0 {
                return true;
            }
            ancestor = item.parent();
        }
        false
    }

    /// Drop the derived payload if nothing needs it. Progress falls back to
    /// [`ProgressState::MetaInfoReady`] so the payload is recomputed on the next update.
    ///
    /// Cache sub-items are cleaned up together with their cache root.
    pub fn try_cleanup_mem(&self, session: &Session) {
        if self.status.contains(TreeItemStatus::IS_CACHE_ITEM) && !self.is_cache_root() {
            return;
        }
        if !self.cleanup_own_data(session)
            || !self.status.contains(TreeItemStatus::IS_CACHE_ITEM)
        {
            return;
        }
        let mut stack = self.children();
        while let Some(item) = stack.pop() {
            if item.cleanup_own_data(session) {
                stack.extend(item.children());
            }
        }
    }

    /// Returns `false` when the item is still needed.
    fn cleanup_own_data(&self, session: &Session) -> bool {
        if self.is_part_of_interest() || self.status.contains(TreeItemStatus::KEEP_DATA) {
            return false;
        }
        if self.is_derived() && self.data.write().take().is_some() {
            self.core.demote_progress(ProgressState::MetaInfoReady);
            debug!(item = %self.source_name(), "released data");
            self.notify(session, NotificationCode::DataReleased);
        }
        true
    }

    // ==================== status flags ====================

    /// Hide or unhide this item; descendants follow through [`TreeItemStatus::IN_HIDDEN`].
    pub fn set_is_hidden(self: &Arc<Self>, value: bool) {
        self.status.set(TreeItemStatus::IS_HIDDEN, value);
        let inherited = self
            .parent
            .as_ref()
            .is_some_and(|p| p.status.contains(TreeItemStatus::IN_HIDDEN));
        propagate(
            self,
            TreeItemStatus::IN_HIDDEN,
            Some(TreeItemStatus::IS_HIDDEN),
            inherited,
        );
    }

    /// Whether this item or an ancestor is hidden.
    pub fn in_hidden(&self) -> bool {
        self.status.contains(TreeItemStatus::IN_HIDDEN)
    }

    /// Mark this item as a template. Templates and everything inside them are passors.
    pub fn set_is_template(self: &Arc<Self>, value: bool) {
        self.status.set(TreeItemStatus::IS_TEMPLATE, value);
        let inherited = self
            .parent
            .as_ref()
            .is_some_and(|p| p.status.contains(TreeItemStatus::IN_TEMPLATE));
        let changed = propagate(
            self,
            TreeItemStatus::IN_TEMPLATE,
            Some(TreeItemStatus::IS_TEMPLATE),
            inherited,
        );
        for item in changed {
            let in_template = item.status.contains(TreeItemStatus::IN_TEMPLATE);
            item.core.set_passor(in_template);
        }
    }

    /// Whether this item is a template or inside one.
    pub fn in_template(&self) -> bool {
        self.status.contains(TreeItemStatus::IN_TEMPLATE)
    }

    /// Keep derived data of the subtree when demand drops. Clearing the flag releases data
    /// that is no longer needed; setting it also keeps the data of referred items.
    pub fn set_keep_data(self: &Arc<Self>, session: &Session, value: bool) {
        let changed = propagate(self, TreeItemStatus::KEEP_DATA, None, value);
        for item in changed {
            if value {
                if let Some(referred) = item.referred_item() {
                    referred.set_keep_data(session, true);
                }
            } else {
                item.try_cleanup_mem(session);
            }
        }
    }

    /// Whether derived data is kept.
    pub fn keeps_data(&self) -> bool {
        self.status.contains(TreeItemStatus::KEEP_DATA)
    }

    /// Write derived data of the subtree to storage on commit.
    pub fn set_store_data(self: &Arc<Self>, value: bool) {
        propagate(self, TreeItemStatus::STORE_DATA, None, value);
    }

    /// Allow data of the subtree to be freed after use.
    pub fn set_free_data(self: &Arc<Self>, value: bool) {
        propagate(self, TreeItemStatus::FREE_DATA, None, value);
    }

    /// Turn this root into a cache root: the subtree is marked as endogenous cache items and
    /// pinned.
    pub fn set_is_cache_item(self: &Arc<Self>, session: &Session) {
        for item in propagate(self, TreeItemStatus::IS_CACHE_ITEM, None, true) {
            item.status.set(TreeItemStatus::IS_ENDOGENOUS, true);
        }
        self.disable_auto_delete(session);
    }

    // ==================== lifetime ====================

    fn pin(self: &Arc<Self>, session: &Session) {
        let mut key = self.pin_key.lock();
        if key.is_none() {
            *key = Some(session.pin(self.clone()));
        }
    }

    /// Pin this item and its subtree so they outlive their last reference.
    pub fn disable_auto_delete(self: &Arc<Self>, session: &Session) {
        for item in self.subtree() {
            item.status.set(TreeItemStatus::AUTO_DELETE_DISABLED, true);
            item.pin(session);
        }
    }

    /// Release the pins of this subtree.
    ///
    /// Keep-data flags of the subtree and its referred items are reset first, so demand can drop
    /// to zero. Pins are released bottom-up afterwards; the unpinned items are returned in the
    /// garbage and free themselves when it is dropped and nothing else refers to them.
    pub fn enable_auto_delete(self: &Arc<Self>, session: &Session) -> Garbage {
        let subtree = self.subtree();
        for item in &subtree {
            let targets = std::iter::once(item.clone()).chain(item.referred_item());
            for target in targets {
                if target.status.set(TreeItemStatus::KEEP_DATA, false) {
                    target.notify(session, NotificationCode::KeepDataReleased);
                    target.try_cleanup_mem(session);
                }
            }
        }

        let mut garbage = Garbage::new();
        for item in subtree.iter().rev() {
            item.status.set(TreeItemStatus::AUTO_DELETE_DISABLED, false);
            let key = item.pin_key.lock().take();
            if let Some(pinned) = key.and_then(|key| session.unpin(key)) {
                item.notify(session, NotificationCode::PinReleased);
                garbage.defer(pinned);
            }
        }

        if self.parent.is_none() {
            *self.back_ref.write() = Weak::new();
            for item in &subtree {
                *item.resolved.write() = None;
            }
        }
        garbage
    }

    /// Detach the sub-item called `name`.
    ///
    /// The child's interest on this item and on its referred item is released and its pins are
    /// dropped; it frees itself once the returned garbage is dropped and nothing else refers to
    /// it.
    pub fn remove_item(self: &Arc<Self>, session: &Session, name: &str) -> ActorResult<Garbage> {
        let child = self.get_child(name).ok_or_else(|| ActorError::ItemNotFound {
            path: name.to_string(),
        })?;
        self.children.lock().retain(|(existing, _)| existing != name);
        child.set_referred_item(session, None)?;
        let mut garbage = child.move_suppl_interest(session);
        garbage.merge(child.enable_auto_delete(session));
        debug!(item = %child.source_name(), "removed");
        garbage.defer(child);
        Ok(garbage)
    }

    /// Tear down this configuration root, or detach this item from its parent.
    pub fn remove_from_config(self: &Arc<Self>, session: &Session) -> ActorResult<Garbage> {
        match &self.parent {
            None => Ok(self.enable_auto_delete(session)),
            Some(parent) => parent.remove_item(session, &self.name),
        }
    }

    // ==================== meta-info ====================

    fn resolved(&self, session: &Session) -> ActorResult<Arc<Resolved>> {
        if let Some(resolved) = self.resolved.read().clone() {
            return Ok(resolved);
        }
        let this = self.self_arc()?;
        let parse = |expr: &str| -> ActorResult<(Arc<dyn Calculator>, Vec<Weak<TreeItem>>)> {
            let factory = session.calculator_factory().ok_or_else(|| {
                ActorError::from(anyhow::anyhow!(
                    "no calculator factory to parse '{}'",
                    expr
                ))
            })?;
            let calculator = factory.parse(self, expr)?;
            let suppliers = calculator
                .supplier_names()
                .iter()
                .map(|name| this.find_item_or_err(name).map(|item| Arc::downgrade(&item)))
                .collect::<ActorResult<Vec<_>>>()?;
            Ok((calculator, suppliers))
        };

        let mut resolved = Resolved::default();
        let expr = self.expr();
        if !expr.is_empty() {
            let (calculator, suppliers) = parse(&expr)?;
            resolved.calculator = Some(calculator);
            resolved.suppliers = suppliers;
        }
        if let Some(check) = self.integrity_check.read().clone() {
            let (calculator, suppliers) = parse(&check)?;
            resolved.check = Some(calculator);
            resolved.check_suppliers = suppliers;
        }
        let resolved = Arc::new(resolved);
        *self.resolved.write() = Some(resolved.clone());
        Ok(resolved)
    }

    fn named_suppliers(&self, session: &Session) -> ActorResult<Vec<Arc<TreeItem>>> {
        let mut suppliers: Vec<_> = [self.domain_unit(), self.values_unit()]
            .into_iter()
            .flatten()
            .collect();
        suppliers.extend(self.explicit_suppliers());
        let resolved = self.resolved(session)?;
        suppliers.extend(upgrade_all(&resolved.suppliers)?);
        suppliers.extend(upgrade_all(&resolved.check_suppliers)?);
        Ok(suppliers)
    }

    /// Derive the result shape: the parent's meta-info, the meta-info of all named suppliers,
    /// the calculator and the referred item's meta-info.
    pub fn update_meta_info(&self, session: &Session) -> ActorResult<()> {
        let core = &self.core;
        if core.trans_state() == TransState::UpdatingMetaInfo {
            return Err(ActorError::MetaInfoRecursion);
        }
        if let Some(parent) = &self.parent {
            parent.update_meta_info(session)?;
        }
        self.determine_state(session);
        if self.was_failed(session, FailType::MetaInfo) {
            return Err(self.throw_fail(session));
        }
        if core.progress() >= ProgressState::MetaInfoReady {
            return Ok(());
        }
        if core.is_passor() {
            self.set_progress(session, ProgressState::MetaInfoReady);
            return Ok(());
        }
        let result = UpdateLock::enter(self, session, TransState::UpdatingMetaInfo)
            .and_then(|_lock| self.derive_meta_info(session));
        match result {
            Ok(()) => {
                self.set_progress(session, ProgressState::MetaInfoReady);
                Ok(())
            }
            Err(err) => {
                self.catch_fail(session, &err, FailType::MetaInfo);
                Err(err)
            }
        }
    }

    fn derive_meta_info(&self, session: &Session) -> ActorResult<()> {
        for supplier in self.named_suppliers(session)? {
            if supplier.status.contains(TreeItemStatus::DEPRECATED) {
                if let Some(target) = supplier.referred_item() {
                    if session.suspend().admit_warning() {
                        let alias = supplier.source_name();
                        let target = target.source_name();
                        warn!(
                            "'{}' refers by '{}' to '{}'\nReplace '{}' by '{}'.",
                            self.source_name(),
                            alias,
                            target,
                            alias,
                            target
                        );
                    }
                }
            }
            supplier.update_meta_info(session)?;
        }
        if let Some(referred) = self.referred_item() {
            referred.update_meta_info(session)?;
            if self.status.contains(TreeItemStatus::IS_CACHE_ITEM) {
                self.copy_sub_items(session, &referred)?;
            }
        }
        Ok(())
    }

    /// Mirror the visible sub-items of `source` as sub-items referring to them.
    fn copy_sub_items(&self, session: &Session, source: &Arc<TreeItem>) -> ActorResult<()> {
        let this = self.self_arc()?;
        for sub_item in source.children() {
            if sub_item.in_hidden() {
                continue;
            }
            let copy = match this.get_child(sub_item.name()) {
                Some(existing) => existing,
                None => this.create_child(session, sub_item.name())?,
            };
            copy.set_referred_item(session, Some(sub_item))?;
        }
        Ok(())
    }

    // ==================== data calculation ====================

    fn ensure_data(&self, resolved: &Resolved) -> ActorResult<()> {
        if self.data.read().is_some() {
            return Ok(());
        }
        if let Some(calculator) = &resolved.calculator {
            let suppliers = upgrade_all(&resolved.suppliers)?;
            let value = calculator.calculate(self, &suppliers)?;
            *self.data.write() = Some(value);
            return Ok(());
        }
        if let Some(manager) = self.storage_parent_manager() {
            let mut lock = ReadLock {
                slot: self.data.write(),
            };
            return manager
                .read_item(self, &mut lock)
                .map_err(ActorError::storage);
        }
        if let Some(referred) = self.referred_item() {
            *self.data.write() = referred.data();
        }
        Ok(())
    }

    fn check_integrity(
        &self,
        check: &dyn Calculator,
        suppliers: &[Weak<TreeItem>],
    ) -> ActorResult<bool> {
        let suppliers = upgrade_all(suppliers)?;
        let value = check.calculate(self, &suppliers)?;
        value.downcast_ref::<bool>().copied().ok_or_else(|| {
            ActorError::from(anyhow::anyhow!(
                "integrity check '{}' did not produce a boolean",
                check.expr()
            ))
        })
    }

    fn store(&self) -> ActorResult<()> {
        let Some(manager) = self.storage_parent_manager() else {
            return Ok(());
        };
        let lock = WriteLock {
            slot: self.data.read(),
        };
        manager.write_item(self, &lock).map_err(ActorError::storage)
    }
}

impl Actor for TreeItem {
    fn core(&self) -> &ActorCore {
        &self.core
    }

    fn source_name(&self) -> String {
        if self.parent.is_none() {
            return self.name.clone();
        }
        self.full_name()
    }

    fn visit_suppliers(
        &self,
        session: &Session,
        flags: SupplierVisitFlags,
        visitor: &mut SupplierVisitor<'_>,
    ) -> ActorResult<VisitState> {
        let mut visit = |item: Arc<TreeItem>| -> ActorResult<bool> {
            let actor: ActorRef = item;
            Ok(visitor(&actor)?.is_ready())
        };
        if flags.contains(SupplierVisitFlags::PARENT) {
            if let Some(parent) = &self.parent {
                if !visit(parent.clone())? {
                    return Ok(VisitState::SuspendedOrFailed);
                }
            }
            if self.in_template() {
                return Ok(VisitState::Ready);
            }
        }
        if flags.contains(SupplierVisitFlags::SIGNATURE) {
            for unit in [self.domain_unit(), self.values_unit()].into_iter().flatten() {
                if !visit(unit)? {
                    return Ok(VisitState::SuspendedOrFailed);
                }
            }
        }
        if flags.contains(SupplierVisitFlags::EXPLICIT) {
            for supplier in self.explicit_suppliers() {
                if !visit(supplier)? {
                    return Ok(VisitState::SuspendedOrFailed);
                }
            }
        }
        if flags.contains(SupplierVisitFlags::CALCULATOR) {
            let resolved = self.resolved(session)?;
            let suppliers = upgrade_all(&resolved.suppliers)?
                .into_iter()
                .chain(upgrade_all(&resolved.check_suppliers)?);
            for supplier in suppliers {
                if !visit(supplier)? {
                    return Ok(VisitState::SuspendedOrFailed);
                }
            }
        }
        if flags.contains(SupplierVisitFlags::REFERRED) {
            if let Some(referred) = self.referred_item() {
                if !visit(referred)? {
                    return Ok(VisitState::SuspendedOrFailed);
                }
            }
        }
        Ok(VisitState::Ready)
    }

    fn prepare_update(&self, session: &Session) -> ActorResult<()> {
        self.update_meta_info(session)
    }

    fn do_update(&self, session: &Session, ps: ProgressState) -> ActorResult<VisitState> {
        let resolved = self.resolved(session)?;
        {
            let _lock = UpdateLock::enter(self, session, TransState::CalculatingData)?;
            if let Err(err) = self.ensure_data(&resolved) {
                self.catch_fail(session, &err, FailType::Data);
                return Ok(VisitState::SuspendedOrFailed);
            }
        }
        let pending_check = resolved
            .check
            .as_ref()
            .filter(|_| self.core.progress() < ProgressState::Validated);
        if let Some(check) = pending_check {
            match self.check_integrity(check.as_ref(), &resolved.check_suppliers) {
                Ok(true) => {}
                Ok(false) => {
                    self.fail(
                        session,
                        format!("integrity check '{}' failed", check.expr()),
                        FailType::Validate,
                    );
                    return Ok(VisitState::SuspendedOrFailed);
                }
                Err(err) => {
                    self.catch_fail(session, &err, FailType::Validate);
                    return Ok(VisitState::SuspendedOrFailed);
                }
            }
        }
        if ps == ProgressState::Committed && self.status.contains(TreeItemStatus::STORE_DATA) {
            self.store()?;
        }
        Ok(VisitState::Ready)
    }

    fn do_invalidate(&self, session: &Session) {
        *self.resolved.write() = None;
        if self.is_derived() {
            self.data.write().take();
        }
        self.notify(session, NotificationCode::Invalidated);
        base::do_invalidate(self, session);
    }

    fn do_fail(&self, session: &Session, reason: FailReason, ft: FailType) -> bool {
        if !base::do_fail(self, session, reason.clone(), ft) {
            return false;
        }
        self.notify(session, NotificationCode::Failed(ft));
        if self.status.contains(TreeItemStatus::IS_CACHE_ITEM) {
            for child in self.children() {
                child.do_fail(session, reason.clone(), ft);
            }
        }
        true
    }

    fn determine_last_supplier_change(
        &self,
        session: &Session,
        failure: &mut SupplierFailure,
    ) -> TimeStamp {
        let last = base::determine_last_supplier_change(self, session, failure);
        let stored = self
            .storage_parent_manager()
            .and_then(|manager| manager.last_change(self));
        last.max(stored.unwrap_or_default())
    }

    fn start_interest(&self, session: &Session) -> ActorResult<()> {
        self.update_meta_info(session)?;
        let referred = self.referred_item();
        if let Some(referred) = &referred {
            referred.inc_interest(session)?;
        }
        let started = base::start_interest(self, session);
        if started.is_err() {
            if let Some(referred) = referred {
                drop(Garbage::release(session, referred));
            }
        }
        started
    }

    fn stop_interest(&self, session: &Session) -> Garbage {
        let mut garbage = base::stop_interest(self, session);
        if let Some(referred) = self.referred_item() {
            garbage.merge(Garbage::release(session, referred));
        }
        self.try_cleanup_mem(session);
        garbage
    }

    fn on_progress(&self, session: &Session, ps: ProgressState) {
        let code = match ps {
            ProgressState::None => return,
            ProgressState::MetaInfoReady => NotificationCode::MetaInfoReady,
            ProgressState::Validated => NotificationCode::Validated,
            ProgressState::Committed => NotificationCode::Committed,
        };
        self.notify(session, code);
    }
}

impl Drop for TreeItem {
    fn drop(&mut self) {
        let Some(session) = self.core.session() else {
            return;
        };
        self.notify(&session, NotificationCode::Deleting);
        if self.core.interest_count() > 0 {
            // the last handle went away while still in demand
            debug!(item = %self.source_name(), "deleted with interest");
            let mut garbage = self.move_suppl_interest(&session);
            if let Some(referred) = self.referred.get_mut().take() {
                garbage.merge(Garbage::release(&session, referred));
            }
            drop(garbage);
        }
        if let Some(parent) = &self.parent {
            parent
                .children
                .lock()
                .retain(|(_, child)| child.strong_count() > 0);
        }
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<TreeItem>();
    assert_sync::<TreeItem>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_child_inherits_flags() {
        let session = Session::new();
        let root = TreeItem::create_root(&session, "root");
        let config = root.create_child(&session, "config").unwrap();
        config.set_is_hidden(true);
        config.set_store_data(true);
        let leaf = config.create_child(&session, "leaf").unwrap();
        assert!(leaf.in_hidden());
        assert!(!leaf.status().contains(TreeItemStatus::IS_HIDDEN));
        assert!(leaf.status().contains(TreeItemStatus::STORE_DATA));
        assert!(!root.in_hidden());
    }

    #[test]
    fn test_duplicate_and_invalid_names() {
        let session = Session::new();
        let root = TreeItem::create_root(&session, "root");
        let _a = root.create_child(&session, "a").unwrap();
        assert!(matches!(
            root.create_child(&session, "a"),
            Err(ActorError::DuplicateName { .. })
        ));
        for name in ["", ".", "..", "a/b"] {
            assert!(matches!(
                root.create_child(&session, name),
                Err(ActorError::InvalidName { .. })
            ));
        }
    }

    #[test]
    fn test_unreferenced_child_frees_itself() {
        let session = Session::new();
        let root = TreeItem::create_root(&session, "root");
        drop(root.create_child(&session, "temp").unwrap());
        assert!(root.get_child("temp").is_none());
        assert!(root.children().is_empty());
        // the name is free again
        let _temp = root.create_child(&session, "temp").unwrap();
    }

    #[test]
    fn test_navigation() {
        let session = Session::new();
        let root = TreeItem::create_root(&session, "root");
        let a = root.create_child(&session, "a").unwrap();
        let b = root.create_child(&session, "b").unwrap();
        assert!(Arc::ptr_eq(&root.first_child().unwrap(), &a));
        assert!(Arc::ptr_eq(&a.next_sibling().unwrap(), &b));
        assert!(b.next_sibling().is_none());
        assert!(Arc::ptr_eq(&b.root(), &root));
        assert_eq!(root.subtree().len(), 3);
    }

    #[test]
    fn test_sibling_walk_matches_children() {
        let session = Session::new();
        let root = TreeItem::create_root(&session, "root");
        let items = ["p", "q", "r", "s"]
            .into_iter()
            .map(|name| root.create_child(&session, name).unwrap())
            .collect::<Vec<_>>();

        let mut walked = Vec::new();
        let mut next = root.first_child();
        while let Some(item) = next {
            next = item.next_sibling();
            walked.push(item);
        }
        assert_eq!(walked.len(), items.len());
        assert!(walked.iter().zip(&items).all(|(a, b)| Arc::ptr_eq(a, b)));
    }

    #[test]
    fn test_hidden_propagation_respects_own_flag() {
        let session = Session::new();
        let root = TreeItem::create_root(&session, "root");
        let a = root.create_child(&session, "a").unwrap();
        let b = a.create_child(&session, "b").unwrap();
        b.set_is_hidden(true);
        a.set_is_hidden(true);
        assert!(b.in_hidden());
        a.set_is_hidden(false);
        assert!(!a.in_hidden());
        assert!(b.in_hidden());
    }

    #[test]
    fn test_template_items_are_passors() {
        let session = Session::new();
        let root = TreeItem::create_root(&session, "root");
        let template = root.create_child(&session, "template").unwrap();
        let inner = template.create_child(&session, "inner").unwrap();
        template.set_is_template(true);
        assert!(template.core().is_passor());
        assert!(inner.core().is_passor());
        let late = template.create_child(&session, "late").unwrap();
        assert!(late.in_template());
        assert!(late.core().is_passor());
        template.set_is_template(false);
        assert!(!inner.core().is_passor());
    }

    #[test]
    fn test_storage_manager_rejected_on_root() {
        #[derive(Debug)]
        struct Null;
        impl StorageManager for Null {
            fn name(&self) -> &str {
                "null"
            }
            fn read_item(&self, _: &TreeItem, _: &mut ReadLock<'_>) -> anyhow::Result<()> {
                Ok(())
            }
            fn write_item(&self, _: &TreeItem, _: &WriteLock<'_>) -> anyhow::Result<()> {
                Ok(())
            }
        }
        let session = Session::new();
        let root = TreeItem::create_root(&session, "root");
        let err = root
            .set_storage_manager(&session, Some(Arc::new(Null)))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "StorageManager 'null' on root item is not allowed"
        );
        let child = root.create_child(&session, "child").unwrap();
        child
            .set_storage_manager(&session, Some(Arc::new(Null)))
            .unwrap();
        assert!(child.create_child(&session, "sub").unwrap().is_derived());
    }

    #[test]
    fn test_pins_keep_items_alive() {
        let session = Session::new();
        let root = TreeItem::create_root(&session, "root");
        root.disable_auto_delete(&session);
        drop(root.create_child(&session, "kept").unwrap());
        assert!(root.get_child("kept").is_some());
        assert_eq!(session.pinned_count(), 2);
        assert_eq!(session.config_roots().len(), 1);

        drop(root.enable_auto_delete(&session));
        assert_eq!(session.pinned_count(), 0);
        assert!(root.get_child("kept").is_none());
    }
}
