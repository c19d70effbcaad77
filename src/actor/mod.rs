//! Incrementally updated graph nodes.
//!
//! An [`Actor`] is one node of the dependency graph. Implementors embed an [`ActorCore`] and
//! declare their dependency edges through [`Actor::visit_suppliers`]. The update protocol,
//! invalidation, failure bookkeeping and interest counting live in [`ActorExt`], which every
//! actor gets through a blanket implementation.
//!
//! Hooks that have a default body delegate to the functions in [`base`], so an override can
//! extend the default behaviour instead of replacing it.
//!
//! # Progress
//!
//! Progress only moves forward (`None → MetaInfoReady → Validated → Committed`) until the actor
//! is invalidated. Invalidation happens lazily: [`ActorExt::determine_state`] compares the
//! actor's last change timestamp with those of its suppliers and resets the actor when a
//! supplier changed after it.
//!
//! # Interest
//!
//! While an actor's interest count is positive it keeps interest on all of its non-passor
//! suppliers, recorded as a chain in the session. The 0→1 edge builds that chain, the 1→0 edge
//! hands it back as [`Garbage`].

pub mod base;
mod state;

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use crate::clock::TimeStamp;
use crate::error::{ActorError, ActorResult, FailReason};
use crate::garbage::Garbage;
use crate::lock_level::{LeveledMutex, LockLevel};
use crate::session::{Session, WeakSession};
use crate::suspend::{BlockerKind, VisitState};

pub(crate) use state::StateWord;
pub use state::{ActorFlags, FailType, ProgressState, TransState};

/// Shared handle to any actor.
pub type ActorRef = Arc<dyn Actor>;

/// Session-unique actor identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorId(pub u64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor#{}", self.0)
    }
}

bitflags! {
    /// Selects which categories of dependency edges a supplier visit includes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SupplierVisitFlags: u32 {
        /// The containing parent.
        const PARENT = 1 << 0;
        /// Domain and values units of data-bearing items.
        const SIGNATURE = 1 << 1;
        /// Explicitly configured suppliers.
        const EXPLICIT = 1 << 2;
        /// Items named by the calculation rule and the integrity check.
        const CALCULATOR = 1 << 3;
        /// The referred item.
        const REFERRED = 1 << 4;

        /// Suppliers whose meta-info an item needs before its own.
        const NAMED_SUPPLIERS = Self::SIGNATURE.bits() | Self::EXPLICIT.bits() | Self::CALCULATOR.bits();
        /// Suppliers kept alive while an item is in demand.
        const START_SUPPL_INTEREST = Self::PARENT.bits() | Self::NAMED_SUPPLIERS.bits();
        /// Suppliers consulted for change detection.
        const DETERMINE_STATE = Self::START_SUPPL_INTEREST.bits() | Self::REFERRED.bits();
        /// Suppliers brought up to date before an item's own update.
        const UPDATE = Self::DETERMINE_STATE.bits();
    }
}

/// Callback passed to [`Actor::visit_suppliers`]. Returning
/// [`VisitState::SuspendedOrFailed`] stops the walk.
pub type SupplierVisitor<'a> = dyn FnMut(&ActorRef) -> ActorResult<VisitState> + 'a;

/// The state every actor embeds.
pub struct ActorCore {
    id: ActorId,
    pub(crate) state: StateWord,
    last_change_ts: AtomicU64,
    last_state_check_ts: AtomicU64,
    interest_count: AtomicU32,
    section: LeveledMutex<()>,
    session: WeakSession,
}

impl ActorCore {
    /// Create the core of a new actor in `session`.
    pub fn new(session: &Session) -> Self {
        Self {
            id: session.next_actor_id(),
            state: StateWord::default(),
            last_change_ts: AtomicU64::new(0),
            last_state_check_ts: AtomicU64::new(0),
            interest_count: AtomicU32::new(0),
            section: LeveledMutex::new(LockLevel::ActorSection, "ActorSection", ()),
            session: session.downgrade(),
        }
    }

    /// Create the core of an actor that never changes.
    pub fn new_passor(session: &Session) -> Self {
        let core = Self::new(session);
        core.state.insert_flags(ActorFlags::IS_PASSOR);
        core
    }

    /// The actor's identity.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// The owning session, unless it was dropped.
    pub fn session(&self) -> Option<Session> {
        self.session.upgrade()
    }

    /// Current progress.
    pub fn progress(&self) -> ProgressState {
        self.state.progress()
    }

    /// Active transient phase.
    pub fn trans_state(&self) -> TransState {
        self.state.trans()
    }

    /// Recorded failure kind.
    pub fn fail_type(&self) -> FailType {
        self.state.fail_type()
    }

    /// Boolean flags.
    pub fn flags(&self) -> ActorFlags {
        self.state.flags()
    }

    /// Whether the actor is exempt from invalidation and interest bookkeeping.
    pub fn is_passor(&self) -> bool {
        self.flags().contains(ActorFlags::IS_PASSOR)
    }

    /// Mark or unmark the actor as passor.
    pub fn set_passor(&self, value: bool) {
        if value {
            self.state.insert_flags(ActorFlags::IS_PASSOR);
        } else {
            self.state.remove_flags(ActorFlags::IS_PASSOR);
        }
    }

    /// Whether a supplier-interest chain is registered.
    pub fn has_suppl_interest(&self) -> bool {
        self.flags().contains(ActorFlags::SUPPL_INTEREST)
    }

    /// Block or unblock the release and re-derivation of supplier interest on invalidation.
    pub fn set_invalidation_block(&self, value: bool) {
        if value {
            self.state.insert_flags(ActorFlags::INVALIDATION_BLOCK);
        } else {
            self.state.remove_flags(ActorFlags::INVALIDATION_BLOCK);
        }
    }

    /// Timestamp of the last actual change.
    pub fn last_change_ts(&self) -> TimeStamp {
        self.last_change_ts.load(Ordering::Acquire)
    }

    /// Timestamp at which the state was last derived from suppliers.
    pub fn last_state_check_ts(&self) -> TimeStamp {
        self.last_state_check_ts.load(Ordering::Acquire)
    }

    /// Current interest count.
    pub fn interest_count(&self) -> u32 {
        self.interest_count.load(Ordering::Acquire)
    }

    fn set_last_change_ts(&self, ts: TimeStamp) {
        self.last_change_ts.store(ts, Ordering::Release);
    }

    fn set_last_state_check_ts(&self, ts: TimeStamp) {
        self.last_state_check_ts.store(ts, Ordering::Release);
    }

    /// Drop progress back to at most `ps` after derived data was discarded.
    pub(crate) fn demote_progress(&self, ps: ProgressState) {
        if self.progress() > ps {
            self.state.set_progress(ps);
        }
    }
}

impl fmt::Debug for ActorCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorCore")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("last_change_ts", &self.last_change_ts())
            .field("interest_count", &self.interest_count())
            .finish()
    }
}

impl Drop for ActorCore {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            drop(session.forget_actor(self.id));
        }
    }
}

/// A node of the dependency graph.
pub trait Actor: Send + Sync + fmt::Debug + 'static {
    /// The embedded state.
    fn core(&self) -> &ActorCore;

    /// Identity used in failure locations and log messages.
    fn source_name(&self) -> String {
        self.core().id().to_string()
    }

    /// Call `visitor` for every supplier in the categories selected by `flags`.
    ///
    /// The default actor has no suppliers.
    fn visit_suppliers(
        &self,
        session: &Session,
        flags: SupplierVisitFlags,
        visitor: &mut SupplierVisitor<'_>,
    ) -> ActorResult<VisitState> {
        let _ = (session, flags, visitor);
        Ok(VisitState::Ready)
    }

    /// Whether reaching a higher progress requires [`do_update`](Self::do_update).
    fn must_apply_impl(&self, session: &Session) -> bool {
        base::must_apply_impl(self, session)
    }

    /// Node-specific recomputation towards `ps`. Errors are recorded as failures.
    fn do_update(&self, session: &Session, ps: ProgressState) -> ActorResult<VisitState> {
        let _ = (session, ps);
        Ok(VisitState::Ready)
    }

    /// Work to do before every update, e.g. deriving meta-info.
    fn prepare_update(&self, session: &Session) -> ActorResult<()> {
        let _ = session;
        Ok(())
    }

    /// Called after an invalidation reset the state.
    fn do_invalidate(&self, session: &Session) {
        base::do_invalidate(self, session)
    }

    /// Record a failure. Returns `false` if an equally or more severe failure was recorded
    /// already.
    fn do_fail(&self, session: &Session, reason: FailReason, ft: FailType) -> bool {
        base::do_fail(self, session, reason, ft)
    }

    /// The newest change timestamp among the suppliers; the most severe supplier failure is
    /// collected into `failure`.
    fn determine_last_supplier_change(
        &self,
        session: &Session,
        failure: &mut SupplierFailure,
    ) -> TimeStamp {
        base::determine_last_supplier_change(self, session, failure)
    }

    /// Interest count goes from 0 to 1.
    fn start_interest(&self, session: &Session) -> ActorResult<()> {
        base::start_interest(self, session)
    }

    /// Interest count went from 1 to 0.
    fn stop_interest(&self, session: &Session) -> Garbage {
        base::stop_interest(self, session)
    }

    /// Progress increased to `ps`.
    fn on_progress(&self, session: &Session, ps: ProgressState) {
        let _ = (session, ps);
    }
}

/// The most severe failure seen among suppliers.
#[derive(Debug, Default)]
pub struct SupplierFailure {
    worst: Option<(FailReason, FailType)>,
}

impl SupplierFailure {
    /// Keep `reason` if it is more severe than what was recorded so far.
    pub fn record(&mut self, reason: FailReason, ft: FailType) {
        if ft == FailType::None {
            return;
        }
        match &self.worst {
            Some((_, worst)) if *worst <= ft => {}
            _ => self.worst = Some((reason, ft)),
        }
    }

    /// Consider the failure state of `supplier`.
    pub fn consider(&mut self, session: &Session, supplier: &dyn Actor) {
        let ft = supplier.core().fail_type();
        if ft == FailType::None {
            return;
        }
        if let Some(reason) = supplier.failure_reason(session) {
            self.record(reason, ft);
        }
    }

    /// Take the recorded failure.
    pub fn take(&mut self) -> Option<(FailReason, FailType)> {
        self.worst.take()
    }
}

/// Guard for a transient phase.
///
/// Entering requires the new phase to be strictly deeper than the active one; dropping restores
/// the previous phase.
#[derive(Debug)]
pub struct UpdateLock<'a> {
    core: &'a ActorCore,
    previous: TransState,
}

impl<'a> UpdateLock<'a> {
    /// Enter `phase` on `actor`.
    pub fn enter<A: Actor + ?Sized>(
        actor: &'a A,
        session: &Session,
        phase: TransState,
    ) -> ActorResult<Self> {
        if phase > TransState::DeterminingState && actor.was_failed(session, phase.fail_type()) {
            return Err(actor.throw_fail(session));
        }
        let core = actor.core();
        let previous = core.trans_state();
        if phase <= previous {
            return Err(ActorError::RecursiveDependency {
                requested: phase,
                active: previous,
            });
        }
        core.state.set_trans(phase);
        Ok(UpdateLock { core, previous })
    }
}

impl Drop for UpdateLock<'_> {
    fn drop(&mut self) {
        self.core.state.set_trans(self.previous);
    }
}

fn skipped(supplier: &ActorRef) -> bool {
    supplier.core().is_passor() || supplier.core().trans_state() == TransState::DeterminingCheck
}

/// Algorithms available on every actor.
pub trait ActorExt: Actor {
    /// Advance to `ps`. With `must_succeed`, suspension is blocked and a failure is returned as
    /// an error; otherwise `Ok(false)` signals suspension or failure.
    fn update(
        &self,
        session: &Session,
        ps: ProgressState,
        must_succeed: bool,
    ) -> ActorResult<bool> {
        if must_succeed {
            self.certain_update(session, ps)?;
            Ok(true)
        } else {
            Ok(self.suspendible_update(session, ps).is_ready())
        }
    }

    /// Advance to `ps` without allowing suspension.
    fn certain_update(&self, session: &Session, ps: ProgressState) -> ActorResult<()> {
        let _blocker = session.blocker(BlockerKind::Fenced);
        match self.suspendible_update(session, ps) {
            VisitState::Ready => Ok(()),
            VisitState::SuspendedOrFailed => Err(self.throw_fail(session)),
        }
    }

    /// Advance to `ps`, stopping early when the suspend controller asks for it.
    ///
    /// Errors never escape: they are recorded as failures and reported as
    /// [`VisitState::SuspendedOrFailed`].
    fn suspendible_update(&self, session: &Session, ps: ProgressState) -> VisitState {
        let core = self.core();
        if !session.is_meta_thread() {
            if core.progress() >= ps {
                return VisitState::Ready;
            }
            warn!(actor = %self.source_name(), "update requested outside the meta thread");
            return VisitState::SuspendedOrFailed;
        }
        if let Err(err) = self.prepare_update(session) {
            self.catch_fail(session, &err, FailType::MetaInfo);
            return VisitState::SuspendedOrFailed;
        }
        self.determine_state(session);

        if core.progress() > ps {
            return VisitState::Ready;
        }
        let ft = ps.blocking_fail_type();
        if self.was_failed(session, ft) {
            return VisitState::SuspendedOrFailed;
        }
        if core.progress() == ps || core.is_passor() {
            return VisitState::Ready;
        }
        if ps == ProgressState::MetaInfoReady {
            if self.was_failed(session, FailType::MetaInfo) {
                return VisitState::SuspendedOrFailed;
            }
            self.set_progress(session, ps);
            return VisitState::Ready;
        }
        if !self.must_apply_impl(session) {
            self.set_progress(session, ps);
            return VisitState::Ready;
        }

        let phase = if ps == ProgressState::Committed {
            TransState::Committing
        } else {
            TransState::Validating
        };
        let _lock = match UpdateLock::enter(self, session, phase) {
            Ok(lock) => lock,
            Err(err) => {
                self.catch_fail(session, &err, ft);
                return VisitState::SuspendedOrFailed;
            }
        };

        let suppliers = self.update_suppliers(session, ps);
        if self.was_failed(session, ft) || suppliers == VisitState::SuspendedOrFailed {
            return VisitState::SuspendedOrFailed;
        }
        if core.progress() >= ps {
            return VisitState::Ready;
        }

        let result = {
            let _source = session.clock().change_source(core.last_change_ts());
            if session.suspend().must_suspend() {
                VisitState::SuspendedOrFailed
            } else {
                match self.do_update(session, ps) {
                    Ok(_) if self.was_failed(session, FailType::Data) => {
                        VisitState::SuspendedOrFailed
                    }
                    Ok(state) => state,
                    Err(err) => {
                        self.catch_fail(session, &err, ft);
                        return VisitState::SuspendedOrFailed;
                    }
                }
            }
        };

        if result.is_ready() && core.progress() < ps {
            self.set_progress(session, ps);
            if !self.must_apply_impl(session) {
                // committed data needs nothing from its suppliers anymore
                drop(self.stop_suppl_interest(session));
            }
        }
        if self.was_failed(session, ft) || core.progress() < ps || session.suspend().did_suspend()
        {
            return VisitState::SuspendedOrFailed;
        }
        VisitState::Ready
    }

    /// Bring every supplier to `ps`, copying supplier failures onto this actor.
    fn update_suppliers(&self, session: &Session, ps: ProgressState) -> VisitState {
        let core = self.core();
        let ft = ps.blocking_fail_type();
        if !core.has_suppl_interest() && core.interest_count() > 0 && !core.is_passor() {
            // released by an earlier commit; suppliers must stay alive while they are updated
            if let Err(err) = self.start_suppl_interest(session) {
                self.catch_fail(session, &err, ft);
                return VisitState::SuspendedOrFailed;
            }
        }
        let visited = self.visit_suppliers(session, SupplierVisitFlags::UPDATE, &mut |supplier| {
            if skipped(supplier) {
                return Ok(VisitState::Ready);
            }
            if supplier.suspendible_update(session, ps).is_ready() {
                return Ok(VisitState::Ready);
            }
            if supplier.was_failed(session, ft) {
                self.fail_from(session, &**supplier);
            }
            Ok(VisitState::SuspendedOrFailed)
        });
        match visited {
            Ok(state) => state,
            Err(err) => {
                self.catch_fail(session, &err, ft);
                VisitState::SuspendedOrFailed
            }
        }
    }

    /// Re-derive validity from the suppliers, invalidating when one changed after this actor.
    ///
    /// Memoized per clock tick; only runs on the meta thread.
    fn determine_state(&self, session: &Session) {
        let core = self.core();
        if core.is_passor()
            || !session.is_meta_thread()
            || core.trans_state() == TransState::DeterminingCheck
        {
            return;
        }
        if core.last_state_check_ts() >= session.clock().peek() {
            return;
        }
        core.set_last_state_check_ts(session.clock().peek());

        loop {
            let mut failure = SupplierFailure::default();
            let last_supplier_change = {
                let _lock = match UpdateLock::enter(self, session, TransState::DeterminingState) {
                    Ok(lock) => lock,
                    Err(err) => {
                        self.catch_fail(session, &err, FailType::Determine);
                        return;
                    }
                };
                let _determine = session.clock().determine_change();
                core.set_last_state_check_ts(session.clock().last_ts());
                let ts = self.determine_last_supplier_change(session, &mut failure);
                core.set_last_state_check_ts(session.clock().last_ts());
                ts
            };

            let own = core.last_change_ts();
            if own < last_supplier_change {
                if own != 0 {
                    self.invalidate_at(session, last_supplier_change);
                    continue;
                }
                core.set_last_change_ts(last_supplier_change);
            }
            if let Some((reason, ft)) = failure.take() {
                self.do_fail(session, reason, ft);
            }
            return;
        }
    }

    /// The last change timestamp after bringing the state up to date.
    fn last_change_ts_determined(&self, session: &Session) -> TimeStamp {
        self.determine_state(session);
        self.core().last_change_ts()
    }

    /// Mark this actor changed as of now.
    fn invalidate(&self, session: &Session) {
        if self.core().last_change_ts() != 0 {
            self.invalidate_at(session, session.clock().active_ts());
        }
    }

    /// Reset progress and failure and stamp the actor changed at `ts`.
    ///
    /// Must not be called while the actor commits or calculates data.
    fn invalidate_at(&self, session: &Session, ts: TimeStamp) {
        let core = self.core();
        debug_assert!(!matches!(
            core.trans_state(),
            TransState::Committing | TransState::CalculatingData
        ));
        if core.last_change_ts() == ts {
            return;
        }
        self.clear_fail(session);
        core.state.set_progress(ProgressState::None);
        core.set_last_change_ts(ts);
        debug!(actor = %self.source_name(), ts, "invalidated");
        if core.flags().contains(ActorFlags::INVALIDATION_BLOCK) {
            return;
        }
        let previous = self.move_suppl_interest(session);
        self.do_invalidate(session);
        drop(previous);
    }

    /// Raise progress to `ps` if that is an increase.
    fn set_progress(&self, session: &Session, ps: ProgressState) {
        let core = self.core();
        if ps > core.progress() {
            core.state.set_progress(ps);
            session.suspend().mark_progress();
            self.on_progress(session, ps);
        }
    }

    /// Acquire one unit of interest.
    ///
    /// The 0→1 edge runs on the meta thread only: it determines state and starts interest on
    /// all suppliers.
    fn inc_interest(&self, session: &Session) -> ActorResult<()> {
        let core = self.core();
        if self.try_inc_interest(session) {
            return Ok(());
        }
        if !session.is_meta_thread() {
            return Err(ActorError::NotMetaThread);
        }
        let _phase = UpdateLock::enter(self, session, TransState::ChangingInterest)?;
        self.determine_state(session);

        let result = {
            let _section = core.section.lock();
            if self.try_inc_interest(session) {
                return Ok(());
            }
            let result = self.start_interest(session);
            if result.is_ok() {
                let _count = session.count_section();
                core.interest_count.fetch_add(1, Ordering::AcqRel);
            }
            result
        };
        match result {
            Ok(()) => {
                trace!(actor = %self.source_name(), "interest started");
                Ok(())
            }
            Err(err) => {
                self.catch_fail(session, &err, FailType::MetaInfo);
                Err(err)
            }
        }
    }

    /// Acquire interest only if the actor already has some. Safe on any thread.
    fn try_inc_interest(&self, session: &Session) -> bool {
        let core = self.core();
        let _count = session.count_section();
        if core.interest_count() == 0 {
            return false;
        }
        core.interest_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Release one unit of interest. The 1→0 edge stops supplier interest; the released
    /// interest comes back as garbage.
    fn dec_interest(&self, session: &Session) -> Garbage {
        let core = self.core();
        {
            let _count = session.count_section();
            match core.interest_count() {
                0 => {
                    warn!(actor = %self.source_name(), "interest released without being held");
                    return Garbage::new();
                }
                1 => {}
                _ => {
                    core.interest_count.fetch_sub(1, Ordering::AcqRel);
                    return Garbage::new();
                }
            }
        }
        let _section = core.section.lock();
        {
            let _count = session.count_section();
            let count = core.interest_count();
            if count == 0 {
                return Garbage::new();
            }
            core.interest_count.store(count - 1, Ordering::Release);
            if count > 1 {
                return Garbage::new();
            }
        }
        trace!(actor = %self.source_name(), "interest stopped");
        self.stop_interest(session)
    }

    /// Build and register the supplier-interest chain.
    fn start_suppl_interest(&self, session: &Session) -> ActorResult<()> {
        base::start_suppl_interest(self, session)
    }

    /// Unregister the supplier-interest chain.
    fn move_suppl_interest(&self, session: &Session) -> Garbage {
        let core = self.core();
        if !core.has_suppl_interest() {
            return Garbage::new();
        }
        let chain = {
            let mut map = session.suppl_interest();
            if !core.has_suppl_interest() {
                return Garbage::new();
            }
            let chain = map.remove(&core.id()).unwrap_or_default();
            session.demand().dec();
            core.state.remove_flags(ActorFlags::SUPPL_INTEREST);
            chain
        };
        Garbage::interest(session, chain)
    }

    /// Release supplier interest once no further computation needs it.
    fn stop_suppl_interest(&self, session: &Session) -> Garbage {
        self.move_suppl_interest(session)
    }

    /// Record a failure with a fresh reason.
    fn fail(&self, session: &Session, why: impl Into<String>, ft: FailType) -> bool
    where
        Self: Sized,
    {
        self.do_fail(session, FailReason::new(why), ft)
    }

    /// Copy the failure of `supplier` onto this actor, at the supplier's kind.
    fn fail_from(&self, session: &Session, supplier: &dyn Actor) -> bool {
        match supplier.failure_reason(session) {
            Some(reason) => self.do_fail(session, reason, supplier.core().fail_type()),
            None => false,
        }
    }

    /// Record a caught error as a failure of kind `ft` unless already failed at that kind.
    fn catch_fail(&self, session: &Session, err: &ActorError, ft: FailType) {
        if !self.was_failed(session, ft) {
            self.do_fail(session, err.fail_reason(), ft);
        }
    }

    /// The recorded failure as an error.
    fn throw_fail(&self, session: &Session) -> ActorError {
        let fail_type = self.core().fail_type();
        let reason = self.failure_reason(session).unwrap_or_else(|| {
            FailReason::new(format!(
                "{} did not reach the requested progress",
                self.source_name()
            ))
        });
        ActorError::Failed { reason, fail_type }
    }

    /// Whether the actor is failed at `ft` or worse, after bringing the state up to date.
    fn is_failed(&self, session: &Session, ft: FailType) -> bool {
        self.determine_state(session);
        self.was_failed(session, ft)
    }

    /// Whether the actor is failed at `ft` or worse. A determine failure only counts within the
    /// tick it was determined in.
    fn was_failed(&self, session: &Session, ft: FailType) -> bool {
        let core = self.core();
        if !core.fail_type().covers(ft) {
            return false;
        }
        if ft > FailType::Determine {
            return true;
        }
        core.last_state_check_ts() == session.clock().peek()
    }

    /// The recorded failure reason.
    fn failure_reason(&self, session: &Session) -> Option<FailReason> {
        if self.core().fail_type() == FailType::None {
            return None;
        }
        session.fail_reason(self.core().id())
    }

    /// Forget the recorded failure.
    fn clear_fail(&self, session: &Session) {
        let core = self.core();
        if core.fail_type() == FailType::None {
            return;
        }
        let mut reasons = session.fail_reasons();
        reasons.remove(&core.id());
        core.state.set_fail_type(FailType::None);
    }
}

impl<A: Actor + ?Sized> ActorExt for A {}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Debug)]
    struct Node {
        core: ActorCore,
        name: &'static str,
        suppliers: Mutex<Vec<ActorRef>>,
        updates: AtomicUsize,
        fail_with: Mutex<Option<String>>,
        reenter: AtomicBool,
    }

    impl Node {
        fn new(session: &Session, name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                core: ActorCore::new(session),
                name,
                suppliers: Mutex::new(Vec::new()),
                updates: AtomicUsize::new(0),
                fail_with: Mutex::new(None),
                reenter: AtomicBool::new(false),
            })
        }

        fn depends_on(&self, supplier: &Arc<Node>) {
            self.suppliers.lock().push(supplier.clone());
        }
    }

    impl Actor for Node {
        fn core(&self) -> &ActorCore {
            &self.core
        }

        fn source_name(&self) -> String {
            self.name.to_string()
        }

        fn visit_suppliers(
            &self,
            _session: &Session,
            _flags: SupplierVisitFlags,
            visitor: &mut SupplierVisitor<'_>,
        ) -> ActorResult<VisitState> {
            let suppliers = self.suppliers.lock().clone();
            for supplier in &suppliers {
                if visitor(supplier)? == VisitState::SuspendedOrFailed {
                    return Ok(VisitState::SuspendedOrFailed);
                }
            }
            Ok(VisitState::Ready)
        }

        fn do_update(&self, session: &Session, ps: ProgressState) -> ActorResult<VisitState> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.reenter.load(Ordering::SeqCst) {
                self.certain_update(session, ps)?;
            }
            match self.fail_with.lock().clone() {
                Some(message) => Err(anyhow::anyhow!(message).into()),
                None => Ok(VisitState::Ready),
            }
        }
    }

    #[test]
    fn test_update_reaches_committed() {
        let session = Session::new();
        let a = Node::new(&session, "a");
        let b = Node::new(&session, "b");
        b.depends_on(&a);
        assert!(b.update(&session, ProgressState::Committed, true).unwrap());
        assert_eq!(a.core().progress(), ProgressState::Committed);
        assert_eq!(b.core().progress(), ProgressState::Committed);
        assert_eq!(a.updates.load(Ordering::SeqCst), 1);
        assert_eq!(b.updates.load(Ordering::SeqCst), 1);

        b.certain_update(&session, ProgressState::Committed).unwrap();
        assert_eq!(b.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_supplier_change_invalidates_dependent() {
        let session = Session::new();
        let a = Node::new(&session, "a");
        let b = Node::new(&session, "b");
        b.depends_on(&a);
        b.certain_update(&session, ProgressState::Committed).unwrap();
        let before = b.core().last_change_ts();

        a.invalidate(&session);
        assert_eq!(a.core().progress(), ProgressState::None);
        assert!(a.core().last_change_ts() > before);

        b.determine_state(&session);
        assert_eq!(b.core().progress(), ProgressState::None);
        assert_eq!(b.core().last_change_ts(), a.core().last_change_ts());

        b.certain_update(&session, ProgressState::Committed).unwrap();
        assert_eq!(b.updates.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_is_recorded_and_sticky() {
        let session = Session::new();
        let a = Node::new(&session, "a");
        *a.fail_with.lock() = Some("boom".into());
        let err = a.certain_update(&session, ProgressState::Committed).unwrap_err();
        assert_eq!(err.fail_reason().message(), "boom");
        assert_eq!(err.fail_type(), Some(FailType::Committed));
        assert_eq!(a.failure_reason(&session).unwrap().location(), Some("a"));

        assert!(!a.update(&session, ProgressState::Committed, false).unwrap());
        assert_eq!(a.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_more_severe_failure_wins() {
        let session = Session::new();
        let a = Node::new(&session, "a");
        assert!(a.fail(&session, "late", FailType::Committed));
        assert!(a.fail(&session, "early", FailType::Data));
        assert!(!a.fail(&session, "later", FailType::Validate));
        assert_eq!(a.core().fail_type(), FailType::Data);
        assert_eq!(a.failure_reason(&session).unwrap().message(), "early");
    }

    #[test]
    fn test_supplier_failure_is_copied() {
        let session = Session::new();
        let a = Node::new(&session, "a");
        let b = Node::new(&session, "b");
        b.depends_on(&a);
        *a.fail_with.lock() = Some("bad input".into());
        assert!(b.certain_update(&session, ProgressState::Committed).is_err());
        assert_eq!(b.core().fail_type(), FailType::Committed);
        assert!(b
            .failure_reason(&session)
            .unwrap()
            .ptr_eq(&a.failure_reason(&session).unwrap()));
        assert_eq!(b.updates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalidation_clears_failure() {
        let session = Session::new();
        let a = Node::new(&session, "a");
        *a.fail_with.lock() = Some("boom".into());
        assert!(a.certain_update(&session, ProgressState::Committed).is_err());
        *a.fail_with.lock() = None;
        a.invalidate(&session);
        assert_eq!(a.core().fail_type(), FailType::None);
        assert!(a.failure_reason(&session).is_none());
        a.certain_update(&session, ProgressState::Committed).unwrap();
    }

    #[test]
    fn test_update_lock_requires_deeper_phase() {
        let session = Session::new();
        let a = Node::new(&session, "a");
        let outer = UpdateLock::enter(&*a, &session, TransState::Committing).unwrap();
        let inner = UpdateLock::enter(&*a, &session, TransState::CalculatingData).unwrap();
        let err = UpdateLock::enter(&*a, &session, TransState::Validating).unwrap_err();
        assert!(err.is_recursive_dependency());
        drop(inner);
        assert_eq!(a.core().trans_state(), TransState::Committing);
        drop(outer);
        assert_eq!(a.core().trans_state(), TransState::Idle);
    }

    #[test]
    fn test_update_of_itself_fails_as_recursion() {
        let session = Session::new();
        let a = Node::new(&session, "a");
        a.reenter.store(true, Ordering::SeqCst);
        let err = a.certain_update(&session, ProgressState::Committed).unwrap_err();
        assert!(err.is_recursive_dependency(), "{err}");
        assert_eq!(
            err.fail_reason().message(),
            "Cannot start Commit while doing Commit; check for recursive dependencies"
        );
        assert_eq!(a.core().fail_type(), FailType::Committed);
        assert_eq!(a.core().trans_state(), TransState::Idle);
        assert_eq!(a.updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_commit_releases_supplier_interest() {
        let session = Session::new();
        let a = Node::new(&session, "a");
        let b = Node::new(&session, "b");
        b.depends_on(&a);
        b.inc_interest(&session).unwrap();
        assert_eq!(a.core().interest_count(), 1);

        b.certain_update(&session, ProgressState::Committed).unwrap();
        assert!(!b.core().has_suppl_interest());
        assert_eq!(session.supplier_interest_len(b.core().id()), None);
        assert_eq!(a.core().interest_count(), 0);
        assert_eq!(b.core().interest_count(), 1);
        assert_eq!(session.demand().remaining(), 0);

        // a changed supplier brings the chain back until the next commit
        a.invalidate(&session);
        b.determine_state(&session);
        assert!(b.core().has_suppl_interest());
        assert_eq!(a.core().interest_count(), 1);
        b.certain_update(&session, ProgressState::Committed).unwrap();
        assert_eq!(a.core().interest_count(), 0);
        assert_eq!(b.updates.load(Ordering::SeqCst), 2);
        drop(b.dec_interest(&session));
        assert_eq!(session.demand().remaining(), 0);
    }

    #[test]
    fn test_interest_chain_and_release() {
        let session = Session::new();
        let a = Node::new(&session, "a");
        let b = Node::new(&session, "b");
        b.depends_on(&a);
        b.inc_interest(&session).unwrap();
        assert_eq!(a.core().interest_count(), 1);
        assert!(b.core().has_suppl_interest());
        assert_eq!(session.supplier_interest_len(b.core().id()), Some(1));
        assert_eq!(session.demand().remaining(), 2);

        b.inc_interest(&session).unwrap();
        assert_eq!(a.core().interest_count(), 1);
        drop(b.dec_interest(&session));
        assert_eq!(b.core().interest_count(), 1);

        let garbage = b.dec_interest(&session);
        assert_eq!(garbage.interest_len(), 1);
        assert_eq!(a.core().interest_count(), 1);
        drop(garbage);
        assert_eq!(a.core().interest_count(), 0);
        assert!(!a.core().has_suppl_interest());
        assert_eq!(session.demand().remaining(), 0);
    }

    #[test]
    fn test_passor_suppliers_are_skipped() {
        let session = Session::new();
        let constant = Arc::new(Node {
            core: ActorCore::new_passor(&session),
            name: "constant",
            suppliers: Mutex::new(Vec::new()),
            updates: AtomicUsize::new(0),
            fail_with: Mutex::new(None),
            reenter: AtomicBool::new(false),
        });
        let b = Node::new(&session, "b");
        b.depends_on(&constant);
        b.inc_interest(&session).unwrap();
        b.certain_update(&session, ProgressState::Committed).unwrap();
        assert_eq!(constant.core().interest_count(), 0);
        assert_eq!(constant.updates.load(Ordering::SeqCst), 0);
        drop(b.dec_interest(&session));
    }
}
