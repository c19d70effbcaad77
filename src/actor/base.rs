//! Default behaviour of the overridable [`Actor`] hooks.
//!
//! Overrides call these to extend rather than replace the default, e.g.
//!
//! ```ignore
//! fn do_invalidate(&self, session: &Session) {
//!     self.drop_cached_result();
//!     base::do_invalidate(self, session);
//! }
//! ```

use tracing::{error, warn};

use super::{
    Actor, ActorExt, ActorFlags, FailType, ProgressState, SupplierFailure, SupplierVisitFlags,
    TransState, UpdateLock,
};
use crate::clock::{TimeStamp, TS_BERESHIT};
use crate::error::{ActorResult, FailReason};
use crate::garbage::Garbage;
use crate::interest_chain::InterestChain;
use crate::session::Session;
use crate::suspend::VisitState;

/// Work is needed unless the actor is committed or already failed at data.
pub fn must_apply_impl<A: Actor + ?Sized>(actor: &A, session: &Session) -> bool {
    actor.core().progress() < ProgressState::Committed && !actor.was_failed(session, FailType::Data)
}

/// Re-derive supplier interest when the actor is still in demand.
pub fn do_invalidate<A: Actor + ?Sized>(actor: &A, session: &Session) {
    actor.determine_state(session);
    if actor.core().interest_count() == 0 {
        return;
    }
    let started = UpdateLock::enter(actor, session, TransState::ChangingInterest)
        .and_then(|_lock| actor.start_suppl_interest(session));
    if let Err(err) = started {
        actor.catch_fail(session, &err, FailType::MetaInfo);
    }
}

/// Record the failure in the session and report it.
///
/// Data-or-worse failures release supplier interest: nothing will compute with the suppliers
/// any more.
pub fn do_fail<A: Actor + ?Sized>(
    actor: &A,
    session: &Session,
    reason: FailReason,
    ft: FailType,
) -> bool {
    let core = actor.core();
    {
        let mut reasons = session.fail_reasons();
        if core.fail_type().covers(ft) {
            return false;
        }
        reasons.insert(core.id(), reason.clone());
        core.state.set_fail_type(ft);
    }
    let first_report = reason.tell_where(&actor.source_name());
    let waste = if ft.is_error() {
        actor.move_suppl_interest(session)
    } else {
        Garbage::new()
    };
    if first_report {
        if ft.is_error() {
            error!(actor = %actor.source_name(), fail_type = ?ft, "{}", reason);
        } else if session.suspend().admit_warning() {
            warn!(actor = %actor.source_name(), fail_type = ?ft, "{}", reason);
        }
    }
    drop(waste);
    true
}

/// Walk the suppliers selected for state determination, bringing each up to date.
pub fn determine_last_supplier_change<A: Actor + ?Sized>(
    actor: &A,
    session: &Session,
    failure: &mut SupplierFailure,
) -> TimeStamp {
    let mut last = actor.core().last_change_ts().max(TS_BERESHIT);
    let visited = actor.visit_suppliers(
        session,
        SupplierVisitFlags::DETERMINE_STATE,
        &mut |supplier| {
            let core = supplier.core();
            if core.is_passor() || core.trans_state() == TransState::DeterminingCheck {
                return Ok(VisitState::Ready);
            }
            last = last.max(supplier.last_change_ts_determined(session));
            failure.consider(session, &**supplier);
            Ok(VisitState::Ready)
        },
    );
    if let Err(err) = visited {
        failure.record(err.fail_reason(), FailType::Determine);
    }
    last
}

/// Start interest on every supplier and register the chain.
pub fn start_suppl_interest<A: Actor + ?Sized>(actor: &A, session: &Session) -> ActorResult<()> {
    let core = actor.core();
    if core.is_passor() || core.has_suppl_interest() {
        return Ok(());
    }
    let mut chain = InterestChain::new();
    let visited = actor.visit_suppliers(
        session,
        SupplierVisitFlags::START_SUPPL_INTEREST,
        &mut |supplier| {
            let supplier_core = supplier.core();
            if supplier_core.is_passor()
                || supplier_core.trans_state() == TransState::DeterminingCheck
            {
                return Ok(VisitState::Ready);
            }
            supplier.inc_interest(session)?;
            chain.push_front(supplier.clone());
            Ok(VisitState::Ready)
        },
    );
    if let Err(err) = visited {
        drop(Garbage::interest(session, chain));
        return Err(err);
    }
    session.demand().inc();
    let mut map = session.suppl_interest();
    map.insert(core.id(), chain);
    core.state.insert_flags(ActorFlags::SUPPL_INTEREST);
    Ok(())
}

/// Interest starts with supplier interest.
pub fn start_interest<A: Actor + ?Sized>(actor: &A, session: &Session) -> ActorResult<()> {
    actor.start_suppl_interest(session)
}

/// Interest stops by handing back supplier interest.
pub fn stop_interest<A: Actor + ?Sized>(actor: &A, session: &Session) -> Garbage {
    actor.move_suppl_interest(session)
}
