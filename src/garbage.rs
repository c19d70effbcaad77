//! Deferred destruction batches.

use std::any::Any;
use std::fmt;
use std::mem;

use tracing::error;

use crate::actor::{ActorExt, ActorRef};
use crate::error::ActorResult;
use crate::interest_chain::InterestChain;
use crate::lock_level::{deepest_held_level, LockLevel};
use crate::session::Session;

/// Interest and objects released by an operation, to be dropped outside of any lock deeper than
/// an actor section.
///
/// Dropping a `Garbage` releases one unit of interest per held actor. Releasing interest can
/// free more interest (the released actor's own supplier chain), which is appended to the same
/// work list, so a teardown of arbitrary depth runs in constant stack.
#[must_use = "dropping garbage releases interest; drop it outside of any lock"]
#[derive(Default)]
pub struct Garbage {
    session: Option<Session>,
    chains: Vec<InterestChain<ActorRef>>,
    objects: Vec<Box<dyn Any + Send>>,
}

impl Garbage {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch releasing one unit of interest per actor in `chain`.
    pub fn interest(session: &Session, chain: InterestChain<ActorRef>) -> Self {
        if chain.is_empty() {
            return Self::new();
        }
        Self {
            session: Some(session.clone()),
            chains: vec![chain],
            objects: Vec::new(),
        }
    }

    /// A batch releasing one unit of interest on `actor`.
    pub fn release(session: &Session, actor: ActorRef) -> Self {
        let mut chain = InterestChain::new();
        chain.push_front(actor);
        Self::interest(session, chain)
    }

    /// Defer dropping `object` until this batch is dropped.
    pub fn defer<T: Send + 'static>(&mut self, object: T) {
        self.objects.push(Box::new(object));
    }

    /// Move everything from `other` into this batch.
    pub fn merge(&mut self, mut other: Garbage) {
        if self.session.is_none() {
            self.session = other.session.take();
        }
        self.chains.append(&mut other.chains);
        self.objects.append(&mut other.objects);
    }

    /// Number of interest units this batch will release.
    pub fn interest_len(&self) -> usize {
        self.chains.iter().map(InterestChain::len).sum()
    }

    /// Whether dropping this batch does nothing.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.chains.iter().all(InterestChain::is_empty)
    }

    /// Drop the batch now.
    pub fn collect(self) {}
}

impl Drop for Garbage {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        debug_assert!(
            deepest_held_level().map_or(true, |level| level <= LockLevel::ActorSection),
            "garbage dropped while holding {:?}",
            deepest_held_level()
        );
        let mut objects = mem::take(&mut self.objects);
        let mut pending = mem::take(&mut self.chains);
        let Some(session) = self.session.take() else {
            if pending.iter().any(|chain| !chain.is_empty()) {
                error!("interest released without a session; supplier interest leaks");
            }
            return;
        };
        while let Some(mut chain) = pending.pop() {
            while let Some(actor) = chain.pop_front() {
                let mut released = actor.dec_interest(&session);
                pending.append(&mut released.chains);
                objects.append(&mut released.objects);
            }
        }
        drop(objects);
    }
}

impl fmt::Debug for Garbage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Garbage")
            .field("interest", &self.interest_len())
            .field("objects", &self.objects.len())
            .finish()
    }
}

/// A counted unit of interest on an actor, released on drop.
pub struct InterestPtr {
    session: Session,
    actor: Option<ActorRef>,
}

impl InterestPtr {
    /// Acquire interest on `actor`. Meta thread only unless the actor already has interest.
    pub fn new(session: &Session, actor: ActorRef) -> ActorResult<Self> {
        actor.inc_interest(session)?;
        Ok(Self {
            session: session.clone(),
            actor: Some(actor),
        })
    }

    /// Acquire interest only if `actor` already has some. Safe on any thread.
    pub fn try_acquire(session: &Session, actor: ActorRef) -> Option<Self> {
        actor.try_inc_interest(session).then(|| Self {
            session: session.clone(),
            actor: Some(actor),
        })
    }

    /// The actor interest is held on.
    pub fn actor(&self) -> Option<&ActorRef> {
        self.actor.as_ref()
    }

    /// Give up the interest, returning the release as garbage.
    pub fn release(mut self) -> Garbage {
        match self.actor.take() {
            Some(actor) => Garbage::release(&self.session, actor),
            None => Garbage::new(),
        }
    }
}

impl Drop for InterestPtr {
    fn drop(&mut self) {
        if let Some(actor) = self.actor.take() {
            drop(Garbage::release(&self.session, actor));
        }
    }
}

impl fmt::Debug for InterestPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InterestPtr").field(&self.actor).finish()
    }
}
