use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use ahash::RandomState;
use slab::Slab;
use tracing::debug;

use crate::actor::{ActorId, ActorRef};
use crate::clock::UpdateClock;
use crate::demand::DemandCounter;
use crate::error::FailReason;
use crate::garbage::Garbage;
use crate::interest_chain::InterestChain;
use crate::lock_level::{LeveledGuard, LeveledMutex, LockLevel};
use crate::notify::{NoopNotifier, StateChangeNotifier};
use crate::suspend::{BlockerKind, SuspendBlocker, SuspendController, WaitingMessagesHook};
use crate::tree_item::{CalculatorFactory, TreeItem};

type IdMap<V> = HashMap<ActorId, V, RandomState>;

/// Settings for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum time between two demand count reports.
    pub demand_report_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            demand_report_interval: Duration::from_millis(500),
        }
    }
}

/// Owner of everything the actors of one model share: the change clock, the suspend
/// controller, the demand counter and the registries for failures, supplier interest and pinned
/// items.
///
/// This is cheap to clone, so you can pass it around by just cloning it. The thread that creates
/// the session becomes its meta thread; graph mutation is only allowed there.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// A non-owning handle to a [`Session`].
#[derive(Clone, Default)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    /// Get the session if it is still alive.
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl std::fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WeakSession")
    }
}

struct SessionInner {
    meta_thread: ThreadId,
    config: SessionConfig,
    clock: UpdateClock,
    demand: DemandCounter,
    suspend: SuspendController,
    fail_reasons: LeveledMutex<IdMap<FailReason>>,
    suppl_interest: LeveledMutex<IdMap<InterestChain<ActorRef>>>,
    count_section: LeveledMutex<()>,
    pins: LeveledMutex<Slab<Arc<TreeItem>>>,
    notifier: Arc<dyn StateChangeNotifier>,
    calculator_factory: Option<Arc<dyn CalculatorFactory>>,
    next_actor_id: AtomicU64,
    creation_depth: AtomicU32,
}

impl Default for Session {
    fn default() -> Self {
        SessionBuilder::new().build()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("meta_thread", &self.inner.meta_thread)
            .field("clock", &self.inner.clock)
            .field("demand", &self.inner.demand)
            .finish_non_exhaustive()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<Session>();
    assert_sync::<Session>();
}

impl Session {
    /// Create a session with default settings.
    pub fn new() -> Self {
        Default::default()
    }

    /// Create a builder for configuring a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// A non-owning handle.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    /// Settings this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Whether the current thread is the meta thread.
    pub fn is_meta_thread(&self) -> bool {
        std::thread::current().id() == self.inner.meta_thread
    }

    /// The change clock.
    pub fn clock(&self) -> &UpdateClock {
        &self.inner.clock
    }

    /// The active target counter.
    pub fn demand(&self) -> &DemandCounter {
        &self.inner.demand
    }

    /// The suspend controller.
    pub fn suspend(&self) -> &SuspendController {
        &self.inner.suspend
    }

    /// Open a scope in which suspension is disabled.
    pub fn blocker(&self, kind: BlockerKind) -> SuspendBlocker<'_> {
        self.inner.suspend.blocker(kind, &self.inner.demand)
    }

    /// The state change notifier.
    pub fn notifier(&self) -> &dyn StateChangeNotifier {
        self.inner.notifier.as_ref()
    }

    /// The factory turning expressions into calculators.
    pub fn calculator_factory(&self) -> Option<&Arc<dyn CalculatorFactory>> {
        self.inner.calculator_factory.as_ref()
    }

    pub(crate) fn next_actor_id(&self) -> ActorId {
        ActorId(self.inner.next_actor_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn count_section(&self) -> LeveledGuard<'_, ()> {
        self.inner.count_section.lock()
    }

    pub(crate) fn fail_reasons(&self) -> LeveledGuard<'_, IdMap<FailReason>> {
        self.inner.fail_reasons.lock()
    }

    pub(crate) fn suppl_interest(&self) -> LeveledGuard<'_, IdMap<InterestChain<ActorRef>>> {
        self.inner.suppl_interest.lock()
    }

    /// The recorded failure of an actor.
    pub fn fail_reason(&self, id: ActorId) -> Option<FailReason> {
        self.fail_reasons().get(&id).cloned()
    }

    /// Number of suppliers an actor currently keeps alive through its supplier-interest chain.
    pub fn supplier_interest_len(&self, id: ActorId) -> Option<usize> {
        self.suppl_interest().get(&id).map(InterestChain::len)
    }

    /// Actors currently held by the supplier-interest chain of `id`.
    pub fn supplier_interest(&self, id: ActorId) -> Vec<ActorRef> {
        self.suppl_interest()
            .get(&id)
            .map(|chain| chain.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the bookkeeping of an actor that is being freed.
    pub(crate) fn forget_actor(&self, id: ActorId) -> Garbage {
        self.fail_reasons().remove(&id);
        let chain = self.suppl_interest().remove(&id);
        match chain {
            Some(chain) => {
                self.demand().dec();
                Garbage::interest(self, chain)
            }
            None => Garbage::new(),
        }
    }

    /// Enter a scope in which items may be created from paths.
    pub fn creation_context(&self) -> CreationContext<'_> {
        self.inner.creation_depth.fetch_add(1, Ordering::AcqRel);
        CreationContext { session: self }
    }

    /// Whether a creation context is active.
    pub fn in_creation_context(&self) -> bool {
        self.inner.creation_depth.load(Ordering::Acquire) > 0
    }

    pub(crate) fn pin(&self, item: Arc<TreeItem>) -> usize {
        self.inner.pins.lock().insert(item)
    }

    pub(crate) fn unpin(&self, key: usize) -> Option<Arc<TreeItem>> {
        self.inner.pins.lock().try_remove(key)
    }

    /// Number of items whose auto-delete is disabled.
    pub fn pinned_count(&self) -> usize {
        self.inner.pins.lock().len()
    }

    /// Roots of all pinned subtrees.
    pub fn config_roots(&self) -> Vec<Arc<TreeItem>> {
        self.inner
            .pins
            .lock()
            .iter()
            .filter(|(_, item)| item.parent().is_none())
            .map(|(_, item)| item.clone())
            .collect()
    }

    /// Tear down every pinned root, in registration order.
    pub fn close(&self) {
        let roots = self.config_roots();
        debug!(roots = roots.len(), "closing session");
        for root in roots {
            drop(root.enable_auto_delete(self));
        }
    }
}

/// Guard returned by [`Session::creation_context`].
#[must_use]
pub struct CreationContext<'a> {
    session: &'a Session,
}

impl Drop for CreationContext<'_> {
    fn drop(&mut self) {
        self.session
            .inner
            .creation_depth
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// Builder for [`Session`] with customizable settings.
///
/// # Example
///
/// ```
/// use dms_actor::Session;
/// use std::time::Duration;
///
/// let session = Session::builder()
///     .demand_report_interval(Duration::from_secs(1))
///     .waiting_messages(|| false)
///     .build();
/// assert!(session.is_meta_thread());
/// ```
pub struct SessionBuilder {
    config: SessionConfig,
    notifier: Arc<dyn StateChangeNotifier>,
    calculator_factory: Option<Arc<dyn CalculatorFactory>>,
    waiting_messages: Option<WaitingMessagesHook>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            notifier: Arc::new(NoopNotifier),
            calculator_factory: None,
            waiting_messages: None,
        }
    }

    /// Replace all settings.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Minimum time between two demand count reports.
    pub fn demand_report_interval(mut self, interval: Duration) -> Self {
        self.config.demand_report_interval = interval;
        self
    }

    /// Set the state change notifier.
    pub fn notifier(mut self, notifier: Arc<dyn StateChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the factory used to parse item expressions.
    pub fn calculator_factory(mut self, factory: Arc<dyn CalculatorFactory>) -> Self {
        self.calculator_factory = Some(factory);
        self
    }

    /// Set the hook the suspend controller polls for pending user input.
    pub fn waiting_messages(mut self, hook: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.waiting_messages = Some(Box::new(hook));
        self
    }

    /// Build the session. The calling thread becomes its meta thread.
    pub fn build(self) -> Session {
        let meta_thread = std::thread::current().id();
        let demand = DemandCounter::new(self.notifier.clone(), self.config.demand_report_interval);
        Session {
            inner: Arc::new(SessionInner {
                meta_thread,
                config: self.config,
                clock: UpdateClock::new(),
                demand,
                suspend: SuspendController::new(meta_thread, self.waiting_messages),
                fail_reasons: LeveledMutex::with_default(LockLevel::FailSection, "FailSection"),
                suppl_interest: LeveledMutex::with_default(
                    LockLevel::MoveSupplInterest,
                    "MoveSupplInterest",
                ),
                count_section: LeveledMutex::new(LockLevel::CountSection, "CountSection", ()),
                pins: LeveledMutex::new(LockLevel::ItemRegister, "ItemRegister", Slab::new()),
                notifier: self.notifier,
                calculator_factory: self.calculator_factory,
                next_actor_id: AtomicU64::new(1),
                creation_depth: AtomicU32::new(0),
            }),
        }
    }
}
