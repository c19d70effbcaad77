//! DMS-Actor: a demand-driven incremental computation graph.
//!
//! Every node of the graph is an [`Actor`]. Actors advance their [`ProgressState`] lazily, when
//! somebody asks for it, and only after all of their suppliers have advanced. A supplier that
//! changes invalidates its dependents the next time their state is determined.
//!
//! # Key Features
//!
//! - **Interest counting**: an actor in demand keeps its suppliers in demand; releasing the last
//!   interest releases theirs and frees derived data
//! - **Sticky failures**: a failure is recorded once per kind and copied onto dependents; only
//!   invalidation clears it
//! - **Cooperative suspension**: long updates give control back when the host has input pending,
//!   keeping whatever was committed
//! - **Named trees**: [`TreeItem`] organizes actors in a namespace with calculation rules,
//!   storage managers, referred items and status flags that propagate to sub-items
//! - **Leveled locks**: every mutex has a [`lock_level::LockLevel`]; taking locks out of order
//!   panics
//!
//! # Example
//!
//! ```ignore
//! use dms_actor::{ActorExt, ProgressState, Session, TreeItem};
//! use std::sync::Arc;
//!
//! let session = Session::builder()
//!     .calculator_factory(Arc::new(MyExpressionParser))
//!     .build();
//! let root = TreeItem::create_root(&session, "model");
//! let a = root.create_child(&session, "a")?;
//! a.set_expr(&session, "1 + 1");
//! let b = root.create_child(&session, "b")?;
//! b.set_expr(&session, "a * 2");
//!
//! b.inc_interest(&session)?;
//! b.certain_update(&session, ProgressState::Committed)?;
//! assert_eq!(*b.data_as::<i64>().unwrap(), 4);
//! b.dec_interest(&session).collect();
//! ```
//!
//! # Threads
//!
//! The thread that builds a [`Session`] is its meta thread. Graph mutation, the 0→1 interest
//! edge and updates run there; other threads may read state, take interest on actors that
//! already have some ([`InterestPtr::try_acquire`]) and release interest.

mod clock;
mod demand;
mod error;
mod garbage;
mod interest_chain;
mod session;
mod suspend;
mod tree_item;

pub mod actor;
pub mod lock_level;
pub mod notify;

pub use actor::{
    Actor, ActorCore, ActorExt, ActorFlags, ActorId, ActorRef, FailType, ProgressState,
    SupplierFailure, SupplierVisitFlags, SupplierVisitor, TransState, UpdateLock,
};
pub use clock::{ChangeSourceLock, DetermineChangeLock, TimeStamp, UpdateClock, TS_BERESHIT};
pub use demand::{demand_message, DemandCounter, NotificationBlock};
pub use error::{ActorError, ActorResult, FailReason};
pub use garbage::{Garbage, InterestPtr};
pub use interest_chain::{InterestChain, Iter as InterestChainIter};
pub use notify::{NoopNotifier, NotificationCode, StateChangeNotifier};
pub use session::{CreationContext, Session, SessionBuilder, SessionConfig, WeakSession};
pub use suspend::{
    BlockerKind, SuspendBlocker, SuspendController, SuspendLevel, VisitState,
    WaitingMessagesHook, MAX_REPORTED_WARNINGS,
};
pub use tree_item::{
    Calculator, CalculatorFactory, DataValue, ReadLock, StorageManager, TreeItem,
    TreeItemStatus, WriteLock,
};
