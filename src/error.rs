//! Error types and recorded failure reasons.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::actor::{FailType, TransState};

/// Errors raised by actor and tree operations.
///
/// Errors coming out of external collaborators (calculators, storage managers) are carried as
/// `anyhow::Error`; `?` on an `anyhow::Result` inside this crate converts them into
/// [`ActorError::Calculator`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActorError {
    /// A transient phase was entered while the same or a deeper phase was already active.
    #[error("Cannot start {requested} while doing {active}; check for recursive dependencies")]
    RecursiveDependency {
        /// The phase that was requested.
        requested: TransState,
        /// The phase that was active.
        active: TransState,
    },

    /// A recorded failure was surfaced.
    #[error("{reason}")]
    Failed {
        /// The recorded reason.
        reason: FailReason,
        /// The kind the failure was recorded at.
        fail_type: FailType,
    },

    /// A graph mutation was attempted off the session's meta thread.
    #[error("graph mutation attempted outside the meta thread")]
    NotMetaThread,

    /// A path did not resolve.
    #[error("Unknown identifier '{path}'")]
    ItemNotFound {
        /// The unresolved path.
        path: String,
    },

    /// Items can only be created from paths inside a creation context.
    #[error("Cannot create new items outside creation context")]
    CreationOutsideContext,

    /// Storage managers cannot be attached to roots.
    #[error("StorageManager '{name}' on root item is not allowed")]
    StorageManagerOnRoot {
        /// Name of the rejected storage manager.
        name: String,
    },

    /// A sibling with the same name exists.
    #[error("an item named '{name}' already exists")]
    DuplicateName {
        /// The clashing name.
        name: String,
    },

    /// Item names must be non-empty, must not contain `/` and must not be `.` or `..`.
    #[error("'{name}' is not a valid item name")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Meta-info derivation re-entered itself.
    #[error("Invalid recursion in UpdateMetaInfo detected")]
    MetaInfoRecursion,

    /// The session this item belongs to is gone.
    #[error("session has been closed")]
    SessionClosed,

    /// An error raised by a calculator or other user code.
    #[error("{0}")]
    Calculator(Arc<anyhow::Error>),

    /// An error raised by a storage manager.
    #[error("storage: {0}")]
    Storage(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for ActorError {
    fn from(err: anyhow::Error) -> Self {
        ActorError::Calculator(Arc::new(err))
    }
}

impl ActorError {
    /// Wrap a storage manager error.
    pub fn storage(err: anyhow::Error) -> Self {
        ActorError::Storage(Arc::new(err))
    }

    /// The reason to record when this error is caught as a failure.
    pub fn fail_reason(&self) -> FailReason {
        match self {
            ActorError::Failed { reason, .. } => reason.clone(),
            other => FailReason::new(other.to_string()),
        }
    }

    /// The recorded fail type, if this error surfaces a recorded failure.
    pub fn fail_type(&self) -> Option<FailType> {
        match self {
            ActorError::Failed { fail_type, .. } => Some(*fail_type),
            _ => None,
        }
    }

    /// Returns `true` for [`ActorError::RecursiveDependency`], or a failure that was recorded
    /// from one.
    pub fn is_recursive_dependency(&self) -> bool {
        match self {
            ActorError::RecursiveDependency { .. } => true,
            ActorError::Failed { reason, .. } => {
                reason.message().contains("recursive dependencies")
            }
            _ => false,
        }
    }
}

/// Result alias for this crate.
pub type ActorResult<T> = Result<T, ActorError>;

/// A recorded failure message.
///
/// Clone is cheap. The "where" annotation is attached once, by the first actor the reason is
/// recorded on; copying the reason onto dependents keeps the original location.
#[derive(Clone)]
pub struct FailReason(Arc<FailReasonInner>);

struct FailReasonInner {
    message: String,
    location: OnceLock<String>,
}

impl FailReason {
    /// Create a reason without location.
    pub fn new(message: impl Into<String>) -> Self {
        FailReason(Arc::new(FailReasonInner {
            message: message.into(),
            location: OnceLock::new(),
        }))
    }

    /// The bare message.
    pub fn message(&self) -> &str {
        &self.0.message
    }

    /// The source the reason was first recorded on.
    pub fn location(&self) -> Option<&str> {
        self.0.location.get().map(String::as_str)
    }

    /// Attach the location unless one is set already. Returns whether it was attached.
    pub fn tell_where(&self, location: &str) -> bool {
        self.0.location.set(location.to_owned()).is_ok()
    }

    /// Whether both handles refer to the same recorded reason.
    pub fn ptr_eq(&self, other: &FailReason) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location() {
            Some(location) => write!(f, "[{}] {}", location, self.message()),
            None => f.write_str(self.message()),
        }
    }
}

impl fmt::Debug for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailReason")
            .field("message", &self.message())
            .field("location", &self.location())
            .finish()
    }
}
