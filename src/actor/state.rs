//! The packed per-actor state word.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

/// How far an actor has been brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum ProgressState {
    /// Nothing derived yet, or invalidated.
    #[default]
    None = 0,
    /// Result shape and suppliers are known.
    MetaInfoReady = 1,
    /// Data has been checked.
    Validated = 2,
    /// Data is final.
    Committed = 3,
}

impl ProgressState {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => ProgressState::None,
            1 => ProgressState::MetaInfoReady,
            2 => ProgressState::Validated,
            _ => ProgressState::Committed,
        }
    }

    /// The fail type that blocks reaching this progress.
    pub fn blocking_fail_type(self) -> FailType {
        if self == ProgressState::Committed {
            FailType::Committed
        } else {
            FailType::Validate
        }
    }
}

/// The transient phase an actor is in. Deeper phases compare greater.
///
/// A phase may only be entered from a strictly shallower one; this is the recursion guard of the
/// update protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum TransState {
    #[allow(missing_docs)]
    #[default]
    Idle = 0,
    #[allow(missing_docs)]
    Committing = 1,
    #[allow(missing_docs)]
    Validating = 2,
    #[allow(missing_docs)]
    CalculatingData = 3,
    #[allow(missing_docs)]
    ChangingInterest = 4,
    #[allow(missing_docs)]
    UpdatingMetaInfo = 5,
    #[allow(missing_docs)]
    DeterminingState = 6,
    #[allow(missing_docs)]
    DeterminingCheck = 7,
}

impl TransState {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b111 {
            0 => TransState::Idle,
            1 => TransState::Committing,
            2 => TransState::Validating,
            3 => TransState::CalculatingData,
            4 => TransState::ChangingInterest,
            5 => TransState::UpdatingMetaInfo,
            6 => TransState::DeterminingState,
            _ => TransState::DeterminingCheck,
        }
    }

    /// The kind of failure recorded when work in this phase goes wrong.
    pub fn fail_type(self) -> FailType {
        match self {
            TransState::Committing => FailType::Committed,
            TransState::Validating => FailType::Validate,
            TransState::CalculatingData => FailType::Data,
            _ => FailType::MetaInfo,
        }
    }

    /// Human readable name used in recursion errors.
    pub fn describe(self) -> &'static str {
        match self {
            TransState::Idle => "Idle",
            TransState::Committing => "Commit",
            TransState::Validating => "Validation",
            TransState::CalculatingData => "DataCalculation",
            TransState::ChangingInterest => "InterestChange",
            TransState::UpdatingMetaInfo => "UpdateMetaInfo",
            TransState::DeterminingState => "DetermineState",
            TransState::DeterminingCheck => "DetermineCheck",
        }
    }
}

impl fmt::Display for TransState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Failure kinds. Smaller values are more severe: a failure of kind `K` also counts as a
/// failure for every check of kind `>= K`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum FailType {
    /// Not failed.
    #[default]
    None = 0,
    /// An error occurred while walking suppliers to determine state.
    Determine = 1,
    /// Meta-info could not be derived.
    MetaInfo = 2,
    /// Data could not be calculated.
    Data = 3,
    /// Data did not pass validation.
    Validate = 4,
    /// Data could not be committed.
    Committed = 5,
}

impl FailType {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b111 {
            0 => FailType::None,
            1 => FailType::Determine,
            2 => FailType::MetaInfo,
            3 => FailType::Data,
            4 => FailType::Validate,
            _ => FailType::Committed,
        }
    }

    /// Whether a failure of this kind covers a check of kind `check`.
    pub fn covers(self, check: FailType) -> bool {
        self != FailType::None && self <= check
    }

    /// Failures at or below data severity are reported as errors, the rest as warnings.
    pub fn is_error(self) -> bool {
        self != FailType::None && self <= FailType::Data
    }
}

bitflags! {
    /// Boolean actor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ActorFlags: u32 {
        /// The actor never changes; exempt from invalidation and interest bookkeeping.
        const IS_PASSOR = 1 << 0;
        /// Invalidation does not release or re-derive supplier interest.
        const INVALIDATION_BLOCK = 1 << 1;
        /// A supplier-interest chain is registered for this actor.
        const SUPPL_INTEREST = 1 << 2;
    }
}

const PROGRESS_SHIFT: u32 = 0;
const TRANS_SHIFT: u32 = 2;
const FAIL_SHIFT: u32 = 5;
const FLAGS_SHIFT: u32 = 8;

const PROGRESS_MASK: u32 = 0b11 << PROGRESS_SHIFT;
const TRANS_MASK: u32 = 0b111 << TRANS_SHIFT;
const FAIL_MASK: u32 = 0b111 << FAIL_SHIFT;

/// Progress, transient phase, failure kind and flags packed into one atomic word.
#[derive(Default)]
pub(crate) struct StateWord(AtomicU32);

impl StateWord {
    fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    fn modify(&self, f: impl Fn(u32) -> u32) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| Some(f(w)));
    }

    pub fn progress(&self) -> ProgressState {
        ProgressState::from_bits(self.load() >> PROGRESS_SHIFT)
    }

    pub fn set_progress(&self, ps: ProgressState) {
        self.modify(|w| (w & !PROGRESS_MASK) | ((ps as u32) << PROGRESS_SHIFT));
    }

    pub fn trans(&self) -> TransState {
        TransState::from_bits(self.load() >> TRANS_SHIFT)
    }

    pub fn set_trans(&self, ts: TransState) {
        self.modify(|w| (w & !TRANS_MASK) | ((ts as u32) << TRANS_SHIFT));
    }

    pub fn fail_type(&self) -> FailType {
        FailType::from_bits(self.load() >> FAIL_SHIFT)
    }

    pub fn set_fail_type(&self, ft: FailType) {
        self.modify(|w| (w & !FAIL_MASK) | ((ft as u32) << FAIL_SHIFT));
    }

    pub fn flags(&self) -> ActorFlags {
        ActorFlags::from_bits_truncate(self.load() >> FLAGS_SHIFT)
    }

    pub fn insert_flags(&self, flags: ActorFlags) {
        self.modify(|w| w | (flags.bits() << FLAGS_SHIFT));
    }

    pub fn remove_flags(&self, flags: ActorFlags) {
        self.modify(|w| w & !(flags.bits() << FLAGS_SHIFT));
    }
}

impl fmt::Debug for StateWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateWord")
            .field("progress", &self.progress())
            .field("trans", &self.trans())
            .field("fail", &self.fail_type())
            .field("flags", &self.flags())
            .finish()
    }
}
