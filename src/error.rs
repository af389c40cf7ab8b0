//! The error taxonomy used throughout the simulation core.
//!
//! Every variant here is a programmer error in the sense of §7 of the design
//! document: a correctly-used `Space` never produces one in the course of an
//! ordinary simulation. Callers that want to *assert* a misuse happened (for
//! example in tests) can use the `try_*` entry points on [`crate::Space`],
//! which return `Result<_, SpaceError>`; the unprefixed convenience methods
//! call those and panic with the `Display` message on `Err`, since a
//! corrupted `Space` is defined to produce silently wrong physics rather than
//! a recoverable condition.

use crate::handle::{BodyKey, ConstraintKey, ShapeKey};

/// Everything that can go wrong when a caller misuses the [`crate::Space`] API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SpaceError {
    /// A shape, body, or constraint was added to a `Space` it was already a
    /// member of.
    #[error("object was already added to this space")]
    AlreadyAdded,

    /// A shape, body, or constraint was removed (or looked up as owned) from
    /// a `Space` it does not belong to.
    #[error("object is not owned by this space")]
    NotOwned,

    /// A structural mutation (add/remove body, shape, or constraint, or a
    /// spatial index swap) was attempted while the space's re-entrancy lock
    /// was held, i.e. from inside a callback running during [`crate::Space::step`].
    #[error("cannot mutate space structure while locked (depth {depth})")]
    Locked {
        /// The lock depth observed at the time of the attempted mutation.
        depth: u32,
    },

    /// [`crate::lock::Lock::unlock`] was called more times than
    /// [`crate::lock::Lock::lock`], which would drive the depth negative.
    #[error("lock depth underflowed")]
    LockUnderflow,

    /// [`crate::Space::activate`] was called on a body that is not
    /// `BodyType::Dynamic`. Only dynamic bodies may sleep, so only dynamic
    /// bodies can be meaningfully activated.
    #[error("body {0:?} is not a dynamic body and cannot be activated")]
    NotDynamic(BodyKey),

    /// A constraint referenced a body key that no longer resolves to a body
    /// in this space.
    #[error("constraint references a body that does not exist")]
    DanglingBody,

    /// The sleep-island flood fill found a dynamic body reachable from two
    /// different roots, or a body threaded into an edge list it was never
    /// inserted into. This indicates a bug in arbiter/constraint threading,
    /// not a user error, but is surfaced the same way so tests can assert it
    /// never happens.
    #[error("contact/constraint graph is inconsistent: {0}")]
    GraphInconsistent(&'static str),

    /// An attempt was made to reassign the space's designated static body
    /// while the current one still owns shapes.
    #[error("cannot replace the static body while it still owns shapes")]
    StaticBodyBusy,

    /// A `Collide` collaborator returned more contacts than
    /// `MAX_CONTACTS_PER_ARBITER` allows. This is a bug in the geometry
    /// collaborator, not in the core.
    #[error("contact buffer overflow: {requested} contacts requested, max is {max}")]
    ContactBufferOverflow {
        /// How many contacts the collaborator tried to push.
        requested: usize,
        /// The hard per-arbiter limit.
        max: usize,
    },

    /// A shape was referenced that does not exist (has been removed, or
    /// belongs to a different space).
    #[error("shape {0:?} does not exist in this space")]
    UnknownShape(ShapeKey),

    /// A constraint was referenced that does not exist.
    #[error("constraint {0:?} does not exist in this space")]
    UnknownConstraint(ConstraintKey),
}

pub type Result<T> = std::result::Result<T, SpaceError>;

/// Panics with the error's `Display` message. Used by the convenience (non
/// `try_`-prefixed) API methods that are defined to abort on programmer
/// error rather than return a `Result`.
pub(crate) fn expect_ok<T>(result: Result<T>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("{e}"),
    }
}
