//! Re-entrancy gate for structural mutations during callbacks (§4.6).
//!
//! User callbacks (begin/preSolve/postSolve/separate, constraint pre/post
//! solve, query callbacks) run synchronously while the space is mid-`step`.
//! If one of them tries to add or remove a body/shape/constraint, that would
//! invalidate iterators the step pipeline is still walking. Rather than
//! forbidding it outright, structural mutation calls fail with
//! [`crate::error::SpaceError::Locked`] while depth > 0, and the one
//! exception -- waking a sleeping body -- is deferred onto a queue drained
//! when the lock fully releases.

use crate::error::{Result, SpaceError};
use crate::handle::BodyKey;

#[derive(Default)]
pub(crate) struct Lock {
    depth: u32,
    roused_bodies: Vec<BodyKey>,
}

impl Lock {
    #[inline]
    pub(crate) fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.depth > 0
    }

    pub(crate) fn lock(&mut self) {
        self.depth += 1;
    }

    /// Releases one level of the lock. If this brings the depth back to
    /// zero, the caller is responsible for draining [`Self::take_roused`]
    /// afterward (kept as a separate step so draining can itself call back
    /// into code that needs `&mut Space`, not just `&mut Lock`).
    pub(crate) fn unlock(&mut self) -> Result<()> {
        match self.depth.checked_sub(1) {
            Some(d) => {
                self.depth = d;
                Ok(())
            }
            None => Err(SpaceError::LockUnderflow),
        }
    }

    /// Fails with `Locked` if a structural mutation is attempted while
    /// locked; the caller should check this before add/remove operations.
    pub(crate) fn check_unlocked(&self) -> Result<()> {
        if self.depth > 0 {
            Err(SpaceError::Locked { depth: self.depth })
        } else {
            Ok(())
        }
    }

    /// Queues a body for activation once the lock fully releases, used when
    /// `activate` is called from inside a callback.
    pub(crate) fn defer_activation(&mut self, body: BodyKey) {
        self.roused_bodies.push(body);
    }

    /// Drains the deferred-activation queue in insertion order. Only
    /// meaningful to call once `depth` has returned to zero.
    pub(crate) fn take_roused(&mut self) -> Vec<BodyKey> {
        std::mem::take(&mut self.roused_bodies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_round_trips_depth() {
        let mut lock = Lock::default();
        lock.lock();
        lock.lock();
        assert_eq!(lock.depth(), 2);
        lock.unlock().unwrap();
        assert_eq!(lock.depth(), 1);
        lock.unlock().unwrap();
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn unlock_past_zero_underflows() {
        let mut lock = Lock::default();
        assert_eq!(lock.unlock(), Err(SpaceError::LockUnderflow));
    }

    #[test]
    fn check_unlocked_fails_with_depth_while_locked() {
        let mut lock = Lock::default();
        lock.lock();
        assert_eq!(lock.check_unlocked(), Err(SpaceError::Locked { depth: 1 }));
    }

    #[test]
    fn deferred_activations_drain_in_order() {
        let mut arena: thunderdome::Arena<()> = thunderdome::Arena::new();
        let a = BodyKey(arena.insert(()));
        let b = BodyKey(arena.insert(()));
        let mut lock = Lock::default();
        lock.defer_activation(a);
        lock.defer_activation(b);
        assert_eq!(lock.take_roused(), vec![a, b]);
        assert!(lock.take_roused().is_empty());
    }
}
