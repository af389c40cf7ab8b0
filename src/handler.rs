//! Collision callback dispatch, keyed by an unordered pair of collision types.

use std::collections::HashMap;

use crate::arbiter::Arbiter;
use crate::body::Body;

/// Arbitrary small integer tag a caller assigns to a shape to classify it
/// for handler dispatch (e.g. "player", "wall", "pickup"). Not related to
/// [`crate::handle::ShapeKey`] identity.
pub type CollisionType = u32;

/// Matches any `CollisionType` when used as one side of a registered pair.
pub const WILDCARD: CollisionType = CollisionType::MAX;

/// Context passed to every callback: the two bodies on either side of the
/// arbiter, in the order the handler was registered for (`type_a`/`type_b`),
/// not necessarily the order the shapes were originally inserted.
pub struct CollisionContext<'a> {
    pub arbiter: &'a Arbiter,
    pub body_a: &'a Body,
    pub body_b: &'a Body,
}

/// A begin/preSolve/postSolve/separate callback set for one unordered type
/// pair, plus opaque user data. The registry never clones this: handlers are
/// looked up by reference and invoked in place.
pub struct CollisionHandler {
    pub type_a: CollisionType,
    pub type_b: CollisionType,
    /// Called the first time an arbiter becomes `FIRST_COLLISION`. Returning
    /// `false` rejects the contact for this arbiter's lifetime (`IGNORE`).
    pub begin: Option<Box<dyn FnMut(&CollisionContext) -> bool>>,
    /// Called every step an arbiter is otherwise eligible to go active.
    /// Returning `false` rejects just this step.
    pub pre_solve: Option<Box<dyn FnMut(&CollisionContext) -> bool>>,
    /// Called once per step after the solver has applied impulses for an
    /// active arbiter.
    pub post_solve: Option<Box<dyn FnMut(&CollisionContext)>>,
    /// Called when a previously-active arbiter is evicted from the cache.
    pub separate: Option<Box<dyn FnMut(&CollisionContext)>>,
}

impl CollisionHandler {
    pub fn new(type_a: CollisionType, type_b: CollisionType) -> Self {
        CollisionHandler {
            type_a,
            type_b,
            begin: None,
            pre_solve: None,
            post_solve: None,
            separate: None,
        }
    }

    pub(crate) fn is_wildcard(&self) -> bool {
        self.type_a == WILDCARD || self.type_b == WILDCARD
    }

    pub(crate) fn run_begin(&mut self, ctx: &CollisionContext) -> bool {
        match &mut self.begin {
            Some(f) => f(ctx),
            None => true,
        }
    }

    pub(crate) fn run_pre_solve(&mut self, ctx: &CollisionContext) -> bool {
        match &mut self.pre_solve {
            Some(f) => f(ctx),
            None => true,
        }
    }

    pub(crate) fn run_post_solve(&mut self, ctx: &CollisionContext) {
        if let Some(f) = &mut self.post_solve {
            f(ctx);
        }
    }

    pub(crate) fn run_separate(&mut self, ctx: &CollisionContext) {
        if let Some(f) = &mut self.separate {
            f(ctx);
        }
    }
}

/// Symmetric key for the handler map: `(type_a, type_b)` and `(type_b,
/// type_a)` must resolve to the same entry.
fn pair_key(a: CollisionType, b: CollisionType) -> (CollisionType, CollisionType) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Dispatch table for [`CollisionHandler`]s, keyed by unordered type pair
/// with wildcard fallback (§4.3).
#[derive(Default)]
pub struct CollisionHandlerRegistry {
    handlers: HashMap<(CollisionType, CollisionType), CollisionHandler>,
    /// One-way latch: once any wildcard handler is registered, the default
    /// handler composes both one-sided wildcards instead of doing nothing.
    /// Can only ever be OR-ed to `true`, never reset.
    uses_wildcards: bool,
}

impl CollisionHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`, returning any handler previously registered for
    /// the same unordered pair.
    pub fn add(&mut self, handler: CollisionHandler) -> Option<CollisionHandler> {
        self.uses_wildcards |= handler.is_wildcard();
        let key = pair_key(handler.type_a, handler.type_b);
        self.handlers.insert(key, handler)
    }

    pub fn uses_wildcards(&self) -> bool {
        self.uses_wildcards
    }

    /// Resolves the handler for an unordered pair of collision types: exact
    /// match first, then one side replaced by the wildcard sentinel, then
    /// `None` (the caller treats a missing handler as "do nothing, accept").
    pub(crate) fn handler_for(
        &mut self,
        type_a: CollisionType,
        type_b: CollisionType,
    ) -> Option<&mut CollisionHandler> {
        let exact = pair_key(type_a, type_b);
        if self.handlers.contains_key(&exact) {
            return self.handlers.get_mut(&exact);
        }
        if !self.uses_wildcards {
            return None;
        }
        let wild_a = pair_key(WILDCARD, type_b);
        if self.handlers.contains_key(&wild_a) {
            return self.handlers.get_mut(&wild_a);
        }
        let wild_b = pair_key(type_a, WILDCARD);
        if self.handlers.contains_key(&wild_b) {
            return self.handlers.get_mut(&wild_b);
        }
        None
    }

    /// §4.3's composite default: when no exact handler exists for the pair
    /// and wildcards are in use, run *both* one-sided wildcard handlers
    /// (`type_a` vs wildcard, `type_b` vs wildcard) and AND their results,
    /// rather than falling back to whichever one happens to match first.
    /// Exact-match handlers still take priority and are dispatched alone.
    pub(crate) fn dispatch_begin(&mut self, type_a: CollisionType, type_b: CollisionType, ctx: &CollisionContext) -> bool {
        if let Some(h) = self.handlers.get_mut(&pair_key(type_a, type_b)) {
            return h.run_begin(ctx);
        }
        self.dispatch_wildcards(type_a, type_b, |h, ctx| h.run_begin(ctx), ctx)
    }

    pub(crate) fn dispatch_pre_solve(&mut self, type_a: CollisionType, type_b: CollisionType, ctx: &CollisionContext) -> bool {
        if let Some(h) = self.handlers.get_mut(&pair_key(type_a, type_b)) {
            return h.run_pre_solve(ctx);
        }
        self.dispatch_wildcards(type_a, type_b, |h, ctx| h.run_pre_solve(ctx), ctx)
    }

    pub(crate) fn dispatch_post_solve(&mut self, type_a: CollisionType, type_b: CollisionType, ctx: &CollisionContext) {
        if let Some(h) = self.handlers.get_mut(&pair_key(type_a, type_b)) {
            h.run_post_solve(ctx);
            return;
        }
        if !self.uses_wildcards {
            return;
        }
        if let Some(h) = self.handlers.get_mut(&pair_key(type_a, WILDCARD)) {
            h.run_post_solve(ctx);
        }
        if let Some(h) = self.handlers.get_mut(&pair_key(type_b, WILDCARD)) {
            h.run_post_solve(ctx);
        }
    }

    pub(crate) fn dispatch_separate(&mut self, type_a: CollisionType, type_b: CollisionType, ctx: &CollisionContext) {
        if let Some(h) = self.handlers.get_mut(&pair_key(type_a, type_b)) {
            h.run_separate(ctx);
            return;
        }
        if !self.uses_wildcards {
            return;
        }
        if let Some(h) = self.handlers.get_mut(&pair_key(type_a, WILDCARD)) {
            h.run_separate(ctx);
        }
        if let Some(h) = self.handlers.get_mut(&pair_key(type_b, WILDCARD)) {
            h.run_separate(ctx);
        }
    }

    fn dispatch_wildcards(
        &mut self,
        type_a: CollisionType,
        type_b: CollisionType,
        mut run: impl FnMut(&mut CollisionHandler, &CollisionContext) -> bool,
        ctx: &CollisionContext,
    ) -> bool {
        if !self.uses_wildcards {
            return true;
        }
        let mut ok = true;
        if let Some(h) = self.handlers.get_mut(&pair_key(type_a, WILDCARD)) {
            ok &= run(h, ctx);
        }
        if let Some(h) = self.handlers.get_mut(&pair_key(type_b, WILDCARD)) {
            ok &= run(h, ctx);
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_symmetric() {
        assert_eq!(pair_key(1, 2), pair_key(2, 1));
    }

    #[test]
    fn registering_wildcard_sets_latch_and_never_clears() {
        let mut reg = CollisionHandlerRegistry::new();
        assert!(!reg.uses_wildcards());
        reg.add(CollisionHandler::new(WILDCARD, 1));
        assert!(reg.uses_wildcards());
        reg.add(CollisionHandler::new(2, 3));
        assert!(reg.uses_wildcards());
    }

    #[test]
    fn exact_match_preferred_over_wildcard() {
        let mut reg = CollisionHandlerRegistry::new();
        reg.add(CollisionHandler::new(WILDCARD, 1));
        reg.add(CollisionHandler::new(1, 2));
        let h = reg.handler_for(1, 2).unwrap();
        assert_eq!((h.type_a, h.type_b), (1, 2));
    }

    #[test]
    fn falls_back_to_wildcard_when_no_exact_match() {
        let mut reg = CollisionHandlerRegistry::new();
        reg.add(CollisionHandler::new(WILDCARD, 1));
        let h = reg.handler_for(1, 99).unwrap();
        assert!(h.is_wildcard());
    }

    #[test]
    fn no_match_returns_none_without_wildcards() {
        let mut reg = CollisionHandlerRegistry::new();
        reg.add(CollisionHandler::new(1, 2));
        assert!(reg.handler_for(3, 4).is_none());
    }

    fn ctx_bodies() -> (Body, Body) {
        (Body::new_dynamic(1.0, 1.0), Body::new_dynamic(1.0, 1.0))
    }

    #[test]
    fn composite_default_ands_both_wildcard_begins() {
        let mut reg = CollisionHandlerRegistry::new();
        let mut h1 = CollisionHandler::new(WILDCARD, 1);
        h1.begin = Some(Box::new(|_| true));
        reg.add(h1);
        let mut h2 = CollisionHandler::new(WILDCARD, 2);
        h2.begin = Some(Box::new(|_| false));
        reg.add(h2);

        let (body_a, body_b) = ctx_bodies();
        let arbiter = crate::arbiter::Arbiter::new(
            crate::handle::ShapeKey(thunderdome::Arena::<()>::new().insert(())),
            crate::handle::ShapeKey(thunderdome::Arena::<()>::new().insert(())),
            crate::handle::BodyKey(thunderdome::Arena::<()>::new().insert(())),
            crate::handle::BodyKey(thunderdome::Arena::<()>::new().insert(())),
            (1, 2),
        );
        let ctx = CollisionContext { arbiter: &arbiter, body_a: &body_a, body_b: &body_b };

        // no exact handler for (1, 2): composes wildcard(1) AND wildcard(2).
        // wildcard(2)'s begin returns false, so the composite must too.
        assert!(!reg.dispatch_begin(1, 2, &ctx));
    }

    #[test]
    fn composite_default_true_when_both_wildcards_accept() {
        let mut reg = CollisionHandlerRegistry::new();
        let mut h1 = CollisionHandler::new(WILDCARD, 1);
        h1.begin = Some(Box::new(|_| true));
        reg.add(h1);

        let (body_a, body_b) = ctx_bodies();
        let arbiter = crate::arbiter::Arbiter::new(
            crate::handle::ShapeKey(thunderdome::Arena::<()>::new().insert(())),
            crate::handle::ShapeKey(thunderdome::Arena::<()>::new().insert(())),
            crate::handle::BodyKey(thunderdome::Arena::<()>::new().insert(())),
            crate::handle::BodyKey(thunderdome::Arena::<()>::new().insert(())),
            (1, 7),
        );
        let ctx = CollisionContext { arbiter: &arbiter, body_a: &body_a, body_b: &body_b };

        // type 7 has no wildcard handler registered; only type 1's applies.
        assert!(reg.dispatch_begin(1, 7, &ctx));
    }

    #[test]
    fn exact_handler_takes_priority_over_composite() {
        let mut reg = CollisionHandlerRegistry::new();
        let mut wild = CollisionHandler::new(WILDCARD, 1);
        wild.begin = Some(Box::new(|_| false));
        reg.add(wild);
        let mut exact = CollisionHandler::new(1, 2);
        exact.begin = Some(Box::new(|_| true));
        reg.add(exact);

        let (body_a, body_b) = ctx_bodies();
        let arbiter = crate::arbiter::Arbiter::new(
            crate::handle::ShapeKey(thunderdome::Arena::<()>::new().insert(())),
            crate::handle::ShapeKey(thunderdome::Arena::<()>::new().insert(())),
            crate::handle::BodyKey(thunderdome::Arena::<()>::new().insert(())),
            crate::handle::BodyKey(thunderdome::Arena::<()>::new().insert(())),
            (1, 2),
        );
        let ctx = CollisionContext { arbiter: &arbiter, body_a: &body_a, body_b: &body_b };

        assert!(reg.dispatch_begin(1, 2, &ctx));
    }
}
