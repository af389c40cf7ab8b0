//! Island-based sleeping (§4.5): per-body idle accounting, contact/constraint
//! driven wake-up, and a connected-components flood-fill that only lets a
//! whole island sleep once every member has been idle long enough.
//!
//! Per-body sleeping is unstable for anything stacked or linked -- one body
//! in a pile going still while its neighbors are still settling causes
//! jitter -- so the unit of sleep is the island, found by walking the
//! contact+constraint graph with kinematic and static bodies acting as
//! barriers that are never themselves put to sleep and never crossed.

use thunderdome as td;

use crate::body::{Body, BodyType};
use crate::graph::{BodyGraph, Edge};
use crate::handle::{ArbiterKey, BodyKey, ConstraintKey};

pub struct SleepPassParams {
    pub dt: f64,
    pub gravity: ultraviolet::DVec2,
    pub idle_speed_threshold: f64,
    pub sleep_time_threshold: f64,
}

/// One arbiter edge, as seen by the sleep pass: the two bodies it connects
/// (order irrelevant) and whether it's currently a candidate for the active
/// arbiter list (always true here -- only active arbiters reach this pass).
pub struct ArbiterEdge {
    pub key: ArbiterKey,
    pub body_a: BodyKey,
    pub body_b: BodyKey,
}

pub struct ConstraintEdge {
    pub key: ConstraintKey,
    pub body_a: BodyKey,
    pub body_b: BodyKey,
}

/// Result of one sleep pass: which bodies were newly put to sleep (grouped
/// by island) and which sleeping bodies were woken.
#[derive(Default)]
pub struct SleepOutcome {
    pub newly_slept_islands: Vec<Vec<BodyKey>>,
    pub woken: Vec<BodyKey>,
}

#[derive(Default)]
pub struct SleepGraph {
    graph: BodyGraph,
}

impl SleepGraph {
    pub fn run(
        &mut self,
        bodies: &mut td::Arena<Body>,
        dynamic: &[BodyKey],
        arbiters: &[ArbiterEdge],
        constraints: &[ConstraintEdge],
        params: &SleepPassParams,
    ) -> SleepOutcome {
        let mut index_of = std::collections::HashMap::with_capacity(dynamic.len());
        for (i, key) in dynamic.iter().enumerate() {
            index_of.insert(*key, i);
        }

        let mut outcome = SleepOutcome::default();

        // 1. idle accounting
        let dv_sq = (params.idle_speed_threshold * params.idle_speed_threshold)
            .max(params.gravity.mag_sq() * params.dt * params.dt);
        for &key in dynamic {
            let body = &mut bodies[key.index()];
            let ke_threshold = body.mass.value().max(0.0) * dv_sq;
            if body.kinetic_energy() > ke_threshold {
                body.sleeping_idle_time = 0.0;
            } else {
                body.sleeping_idle_time += params.dt;
            }
        }

        // 2. wake through contacts
        for edge in arbiters {
            self.wake_pair(bodies, edge.body_a, edge.body_b, &mut outcome.woken);
        }
        // 3. wake through kinematic constraints
        for edge in constraints {
            self.wake_pair(bodies, edge.body_a, edge.body_b, &mut outcome.woken);
        }

        // thread dynamic-dynamic edges for the flood fill
        self.graph.resize(dynamic.len());
        for edge in arbiters {
            self.thread_if_both_dynamic(&index_of, edge.body_a, edge.body_b, Edge::Arbiter {
                key: edge.key,
                other: 0,
                other_is_static: false,
            });
        }
        for edge in constraints {
            self.thread_if_both_dynamic(&index_of, edge.body_a, edge.body_b, Edge::Constraint {
                key: edge.key,
                other: 0,
                other_is_static: false,
            });
        }

        // 4. flood-fill islands
        let mut visited = vec![false; dynamic.len()];
        for start in 0..dynamic.len() {
            if visited[start] {
                continue;
            }
            let mut island = Vec::new();
            let mut stack = vec![start];
            visited[start] = true;
            while let Some(idx) = stack.pop() {
                island.push(idx);
                let neighbors: Vec<usize> = self.graph.iter(idx).map(|e| e.other()).collect();
                for n in neighbors {
                    if !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }

            let all_idle = island
                .iter()
                .all(|&i| bodies[dynamic[i].index()].sleeping_idle_time >= params.sleep_time_threshold);

            if all_idle {
                let keys: Vec<BodyKey> = island.iter().map(|&i| dynamic[i]).collect();
                for &key in &keys {
                    bodies[key.index()].is_sleeping = true;
                }
                outcome.newly_slept_islands.push(keys);
            }
        }

        outcome
    }

    fn wake_pair(&self, bodies: &mut td::Arena<Body>, a: BodyKey, b: BodyKey, woken: &mut Vec<BodyKey>) {
        let (ty_a, sleeping_a) = {
            let body = &bodies[a.index()];
            (body.ty, body.is_sleeping)
        };
        let (ty_b, sleeping_b) = {
            let body = &bodies[b.index()];
            (body.ty, body.is_sleeping)
        };

        let should_wake_b = sleeping_b
            && ty_b == BodyType::Dynamic
            && (ty_a == BodyType::Kinematic || !sleeping_a);
        let should_wake_a = sleeping_a
            && ty_a == BodyType::Dynamic
            && (ty_b == BodyType::Kinematic || !sleeping_b);

        if should_wake_b {
            let body = &mut bodies[b.index()];
            body.is_sleeping = false;
            body.sleeping_idle_time = 0.0;
            woken.push(b);
        }
        if should_wake_a {
            let body = &mut bodies[a.index()];
            body.is_sleeping = false;
            body.sleeping_idle_time = 0.0;
            woken.push(a);
        }
    }

    fn thread_if_both_dynamic(
        &mut self,
        index_of: &std::collections::HashMap<BodyKey, usize>,
        a: BodyKey,
        b: BodyKey,
        edge_template: Edge,
    ) {
        if let (Some(&ia), Some(&ib)) = (index_of.get(&a), index_of.get(&b)) {
            let (key_for_a, key_for_b) = match edge_template {
                Edge::Arbiter { key, .. } => (
                    Edge::Arbiter {
                        key,
                        other: ib,
                        other_is_static: false,
                    },
                    Edge::Arbiter {
                        key,
                        other: ia,
                        other_is_static: false,
                    },
                ),
                Edge::Constraint { key, .. } => (
                    Edge::Constraint {
                        key,
                        other: ib,
                        other_is_static: false,
                    },
                    Edge::Constraint {
                        key,
                        other: ia,
                        other_is_static: false,
                    },
                ),
            };
            self.graph.insert(ia, key_for_a);
            self.graph.insert(ib, key_for_b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;

    fn insert_body(arena: &mut td::Arena<Body>, body: Body) -> BodyKey {
        BodyKey(arena.insert(body))
    }

    #[test]
    fn lone_idle_body_sleeps_after_threshold() {
        let mut bodies: td::Arena<Body> = td::Arena::new();
        let a = insert_body(&mut bodies, Body::new_dynamic(1.0, 1.0));
        let dynamic = vec![a];
        let mut graph = SleepGraph::default();
        let params = SleepPassParams {
            dt: 1.0,
            gravity: ultraviolet::DVec2::zero(),
            idle_speed_threshold: 0.1,
            sleep_time_threshold: 0.5,
        };
        let outcome = graph.run(&mut bodies, &dynamic, &[], &[], &params);
        assert_eq!(outcome.newly_slept_islands.len(), 1);
        assert!(bodies[a.index()].is_sleeping);
    }

    #[test]
    fn moving_body_never_sleeps() {
        let mut bodies: td::Arena<Body> = td::Arena::new();
        let mut b = Body::new_dynamic(1.0, 1.0);
        b.velocity.linear = ultraviolet::DVec2::new(100.0, 0.0);
        let a = insert_body(&mut bodies, b);
        let dynamic = vec![a];
        let mut graph = SleepGraph::default();
        let params = SleepPassParams {
            dt: 1.0,
            gravity: ultraviolet::DVec2::zero(),
            idle_speed_threshold: 0.1,
            sleep_time_threshold: 0.5,
        };
        let outcome = graph.run(&mut bodies, &dynamic, &[], &[], &params);
        assert!(outcome.newly_slept_islands.is_empty());
        assert!(!bodies[a.index()].is_sleeping);
    }

    #[test]
    fn kinematic_neighbor_wakes_sleeping_dynamic_body() {
        let mut bodies: td::Arena<Body> = td::Arena::new();
        let mut sleeper = Body::new_dynamic(1.0, 1.0);
        sleeper.is_sleeping = true;
        let a = insert_body(&mut bodies, sleeper);
        let b = insert_body(&mut bodies, Body::new_kinematic());

        let mut arbiters: thunderdome::Arena<()> = thunderdome::Arena::new();
        let arb_key = ArbiterKey(arbiters.insert(()));
        let edges = vec![ArbiterEdge {
            key: arb_key,
            body_a: a,
            body_b: b,
        }];

        let dynamic = vec![a];
        let mut graph = SleepGraph::default();
        let params = SleepPassParams {
            dt: 1.0,
            gravity: ultraviolet::DVec2::zero(),
            idle_speed_threshold: 0.1,
            sleep_time_threshold: 0.5,
        };
        let outcome = graph.run(&mut bodies, &dynamic, &edges, &[], &params);
        assert!(outcome.woken.contains(&a));
        assert!(!bodies[a.index()].is_sleeping);
    }
}
