//! Broadphase and narrowphase collision collaborators (§4.4, §4.8).

mod aabb;
mod brute_force;
mod collide;
mod hgrid;
pub(crate) mod narrowphase;
mod spatial_index;

pub use aabb::Aabb;
pub use brute_force::BruteForce;
pub use collide::{CircleCollider, Collide, CollideInfo};
pub use hgrid::{HGrid, HGridParams};
pub use spatial_index::SpatialIndex;
