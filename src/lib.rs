//! A 2D rigid body simulation core: islands, persistent contacts, iterative
//! impulse solving.
//!
//! [`Space`] is the entry point: it owns every [`body::Body`],
//! [`shape::Shape`] and [`constraint::Constraint`] and advances them with
//! [`Space::step`].

#[macro_use]
mod tracy_helpers {
    macro_rules! tracy_span {
        ($name: literal, $func_name: literal) => {
            tracy_client::Span::new($name, $func_name, file!(), line!(), 100)
        };
    }
}

pub mod arbiter;
pub mod body;
pub mod collision;
pub mod constraint;
pub mod contact_buffer;
pub mod error;
pub mod graph;
pub mod handle;
pub mod handler;
pub mod lock;
pub mod shape;
pub mod sleep;
pub mod space;

pub use body::{Body, BodyType};
pub use constraint::Constraint;
pub use error::{Result, SpaceError};
pub use handle::{ArbiterKey, BodyKey, ConstraintKey, ShapeKey};
pub use shape::Shape;
pub use space::Space;
