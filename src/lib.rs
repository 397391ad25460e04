//! rescache: budgeted GPU resource cache with scratch and unique key reuse.
//!
//! See `DESIGN.md` for internal architecture and invariants.

pub mod ds;

pub mod cache;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod prelude;
pub mod resource;
pub mod stats;
