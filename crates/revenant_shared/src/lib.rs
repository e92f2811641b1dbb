//! # REVENANT Shared Types
//!
//! Wire-canonical types used by both endpoints of a replicated session.
//!
//! The replication protocol carries no schema: a position is three floats
//! because both ends were compiled from this crate, not because the wire
//! says so. Every type here is therefore part of the protocol contract —
//! change one and you have changed the wire format.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod math;

pub use math::{Quat, Vec3};
