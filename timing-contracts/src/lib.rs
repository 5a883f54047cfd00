//! # timing-contracts
//!
//! Wire-stable types that cross the boundary between the race timing
//! core and its external collaborators: the broker (stream field names,
//! cache keys, consumer group names), the relational store (patch
//! application targets), and the fan-out hub (the envelope types pushed
//! to subscribed clients).
//!
//! Kept as its own crate so the wire shape can be versioned and consumed
//! independently of the pipeline's internal mutable state.

pub mod hub;
pub mod patch;
pub mod stream;

pub use hub::*;
pub use patch::*;
pub use stream::*;
