//! # timing-protocol
//!
//! Low-level, zero-I/O tokenizing and formatting primitives for the two
//! on-track timing feeds the core consumes: the ASCII **RMonitor**
//! protocol and the delimited **Multiloop** protocol.
//!
//! ## What This Library Provides
//!
//! - RMonitor quoted-CSV record tokenizer
//! - Multiloop `\x02`-delimited record tokenizer and fixed-header parsing
//! - The shared `Flag` enum and its RMonitor code mapping
//! - Clock/duration parsing and gap formatting helpers
//!
//! ## What This Library Does NOT Provide
//!
//! - Decoding tokens into typed state-change updates (see `timing-parser`)
//! - I/O operations (stream framing, sockets, the broker)
//!
//! This is a pure logic library with no I/O dependencies, mirroring the
//! separation between protocol primitives and the decoder that consumes
//! them.

pub mod error;
pub mod flag;
pub mod multiloop;
pub mod rmonitor;
pub mod time;

pub use error::{ProtocolError, ProtocolResult};
pub use flag::Flag;
