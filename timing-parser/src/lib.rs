//! # timing-parser
//!
//! Decodes raw feed payloads from the two on-track timing protocols into
//! typed state-change updates the core applies to `SessionState`.
//!
//! - [`rmonitor`] — the legacy ASCII timing protocol
//! - [`multiloop`] — the delimited multi-loop protocol
//! - [`message`] — the `TimingMessage` envelope dispatched by the ingress
//!
//! Parsing is best-effort throughout: a malformed record is skipped
//! rather than aborting the rest of the payload, matching the decoder
//! contracts in the core's component design.

pub mod error;
pub mod message;
pub mod multiloop;
pub mod rmonitor;

pub use error::{ParseError, ParseResult};
pub use message::{TimingMessage, TimingMessageType};
