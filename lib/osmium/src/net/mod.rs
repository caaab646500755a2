//! Socket-facing half of the engine: readiness watching, per-connection framed
//! buffers and the single-threaded event loop tying them together.

pub mod buffer;
pub mod endpoint;
pub mod notifier;
pub mod support;
