//! Wire protocol and the pure state machines that interpret the worker's event
//! stream. Nothing in here performs I/O; the engine feeds events in and sends the
//! returned commands out.

pub mod device;
pub mod media;
pub mod protocol;

/// Literal the worker uses for "no device" / "no media" instead of an absent value.
pub const UNKNOWN_SENTINEL: &str = "Unknown";
