//! mediawire-core: shared types, wire format, control messages and
//! configuration. All other Mediawire crates depend on this one.

pub mod clock;
pub mod config;
pub mod control;
pub mod wire;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::MediaConfig;
pub use control::ControlMessage;
pub use wire::{HeaderFlags, MediaKind, Protocol, WireError, WireHeader};
