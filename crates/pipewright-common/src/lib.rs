//! Types shared between the pipewright server and anything that subscribes
//! to its push channel.
//!
//! Publisher and subscribers share one [`EventCategory`] enumeration.

pub mod event;
pub mod stage;

pub use event::{Decoded, EventCategory, LogCategory, PROTOCOL_VERSION, PushMessage, decode};
pub use stage::{Stage, StagePosition, UnknownStage};
