//! Event model, sequencing, wire format, usage fold and graph layout shared
//! by every skein crate.

pub mod errors;
pub mod events;
pub mod hooks;
pub mod ids;
pub mod layout;
pub mod sequencer;
pub mod sink;
pub mod usage;
pub mod wire;
