//! Producer side: engine hooks in, sequenced events out.

pub mod bridge;
pub mod preview;
pub mod script;
pub mod shadow;

pub use bridge::{CaptureBridge, CaptureConfig};
pub use script::{ScriptStep, ScriptedRun};
pub use shadow::ShadowStore;
