//! Consumer side: follow a thread's stream and rebuild its timeline.

pub mod error;
pub mod poller;
pub mod reconstruct;
pub mod session;
pub mod subscribe;

pub use error::ClientError;
pub use poller::{HttpMetricsSource, HybridPoller, MetricsSource, PollState};
pub use reconstruct::{OpenStepPolicy, ReasoningStep, Reconstructor};
pub use session::{ConsumerSession, SessionUpdate};
pub use subscribe::{Subscriber, SubscriberConfig};
