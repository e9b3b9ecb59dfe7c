//! Consumer-facing side: per-thread channels, delivery tasks and the HTTP
//! surface that streams them.

use std::sync::Arc;

use skein_capture::{CaptureBridge, CaptureConfig, ShadowStore};
use skein_telemetry::MetricsAggregator;

pub mod auth;
pub mod channel;
pub mod delivery;
pub mod hub;
pub mod server;
pub mod settings;

pub use auth::{AllowAll, Authorizer, Principal, StaticTokens};
pub use channel::{ChannelConfig, ChannelError, DrainPolicy, ThreadChannel};
pub use delivery::DeliveryOutcome;
pub use hub::{ChannelHub, Subscription};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use settings::{load_settings, SkeinSettings};

/// Bridge, hub, shadow and metrics wired together.
///
/// The shadow observes before metrics so a snapshot taken on resync already
/// reflects the envelope being stamped.
pub struct Pipeline {
    pub hub: Arc<ChannelHub>,
    pub shadow: Arc<ShadowStore>,
    pub bridge: Arc<CaptureBridge>,
    pub metrics: Arc<MetricsAggregator>,
}

impl Pipeline {
    pub fn new(channel: ChannelConfig, capture: CaptureConfig, metrics: Arc<MetricsAggregator>) -> Self {
        let shadow = Arc::new(ShadowStore::new());
        let hub = Arc::new(
            ChannelHub::new(channel)
                .with_observer(shadow.clone())
                .with_observer(metrics.clone())
                .with_snapshot_source(shadow.clone()),
        );
        let bridge = Arc::new(CaptureBridge::new(hub.clone(), shadow.clone(), capture));
        Self {
            hub,
            shadow,
            bridge,
            metrics,
        }
    }

    pub fn app_state(&self, authorizer: Arc<dyn Authorizer>) -> AppState {
        AppState {
            hub: self.hub.clone(),
            metrics: self.metrics.clone(),
            authorizer,
        }
    }
}
