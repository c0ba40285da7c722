//! Shared model for the identity resource engine: resource records,
//! bindings, error taxonomy, and the injectable clock/RNG/event seams.

pub mod binding;
pub mod clock;
pub mod error;
pub mod events;
pub mod regions;
pub mod resource;
pub mod rng;
pub mod transport;
pub mod types;

pub use binding::{Binding, BindingEnd, BindingKey, BindingReason, EndedBinding};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventSink, RecordingEventSink, TracingEventSink};
pub use resource::{
    DeviceProfile, FingerprintSummary, Geolocation, HealthState, ProxyProfile, ProxyProtocol,
    Resource, ResourceProfile, RotationState, ScreenProfile, SessionIdentityProfile, UsageStats,
};
pub use rng::{FixedRngSource, HashedRngSource, RngSource};
pub use transport::{BrowserContext, ProxyConfig, TransportBundle};
pub use types::{
    ConsistencyLevel, ResourceId, ResourceKind, ResourceStatus, RotationStrategy,
    RotationTrigger, ViolationKind,
};
