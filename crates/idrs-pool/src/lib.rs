//! Resource registry, profile generation, scoring and selection draw.

pub mod generator;
pub mod history;
pub mod pool;
pub mod scoring;
pub mod selection;

pub use generator::{ProfileGenerator, ResourceHints};
pub use pool::{
    ActiveResources, BindingSlot, FlushReport, KindStats, PoolSettings, PoolStats, ResourceFilter,
    ResourcePool,
};
pub use scoring::{ScoreBreakdown, ScoreContext};
pub use selection::Ranked;
