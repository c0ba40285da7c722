//! Selection path, rotation, health probing, background tasks and the
//! `Engine` facade tying the pool, store and validator together.

pub mod engine;
pub mod health;
pub mod rotation;
pub mod selector;
pub mod tasks;

pub use engine::{Engine, EngineBuilder, SessionOutcome, ShutdownReport};
pub use health::{AuditReport, HealthMonitor, ProbeReport, ProbeResult, Prober, TcpProber};
pub use rotation::{PendingRotation, RotationScheduler, SweepReport, trigger_order};
pub use selector::{AcquireRequest, SelectionPlan, Selector};
pub use tasks::BackgroundTasks;

#[cfg(test)]
mod test_support;
