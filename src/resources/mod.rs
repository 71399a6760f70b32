//! 资源预算：预留、用量累计、结算与准入控制

pub mod manager;
pub mod types;

pub use manager::{ResourceLimits, ResourceManager, UsageTracker};
pub use types::{
    ResourceConstraints, ResourceKind, ResourceReservation, ResourceSnapshot, ResourceUsage,
    UsageReport,
};
