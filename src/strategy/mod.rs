//! 策略层：策略接口、注册表、使用提示与选择器

pub mod hints;
pub mod registry;
pub mod selector;
pub mod traits;
pub mod types;

pub use hints::{StrategyStats, UsageHintStore};
pub use registry::StrategyRegistry;
pub use selector::{SelectedStrategy, SelectionReason, SelectorConfig, StrategySelector};
pub use traits::{ExecutionStrategy, PassthroughStrategy, StrategyOutput, StrategyRequest};
pub use types::{
    performance_score, ExecutionFeedback, ExecutionLocality, ExecutionMetadata, ExecutionOutcome,
    NetworkState, StepContext, StrategyExecutionResult, StrategyType, UsageHints,
};
