//! 分支层：并行扇出、分支内串行执行、失败隔离

pub mod coordinator;
pub mod traits;
pub mod types;

pub use coordinator::{BranchCoordinator, RunHandle};
pub use traits::{Navigator, StepExecutionParams, StepExecutor, StepInfo, StepOutcome};
pub use types::{BranchExecution, BranchResult, BranchStatus};
