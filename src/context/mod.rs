//! 上下文层：作用域栈、黑板、分支克隆与合并、检查点

pub mod manager;
pub mod types;

pub use manager::{ContextManager, MergeStrategy, VariableLookup, VariableSource};
pub use types::{
    Blackboard, Checkpoint, ContextScope, Location, RunContext, RunId, BRANCH_SCOPE_PREFIX,
    GLOBAL_SCOPE_ID,
};
