//! 运行时错误类型
//!
//! 只有配置错误与熔断拒绝会以 Err 形式向上传播；预算拒绝、校验失败、步骤失败都作为结果数据返回。

use thiserror::Error;

/// 分层执行运行时中可能出现的错误
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// 构造参数非法（如熔断器阈值 < 1），在构造时即失败
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// 熔断器处于打开状态，调用未被执行
    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    /// 分支内某一步失败；只影响该分支自身的结果
    #[error("Branch {branch_id} failed at step {step_id}: {reason}")]
    BranchExecution {
        branch_id: String,
        step_id: String,
        reason: String,
    },

    #[error("Run state store error: {0}")]
    StateStore(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Execution cancelled")]
    Cancelled,

    /// 未预料到的错误（含 panic），在 UnifiedExecutor 边界被转换为失败结果
    #[error("Unexpected execution error: {0}")]
    Unexpected(String),
}
