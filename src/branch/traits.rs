//! 分支协调器依赖的外部协作者：工作流图导航器与单步执行器

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Location, RunContext};
use crate::core::RuntimeError;

/// 工作流图中一个步骤的描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    pub id: String,
    pub name: String,
    /// 步骤类型（如 "action"、"decision"、"chat"）
    pub step_type: String,
    /// 需要从上下文解析的输入变量名
    #[serde(default)]
    pub inputs: Vec<String>,
}

/// 工作流图访问器
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn get_step_info(&self, location: &Location) -> Result<StepInfo, RuntimeError>;

    /// 给定并行结构的入口位置，返回有序的候选路径（每条路径是有序的位置序列）
    ///
    /// 不支持并行枚举的导航器保持默认实现（返回 None）。
    async fn get_parallel_branches(
        &self,
        _locations: &[Location],
    ) -> Result<Option<Vec<Vec<Location>>>, RuntimeError> {
        Ok(None)
    }
}

/// 传给单步执行器的参数
#[derive(Debug, Clone)]
pub struct StepExecutionParams {
    pub run_id: String,
    pub branch_id: String,
    pub location: Location,
    pub step: StepInfo,
    /// 分支上下文快照（黑板与分支共享）
    pub context: RunContext,
}

/// 单步执行结果
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub success: bool,
    pub outputs: HashMap<String, Value>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn succeeded(outputs: HashMap<String, Value>, duration_ms: u64) -> Self {
        Self {
            success: true,
            outputs,
            duration_ms,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            outputs: HashMap::new(),
            duration_ms,
            error: Some(error.into()),
        }
    }
}

/// 单步执行器
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute_step(&self, params: StepExecutionParams) -> Result<StepOutcome, RuntimeError>;
}
