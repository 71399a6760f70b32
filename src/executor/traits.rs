//! 执行器的外部协作者：输入准备、输出校验、上下文导出、工具调用

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;
use crate::core::RuntimeError;
use crate::strategy::StepContext;

/// 根据步骤声明与 run 上下文准备输入
#[async_trait]
pub trait IoProcessor: Send + Sync {
    async fn build_input_payload(
        &self,
        step: &StepContext,
        context: &RunContext,
    ) -> Result<HashMap<String, Value>, RuntimeError>;
}

/// 校验结果：通过时 data 为（可能规整过的）结果，失败时 errors 非空
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            valid: true,
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            data: None,
            errors,
        }
    }
}

/// 输出校验
pub trait ValidationEngine: Send + Sync {
    fn validate(&self, raw: &Value, schema: &Value) -> ValidationOutcome;
}

/// 把步骤产生的上下文变化同步给上层
#[async_trait]
pub trait ContextExporter: Send + Sync {
    async fn export(
        &self,
        step: &StepContext,
        outputs: &Value,
        context: &RunContext,
    ) -> Result<(), RuntimeError>;
}

/// 工具调用入口（策略在执行中使用）
#[async_trait]
pub trait ToolOrchestrator: Send + Sync {
    async fn invoke(&self, tool: &str, args: Value) -> Result<Value, RuntimeError>;
}

/// 不导出任何东西
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

#[async_trait]
impl ContextExporter for NoopExporter {
    async fn export(
        &self,
        _step: &StepContext,
        _outputs: &Value,
        _context: &RunContext,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// 把输出写到黑板 `step:{step_id}`，对 run 的所有分支可见
#[derive(Debug, Default, Clone, Copy)]
pub struct BlackboardExporter;

impl BlackboardExporter {
    pub fn key(step_id: &str) -> String {
        format!("step:{step_id}")
    }
}

#[async_trait]
impl ContextExporter for BlackboardExporter {
    async fn export(
        &self,
        step: &StepContext,
        outputs: &Value,
        context: &RunContext,
    ) -> Result<(), RuntimeError> {
        context
            .blackboard
            .set(Self::key(&step.step_id), outputs.clone());
        Ok(())
    }
}
