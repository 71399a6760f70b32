//! 执行策略接口与内置的直通策略

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::RuntimeError;
use crate::executor::ToolOrchestrator;
use crate::resources::{ResourceUsage, UsageTracker};
use crate::strategy::types::{ExecutionLocality, StepContext, StrategyType};

/// 交给策略的一次执行请求
#[derive(Clone)]
pub struct StrategyRequest {
    pub step: StepContext,
    /// IoProcessor 准备好的输入
    pub inputs: HashMap<String, Value>,
    /// 已批准的分配量
    pub allocation: ResourceUsage,
    /// 执行中上报用量（例如每次工具调用）
    pub tracker: UsageTracker,
    pub tools: Option<Arc<dyn ToolOrchestrator>>,
}

/// 策略执行产物
#[derive(Debug, Clone, Default)]
pub struct StrategyOutput {
    pub result: Value,
    /// [0, 1]
    pub confidence: f64,
    /// 结束时一次性报告的用量；已经通过 tracker 上报的部分不要重复计入
    pub usage: ResourceUsage,
}

/// 执行策略
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn strategy_type(&self) -> StrategyType;

    fn name(&self) -> &str;

    fn locality(&self) -> ExecutionLocality {
        ExecutionLocality::Local
    }

    async fn execute(&self, request: StrategyRequest) -> Result<StrategyOutput, RuntimeError>;
}

/// 确定性直通策略：把准备好的输入原样作为输出
pub struct PassthroughStrategy;

#[async_trait]
impl ExecutionStrategy for PassthroughStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Deterministic
    }

    fn name(&self) -> &str {
        "passthrough"
    }

    async fn execute(&self, request: StrategyRequest) -> Result<StrategyOutput, RuntimeError> {
        Ok(StrategyOutput {
            result: Value::Object(request.inputs.into_iter().collect()),
            confidence: 1.0,
            usage: ResourceUsage::default(),
        })
    }
}
