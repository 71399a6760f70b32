//! 策略层类型：策略类别、步骤描述、选择信号与统一执行结果

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::RuntimeError;
use crate::resources::{ResourceConstraints, ResourceUsage};

/// 执行策略类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    /// 对话式（模型驱动，逐轮交互）
    Conversational,
    /// 推理式（模型驱动，多步推理 + 工具）
    Reasoning,
    /// 确定性（不依赖模型）
    Deterministic,
}

impl StrategyType {
    /// 回退顺序：主策略失败时取其后第一个已注册的类别（循环）
    pub const FALLBACK_ORDER: [StrategyType; 3] = [
        StrategyType::Conversational,
        StrategyType::Reasoning,
        StrategyType::Deterministic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Conversational => "conversational",
            StrategyType::Reasoning => "reasoning",
            StrategyType::Deterministic => "deterministic",
        }
    }

    /// 步骤类型缺省对应的策略
    pub fn default_for_step_type(step_type: &str) -> Option<StrategyType> {
        match step_type.to_lowercase().as_str() {
            "chat" | "conversation" | "conversational" | "prompt" => {
                Some(StrategyType::Conversational)
            }
            "reasoning" | "analysis" | "decision" | "plan" | "planning" => {
                Some(StrategyType::Reasoning)
            }
            "action" | "transform" | "api" | "code" | "deterministic" | "tool" => {
                Some(StrategyType::Deterministic)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "conversational" => Ok(StrategyType::Conversational),
            "reasoning" => Ok(StrategyType::Reasoning),
            "deterministic" => Ok(StrategyType::Deterministic),
            other => Err(RuntimeError::Configuration(format!(
                "unknown strategy type: {other}"
            ))),
        }
    }
}

/// 策略在哪里执行（决定网络可达性是否影响选择）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLocality {
    Local,
    Cloud,
}

/// 本地 / 云端执行资源的可达性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub local_available: bool,
    pub cloud_available: bool,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            local_available: true,
            cloud_available: true,
        }
    }
}

/// 交给执行器的单步描述
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepContext {
    pub step_id: String,
    pub name: String,
    pub step_type: String,
    /// 显式指定的策略（最高优先级）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_override: Option<StrategyType>,
    /// 字面量输入
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// 参数名 -> 上下文变量名
    #[serde(default)]
    pub input_bindings: HashMap<String, String>,
    /// 输出约束；None 表示不校验
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub requested: ResourceUsage,
    #[serde(default)]
    pub constraints: ResourceConstraints,
}

impl StepContext {
    pub fn new(step_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        let step_id = step_id.into();
        Self {
            name: step_id.clone(),
            step_id,
            step_type: step_type.into(),
            ..Self::default()
        }
    }

    pub fn with_override(mut self, strategy: StrategyType) -> Self {
        self.strategy_override = Some(strategy);
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_binding(mut self, param: impl Into<String>, variable: impl Into<String>) -> Self {
        self.input_bindings.insert(param.into(), variable.into());
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_requested(mut self, requested: ResourceUsage) -> Self {
        self.requested = requested;
        self
    }

    pub fn with_constraints(mut self, constraints: ResourceConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// 历史运行得出的使用提示
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_strategy: Option<StrategyType>,
    /// 该偏好对应的历史成功率
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub samples: u64,
}

/// 结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
    ResourceLimited,
    ValidationFailed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub strategy_type: StrategyType,
    pub elapsed_ms: u64,
    pub resource_usage: ResourceUsage,
    pub confidence: f64,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFeedback {
    pub outcome: ExecutionOutcome,
    pub performance_score: f64,
}

/// 统一执行结果：无论成功、拒绝还是异常，调用方拿到的形状都一样
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: ExecutionMetadata,
    pub feedback: ExecutionFeedback,
}

impl StrategyExecutionResult {
    /// 结构化失败结果（置信度为 0）
    pub fn failure(
        strategy_type: StrategyType,
        outcome: ExecutionOutcome,
        error: impl Into<String>,
        elapsed_ms: u64,
        resource_usage: ResourceUsage,
        fallback_used: bool,
        target_ms: u64,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            metadata: ExecutionMetadata {
                strategy_type,
                elapsed_ms,
                resource_usage,
                confidence: 0.0,
                fallback_used,
            },
            feedback: ExecutionFeedback {
                outcome,
                performance_score: performance_score(false, 0.0, elapsed_ms, fallback_used, target_ms),
            },
        }
    }
}

/// 性能分
///
/// 基础分 成功 0.8 / 失败 0.2；加 confidence × 0.1；
/// 耗时低于目标 +0.1，超过目标两倍 -0.1；使用了回退策略 -0.05；最后截断到 [0, 1]。
pub fn performance_score(
    success: bool,
    confidence: f64,
    duration_ms: u64,
    fallback_used: bool,
    target_ms: u64,
) -> f64 {
    let mut score = if success { 0.8 } else { 0.2 };
    score += confidence * 0.1;
    if duration_ms < target_ms {
        score += 0.1;
    } else if duration_ms > target_ms.saturating_mul(2) {
        score -= 0.1;
    }
    if fallback_used {
        score -= 0.05;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: u64 = 30_000;

    #[test]
    fn test_performance_score() {
        assert_eq!(performance_score(true, 1.0, 10_000, false, TARGET), 1.0);
        assert!((performance_score(true, 0.5, 45_000, false, TARGET) - 0.85).abs() < 1e-9);
        assert!((performance_score(true, 0.0, 70_000, true, TARGET) - 0.65).abs() < 1e-9);
        assert!((performance_score(false, 0.0, 10_000, false, TARGET) - 0.3).abs() < 1e-9);
        assert!((performance_score(false, 0.0, 90_000, true, TARGET) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_strategy_type_parse() {
        assert_eq!("Reasoning".parse::<StrategyType>().unwrap(), StrategyType::Reasoning);
        assert!("magic".parse::<StrategyType>().is_err());
        assert_eq!(
            StrategyType::default_for_step_type("chat"),
            Some(StrategyType::Conversational)
        );
        assert_eq!(StrategyType::default_for_step_type("unknown"), None);
    }
}
