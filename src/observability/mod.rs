//! 可观测性：日志初始化与遥测事件

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::resources::ResourceUsage;
use crate::strategy::StrategyType;

/// 安装全局 subscriber；RUST_LOG 可覆盖默认的 info 级别。重复调用无副作用。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 执行器在固定节点发出的遥测事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    LimitExceeded {
        step_id: String,
        strategy_type: StrategyType,
        reason: String,
        requested: ResourceUsage,
    },
    ValidationFailed {
        step_id: String,
        strategy_type: StrategyType,
        errors: Vec<String>,
    },
    StepCompleted {
        step_id: String,
        strategy_type: StrategyType,
        elapsed_ms: u64,
        confidence: f64,
        fallback_used: bool,
        performance_score: f64,
        resource_usage: ResourceUsage,
    },
    StepFailed {
        step_id: String,
        strategy_type: StrategyType,
        error: String,
    },
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::LimitExceeded { .. } => "limit_exceeded",
            TelemetryEvent::ValidationFailed { .. } => "validation_failed",
            TelemetryEvent::StepCompleted { .. } => "step_completed",
            TelemetryEvent::StepFailed { .. } => "step_failed",
        }
    }

    pub fn step_id(&self) -> &str {
        match self {
            TelemetryEvent::LimitExceeded { step_id, .. }
            | TelemetryEvent::ValidationFailed { step_id, .. }
            | TelemetryEvent::StepCompleted { step_id, .. }
            | TelemetryEvent::StepFailed { step_id, .. } => step_id,
        }
    }
}

/// 遥测出口（发出即忘）
pub trait TelemetryShim: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// 默认实现：每个事件输出一条带 JSON 负载的结构化日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetryShim for TracingTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        match &event {
            TelemetryEvent::StepCompleted { .. } => {
                tracing::info!(telemetry = %payload, step_id = event.step_id(), "telemetry")
            }
            _ => tracing::warn!(telemetry = %payload, step_id = event.step_id(), "telemetry"),
        }
    }
}

/// 在内存里收集事件（测试与诊断用）
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(TelemetryEvent::name).collect()
    }
}

impl TelemetryShim for RecordingTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payload_is_tagged() {
        let event = TelemetryEvent::StepFailed {
            step_id: "s1".into(),
            strategy_type: StrategyType::Deterministic,
            error: "boom".into(),
        };
        let payload = serde_json::to_value(&event).unwrap();
        assert_eq!(payload["event"], "step_failed");
        assert_eq!(payload["strategy_type"], "deterministic");
        assert_eq!(event.name(), "step_failed");
    }

    #[test]
    fn test_recording_telemetry_keeps_order() {
        let telemetry = RecordingTelemetry::new();
        telemetry.emit(TelemetryEvent::ValidationFailed {
            step_id: "a".into(),
            strategy_type: StrategyType::Reasoning,
            errors: vec![],
        });
        TracingTelemetry.emit(TelemetryEvent::StepFailed {
            step_id: "b".into(),
            strategy_type: StrategyType::Reasoning,
            error: "x".into(),
        });
        assert_eq!(telemetry.names(), vec!["validation_failed"]);
    }
}
