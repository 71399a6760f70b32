//! 统一执行器
//!
//! 单步执行顺序：选择策略 → 预留预算 → 准备输入 → 执行策略（熔断 + 回退）→ 校验输出
//! → 结算用量 → 导出上下文 → 发出完成事件 → 返回结果。
//! 预算拒绝、校验失败、策略失败都以失败结果返回；其余错误与 panic 在最外层被捕获，
//! 转为使用缺省策略类别的同形失败结果，调用方永远拿到 StrategyExecutionResult。

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::core::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, RuntimeError};
use crate::executor::traits::{ContextExporter, IoProcessor, NoopExporter, ToolOrchestrator, ValidationEngine};
use crate::executor::validation::SchemaValidator;
use crate::observability::{TelemetryEvent, TelemetryShim, TracingTelemetry};
use crate::resources::{ResourceManager, ResourceUsage, UsageTracker};
use crate::strategy::{
    performance_score, ExecutionFeedback, ExecutionMetadata, ExecutionOutcome, ExecutionStrategy,
    StepContext, StrategyExecutionResult, StrategyOutput, StrategyRequest, StrategySelector,
    StrategyType, UsageHintStore,
};

/// 执行器参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// 意外错误时结果里使用的策略类别
    pub default_strategy: StrategyType,
    /// 性能分的耗时目标（毫秒）
    pub performance_target_ms: u64,
    /// 主策略失败时是否尝试回退策略
    pub fallback_on_failure: bool,
    /// 每个策略类别一个熔断器
    pub breaker_failure_threshold: i64,
    pub breaker_recovery_timeout_ms: i64,
    pub breaker_half_open_timeout_ms: i64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyType::Deterministic,
            performance_target_ms: 30_000,
            fallback_on_failure: true,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_ms: 30_000,
            breaker_half_open_timeout_ms: 10_000,
        }
    }
}

/// 单步统一执行器
pub struct UnifiedExecutor {
    selector: Arc<StrategySelector>,
    resources: Arc<ResourceManager>,
    io: Arc<dyn IoProcessor>,
    validator: Arc<dyn ValidationEngine>,
    exporter: Arc<dyn ContextExporter>,
    telemetry: Arc<dyn TelemetryShim>,
    tools: Option<Arc<dyn ToolOrchestrator>>,
    hints: Arc<UsageHintStore>,
    breakers: HashMap<StrategyType, CircuitBreaker>,
    config: ExecutorConfig,
}

impl UnifiedExecutor {
    /// 熔断参数非法时返回 Configuration 错误
    pub fn new(
        selector: Arc<StrategySelector>,
        resources: Arc<ResourceManager>,
        io: Arc<dyn IoProcessor>,
        config: ExecutorConfig,
    ) -> Result<Self, RuntimeError> {
        let mut breakers = HashMap::new();
        for strategy_type in StrategyType::FALLBACK_ORDER {
            let breaker = CircuitBreaker::new(
                CircuitBreakerConfig::new(format!("strategy:{strategy_type}"))
                    .with_failure_threshold(config.breaker_failure_threshold)
                    .with_recovery_timeout_ms(config.breaker_recovery_timeout_ms)
                    .with_half_open_timeout_ms(config.breaker_half_open_timeout_ms),
            )?;
            breakers.insert(strategy_type, breaker);
        }
        Ok(Self {
            selector,
            resources,
            io,
            validator: Arc::new(SchemaValidator),
            exporter: Arc::new(NoopExporter),
            telemetry: Arc::new(TracingTelemetry),
            tools: None,
            hints: Arc::new(UsageHintStore::new()),
            breakers,
            config,
        })
    }

    pub fn with_validator(mut self, validator: Arc<dyn ValidationEngine>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn ContextExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryShim>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolOrchestrator>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// 共享同一份使用提示（多个执行器一起学习）
    pub fn with_hints(mut self, hints: Arc<UsageHintStore>) -> Self {
        self.hints = hints;
        self
    }

    pub fn hints(&self) -> &Arc<UsageHintStore> {
        &self.hints
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn breaker_state(&self, strategy_type: StrategyType) -> Option<CircuitBreakerState> {
        self.breakers.get(&strategy_type).map(CircuitBreaker::snapshot)
    }

    pub async fn execute_step(&self, step: &StepContext, context: &RunContext) -> StrategyExecutionResult {
        self.execute_step_with_cancel(step, context, &CancellationToken::new())
            .await
    }

    /// 与 execute_step 相同；观察到取消时不再开始新的策略执行
    pub async fn execute_step_with_cancel(
        &self,
        step: &StepContext,
        context: &RunContext,
        cancel: &CancellationToken,
    ) -> StrategyExecutionResult {
        let started = Instant::now();
        let mut reservation: Option<String> = None;

        let outcome = AssertUnwindSafe(self.run_step(step, context, cancel, started, &mut reservation))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(result)) => return result,
            Ok(Err(e)) => e,
            Err(panic) => RuntimeError::Unexpected(panic_message(panic.as_ref())),
        };

        if let Some(reservation_id) = reservation.take() {
            self.resources.release(&reservation_id);
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::error!(step_id = %step.step_id, error = %error, "step execution failed unexpectedly");
        self.telemetry.emit(TelemetryEvent::StepFailed {
            step_id: step.step_id.clone(),
            strategy_type: self.config.default_strategy,
            error: error.to_string(),
        });
        StrategyExecutionResult::failure(
            self.config.default_strategy,
            ExecutionOutcome::Error,
            error.to_string(),
            elapsed_ms,
            ResourceUsage::default(),
            false,
            self.config.performance_target_ms,
        )
    }

    async fn run_step(
        &self,
        step: &StepContext,
        context: &RunContext,
        cancel: &CancellationToken,
        started: Instant,
        reservation_slot: &mut Option<String>,
    ) -> Result<StrategyExecutionResult, RuntimeError> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        // 1. 选择策略
        let hints = self
            .hints
            .hints_for(&step.step_type, self.selector.config().min_hint_samples);
        let selected = self.selector.select_strategy(step, &hints)?;
        tracing::debug!(step_id = %step.step_id, ?selected, "strategy selected");

        // 2. 预留预算
        let reservation = self
            .resources
            .reserve_budget(&step.step_id, step.requested, &step.constraints);
        if !reservation.approved {
            let reason = reservation
                .reason
                .clone()
                .unwrap_or_else(|| "budget reservation rejected".to_string());
            self.telemetry.emit(TelemetryEvent::LimitExceeded {
                step_id: step.step_id.clone(),
                strategy_type: selected.strategy_type,
                reason: reason.clone(),
                requested: step.requested,
            });
            return Ok(self.failed(
                selected.strategy_type,
                ExecutionOutcome::ResourceLimited,
                RuntimeError::ResourceLimitExceeded(reason).to_string(),
                started,
                ResourceUsage::default(),
                false,
            ));
        }
        *reservation_slot = Some(reservation.reservation_id.clone());

        // 3. 准备输入
        let inputs = self.io.build_input_payload(step, context).await?;

        // 4. 执行策略
        let request = StrategyRequest {
            step: step.clone(),
            inputs,
            allocation: reservation.allocation,
            tracker: UsageTracker::new(Arc::clone(&self.resources), &reservation),
            tools: self.tools.clone(),
        };

        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        let mut strategy_type = selected.strategy_type;
        let mut fallback_used = false;
        let primary = self.attempt(&selected.strategy, request.clone()).await;
        let attempt = match (primary, &selected.fallback) {
            (Err(primary_err), Some(fallback)) if self.config.fallback_on_failure => {
                tracing::warn!(
                    step_id = %step.step_id,
                    primary = %strategy_type,
                    fallback = %fallback.strategy_type(),
                    error = %primary_err,
                    "primary strategy failed, trying fallback"
                );
                strategy_type = fallback.strategy_type();
                fallback_used = true;
                self.attempt(fallback, request.clone()).await
            }
            (primary, _) => primary,
        };

        let output = match attempt {
            Ok(output) => output,
            Err(e) => {
                let report = self.finalize(reservation_slot, started)?;
                self.telemetry.emit(TelemetryEvent::StepFailed {
                    step_id: step.step_id.clone(),
                    strategy_type,
                    error: e.to_string(),
                });
                let outcome = match e {
                    RuntimeError::Unexpected(_) => ExecutionOutcome::Error,
                    _ => ExecutionOutcome::Failure,
                };
                let result = self.failed(
                    strategy_type,
                    outcome,
                    e.to_string(),
                    started,
                    report,
                    fallback_used,
                );
                self.hints.record(&step.step_type, &result);
                return Ok(result);
            }
        };
        request.tracker.record(output.usage);

        // 5. 校验输出
        let StrategyOutput {
            result: raw,
            confidence,
            ..
        } = output;
        let confidence = confidence.clamp(0.0, 1.0);
        let result = match &step.output_schema {
            Some(schema) => {
                let validation = self.validator.validate(&raw, schema);
                if !validation.valid {
                    let report = self.finalize(reservation_slot, started)?;
                    self.telemetry.emit(TelemetryEvent::ValidationFailed {
                        step_id: step.step_id.clone(),
                        strategy_type,
                        errors: validation.errors.clone(),
                    });
                    let result = self.failed(
                        strategy_type,
                        ExecutionOutcome::ValidationFailed,
                        RuntimeError::ValidationFailure(validation.errors.join("; ")).to_string(),
                        started,
                        report,
                        fallback_used,
                    );
                    self.hints.record(&step.step_type, &result);
                    return Ok(result);
                }
                validation.data.unwrap_or(raw)
            }
            None => raw,
        };

        // 6. 结算用量
        let resource_usage = self.finalize(reservation_slot, started)?;

        // 7. 导出上下文变化
        if let Err(e) = self.exporter.export(step, &result, context).await {
            tracing::warn!(step_id = %step.step_id, error = %e, "context export failed");
        }

        // 8. 完成事件
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let score = performance_score(
            true,
            confidence,
            elapsed_ms,
            fallback_used,
            self.config.performance_target_ms,
        );
        self.telemetry.emit(TelemetryEvent::StepCompleted {
            step_id: step.step_id.clone(),
            strategy_type,
            elapsed_ms,
            confidence,
            fallback_used,
            performance_score: score,
            resource_usage,
        });

        // 9. 返回
        let result = StrategyExecutionResult {
            success: true,
            result: Some(result),
            error: None,
            metadata: ExecutionMetadata {
                strategy_type,
                elapsed_ms,
                resource_usage,
                confidence,
                fallback_used,
            },
            feedback: ExecutionFeedback {
                outcome: ExecutionOutcome::Success,
                performance_score: score,
            },
        };
        self.hints.record(&step.step_type, &result);
        Ok(result)
    }

    /// 在该策略类别的熔断器保护下执行一次；策略 panic 记作一次失败
    async fn attempt(
        &self,
        strategy: &Arc<dyn ExecutionStrategy>,
        request: StrategyRequest,
    ) -> Result<StrategyOutput, RuntimeError> {
        let guarded = || async {
            AssertUnwindSafe(strategy.execute(request))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(RuntimeError::Unexpected(panic_message(panic.as_ref()))))
        };
        match self.breakers.get(&strategy.strategy_type()) {
            Some(breaker) => breaker.execute(guarded).await,
            None => guarded().await,
        }
    }

    /// 结算预留；实际耗时计入 time 维度
    fn finalize(
        &self,
        reservation_slot: &mut Option<String>,
        started: Instant,
    ) -> Result<ResourceUsage, RuntimeError> {
        let Some(reservation_id) = reservation_slot.take() else {
            return Ok(ResourceUsage::default());
        };
        let actual = ResourceUsage {
            time_ms: started.elapsed().as_millis() as u64,
            ..ResourceUsage::default()
        };
        Ok(self.resources.finalize_usage(&reservation_id, actual)?.actual)
    }

    fn failed(
        &self,
        strategy_type: StrategyType,
        outcome: ExecutionOutcome,
        error: String,
        started: Instant,
        usage: ResourceUsage,
        fallback_used: bool,
    ) -> StrategyExecutionResult {
        StrategyExecutionResult::failure(
            strategy_type,
            outcome,
            error,
            started.elapsed().as_millis() as u64,
            usage,
            fallback_used,
            self.config.performance_target_ms,
        )
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("strategy panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("strategy panicked: {s}")
    } else {
        "strategy panicked".to_string()
    }
}

/// 结果中的对象字段展开为变量（供分支写回上下文）
pub(crate) fn result_outputs(result: &StrategyExecutionResult) -> HashMap<String, Value> {
    match &result.result {
        Some(Value::Object(map)) => map.clone().into_iter().collect(),
        Some(other) => HashMap::from([("result".to_string(), other.clone())]),
        None => HashMap::new(),
    }
}
