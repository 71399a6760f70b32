//! 把 UnifiedExecutor 接到分支协调器的 StepExecutor 接口上

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::branch::{StepExecutionParams, StepExecutor, StepInfo, StepOutcome};
use crate::core::RuntimeError;
use crate::executor::unified::{result_outputs, UnifiedExecutor};
use crate::strategy::StepContext;

/// 导航器给出的 StepInfo → StepContext；登记过模板的步骤使用模板（schema、预算、策略覆盖）
pub struct UnifiedStepExecutor {
    executor: Arc<UnifiedExecutor>,
    templates: HashMap<String, StepContext>,
}

impl UnifiedStepExecutor {
    pub fn new(executor: Arc<UnifiedExecutor>) -> Self {
        Self {
            executor,
            templates: HashMap::new(),
        }
    }

    pub fn with_step(mut self, step: StepContext) -> Self {
        self.templates.insert(step.step_id.clone(), step);
        self
    }

    fn step_context(&self, info: &StepInfo) -> StepContext {
        if let Some(template) = self.templates.get(&info.id) {
            return template.clone();
        }
        let mut step = StepContext::new(info.id.clone(), info.step_type.clone());
        step.name = info.name.clone();
        for input in &info.inputs {
            step.input_bindings.insert(input.clone(), input.clone());
        }
        step
    }
}

#[async_trait]
impl StepExecutor for UnifiedStepExecutor {
    async fn execute_step(&self, params: StepExecutionParams) -> Result<StepOutcome, RuntimeError> {
        let step = self.step_context(&params.step);
        let result = self.executor.execute_step(&step, &params.context).await;
        tracing::debug!(
            run_id = %params.run_id,
            branch_id = %params.branch_id,
            step_id = %step.step_id,
            success = result.success,
            "step executed"
        );
        let duration_ms = result.metadata.elapsed_ms;
        if result.success {
            Ok(StepOutcome::succeeded(result_outputs(&result), duration_ms))
        } else {
            Ok(StepOutcome::failed(
                result.error.unwrap_or_else(|| "step failed".to_string()),
                duration_ms,
            ))
        }
    }
}
