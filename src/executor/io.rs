//! 基于 ContextManager 的输入准备

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::{ContextManager, RunContext};
use crate::core::RuntimeError;
use crate::executor::traits::IoProcessor;
use crate::strategy::StepContext;

/// 字面量输入 + 绑定变量
///
/// 绑定按作用域链解析，解析不到时再查黑板；两处都没有则报 NotFound。
/// 同名时绑定覆盖字面量。
pub struct ContextIoProcessor {
    contexts: Arc<ContextManager>,
}

impl ContextIoProcessor {
    pub fn new(contexts: Arc<ContextManager>) -> Self {
        Self { contexts }
    }
}

#[async_trait]
impl IoProcessor for ContextIoProcessor {
    async fn build_input_payload(
        &self,
        step: &StepContext,
        context: &RunContext,
    ) -> Result<HashMap<String, Value>, RuntimeError> {
        let mut payload = step.inputs.clone();
        for (param, variable) in &step.input_bindings {
            let value = self
                .contexts
                .get_variable(context, variable, None)
                .value
                .or_else(|| self.contexts.get_blackboard_value(context, variable))
                .ok_or_else(|| {
                    RuntimeError::NotFound(format!(
                        "input '{param}' of step {} is bound to unknown variable '{variable}'",
                        step.step_id
                    ))
                })?;
            payload.insert(param.clone(), value);
        }
        Ok(payload)
    }
}
