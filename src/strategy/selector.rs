//! 策略选择器
//!
//! 纯选择策略，不执行任何东西。按固定优先级逐条匹配：
//! 显式覆盖 > 使用提示 > 步骤类型缺省 > 配置缺省 > 任意可达策略。
//! 每条候选都要先通过可达性检查（本地 / 云端可用、仅离线模式）。

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::core::RuntimeError;
use crate::strategy::registry::StrategyRegistry;
use crate::strategy::traits::ExecutionStrategy;
use crate::strategy::types::{ExecutionLocality, NetworkState, StepContext, StrategyType, UsageHints};

/// 选择参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// 其他信号都不适用时的缺省策略
    pub default_strategy: StrategyType,
    /// 只允许本地执行
    pub offline_only: bool,
    /// 提示至少需要的样本数
    pub min_hint_samples: u64,
    /// 提示成功率达到该值才采纳
    pub hint_success_threshold: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyType::Deterministic,
            offline_only: false,
            min_hint_samples: 5,
            hint_success_threshold: 0.7,
        }
    }
}

/// 命中的是哪一条规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    Override,
    UsageHint,
    StepTypeDefault,
    ConfiguredDefault,
    Reachability,
}

/// 选择结果
#[derive(Clone)]
pub struct SelectedStrategy {
    pub strategy_type: StrategyType,
    pub name: String,
    pub strategy: Arc<dyn ExecutionStrategy>,
    /// 主策略失败时尝试一次的回退策略
    pub fallback: Option<Arc<dyn ExecutionStrategy>>,
    pub reason: SelectionReason,
}

impl std::fmt::Debug for SelectedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedStrategy")
            .field("strategy_type", &self.strategy_type)
            .field("name", &self.name)
            .field("fallback", &self.fallback.as_ref().map(|s| s.strategy_type()))
            .field("reason", &self.reason)
            .finish()
    }
}

pub struct StrategySelector {
    registry: Arc<StrategyRegistry>,
    config: SelectorConfig,
    network: RwLock<NetworkState>,
}

impl StrategySelector {
    pub fn new(registry: Arc<StrategyRegistry>, config: SelectorConfig) -> Self {
        Self {
            registry,
            config,
            network: RwLock::new(NetworkState::default()),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn network_state(&self) -> NetworkState {
        *self.network.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 更新可达性（由外部探测结果驱动）
    pub fn set_network_state(&self, state: NetworkState) {
        *self.network.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn select_strategy(
        &self,
        step: &StepContext,
        hints: &UsageHints,
    ) -> Result<SelectedStrategy, RuntimeError> {
        let network = self.network_state();

        let hinted = hints.preferred_strategy.filter(|_| {
            hints.samples >= self.config.min_hint_samples
                && hints.success_rate >= self.config.hint_success_threshold
        });

        let candidates = [
            (step.strategy_override, SelectionReason::Override),
            (hinted, SelectionReason::UsageHint),
            (
                StrategyType::default_for_step_type(&step.step_type),
                SelectionReason::StepTypeDefault,
            ),
            (
                Some(self.config.default_strategy),
                SelectionReason::ConfiguredDefault,
            ),
        ];

        for (candidate, reason) in candidates {
            let Some(strategy_type) = candidate else {
                continue;
            };
            match self.usable(strategy_type, &network) {
                Some(strategy) => return Ok(self.selected(strategy, reason, &network)),
                None if reason == SelectionReason::Override => {
                    tracing::warn!(
                        step_id = %step.step_id,
                        %strategy_type,
                        "strategy override not usable, falling back to other signals"
                    );
                }
                None => {}
            }
        }

        StrategyType::FALLBACK_ORDER
            .into_iter()
            .find_map(|t| self.usable(t, &network))
            .map(|strategy| self.selected(strategy, SelectionReason::Reachability, &network))
            .ok_or_else(|| {
                RuntimeError::Configuration(format!(
                    "no usable strategy for step {} (offline_only={}, local={}, cloud={})",
                    step.step_id,
                    self.config.offline_only,
                    network.local_available,
                    network.cloud_available
                ))
            })
    }

    fn selected(
        &self,
        strategy: Arc<dyn ExecutionStrategy>,
        reason: SelectionReason,
        network: &NetworkState,
    ) -> SelectedStrategy {
        let strategy_type = strategy.strategy_type();
        SelectedStrategy {
            strategy_type,
            name: strategy.name().to_string(),
            fallback: self.fallback_for(strategy_type, network),
            strategy,
            reason,
        }
    }

    /// 回退顺序中排在 primary 之后（循环）的第一个可用策略
    fn fallback_for(
        &self,
        primary: StrategyType,
        network: &NetworkState,
    ) -> Option<Arc<dyn ExecutionStrategy>> {
        let order = StrategyType::FALLBACK_ORDER;
        let start = order.iter().position(|t| *t == primary)?;
        (1..order.len())
            .map(|offset| order[(start + offset) % order.len()])
            .find_map(|t| self.usable(t, network))
    }

    fn usable(
        &self,
        strategy_type: StrategyType,
        network: &NetworkState,
    ) -> Option<Arc<dyn ExecutionStrategy>> {
        let strategy = self.registry.get(strategy_type)?;
        let reachable = match strategy.locality() {
            ExecutionLocality::Local => network.local_available,
            ExecutionLocality::Cloud => !self.config.offline_only && network.cloud_available,
        };
        reachable.then_some(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::strategy::traits::{StrategyOutput, StrategyRequest};

    struct Fixed(StrategyType, ExecutionLocality);

    #[async_trait]
    impl ExecutionStrategy for Fixed {
        fn strategy_type(&self) -> StrategyType {
            self.0
        }

        fn name(&self) -> &str {
            self.0.as_str()
        }

        fn locality(&self) -> ExecutionLocality {
            self.1
        }

        async fn execute(&self, _request: StrategyRequest) -> Result<StrategyOutput, RuntimeError> {
            Ok(StrategyOutput::default())
        }
    }

    fn full_registry() -> Arc<StrategyRegistry> {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(Fixed(StrategyType::Conversational, ExecutionLocality::Cloud)));
        registry.register(Arc::new(Fixed(StrategyType::Reasoning, ExecutionLocality::Cloud)));
        registry.register(Arc::new(Fixed(StrategyType::Deterministic, ExecutionLocality::Local)));
        Arc::new(registry)
    }

    fn strong_hint(strategy: StrategyType) -> UsageHints {
        UsageHints {
            preferred_strategy: Some(strategy),
            success_rate: 0.9,
            samples: 10,
        }
    }

    #[test]
    fn test_override_beats_hints() {
        let selector = StrategySelector::new(full_registry(), SelectorConfig::default());
        let step = StepContext::new("s1", "chat").with_override(StrategyType::Reasoning);
        let selected = selector
            .select_strategy(&step, &strong_hint(StrategyType::Deterministic))
            .unwrap();
        assert_eq!(selected.strategy_type, StrategyType::Reasoning);
        assert_eq!(selected.reason, SelectionReason::Override);
        assert_eq!(
            selected.fallback.map(|s| s.strategy_type()),
            Some(StrategyType::Deterministic)
        );
    }

    #[test]
    fn test_hints_beat_step_type_default() {
        let selector = StrategySelector::new(full_registry(), SelectorConfig::default());
        let step = StepContext::new("s1", "chat");
        let selected = selector
            .select_strategy(&step, &strong_hint(StrategyType::Reasoning))
            .unwrap();
        assert_eq!(selected.reason, SelectionReason::UsageHint);

        let weak = UsageHints {
            samples: 1,
            ..strong_hint(StrategyType::Reasoning)
        };
        let selected = selector.select_strategy(&step, &weak).unwrap();
        assert_eq!(selected.strategy_type, StrategyType::Conversational);
        assert_eq!(selected.reason, SelectionReason::StepTypeDefault);
    }

    #[test]
    fn test_offline_only_skips_cloud_strategies() {
        let config = SelectorConfig {
            offline_only: true,
            ..SelectorConfig::default()
        };
        let selector = StrategySelector::new(full_registry(), config);
        let step = StepContext::new("s1", "chat").with_override(StrategyType::Conversational);
        let selected = selector.select_strategy(&step, &UsageHints::default()).unwrap();
        assert_eq!(selected.strategy_type, StrategyType::Deterministic);
        assert!(selected.fallback.is_none());
    }

    #[test]
    fn test_cloud_unreachable_uses_local() {
        let selector = StrategySelector::new(full_registry(), SelectorConfig::default());
        selector.set_network_state(NetworkState {
            local_available: true,
            cloud_available: false,
        });
        let step = StepContext::new("s1", "reasoning");
        let selected = selector.select_strategy(&step, &UsageHints::default()).unwrap();
        assert_eq!(selected.strategy_type, StrategyType::Deterministic);
        assert_eq!(selected.reason, SelectionReason::ConfiguredDefault);
    }

    #[test]
    fn test_nothing_reachable_is_error() {
        let selector = StrategySelector::new(full_registry(), SelectorConfig::default());
        selector.set_network_state(NetworkState {
            local_available: false,
            cloud_available: false,
        });
        let err = selector
            .select_strategy(&StepContext::new("s1", "action"), &UsageHints::default())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration(_)));
    }
}
