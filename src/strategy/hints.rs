//! 使用提示：按步骤类型统计各策略的历史成功率

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::strategy::types::{StrategyExecutionResult, StrategyType, UsageHints};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub successes: u64,
    pub total: u64,
}

impl StrategyStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}

/// step_type -> strategy -> 统计
#[derive(Debug, Default)]
pub struct UsageHintStore {
    stats: RwLock<HashMap<String, HashMap<StrategyType, StrategyStats>>>,
}

impl UsageHintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次执行反馈
    pub fn record(&self, step_type: &str, result: &StrategyExecutionResult) {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        let entry = stats
            .entry(step_type.to_string())
            .or_default()
            .entry(result.metadata.strategy_type)
            .or_default();
        entry.total += 1;
        if result.success {
            entry.successes += 1;
        }
    }

    pub fn stats(&self, step_type: &str, strategy: StrategyType) -> StrategyStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(step_type)
            .and_then(|m| m.get(&strategy))
            .copied()
            .unwrap_or_default()
    }

    /// 样本数达到 min_samples 的策略中成功率最高者；并列时按回退顺序取靠前的
    pub fn hints_for(&self, step_type: &str, min_samples: u64) -> UsageHints {
        let stats = self.stats.read().unwrap_or_else(PoisonError::into_inner);
        let Some(per_strategy) = stats.get(step_type) else {
            return UsageHints::default();
        };

        let mut best: Option<(StrategyType, StrategyStats)> = None;
        for strategy in StrategyType::FALLBACK_ORDER {
            let Some(s) = per_strategy.get(&strategy) else {
                continue;
            };
            if s.total < min_samples {
                continue;
            }
            match best {
                Some((_, b)) if b.success_rate() >= s.success_rate() => {}
                _ => best = Some((strategy, *s)),
            }
        }

        match best {
            Some((strategy, s)) => UsageHints {
                preferred_strategy: Some(strategy),
                success_rate: s.success_rate(),
                samples: s.total,
            },
            None => UsageHints::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceUsage;
    use crate::strategy::types::ExecutionOutcome;

    fn result(strategy: StrategyType, success: bool) -> StrategyExecutionResult {
        let mut r = StrategyExecutionResult::failure(
            strategy,
            ExecutionOutcome::Failure,
            "x",
            0,
            ResourceUsage::default(),
            false,
            30_000,
        );
        r.success = success;
        r
    }

    #[test]
    fn test_hints_prefer_higher_success_rate() {
        let store = UsageHintStore::new();
        for _ in 0..3 {
            store.record("chat", &result(StrategyType::Conversational, false));
            store.record("chat", &result(StrategyType::Reasoning, true));
        }
        store.record("chat", &result(StrategyType::Deterministic, true));

        let hints = store.hints_for("chat", 3);
        assert_eq!(hints.preferred_strategy, Some(StrategyType::Reasoning));
        assert_eq!(hints.samples, 3);
        assert_eq!(hints.success_rate, 1.0);

        assert_eq!(store.hints_for("chat", 10), UsageHints::default());
        assert_eq!(store.hints_for("other", 0), UsageHints::default());
        assert_eq!(store.stats("chat", StrategyType::Conversational).total, 3);
    }
}
