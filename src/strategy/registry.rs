//! 策略注册表：按 StrategyType 索引，每个类别一个实现

use std::collections::HashMap;
use std::sync::Arc;

use crate::strategy::traits::{ExecutionStrategy, PassthroughStrategy};
use crate::strategy::types::StrategyType;

#[derive(Default, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<StrategyType, Arc<dyn ExecutionStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只注册直通策略（Deterministic）
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PassthroughStrategy));
        registry
    }

    /// 注册策略；同类别的旧实现被替换
    pub fn register(&mut self, strategy: Arc<dyn ExecutionStrategy>) {
        let strategy_type = strategy.strategy_type();
        if self.strategies.insert(strategy_type, strategy).is_some() {
            tracing::debug!(%strategy_type, "strategy replaced");
        }
    }

    pub fn get(&self, strategy_type: StrategyType) -> Option<Arc<dyn ExecutionStrategy>> {
        self.strategies.get(&strategy_type).cloned()
    }

    pub fn contains(&self, strategy_type: StrategyType) -> bool {
        self.strategies.contains_key(&strategy_type)
    }

    /// 已注册的类别（按回退顺序）
    pub fn types(&self) -> Vec<StrategyType> {
        StrategyType::FALLBACK_ORDER
            .into_iter()
            .filter(|t| self.contains(*t))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_register_deterministic() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.types(), vec![StrategyType::Deterministic]);
        let strategy = registry.get(StrategyType::Deterministic).unwrap();
        assert_eq!(strategy.name(), "passthrough");
        assert!(registry.get(StrategyType::Reasoning).is_none());
    }
}
