//! 运行时配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COMB__*` 覆盖（双下划线表示嵌套，如 `COMB__RESOURCES__TOTAL_CREDITS=500`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::executor::ExecutorConfig;
use crate::resources::ResourceLimits;
use crate::strategy::{SelectorConfig, StrategyType};

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeSection,
    pub resources: ResourcesSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub strategy: StrategySection,
}

/// [runtime] 段：缺省策略、性能目标、分支并发
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub default_strategy: StrategyType,
    /// 性能分的耗时目标（毫秒）
    pub performance_target_ms: u64,
    pub fallback_on_failure: bool,
    /// 同时执行的分支数上限；0 表示不限
    pub max_concurrent_branches: usize,
    /// 检查点文件路径（demo 使用）
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            default_strategy: StrategyType::Deterministic,
            performance_target_ms: 30_000,
            fallback_on_failure: true,
            max_concurrent_branches: 0,
            checkpoint_path: None,
        }
    }
}

/// [resources] 段：run 级资源池与超支准入
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    pub total_credits: Option<u64>,
    pub total_tokens: Option<u64>,
    pub total_tool_calls: Option<u64>,
    pub default_max_time_ms: u64,
    pub overrun_failure_threshold: i64,
    pub overrun_recovery_timeout_ms: i64,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            total_credits: limits.total_credits,
            total_tokens: limits.total_tokens,
            total_tool_calls: limits.total_tool_calls,
            default_max_time_ms: limits.default_max_time_ms,
            overrun_failure_threshold: limits.overrun_failure_threshold,
            overrun_recovery_timeout_ms: limits.overrun_recovery_timeout_ms,
        }
    }
}

/// [circuit_breaker] 段：每个策略类别的熔断参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: i64,
    pub recovery_timeout_ms: i64,
    /// 0 表示不限制探测时长
    pub half_open_timeout_ms: i64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_timeout_ms: 10_000,
        }
    }
}

/// [strategy] 段：选择器参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategySection {
    pub offline_only: bool,
    pub min_hint_samples: u64,
    pub hint_success_threshold: f64,
}

impl Default for StrategySection {
    fn default() -> Self {
        let selector = SelectorConfig::default();
        Self {
            offline_only: selector.offline_only,
            min_hint_samples: selector.min_hint_samples,
            hint_success_threshold: selector.hint_success_threshold,
        }
    }
}

impl AppConfig {
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            total_credits: self.resources.total_credits,
            total_tokens: self.resources.total_tokens,
            total_tool_calls: self.resources.total_tool_calls,
            default_max_time_ms: self.resources.default_max_time_ms,
            overrun_failure_threshold: self.resources.overrun_failure_threshold,
            overrun_recovery_timeout_ms: self.resources.overrun_recovery_timeout_ms,
        }
    }

    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            default_strategy: self.runtime.default_strategy,
            offline_only: self.strategy.offline_only,
            min_hint_samples: self.strategy.min_hint_samples,
            hint_success_threshold: self.strategy.hint_success_threshold,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            default_strategy: self.runtime.default_strategy,
            performance_target_ms: self.runtime.performance_target_ms,
            fallback_on_failure: self.runtime.fallback_on_failure,
            breaker_failure_threshold: self.circuit_breaker.failure_threshold,
            breaker_recovery_timeout_ms: self.circuit_breaker.recovery_timeout_ms,
            breaker_half_open_timeout_ms: self.circuit_breaker.half_open_timeout_ms,
        }
    }
}

/// 默认配置文件（相对工作目录）
pub const DEFAULT_CONFIG_FILE: &str = "config/default.toml";

/// 加载配置：config/default.toml（可缺省）→ 显式文件 → 环境变量 COMB__*
///
/// 显式传入的文件必须存在。
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::from(PathBuf::from(DEFAULT_CONFIG_FILE)).required(false));
    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path));
    }
    builder
        .add_source(
            config::Environment::with_prefix("COMB")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
