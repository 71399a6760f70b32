//! 熔断器
//!
//! 显式状态机：Closed → Open → HalfOpen → Closed/Open。
//! Open → HalfOpen 的转换是惰性的，只在下一次 is_call_allowed / execute 时判断，没有后台定时器。
//! 每个熔断器实例只有一把锁，所有计数与状态转换都在锁内完成。

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::RuntimeError;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// 正常放行
    Closed,
    /// 拒绝所有调用，等待恢复超时
    Open,
    /// 放行单个探测调用
    HalfOpen,
}

/// 熔断器构造参数
///
/// 数值使用有符号整数：它们通常来自配置文件，负数需要在构造时被拒绝而不是被静默截断。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// 连续失败多少次后打开
    pub failure_threshold: i64,
    /// Open 状态持续多久后允许探测（毫秒）
    pub recovery_timeout_ms: i64,
    /// HalfOpen 探测调用的最长等待时间（毫秒），0 表示不限制
    pub half_open_timeout_ms: i64,
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_timeout_ms: 10_000,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: i64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout_ms(mut self, ms: i64) -> Self {
        self.recovery_timeout_ms = ms;
        self
    }

    pub fn with_half_open_timeout_ms(mut self, ms: i64) -> Self {
        self.half_open_timeout_ms = ms;
        self
    }
}

/// 熔断器状态快照（用于监控与测试）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_transition: Instant,
    last_transition_at: DateTime<Utc>,
    /// HalfOpen 下正在进行的探测调用的开始时间
    probe_started: Option<Instant>,
}

/// 单个操作的熔断器
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// 校验配置并创建熔断器；配置非法时立即返回 Configuration 错误
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, RuntimeError> {
        if config.name.trim().is_empty() {
            return Err(RuntimeError::Configuration(
                "circuit breaker name must not be empty".to_string(),
            ));
        }
        if config.failure_threshold < 1 {
            return Err(RuntimeError::Configuration(format!(
                "circuit breaker '{}': failure_threshold must be >= 1, got {}",
                config.name, config.failure_threshold
            )));
        }
        if config.recovery_timeout_ms < 0 {
            return Err(RuntimeError::Configuration(format!(
                "circuit breaker '{}': recovery_timeout_ms must be >= 0, got {}",
                config.name, config.recovery_timeout_ms
            )));
        }
        if config.half_open_timeout_ms < 0 {
            return Err(RuntimeError::Configuration(format!(
                "circuit breaker '{}': half_open_timeout_ms must be >= 0, got {}",
                config.name, config.half_open_timeout_ms
            )));
        }

        let failure_threshold = u32::try_from(config.failure_threshold).map_err(|_| {
            RuntimeError::Configuration(format!(
                "circuit breaker '{}': failure_threshold too large",
                config.name
            ))
        })?;

        Ok(Self {
            name: config.name,
            failure_threshold,
            recovery_timeout: Duration::from_millis(config.recovery_timeout_ms as u64),
            half_open_timeout: Duration::from_millis(config.half_open_timeout_ms as u64),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_transition: Instant::now(),
                last_transition_at: Utc::now(),
                probe_started: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前状态（不触发惰性转换）
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// 是否允许调用；Open 且恢复超时已过时顺带转换为 HalfOpen
    pub fn is_call_allowed(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => inner.probe_started.is_none(),
            CircuitState::Open => false,
        }
    }

    /// 在熔断保护下执行 f
    ///
    /// 不允许调用时直接返回 CircuitOpen，f 不会被调用。
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RuntimeError>,
    {
        if !self.try_acquire() {
            tracing::debug!(breaker = %self.name, "call rejected by open circuit");
            return Err(RuntimeError::CircuitOpen(self.name.clone()).into());
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// 记录一次成功
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.success_count = inner.success_count.saturating_add(1);
                // 只统计连续失败
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Closed),
            // 打开前放行的调用迟到的结果
            CircuitState::Open => {}
        }
    }

    /// 记录一次失败
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
                inner.failure_count = 1;
            }
            CircuitState::Open => {
                inner.failure_count = inner.failure_count.saturating_add(1);
            }
        }
    }

    /// 人工干预：强制回到 Closed 并清零计数
    pub fn force_reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
        tracing::info!(breaker = %self.name, "circuit breaker force reset");
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_transition_at: inner.last_transition_at,
        }
    }

    /// 检查并占用调用许可（HalfOpen 下只占用唯一的探测名额）
    fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if inner.probe_started.is_none() => {
                inner.probe_started = Some(Instant::now());
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => false,
        }
    }

    /// 惰性状态转换：Open 超时 → HalfOpen；HalfOpen 探测超时 → Open
    fn refresh(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Open if inner.last_transition.elapsed() >= self.recovery_timeout => {
                self.transition(inner, CircuitState::HalfOpen);
            }
            CircuitState::HalfOpen => {
                let probe_expired = inner.probe_started.is_some_and(|started| {
                    !self.half_open_timeout.is_zero() && started.elapsed() > self.half_open_timeout
                });
                if probe_expired {
                    self.transition(inner, CircuitState::Open);
                    inner.failure_count = 1;
                }
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Instant::now();
        inner.last_transition_at = Utc::now();
        inner.probe_started = None;
        if to == CircuitState::Closed {
            inner.failure_count = 0;
            inner.success_count = 0;
        }
        if from != to {
            tracing::info!(breaker = %self.name, ?from, ?to, "circuit breaker transition");
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
