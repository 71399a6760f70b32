//! 核心基础：错误类型与熔断器

pub mod circuit_breaker;
pub mod error;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState};
pub use error::RuntimeError;
