//! comb - Rust 分层 routine 执行运行时
//!
//! 模块划分：
//! - **branch**: 并行分支的创建与调度，分支内串行执行、失败隔离
//! - **config**: 运行时配置加载（TOML + 环境变量）
//! - **context**: 作用域上下文、黑板、分支克隆与合并、检查点
//! - **core**: 错误类型与熔断器
//! - **executor**: 单步统一执行器（选择、预算、执行、校验、结算、导出）
//! - **observability**: 日志初始化与遥测事件
//! - **resources**: 预算预留、用量累计与结算
//! - **state**: run 状态存储接口与内存实现、检查点文件
//! - **strategy**: 执行策略接口、注册表、使用提示与选择器

pub mod branch;
pub mod config;
pub mod context;
pub mod core;
pub mod executor;
pub mod observability;
pub mod resources;
pub mod state;
pub mod strategy;

pub use branch::{BranchCoordinator, RunHandle};
pub use context::ContextManager;
pub use core::RuntimeError;
pub use executor::UnifiedExecutor;
pub use resources::ResourceManager;
pub use strategy::StrategySelector;
