//! 单步执行：统一执行器及其协作者

pub mod adapter;
pub mod io;
pub mod traits;
pub mod unified;
pub mod validation;

pub use adapter::UnifiedStepExecutor;
pub use io::ContextIoProcessor;
pub use traits::{
    BlackboardExporter, ContextExporter, IoProcessor, NoopExporter, ToolOrchestrator,
    ValidationEngine, ValidationOutcome,
};
pub use unified::{ExecutorConfig, UnifiedExecutor};
pub use validation::SchemaValidator;
