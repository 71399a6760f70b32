//! Run 状态：存储接口、内存实现、检查点文件

pub mod memory;
pub mod persistence;
pub mod store;
pub mod types;

pub use memory::InMemoryRunStateStore;
pub use persistence::CheckpointFile;
pub use store::RunStateStore;
pub use types::{RunRecord, RunState, StepExecution};
