//! Run 状态存储接口
//!
//! 运行时只依赖这个 trait；持久化技术由实现方决定。
//! 同一检查点的上下文与位置必须一起可取回，恢复时一起生效。

use async_trait::async_trait;

use crate::branch::BranchExecution;
use crate::context::{Checkpoint, Location, RunContext};
use crate::core::RuntimeError;
use crate::state::types::{RunRecord, RunState, StepExecution};

#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn create_run(&self, run: RunRecord) -> Result<(), RuntimeError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, RuntimeError>;

    async fn update_run_state(&self, run_id: &str, state: RunState) -> Result<(), RuntimeError>;

    async fn get_context(&self, run_id: &str) -> Result<Option<RunContext>, RuntimeError>;

    async fn update_context(&self, run_id: &str, context: &RunContext) -> Result<(), RuntimeError>;

    async fn get_current_location(&self, run_id: &str) -> Result<Option<Location>, RuntimeError>;

    async fn update_location(&self, run_id: &str, location: &Location) -> Result<(), RuntimeError>;

    async fn create_branch(&self, run_id: &str, branch: &BranchExecution) -> Result<(), RuntimeError>;

    async fn update_branch(&self, run_id: &str, branch: &BranchExecution) -> Result<(), RuntimeError>;

    async fn list_branches(&self, run_id: &str) -> Result<Vec<BranchExecution>, RuntimeError>;

    async fn record_step_execution(
        &self,
        run_id: &str,
        step: &StepExecution,
    ) -> Result<(), RuntimeError>;

    async fn list_step_executions(&self, run_id: &str) -> Result<Vec<StepExecution>, RuntimeError>;

    /// 上下文与位置作为一个整体保存
    async fn create_checkpoint(
        &self,
        run_id: &str,
        context: &RunContext,
        location: &Location,
    ) -> Result<Checkpoint, RuntimeError>;

    async fn get_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, RuntimeError>;

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>, RuntimeError>;

    /// 原子地把检查点的上下文与位置写回 run
    async fn restore_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, RuntimeError>;

    async fn get_runs_by_state(&self, state: RunState) -> Result<Vec<RunRecord>, RuntimeError>;

    async fn get_runs_by_user(&self, user_id: &str) -> Result<Vec<RunRecord>, RuntimeError>;
}
