//! 内存版 Run 状态存储
//!
//! 所有 run 放在同一把 RwLock 下，上下文与位置的更新、检查点恢复都在一次写锁内完成。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::branch::BranchExecution;
use crate::context::{Checkpoint, Location, RunContext, RunId};
use crate::core::RuntimeError;
use crate::state::store::RunStateStore;
use crate::state::types::{RunRecord, RunState, StepExecution};

#[derive(Debug)]
struct RunEntry {
    record: RunRecord,
    branches: Vec<BranchExecution>,
    steps: Vec<StepExecution>,
    checkpoints: Vec<Checkpoint>,
}

/// 内存存储（测试与单进程场景）
#[derive(Debug, Default)]
pub struct InMemoryRunStateStore {
    runs: RwLock<HashMap<RunId, RunEntry>>,
}

fn run_not_found(run_id: &str) -> RuntimeError {
    RuntimeError::NotFound(format!("run {run_id}"))
}

impl InMemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStateStore for InMemoryRunStateStore {
    async fn create_run(&self, run: RunRecord) -> Result<(), RuntimeError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            return Err(RuntimeError::StateStore(format!(
                "run {} already exists",
                run.run_id
            )));
        }
        runs.insert(
            run.run_id.clone(),
            RunEntry {
                record: run,
                branches: Vec::new(),
                steps: Vec::new(),
                checkpoints: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, RuntimeError> {
        Ok(self.runs.read().await.get(run_id).map(|e| e.record.clone()))
    }

    async fn update_run_state(&self, run_id: &str, state: RunState) -> Result<(), RuntimeError> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        entry.record.state = state;
        entry.record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_context(&self, run_id: &str) -> Result<Option<RunContext>, RuntimeError> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .map(|e| e.record.context.clone()))
    }

    async fn update_context(&self, run_id: &str, context: &RunContext) -> Result<(), RuntimeError> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        entry.record.context = context.clone();
        entry.record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_current_location(&self, run_id: &str) -> Result<Option<Location>, RuntimeError> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .map(|e| e.record.location.clone()))
    }

    async fn update_location(&self, run_id: &str, location: &Location) -> Result<(), RuntimeError> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        entry.record.location = location.clone();
        entry.record.updated_at = Utc::now();
        Ok(())
    }

    async fn create_branch(&self, run_id: &str, branch: &BranchExecution) -> Result<(), RuntimeError> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        if entry.branches.iter().any(|b| b.id == branch.id) {
            return Err(RuntimeError::StateStore(format!(
                "branch {} already exists in run {run_id}",
                branch.id
            )));
        }
        entry.branches.push(branch.clone());
        Ok(())
    }

    async fn update_branch(&self, run_id: &str, branch: &BranchExecution) -> Result<(), RuntimeError> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        let existing = entry
            .branches
            .iter_mut()
            .find(|b| b.id == branch.id)
            .ok_or_else(|| RuntimeError::NotFound(format!("branch {}", branch.id)))?;
        *existing = branch.clone();
        Ok(())
    }

    async fn list_branches(&self, run_id: &str) -> Result<Vec<BranchExecution>, RuntimeError> {
        let runs = self.runs.read().await;
        let entry = runs.get(run_id).ok_or_else(|| run_not_found(run_id))?;
        Ok(entry.branches.clone())
    }

    async fn record_step_execution(
        &self,
        run_id: &str,
        step: &StepExecution,
    ) -> Result<(), RuntimeError> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        entry.steps.push(step.clone());
        Ok(())
    }

    async fn list_step_executions(&self, run_id: &str) -> Result<Vec<StepExecution>, RuntimeError> {
        let runs = self.runs.read().await;
        let entry = runs.get(run_id).ok_or_else(|| run_not_found(run_id))?;
        Ok(entry.steps.clone())
    }

    async fn create_checkpoint(
        &self,
        run_id: &str,
        context: &RunContext,
        location: &Location,
    ) -> Result<Checkpoint, RuntimeError> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        let checkpoint = Checkpoint::new(run_id, context, location.clone());
        entry.record.context = context.clone();
        entry.record.location = location.clone();
        entry.record.updated_at = Utc::now();
        let detached = checkpoint.detached();
        entry.checkpoints.push(checkpoint);
        Ok(detached)
    }

    async fn get_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, RuntimeError> {
        let runs = self.runs.read().await;
        Ok(runs
            .get(run_id)
            .and_then(|e| e.checkpoints.iter().find(|c| c.id == checkpoint_id))
            .map(Checkpoint::detached))
    }

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>, RuntimeError> {
        let runs = self.runs.read().await;
        let entry = runs.get(run_id).ok_or_else(|| run_not_found(run_id))?;
        Ok(entry.checkpoints.iter().map(Checkpoint::detached).collect())
    }

    async fn restore_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, RuntimeError> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| run_not_found(run_id))?;
        let checkpoint = entry
            .checkpoints
            .iter()
            .find(|c| c.id == checkpoint_id)
            .map(Checkpoint::detached)
            .ok_or_else(|| RuntimeError::NotFound(format!("checkpoint {checkpoint_id}")))?;
        entry.record.context = checkpoint.context.clone();
        entry.record.location = checkpoint.location.clone();
        entry.record.updated_at = Utc::now();
        Ok(checkpoint)
    }

    async fn get_runs_by_state(&self, state: RunState) -> Result<Vec<RunRecord>, RuntimeError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|e| e.record.state == state)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn get_runs_by_user(&self, user_id: &str) -> Result<Vec<RunRecord>, RuntimeError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|e| e.record.user_id == user_id)
            .map(|e| e.record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextManager;
    use serde_json::json;

    fn record(run_id: &str, user: &str) -> RunRecord {
        let ctx = ContextManager::new().create_context(None, None, None);
        RunRecord::new(run_id, user, ctx, Location::new("routine", "start"))
    }

    #[tokio::test]
    async fn test_create_run_twice_fails() {
        let store = InMemoryRunStateStore::new();
        store.create_run(record("r1", "u1")).await.unwrap();
        assert!(store.create_run(record("r1", "u1")).await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_restore_applies_context_and_location_together() {
        let store = InMemoryRunStateStore::new();
        store.create_run(record("r1", "u1")).await.unwrap();

        let mut ctx = store.get_context("r1").await.unwrap().unwrap();
        ctx.variables.insert("v".into(), json!(1));
        let ckpt = store
            .create_checkpoint("r1", &ctx, &Location::new("routine", "n1"))
            .await
            .unwrap();

        ctx.variables.insert("v".into(), json!(2));
        store.update_context("r1", &ctx).await.unwrap();
        store
            .update_location("r1", &Location::new("routine", "n2"))
            .await
            .unwrap();

        store.restore_checkpoint("r1", &ckpt.id).await.unwrap();
        let ctx = store.get_context("r1").await.unwrap().unwrap();
        let loc = store.get_current_location("r1").await.unwrap().unwrap();
        assert_eq!(ctx.variables["v"], json!(1));
        assert_eq!(loc.node_id(), "n1");
        assert_eq!(store.list_checkpoints("r1").await.unwrap().len(), 1);
        assert!(store.restore_checkpoint("r1", "missing").await.is_err());
    }

    #[tokio::test]
    async fn test_restore_ignores_blackboard_writes_after_checkpoint() {
        let store = InMemoryRunStateStore::new();
        store.create_run(record("r1", "u1")).await.unwrap();

        let ctx = store.get_context("r1").await.unwrap().unwrap();
        ctx.blackboard.set("k", json!(1));
        let ckpt = store
            .create_checkpoint("r1", &ctx, &Location::new("routine", "n1"))
            .await
            .unwrap();
        ctx.blackboard.set("k", json!(2));
        ckpt.context.blackboard.set("k", json!(9));

        let restored = store.restore_checkpoint("r1", &ckpt.id).await.unwrap();
        assert_eq!(restored.context.blackboard.get("k"), Some(json!(1)));
        let live = store.get_context("r1").await.unwrap().unwrap();
        assert_eq!(live.blackboard.get("k"), Some(json!(1)));

        // 恢复后的写入同样不回流到检查点
        live.blackboard.set("k", json!(3));
        let again = store.get_checkpoint("r1", &ckpt.id).await.unwrap().unwrap();
        assert_eq!(again.context.blackboard.get("k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_query_runs_by_state_and_user() {
        let store = InMemoryRunStateStore::new();
        store.create_run(record("r1", "alice")).await.unwrap();
        store.create_run(record("r2", "alice")).await.unwrap();
        store.create_run(record("r3", "bob")).await.unwrap();
        store.update_run_state("r2", RunState::Running).await.unwrap();

        assert_eq!(store.get_runs_by_user("alice").await.unwrap().len(), 2);
        let running = store.get_runs_by_state(RunState::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].run_id, "r2");
        assert!(store.update_run_state("missing", RunState::Failed).await.is_err());
    }

    #[tokio::test]
    async fn test_step_log_is_append_only_in_order() {
        let store = InMemoryRunStateStore::new();
        store.create_run(record("r1", "u")).await.unwrap();
        for i in 0..3 {
            let step = StepExecution {
                step_id: format!("s{i}"),
                branch_id: None,
                success: true,
                outputs: json!({}),
                duration_ms: 1,
                error: None,
                executed_at: Utc::now(),
            };
            store.record_step_execution("r1", &step).await.unwrap();
        }
        let steps = store.list_step_executions("r1").await.unwrap();
        let ids: Vec<_> = steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2"]);
    }
}
