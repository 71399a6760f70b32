//! 分支协调器
//!
//! 为并行结构创建分支、并发调度各分支，分支内步骤严格串行。
//! 每个分支持有独立的上下文克隆；某个分支失败不会中止兄弟分支。
//! 结果按输入顺序返回，与完成顺序无关。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::branch::traits::{Navigator, StepExecutionParams, StepExecutor, StepOutcome};
use crate::branch::types::*;
use crate::context::{ContextManager, Location, RunContext, RunId, BRANCH_SCOPE_PREFIX};
use crate::core::RuntimeError;
use crate::state::{RunStateStore, StepExecution};

/// 发起扇出的 run：ID + 父上下文
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: RunId,
    pub context: RunContext,
}

impl RunHandle {
    pub fn new(run_id: impl Into<RunId>, context: RunContext) -> Self {
        Self {
            run_id: run_id.into(),
            context,
        }
    }
}

/// 单个分支任务所需的全部状态（move 进 tokio 任务）
struct BranchTask {
    run_id: RunId,
    branch: BranchExecution,
    path: Vec<Location>,
    context: RunContext,
    contexts: Arc<ContextManager>,
    store: Option<Arc<dyn RunStateStore>>,
    navigator: Arc<dyn Navigator>,
    step_executor: Arc<dyn StepExecutor>,
    cancel: CancellationToken,
    permits: Option<Arc<Semaphore>>,
}

/// 分支协调器
pub struct BranchCoordinator {
    contexts: Arc<ContextManager>,
    store: Option<Arc<dyn RunStateStore>>,
    /// 同时执行的分支数上限（None 表示不限）
    branch_permits: Option<Arc<Semaphore>>,
}

impl BranchCoordinator {
    pub fn new(contexts: Arc<ContextManager>) -> Self {
        Self {
            contexts,
            store: None,
            branch_permits: None,
        }
    }

    /// 记录分支状态与步骤日志到存储
    pub fn with_store(mut self, store: Arc<dyn RunStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 限制同时执行的分支数
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.branch_permits = Some(Arc::new(Semaphore::new(max.max(1))));
        self
    }

    /// 每个位置创建一个分支；并行时按输入顺序分配 branch_index 0..N-1
    pub fn create_branches(
        &self,
        run_id: &str,
        locations: &[Location],
        is_parallel: bool,
    ) -> Vec<BranchExecution> {
        locations
            .iter()
            .enumerate()
            .map(|(idx, location)| {
                let index = is_parallel.then_some(idx);
                BranchExecution::new(run_id, location.clone(), index)
            })
            .collect()
    }

    /// 单个非并行分支（没有 branch_index）
    pub fn create_sequential_branch(&self, run_id: &str, node_id: &str) -> BranchExecution {
        BranchExecution::new(run_id, Location::new(run_id, node_id), None)
    }

    /// 并发执行分支，结果与输入分支一一对应
    pub async fn execute_branches(
        &self,
        run: &RunHandle,
        branches: Vec<BranchExecution>,
        navigator: Arc<dyn Navigator>,
        step_executor: Arc<dyn StepExecutor>,
        cancel: CancellationToken,
    ) -> Vec<BranchResult> {
        let paths = self.fetch_paths(&branches, navigator.as_ref()).await;
        tracing::info!(
            run_id = %run.run_id,
            branches = branches.len(),
            paths = ?paths.as_ref().map(Vec::len),
            "executing branches"
        );

        let mut handles = Vec::with_capacity(branches.len());
        for branch in branches {
            let context = self.contexts.clone_context(&run.context, &branch.id);
            let path = select_path(&branch, paths.as_deref());
            let task = BranchTask {
                run_id: run.run_id.clone(),
                branch: branch.clone(),
                path,
                context: context.clone(),
                contexts: Arc::clone(&self.contexts),
                store: self.store.clone(),
                navigator: Arc::clone(&navigator),
                step_executor: Arc::clone(&step_executor),
                cancel: cancel.clone(),
                permits: self.branch_permits.clone(),
            };
            handles.push((branch, context, tokio::spawn(run_branch(task))));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (branch, context, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    tracing::error!(branch_id = %branch.id, error = %join_err, "branch task aborted");
                    let mut result = BranchResult::new(&branch, context);
                    result.fail(BranchStatus::Failed, format!("branch task aborted: {join_err}"));
                    results.push(result);
                }
            }
        }
        results
    }

    /// 导航器支持并行枚举时只请求一次候选路径
    async fn fetch_paths(
        &self,
        branches: &[BranchExecution],
        navigator: &dyn Navigator,
    ) -> Option<Vec<Vec<Location>>> {
        if !branches.iter().any(BranchExecution::is_parallel) {
            return None;
        }
        let locations: Vec<Location> = branches.iter().map(|b| b.location.clone()).collect();
        match navigator.get_parallel_branches(&locations).await {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, "navigator failed to enumerate parallel branches");
                None
            }
        }
    }
}

/// 按 branch_index 选择路径
///
/// branch_index 超出可用路径数时退回最后一条路径并记录告警，分支不会被丢弃。
/// 没有可用路径（或分支不是并行成员）时，路径就是分支自身的起点。
fn select_path(branch: &BranchExecution, paths: Option<&[Vec<Location>]>) -> Vec<Location> {
    let (Some(requested_index), Some(paths)) = (branch.branch_index, paths) else {
        return vec![branch.location.clone()];
    };
    if paths.is_empty() {
        tracing::warn!(branch_id = %branch.id, requested_index, "navigator returned no parallel paths");
        return vec![branch.location.clone()];
    }
    if requested_index >= paths.len() {
        let fallback_index = paths.len() - 1;
        tracing::warn!(
            branch_id = %branch.id,
            requested_index,
            fallback_index,
            available_paths = paths.len(),
            "branch index exceeds available paths, using last path"
        );
        return paths[fallback_index].clone();
    }
    paths[requested_index].clone()
}

async fn run_branch(task: BranchTask) -> BranchResult {
    let BranchTask {
        run_id,
        mut branch,
        path,
        mut context,
        contexts,
        store,
        navigator,
        step_executor,
        cancel,
        permits,
    } = task;

    let _permit = match permits {
        Some(sem) => sem.acquire_owned().await.ok(),
        None => None,
    };

    let scope_id = format!("{BRANCH_SCOPE_PREFIX}{}", branch.id);
    let mut result = BranchResult::new(&branch, context.clone());

    branch.status = BranchStatus::Running;
    persist_branch(store.as_deref(), &run_id, &branch, true).await;

    for location in path {
        if cancel.is_cancelled() {
            tracing::info!(branch_id = %branch.id, "cancellation observed, not starting new steps");
            result.fail(BranchStatus::Cancelled, RuntimeError::Cancelled.to_string());
            break;
        }

        let step = match navigator.get_step_info(&location).await {
            Ok(step) => step,
            Err(e) => {
                let err = RuntimeError::BranchExecution {
                    branch_id: branch.id.clone(),
                    step_id: location.node_id().to_string(),
                    reason: e.to_string(),
                };
                result.fail(BranchStatus::Failed, err.to_string());
                break;
            }
        };

        let started = Instant::now();
        let params = StepExecutionParams {
            run_id: run_id.clone(),
            branch_id: branch.id.clone(),
            location: location.in_branch(branch.id.clone()),
            step: step.clone(),
            context: context.clone(),
        };
        let outcome = step_executor
            .execute_step(params)
            .await
            .unwrap_or_else(|e| StepOutcome::failed(e.to_string(), started.elapsed().as_millis() as u64));

        record_step(store.as_deref(), &run_id, &branch.id, &step.id, &outcome).await;

        if !outcome.success {
            let err = RuntimeError::BranchExecution {
                branch_id: branch.id.clone(),
                step_id: step.id.clone(),
                reason: outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "step reported failure".to_string()),
            };
            tracing::warn!(branch_id = %branch.id, step_id = %step.id, error = %err, "branch step failed");
            result.fail(BranchStatus::Failed, err.to_string());
            break;
        }

        for (name, value) in &outcome.outputs {
            if let Err(e) = contexts.set_variable(&mut context, name.clone(), value.clone(), Some(&scope_id)) {
                tracing::warn!(branch_id = %branch.id, variable = %name, error = %e, "failed to write step output");
            }
        }
        result.completed_steps.push(step.id.clone());
        result
            .outputs
            .insert(step.id.clone(), Value::Object(outcome.outputs.into_iter().collect()));
    }

    if result.success {
        result.status = BranchStatus::Completed;
    }
    result.context = context;

    branch.status = result.status;
    branch.completed_at = Some(Utc::now());
    persist_branch(store.as_deref(), &run_id, &branch, false).await;

    tracing::info!(
        branch_id = %branch.id,
        branch_index = ?branch.branch_index,
        status = ?result.status,
        completed_steps = result.completed_steps.len(),
        "branch finished"
    );
    result
}

/// 存储失败只告警，不影响分支执行
async fn persist_branch(
    store: Option<&dyn RunStateStore>,
    run_id: &str,
    branch: &BranchExecution,
    first_write: bool,
) {
    let Some(store) = store else {
        return;
    };
    let outcome = if first_write {
        match store.create_branch(run_id, branch).await {
            Ok(()) => Ok(()),
            Err(_) => store.update_branch(run_id, branch).await,
        }
    } else {
        store.update_branch(run_id, branch).await
    };
    if let Err(e) = outcome {
        tracing::warn!(run_id, branch_id = %branch.id, error = %e, "failed to persist branch state");
    }
}

async fn record_step(
    store: Option<&dyn RunStateStore>,
    run_id: &str,
    branch_id: &str,
    step_id: &str,
    outcome: &StepOutcome,
) {
    let Some(store) = store else {
        return;
    };
    let outputs: serde_json::Map<String, Value> = outcome
        .outputs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let record = StepExecution {
        step_id: step_id.to_string(),
        branch_id: Some(branch_id.to_string()),
        success: outcome.success,
        outputs: Value::Object(outputs),
        duration_ms: outcome.duration_ms,
        error: outcome.error.clone(),
        executed_at: Utc::now(),
    };
    if let Err(e) = store.record_step_execution(run_id, &record).await {
        tracing::warn!(run_id, step_id, error = %e, "failed to record step execution");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use crate::branch::traits::StepInfo;

    fn coordinator() -> BranchCoordinator {
        BranchCoordinator::new(Arc::new(ContextManager::new()))
    }

    struct EchoExecutor;

    #[async_trait]
    impl StepExecutor for EchoExecutor {
        async fn execute_step(&self, params: StepExecutionParams) -> Result<StepOutcome, RuntimeError> {
            let mut outputs = HashMap::new();
            outputs.insert(format!("{}_done", params.step.id), Value::Bool(true));
            Ok(StepOutcome::succeeded(outputs, 1))
        }
    }

    struct PlainNavigator;

    #[async_trait]
    impl Navigator for PlainNavigator {
        async fn get_step_info(&self, location: &Location) -> Result<StepInfo, RuntimeError> {
            Ok(StepInfo {
                id: location.node_id().to_string(),
                name: location.node_id().to_string(),
                step_type: "action".to_string(),
                inputs: Vec::new(),
            })
        }
    }

    #[test]
    fn test_parallel_branches_get_contiguous_indices() {
        let c = coordinator();
        let locations: Vec<_> = (0..5).map(|i| Location::new("r", format!("n{i}"))).collect();
        let branches = c.create_branches("run-1", &locations, true);
        let indices: Vec<_> = branches.iter().map(|b| b.branch_index).collect();
        assert_eq!(indices, (0..5).map(Some).collect::<Vec<_>>());
        assert_eq!(branches[3].location.node_id(), "n3");
    }

    #[test]
    fn test_sequential_branches_have_no_index() {
        let c = coordinator();
        let locations = vec![Location::new("r", "a"), Location::new("r", "b")];
        assert!(c
            .create_branches("run-1", &locations, false)
            .iter()
            .all(|b| b.branch_index.is_none()));
        let single = c.create_sequential_branch("run-1", "n1");
        assert!(single.branch_index.is_none());
        assert_eq!(single.location.node_id(), "n1");
    }

    #[test]
    fn test_select_path_clamps_to_last() {
        let mut branch = BranchExecution::new("r", Location::new("r", "start"), Some(5));
        let paths = vec![
            vec![Location::new("r", "a1")],
            vec![Location::new("r", "b1"), Location::new("r", "b2")],
        ];
        let path = select_path(&branch, Some(paths.as_slice()));
        assert_eq!(path[0].node_id(), "b1");

        branch.branch_index = Some(0);
        assert_eq!(select_path(&branch, Some(paths.as_slice()))[0].node_id(), "a1");
        assert_eq!(select_path(&branch, Some(&[][..]))[0].node_id(), "start");
        assert_eq!(select_path(&branch, None)[0].node_id(), "start");
    }

    /// 收集日志输出的内存 writer
    #[derive(Clone, Default)]
    struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_clamp_warning_names_both_indices() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let branch = BranchExecution::new("r", Location::new("r", "start"), Some(7));
        let paths = vec![vec![Location::new("r", "a1")], vec![Location::new("r", "b1")]];
        tracing::subscriber::with_default(subscriber, || {
            select_path(&branch, Some(paths.as_slice()));
        });

        let output = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("WARN"));
        assert!(output.contains("requested_index=7"));
        assert!(output.contains("fallback_index=1"));
    }

    #[tokio::test]
    async fn test_sequential_branch_runs_own_location() {
        let c = coordinator();
        let cm = ContextManager::new();
        let run = RunHandle::new("run-1", cm.create_context(None, None, None));
        let branch = c.create_sequential_branch("run-1", "only");
        let results = c
            .execute_branches(
                &run,
                vec![branch],
                Arc::new(PlainNavigator),
                Arc::new(EchoExecutor),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].completed_steps, vec!["only".to_string()]);
        assert_eq!(
            cm.get_variable(&results[0].context, "only_done", None).value,
            Some(Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let c = coordinator();
        let cm = ContextManager::new();
        let run = RunHandle::new("run-1", cm.create_context(None, None, None));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = c
            .execute_branches(
                &run,
                vec![c.create_sequential_branch("run-1", "x")],
                Arc::new(PlainNavigator),
                Arc::new(EchoExecutor),
                cancel,
            )
            .await;
        assert_eq!(results[0].status, BranchStatus::Cancelled);
        assert!(results[0].completed_steps.is_empty());
    }
}
