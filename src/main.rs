//! comb 演示入口
//!
//! 加载配置、初始化日志，在内存导航器上跑一次两分支并行扇出（直通策略），
//! 合并分支上下文并把检查点写到文件。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use comb::branch::{BranchCoordinator, Navigator, RunHandle, StepInfo};
use comb::config::load_config;
use comb::context::{ContextManager, Location, MergeStrategy};
use comb::core::RuntimeError;
use comb::executor::{
    BlackboardExporter, ContextIoProcessor, UnifiedExecutor, UnifiedStepExecutor,
};
use comb::observability;
use comb::resources::ResourceManager;
use comb::state::{CheckpointFile, InMemoryRunStateStore, RunRecord, RunState, RunStateStore};
use comb::strategy::{StepContext, StrategyRegistry, StrategySelector};

/// 固定的两条并行路径：fetch → summarize
struct DemoNavigator {
    paths: Vec<Vec<Location>>,
    steps: HashMap<String, StepInfo>,
}

impl DemoNavigator {
    fn new(run_id: &str) -> Self {
        let mut paths = Vec::new();
        let mut steps = HashMap::new();
        for source in ["alpha", "beta"] {
            let mut path = Vec::new();
            for (kind, step_type) in [("fetch", "action"), ("summarize", "transform")] {
                let id = format!("{kind}_{source}");
                path.push(Location::new(run_id, id.clone()));
                steps.insert(
                    id.clone(),
                    StepInfo {
                        id: id.clone(),
                        name: format!("{kind} {source}"),
                        step_type: step_type.to_string(),
                        inputs: vec!["topic".to_string()],
                    },
                );
            }
            paths.push(path);
        }
        Self { paths, steps }
    }
}

#[async_trait]
impl Navigator for DemoNavigator {
    async fn get_step_info(&self, location: &Location) -> Result<StepInfo, RuntimeError> {
        self.steps
            .get(location.node_id())
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("step {}", location.node_id())))
    }

    async fn get_parallel_branches(
        &self,
        _locations: &[Location],
    ) -> Result<Option<Vec<Vec<Location>>>, RuntimeError> {
        Ok(Some(self.paths.clone()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cfg = load_config(None).context("Failed to load config")?;

    let store: Arc<dyn RunStateStore> = Arc::new(InMemoryRunStateStore::new());
    let contexts = Arc::new(ContextManager::with_store(Arc::clone(&store)));
    let resources = Arc::new(ResourceManager::new(cfg.resource_limits())?);
    let selector = Arc::new(StrategySelector::new(
        Arc::new(StrategyRegistry::with_defaults()),
        cfg.selector_config(),
    ));
    let executor = Arc::new(
        UnifiedExecutor::new(
            selector,
            Arc::clone(&resources),
            Arc::new(ContextIoProcessor::new(Arc::clone(&contexts))),
            cfg.executor_config(),
        )?
        .with_exporter(Arc::new(BlackboardExporter)),
    );

    let run_id = format!("run_{}", uuid::Uuid::new_v4());
    let mut context = contexts.create_context(None, None, None);
    contexts.set_variable(&mut context, "topic", json!("tiered execution"), None)?;
    let start = Location::new(&run_id, "fanout");
    store
        .create_run(RunRecord::new(&run_id, "demo", context.clone(), start.clone()))
        .await?;
    store.update_run_state(&run_id, RunState::Running).await?;

    // 两个 fetch 步骤给出不同的 source，合并后落到 source_branches
    let step_executor = Arc::new(
        UnifiedStepExecutor::new(Arc::clone(&executor))
            .with_step(
                StepContext::new("fetch_alpha", "action")
                    .with_binding("topic", "topic")
                    .with_input("source", json!("alpha")),
            )
            .with_step(
                StepContext::new("fetch_beta", "action")
                    .with_binding("topic", "topic")
                    .with_input("source", json!("beta")),
            ),
    );

    let mut coordinator = BranchCoordinator::new(Arc::clone(&contexts)).with_store(Arc::clone(&store));
    if cfg.runtime.max_concurrent_branches > 0 {
        coordinator = coordinator.with_max_concurrency(cfg.runtime.max_concurrent_branches);
    }
    let branches = coordinator.create_branches(&run_id, &[start.clone(), start.clone()], true);
    let results = coordinator
        .execute_branches(
            &RunHandle::new(run_id.clone(), context.clone()),
            branches,
            Arc::new(DemoNavigator::new(&run_id)),
            step_executor,
            CancellationToken::new(),
        )
        .await;

    for result in &results {
        tracing::info!(
            branch_id = %result.branch_id,
            branch_index = ?result.branch_index,
            status = ?result.status,
            steps = ?result.completed_steps,
            error = ?result.error,
            "branch result"
        );
    }

    let branch_contexts: Vec<_> = results.iter().map(|r| r.context.clone()).collect();
    let merged = contexts.merge_contexts(&context, &branch_contexts, MergeStrategy::Merge);
    contexts.save_context(&run_id, &merged).await?;

    let join = Location::new(&run_id, "join");
    store.update_location(&run_id, &join).await?;
    let checkpoint = contexts.checkpoint(&run_id, &merged, &join).await?;

    let final_state = if results.iter().all(|r| r.success) {
        RunState::Completed
    } else {
        RunState::Failed
    };
    store.update_run_state(&run_id, final_state).await?;

    if let Some(path) = &cfg.runtime.checkpoint_path {
        CheckpointFile::new(path)
            .save(&checkpoint)
            .context("Failed to write checkpoint file")?;
        tracing::info!(path = %path.display(), "checkpoint written");
    }

    let steps = store.list_step_executions(&run_id).await?;
    tracing::info!(
        run_id = %run_id,
        state = ?final_state,
        steps = steps.len(),
        merged = %serde_json::to_string(&merged.variables)?,
        resources = ?resources.snapshot(),
        "run finished"
    );
    Ok(())
}
