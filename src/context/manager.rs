//! 上下文管理器
//!
//! 作用域栈、变量解析、黑板、分支克隆与合并、序列化，以及按 run 缓存的上下文读写。
//! 缓存由管理器实例持有，调用方通过 clear_cache 显式失效。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::types::*;
use crate::core::RuntimeError;
use crate::state::RunStateStore;

/// 分支上下文合并策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// 原样取第一个分支的上下文
    First,
    /// 原样取最后一个分支的上下文
    Last,
    /// 汇总各分支作用域变量；冲突写入 {name}_branches
    #[default]
    Merge,
}

impl FromStr for MergeStrategy {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "merge" | "" => Ok(Self::Merge),
            other => Err(RuntimeError::Configuration(format!(
                "unknown merge strategy: {other}"
            ))),
        }
    }
}

/// 变量解析来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableSource {
    Scope(String),
    /// 顶层 variables 兜底
    Global,
    Unresolved,
}

/// get_variable 的结果：值 + 命中的来源
#[derive(Debug, Clone, PartialEq)]
pub struct VariableLookup {
    pub value: Option<Value>,
    pub source: VariableSource,
}

impl VariableLookup {
    fn unresolved() -> Self {
        Self {
            value: None,
            source: VariableSource::Unresolved,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.source != VariableSource::Unresolved
    }
}

/// 冲突变量的后缀
const BRANCHES_SUFFIX: &str = "_branches";

/// 上下文管理器
pub struct ContextManager {
    store: Option<Arc<dyn RunStateStore>>,
    cache: RwLock<HashMap<RunId, RunContext>>,
}

impl ContextManager {
    /// 仅内存，不连接持久化存储
    pub fn new() -> Self {
        Self {
            store: None,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_store(store: Arc<dyn RunStateStore>) -> Self {
        Self {
            store: Some(store),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 创建上下文；未提供作用域时以全局作用域作为栈底
    pub fn create_context(
        &self,
        variables: Option<HashMap<String, Value>>,
        blackboard: Option<Blackboard>,
        scopes: Option<Vec<ContextScope>>,
    ) -> RunContext {
        let mut context = RunContext {
            variables: variables.unwrap_or_default(),
            blackboard: blackboard.unwrap_or_default(),
            scopes: scopes.unwrap_or_default(),
        };
        context.ensure_global_scope();
        context
    }

    /// 为分支克隆上下文
    ///
    /// variables 与各作用域的 variables 深拷贝；blackboard 共享引用；
    /// 追加作用域 branch-{branch_id}，parent_id 为克隆前的最后一个作用域。
    pub fn clone_context(&self, context: &RunContext, branch_id: &str) -> RunContext {
        let parent_id = context.current_scope().map(|s| s.id.clone());
        let mut cloned = context.clone();
        let scope_id = format!("{BRANCH_SCOPE_PREFIX}{branch_id}");
        cloned
            .scopes
            .push(ContextScope::new(scope_id.clone(), scope_id, parent_id));
        cloned
    }

    /// 将分支上下文合并回父上下文
    pub fn merge_contexts(
        &self,
        parent: &RunContext,
        branches: &[RunContext],
        strategy: MergeStrategy,
    ) -> RunContext {
        match strategy {
            MergeStrategy::First => branches.first().cloned().unwrap_or_else(|| parent.clone()),
            MergeStrategy::Last => branches.last().cloned().unwrap_or_else(|| parent.clone()),
            MergeStrategy::Merge => {
                let mut merged = parent.clone();
                // 名称 -> 各分支给出的值（按分支顺序）
                let mut collected: Vec<(String, Vec<Value>)> = Vec::new();
                for branch in branches {
                    for scope in branch.scopes.iter().filter(|s| s.is_branch_scope()) {
                        let mut names: Vec<&String> = scope.variables.keys().collect();
                        names.sort();
                        for name in names {
                            let value = scope.variables[name].clone();
                            match collected.iter_mut().find(|(n, _)| n == name) {
                                Some((_, values)) => values.push(value),
                                None => collected.push((name.clone(), vec![value])),
                            }
                        }
                    }
                }

                for (name, values) in collected {
                    let all_equal = values.windows(2).all(|w| w[0] == w[1]);
                    if all_equal {
                        if let Some(value) = values.into_iter().next() {
                            merged.variables.insert(name, value);
                        }
                    } else {
                        tracing::debug!(variable = %name, count = values.len(), "branch values conflict");
                        merged
                            .variables
                            .insert(format!("{name}{BRANCHES_SUFFIX}"), Value::Array(values));
                    }
                }
                merged
            }
        }
    }

    /// 解析变量
    ///
    /// 指定 scope_id 时只查该作用域；否则从最具体的作用域向全局作用域查找，最后回退到顶层 variables。
    pub fn get_variable(
        &self,
        context: &RunContext,
        name: &str,
        scope_id: Option<&str>,
    ) -> VariableLookup {
        if let Some(scope_id) = scope_id {
            return context
                .find_scope(scope_id)
                .and_then(|scope| scope.variables.get(name))
                .map(|value| VariableLookup {
                    value: Some(value.clone()),
                    source: VariableSource::Scope(scope_id.to_string()),
                })
                .unwrap_or_else(VariableLookup::unresolved);
        }

        for scope in context.scopes.iter().rev() {
            if let Some(value) = scope.variables.get(name) {
                return VariableLookup {
                    value: Some(value.clone()),
                    source: VariableSource::Scope(scope.id.clone()),
                };
            }
        }

        match context.variables.get(name) {
            Some(value) => VariableLookup {
                value: Some(value.clone()),
                source: VariableSource::Global,
            },
            None => VariableLookup::unresolved(),
        }
    }

    /// 写变量：指定作用域 > 当前作用域 > 顶层 variables
    pub fn set_variable(
        &self,
        context: &mut RunContext,
        name: impl Into<String>,
        value: Value,
        scope_id: Option<&str>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        if let Some(scope_id) = scope_id {
            let scope = context
                .find_scope_mut(scope_id)
                .ok_or_else(|| RuntimeError::NotFound(format!("scope {scope_id}")))?;
            scope.variables.insert(name, value);
            return Ok(());
        }

        match context.scopes.last_mut() {
            Some(scope) => {
                scope.variables.insert(name, value);
            }
            None => {
                context.variables.insert(name, value);
            }
        }
        Ok(())
    }

    /// 压入新作用域，返回其 ID
    pub fn push_scope(&self, context: &mut RunContext, name: impl Into<String>) -> String {
        let id = format!("scope_{}", uuid::Uuid::new_v4());
        let parent_id = context.current_scope().map(|s| s.id.clone());
        context
            .scopes
            .push(ContextScope::new(id.clone(), name, parent_id));
        id
    }

    /// 弹出最具体的作用域；只剩全局作用域时不做任何事
    pub fn pop_scope(&self, context: &mut RunContext) -> Option<ContextScope> {
        if context.scopes.len() <= 1 {
            return None;
        }
        context.scopes.pop()
    }

    pub fn get_blackboard_value(&self, context: &RunContext, key: &str) -> Option<Value> {
        context.blackboard.get(key)
    }

    pub fn set_blackboard_value(&self, context: &RunContext, key: impl Into<String>, value: Value) {
        context.blackboard.set(key, value);
    }

    pub fn serialize_context(&self, context: &RunContext) -> Result<String, RuntimeError> {
        Ok(serde_json::to_string(context)?)
    }

    pub fn deserialize_context(&self, data: &str) -> Result<RunContext, RuntimeError> {
        let mut context: RunContext = serde_json::from_str(data)?;
        context.ensure_global_scope();
        Ok(context)
    }

    /// 序列化后的字节数，供调用方做监控或背压判断
    pub fn get_context_size(&self, context: &RunContext) -> Result<usize, RuntimeError> {
        Ok(self.serialize_context(context)?.len())
    }

    /// 读取 run 的上下文：先查缓存，未命中再查存储并回填缓存
    pub async fn load_context(&self, run_id: &str) -> Result<Option<RunContext>, RuntimeError> {
        if let Some(context) = self.cache_read().get(run_id).cloned() {
            return Ok(Some(context));
        }
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let loaded = store.get_context(run_id).await?;
        if let Some(context) = &loaded {
            self.cache_write().insert(run_id.to_string(), context.clone());
            tracing::debug!(run_id, "context loaded from store");
        }
        Ok(loaded)
    }

    /// 写入 run 的上下文（写穿到存储并刷新缓存）
    pub async fn save_context(&self, run_id: &str, context: &RunContext) -> Result<(), RuntimeError> {
        if let Some(store) = &self.store {
            store.update_context(run_id, context).await?;
        }
        self.cache_write().insert(run_id.to_string(), context.clone());
        Ok(())
    }

    /// 上下文与位置作为一个检查点一起保存
    pub async fn checkpoint(
        &self,
        run_id: &str,
        context: &RunContext,
        location: &Location,
    ) -> Result<Checkpoint, RuntimeError> {
        let store = self.require_store()?;
        let checkpoint = store.create_checkpoint(run_id, context, location).await?;
        self.cache_write().insert(run_id.to_string(), context.clone());
        tracing::info!(run_id, checkpoint_id = %checkpoint.id, node = %location.node_id(), "checkpoint created");
        Ok(checkpoint)
    }

    /// 从检查点恢复；存储保证上下文与位置同时生效
    pub async fn restore_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, RuntimeError> {
        let store = self.require_store()?;
        let checkpoint = store.restore_checkpoint(run_id, checkpoint_id).await?;
        self.cache_write()
            .insert(run_id.to_string(), checkpoint.context.clone());
        tracing::info!(run_id, checkpoint_id, "checkpoint restored");
        Ok(checkpoint)
    }

    /// 清除缓存：指定 run 或全部
    pub fn clear_cache(&self, run_id: Option<&str>) {
        let mut cache = self.cache_write();
        match run_id {
            Some(id) => {
                cache.remove(id);
            }
            None => cache.clear(),
        }
    }

    pub fn is_cached(&self, run_id: &str) -> bool {
        self.cache_read().contains_key(run_id)
    }

    fn require_store(&self) -> Result<&Arc<dyn RunStateStore>, RuntimeError> {
        self.store
            .as_ref()
            .ok_or_else(|| RuntimeError::Configuration("context manager has no run state store".to_string()))
    }

    fn cache_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<RunId, RunContext>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<RunId, RunContext>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InMemoryRunStateStore, RunRecord};
    use serde_json::json;

    fn manager() -> ContextManager {
        ContextManager::new()
    }

    #[test]
    fn test_create_context_seeds_global_scope() {
        let ctx = manager().create_context(None, None, None);
        assert_eq!(ctx.scopes.len(), 1);
        assert_eq!(ctx.scopes[0].id, GLOBAL_SCOPE_ID);
    }

    #[test]
    fn test_clone_isolates_variables_and_shares_blackboard() {
        let cm = manager();
        let mut vars = HashMap::new();
        vars.insert("a".to_string(), json!(1));
        let mut original = cm.create_context(Some(vars), None, None);
        cm.set_variable(&mut original, "s", json!("orig"), Some(GLOBAL_SCOPE_ID))
            .unwrap();

        let mut clone = cm.clone_context(&original, "b1");
        assert_eq!(clone.scopes.len(), 2);
        assert_eq!(clone.scopes[1].id, "branch-b1");
        assert_eq!(clone.scopes[1].parent_id.as_deref(), Some(GLOBAL_SCOPE_ID));

        clone.variables.insert("a".to_string(), json!(99));
        cm.set_variable(&mut clone, "s", json!("changed"), Some(GLOBAL_SCOPE_ID))
            .unwrap();
        cm.set_variable(&mut clone, "new", json!(true), None).unwrap();

        assert_eq!(original.variables["a"], json!(1));
        assert_eq!(original.scopes[0].variables["s"], json!("orig"));
        assert_eq!(original.scopes.len(), 1);

        cm.set_blackboard_value(&clone, "shared", json!("seen"));
        assert_eq!(cm.get_blackboard_value(&original, "shared"), Some(json!("seen")));
    }

    #[test]
    fn test_merge_conflict_goes_to_branches_array() {
        let cm = manager();
        let parent = cm.create_context(None, None, None);
        let mut b1 = cm.clone_context(&parent, "1");
        let mut b2 = cm.clone_context(&parent, "2");
        cm.set_variable(&mut b1, "x", json!("v1"), None).unwrap();
        cm.set_variable(&mut b2, "x", json!("v2"), None).unwrap();
        cm.set_variable(&mut b1, "only_one", json!(42), None).unwrap();
        cm.set_variable(&mut b1, "same", json!("s"), None).unwrap();
        cm.set_variable(&mut b2, "same", json!("s"), None).unwrap();

        let merged = cm.merge_contexts(&parent, &[b1, b2], MergeStrategy::Merge);
        assert_eq!(merged.variables["x_branches"], json!(["v1", "v2"]));
        assert!(!merged.variables.contains_key("x"));
        assert_eq!(merged.variables["only_one"], json!(42));
        assert_eq!(merged.variables["same"], json!("s"));
        assert_eq!(merged.scopes.len(), 1);
    }

    #[test]
    fn test_merge_first_and_last_select_verbatim() {
        let cm = manager();
        let parent = cm.create_context(None, None, None);
        let mut b1 = cm.clone_context(&parent, "1");
        let mut b2 = cm.clone_context(&parent, "2");
        b1.variables.insert("who".into(), json!("first"));
        b2.variables.insert("who".into(), json!("last"));
        let branches = vec![b1, b2];

        let first = cm.merge_contexts(&parent, &branches, MergeStrategy::First);
        let last = cm.merge_contexts(&parent, &branches, MergeStrategy::Last);
        assert_eq!(first.variables["who"], json!("first"));
        assert_eq!(last.variables["who"], json!("last"));
        assert_eq!(last.scopes[1].id, "branch-2");

        let empty = cm.merge_contexts(&parent, &[], MergeStrategy::Last);
        assert_eq!(empty.scopes.len(), 1);
    }

    #[test]
    fn test_merge_strategy_from_str() {
        assert_eq!("first".parse::<MergeStrategy>().unwrap(), MergeStrategy::First);
        assert_eq!("LAST".parse::<MergeStrategy>().unwrap(), MergeStrategy::Last);
        assert_eq!("".parse::<MergeStrategy>().unwrap(), MergeStrategy::Merge);
        assert!("average".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn test_get_variable_resolution_order() {
        let cm = manager();
        let mut ctx = cm.create_context(None, None, None);
        ctx.variables.insert("v".into(), json!("top"));
        assert_eq!(cm.get_variable(&ctx, "v", None).source, VariableSource::Global);

        cm.set_variable(&mut ctx, "v", json!("global-scope"), None).unwrap();
        let inner = cm.push_scope(&mut ctx, "inner");
        cm.set_variable(&mut ctx, "v", json!("inner"), None).unwrap();

        let hit = cm.get_variable(&ctx, "v", None);
        assert_eq!(hit.value, Some(json!("inner")));
        assert_eq!(hit.source, VariableSource::Scope(inner.clone()));

        let scoped = cm.get_variable(&ctx, "v", Some(GLOBAL_SCOPE_ID));
        assert_eq!(scoped.value, Some(json!("global-scope")));

        let miss = cm.get_variable(&ctx, "nope", None);
        assert!(!miss.is_resolved());
        assert!(!cm.get_variable(&ctx, "v", Some("missing-scope")).is_resolved());
    }

    #[test]
    fn test_set_variable_unknown_scope_errors() {
        let cm = manager();
        let mut ctx = cm.create_context(None, None, None);
        let err = cm.set_variable(&mut ctx, "x", json!(1), Some("nope"));
        assert!(matches!(err, Err(RuntimeError::NotFound(_))));
    }

    #[test]
    fn test_set_variable_without_scopes_writes_top_level() {
        let cm = manager();
        let mut ctx = cm.create_context(None, None, None);
        ctx.scopes.clear();
        cm.set_variable(&mut ctx, "x", json!(1), None).unwrap();
        assert_eq!(ctx.variables["x"], json!(1));
    }

    #[test]
    fn test_pop_scope_keeps_global() {
        let cm = manager();
        let mut ctx = cm.create_context(None, None, None);
        assert!(cm.pop_scope(&mut ctx).is_none());
        assert_eq!(ctx.scopes.len(), 1);

        cm.push_scope(&mut ctx, "tmp");
        let popped = cm.pop_scope(&mut ctx).unwrap();
        assert_eq!(popped.name, "tmp");
        assert_eq!(ctx.scopes.len(), 1);
    }

    #[test]
    fn test_serialize_round_trip_and_size() {
        let cm = manager();
        let mut ctx = cm.create_context(None, None, None);
        cm.set_variable(&mut ctx, "k", json!({"nested": [1, 2]}), None).unwrap();
        cm.set_blackboard_value(&ctx, "bb", json!("v"));

        let data = cm.serialize_context(&ctx).unwrap();
        let restored = cm.deserialize_context(&data).unwrap();
        assert_eq!(restored.scopes, ctx.scopes);
        assert_eq!(restored.blackboard.snapshot(), ctx.blackboard.snapshot());
        assert_eq!(cm.get_context_size(&ctx).unwrap(), data.len());
    }

    #[tokio::test]
    async fn test_cache_and_checkpoint_restore() {
        let store = Arc::new(InMemoryRunStateStore::new());
        let cm = ContextManager::with_store(store.clone());
        let mut ctx = cm.create_context(None, None, None);
        store
            .create_run(RunRecord::new("run-1", "user-1", ctx.clone(), Location::new("r", "start")))
            .await
            .unwrap();

        cm.set_variable(&mut ctx, "step", json!(1), None).unwrap();
        let loc = Location::new("r", "n1");
        let ckpt = cm.checkpoint("run-1", &ctx, &loc).await.unwrap();

        cm.set_variable(&mut ctx, "step", json!(2), None).unwrap();
        cm.save_context("run-1", &ctx).await.unwrap();
        assert!(cm.is_cached("run-1"));

        let restored = cm.restore_checkpoint("run-1", &ckpt.id).await.unwrap();
        assert_eq!(restored.location, loc);
        let cached = cm.load_context("run-1").await.unwrap().unwrap();
        assert_eq!(cm.get_variable(&cached, "step", None).value, Some(json!(1)));

        cm.clear_cache(Some("run-1"));
        assert!(!cm.is_cached("run-1"));
        let reloaded = cm.load_context("run-1").await.unwrap().unwrap();
        assert_eq!(cm.get_variable(&reloaded, "step", None).value, Some(json!(1)));
        assert!(cm.is_cached("run-1"));
    }

    #[tokio::test]
    async fn test_checkpoint_without_store_is_configuration_error() {
        let cm = manager();
        let ctx = cm.create_context(None, None, None);
        let err = cm.checkpoint("r", &ctx, &Location::new("r", "n")).await;
        assert!(matches!(err, Err(RuntimeError::Configuration(_))));
    }
}
