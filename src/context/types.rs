//! 上下文数据类型
//!
//! RunContext = 全局变量 + 黑板 + 作用域栈。克隆时变量深拷贝，黑板按引用共享。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Run ID
pub type RunId = String;

/// 全局作用域 ID，始终位于作用域栈底
pub const GLOBAL_SCOPE_ID: &str = "global";

/// 分支作用域 ID 前缀（branch-{branchId}）
pub const BRANCH_SCOPE_PREFIX: &str = "branch-";

/// 同一次 run 的所有分支共享的键值存储
///
/// 克隆 Blackboard 只克隆 Arc；每个键的读写都在锁内完成，
/// 需要读-改-写的调用方使用 update 避免丢失更新。
#[derive(Debug, Clone, Default)]
pub struct Blackboard(Arc<RwLock<HashMap<String, Value>>>);

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<String, Value>) -> Self {
        Self(Arc::new(RwLock::new(map)))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// 写入并返回旧值
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value)
    }

    /// 原子的读-改-写：f 收到当前值（可能不存在），返回新值
    pub fn update<F>(&self, key: &str, f: F) -> Value
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let mut map = self.0.write().unwrap_or_else(PoisonError::into_inner);
        let next = f(map.get(key));
        map.insert(key.to_string(), next.clone());
        next
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 两个黑板是否为同一份共享存储
    pub fn ptr_eq(&self, other: &Blackboard) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Serialize for Blackboard {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Blackboard {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        HashMap::<String, Value>::deserialize(deserializer).map(Self::from_map)
    }
}

/// 作用域：一层具名变量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextScope {
    pub id: String,
    pub name: String,
    /// 仅用于溯源调试，不参与变量解析
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl ContextScope {
    pub fn new(id: impl Into<String>, name: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id,
            variables: HashMap::new(),
        }
    }

    pub fn global() -> Self {
        Self::new(GLOBAL_SCOPE_ID, "Global", None)
    }

    pub fn is_branch_scope(&self) -> bool {
        self.id.starts_with(BRANCH_SCOPE_PREFIX)
    }
}

/// 一次 run（或其分支）的执行上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    /// 全局兜底变量
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub blackboard: Blackboard,
    /// 作用域栈；下标 0 始终是全局作用域
    #[serde(default)]
    pub scopes: Vec<ContextScope>,
}

impl RunContext {
    /// 当前（最具体的）作用域
    pub fn current_scope(&self) -> Option<&ContextScope> {
        self.scopes.last()
    }

    pub fn find_scope(&self, scope_id: &str) -> Option<&ContextScope> {
        self.scopes.iter().find(|s| s.id == scope_id)
    }

    pub fn find_scope_mut(&mut self, scope_id: &str) -> Option<&mut ContextScope> {
        self.scopes.iter_mut().find(|s| s.id == scope_id)
    }

    /// 脱离共享黑板的副本：黑板按当前内容重建，之后的写入互不可见
    pub fn snapshot(&self) -> RunContext {
        RunContext {
            variables: self.variables.clone(),
            blackboard: Blackboard::from_map(self.blackboard.snapshot()),
            scopes: self.scopes.clone(),
        }
    }

    /// 保证全局作用域存在且位于栈底（反序列化外部数据后调用）
    pub(crate) fn ensure_global_scope(&mut self) {
        match self.scopes.iter().position(|s| s.id == GLOBAL_SCOPE_ID) {
            Some(0) => {}
            Some(idx) => {
                let global = self.scopes.remove(idx);
                self.scopes.insert(0, global);
            }
            None => self.scopes.insert(0, ContextScope::global()),
        }
    }
}

/// 工作流图中的位置；创建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    routine_id: String,
    node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branch_id: Option<String>,
}

impl Location {
    pub fn new(routine_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            routine_id: routine_id.into(),
            node_id: node_id.into(),
            branch_id: None,
        }
    }

    /// 返回带分支标识的新位置
    pub fn in_branch(&self, branch_id: impl Into<String>) -> Self {
        Self {
            branch_id: Some(branch_id.into()),
            ..self.clone()
        }
    }

    pub fn routine_id(&self) -> &str {
        &self.routine_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }
}

/// 检查点：上下文与位置一起保存，恢复时不会错位
///
/// 保存的上下文持有独立的黑板，run 之后的写入不会改动检查点。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: RunId,
    pub context: RunContext,
    pub location: Location,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run_id: impl Into<RunId>, context: &RunContext, location: Location) -> Self {
        Self {
            id: format!("ckpt_{}", uuid::Uuid::new_v4()),
            run_id: run_id.into(),
            context: context.snapshot(),
            location,
            created_at: Utc::now(),
        }
    }

    /// 克隆并断开黑板共享（交给调用方的副本用这个）
    pub fn detached(&self) -> Checkpoint {
        Checkpoint {
            context: self.context.snapshot(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blackboard_clone_shares_storage() {
        let a = Blackboard::new();
        let b = a.clone();
        b.set("k", json!(1));
        assert_eq!(a.get("k"), Some(json!(1)));
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_blackboard_update_is_read_modify_write() {
        let board = Blackboard::new();
        for _ in 0..5 {
            board.update("count", |v| json!(v.and_then(Value::as_i64).unwrap_or(0) + 1));
        }
        assert_eq!(board.get("count"), Some(json!(5)));
    }

    #[test]
    fn test_ensure_global_scope_moves_to_front() {
        let mut ctx = RunContext {
            variables: HashMap::new(),
            blackboard: Blackboard::new(),
            scopes: vec![ContextScope::new("s1", "S1", None), ContextScope::global()],
        };
        ctx.ensure_global_scope();
        assert_eq!(ctx.scopes[0].id, GLOBAL_SCOPE_ID);
        assert_eq!(ctx.scopes.len(), 2);
    }

    #[test]
    fn test_checkpoint_does_not_follow_later_blackboard_writes() {
        let ctx = RunContext {
            variables: HashMap::new(),
            blackboard: Blackboard::new(),
            scopes: vec![ContextScope::global()],
        };
        ctx.blackboard.set("k", json!(1));
        let ckpt = Checkpoint::new("run-1", &ctx, Location::new("routine", "n1"));
        ctx.blackboard.set("k", json!(2));

        assert_eq!(ckpt.context.blackboard.get("k"), Some(json!(1)));
        assert!(!ckpt.context.blackboard.ptr_eq(&ctx.blackboard));

        let copy = ckpt.detached();
        copy.context.blackboard.set("k", json!(3));
        assert_eq!(ckpt.context.blackboard.get("k"), Some(json!(1)));
    }

    #[test]
    fn test_location_in_branch_keeps_original() {
        let loc = Location::new("routine-1", "node-a");
        let branched = loc.in_branch("b1");
        assert_eq!(loc.branch_id(), None);
        assert_eq!(branched.branch_id(), Some("b1"));
        assert_eq!(branched.node_id(), "node-a");
    }
}
