//! 分支类型定义

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Location, RunContext, RunId};

/// 分支状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchStatus {
    /// 已创建，等待执行
    Pending,
    /// 正在执行
    Running,
    /// 路径上的步骤全部成功
    Completed,
    /// 某一步失败，后续步骤未执行
    Failed,
    /// 观察到取消信号，未开始新的步骤
    Cancelled,
}

impl BranchStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            BranchStatus::Completed | BranchStatus::Failed | BranchStatus::Cancelled
        )
    }
}

/// 一个分支的执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchExecution {
    /// run 内唯一
    pub id: String,
    pub run_id: RunId,
    /// 分支起点
    pub location: Location,
    /// 只有并行扇出创建的分支才有；顺序分支没有这个字段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_index: Option<usize>,
    pub status: BranchStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BranchExecution {
    pub fn new(run_id: impl Into<RunId>, location: Location, branch_index: Option<usize>) -> Self {
        Self {
            id: format!("branch_{}", uuid::Uuid::new_v4()),
            run_id: run_id.into(),
            location,
            branch_index,
            status: BranchStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.branch_index.is_some()
    }
}

/// 一个分支执行完毕后的结果
#[derive(Debug, Clone)]
pub struct BranchResult {
    pub branch_id: String,
    pub branch_index: Option<usize>,
    pub status: BranchStatus,
    pub success: bool,
    /// 按路径顺序完成的步骤 ID
    pub completed_steps: Vec<String>,
    /// step_id -> 该步骤的输出
    pub outputs: HashMap<String, Value>,
    pub error: Option<String>,
    /// 分支结束时的上下文（供调用方合并回父上下文）
    pub context: RunContext,
}

impl BranchResult {
    pub(crate) fn new(branch: &BranchExecution, context: RunContext) -> Self {
        Self {
            branch_id: branch.id.clone(),
            branch_index: branch.branch_index,
            status: BranchStatus::Running,
            success: true,
            completed_steps: Vec::new(),
            outputs: HashMap::new(),
            error: None,
            context,
        }
    }

    pub(crate) fn fail(&mut self, status: BranchStatus, error: String) {
        self.success = false;
        self.status = status;
        self.error = Some(error);
    }
}
