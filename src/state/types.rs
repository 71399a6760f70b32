//! Run 状态数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Location, RunContext, RunId};

/// Run 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// 一次 run 的持久化记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub user_id: String,
    pub state: RunState,
    pub context: RunContext,
    pub location: Location,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        run_id: impl Into<RunId>,
        user_id: impl Into<String>,
        context: RunContext,
        location: Location,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            user_id: user_id.into(),
            state: RunState::Pending,
            context,
            location,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 单步执行日志（按 run 追加，只增不改）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    pub success: bool,
    pub outputs: Value,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}
