//! 资源预算类型
//!
//! 维度：时间（毫秒）、积分、token、工具调用次数。时间只作为单步配额，不进入 run 级资源池。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 资源维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Time,
    Credits,
    Tokens,
    ToolCalls,
}

impl ResourceKind {
    pub fn all() -> [ResourceKind; 4] {
        [
            ResourceKind::Time,
            ResourceKind::Credits,
            ResourceKind::Tokens,
            ResourceKind::ToolCalls,
        ]
    }

    /// 进入 run 级资源池的维度
    pub fn pooled() -> [ResourceKind; 3] {
        [ResourceKind::Credits, ResourceKind::Tokens, ResourceKind::ToolCalls]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Time => "time",
            ResourceKind::Credits => "credits",
            ResourceKind::Tokens => "tokens",
            ResourceKind::ToolCalls => "tool_calls",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 各维度的数量（请求量、分配量、实际用量共用）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub time_ms: u64,
    #[serde(default)]
    pub credits: u64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub tool_calls: u64,
}

impl ResourceUsage {
    pub fn get(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Time => self.time_ms,
            ResourceKind::Credits => self.credits,
            ResourceKind::Tokens => self.tokens,
            ResourceKind::ToolCalls => self.tool_calls,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, value: u64) {
        match kind {
            ResourceKind::Time => self.time_ms = value,
            ResourceKind::Credits => self.credits = value,
            ResourceKind::Tokens => self.tokens = value,
            ResourceKind::ToolCalls => self.tool_calls = value,
        }
    }

    fn zip_with(&self, other: &ResourceUsage, f: impl Fn(u64, u64) -> u64) -> ResourceUsage {
        let mut out = ResourceUsage::default();
        for kind in ResourceKind::all() {
            out.set(kind, f(self.get(kind), other.get(kind)));
        }
        out
    }

    pub fn saturating_add(&self, other: &ResourceUsage) -> ResourceUsage {
        self.zip_with(other, u64::saturating_add)
    }

    pub fn saturating_sub(&self, other: &ResourceUsage) -> ResourceUsage {
        self.zip_with(other, u64::saturating_sub)
    }

    /// 逐维度取较大值
    pub fn max(&self, other: &ResourceUsage) -> ResourceUsage {
        self.zip_with(other, u64::max)
    }

    /// self 超出 limit 的维度
    pub fn exceeded(&self, limit: &ResourceUsage) -> Vec<ResourceKind> {
        ResourceKind::all()
            .into_iter()
            .filter(|k| self.get(*k) > limit.get(*k))
            .collect()
    }

    pub fn is_zero(&self) -> bool {
        ResourceKind::all().into_iter().all(|k| self.get(k) == 0)
    }
}

/// 单步资源上限（None 表示该维度不设上限）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConstraints {
    #[serde(default)]
    pub max_time_ms: Option<u64>,
    #[serde(default)]
    pub max_credits: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_tool_calls: Option<u64>,
}

impl ResourceConstraints {
    pub fn cap(&self, kind: ResourceKind) -> Option<u64> {
        match kind {
            ResourceKind::Time => self.max_time_ms,
            ResourceKind::Credits => self.max_credits,
            ResourceKind::Tokens => self.max_tokens,
            ResourceKind::ToolCalls => self.max_tool_calls,
        }
    }
}

/// 一次预算预留（批准或拒绝都会返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReservation {
    pub reservation_id: String,
    pub step_id: String,
    pub requested: ResourceUsage,
    /// 批准的分配量；被拒绝时为 0
    pub allocation: ResourceUsage,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// finalize_usage 的对账报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub reservation_id: String,
    pub step_id: String,
    pub reserved: ResourceUsage,
    pub actual: ResourceUsage,
    /// 未用完、已退回资源池的部分
    pub unused: ResourceUsage,
    pub overruns: Vec<ResourceKind>,
}

/// 资源池快照（监控用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub reserved: ResourceUsage,
    pub consumed: ResourceUsage,
    /// 各池化维度剩余量；None 表示不限
    pub available_credits: Option<u64>,
    pub available_tokens: Option<u64>,
    pub available_tool_calls: Option<u64>,
    pub active_reservations: usize,
}
