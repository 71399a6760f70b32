//! 资源管理器
//!
//! 预留 → 执行中累计用量 → 结算对账。所有计数器在同一把锁内更新，多个分支可并发预留与结算。
//! 每个池化维度挂一个熔断器：结算时反复超支会暂停该维度的准入，直到恢复超时后探测放行。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::{CircuitBreaker, CircuitBreakerConfig, RuntimeError};
use crate::resources::types::*;

/// run 级资源池与准入参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// None 表示不限
    pub total_credits: Option<u64>,
    pub total_tokens: Option<u64>,
    pub total_tool_calls: Option<u64>,
    /// 请求与约束都未给出时间时的单步默认配额
    pub default_max_time_ms: u64,
    /// 连续超支多少次后暂停该维度准入
    pub overrun_failure_threshold: i64,
    pub overrun_recovery_timeout_ms: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            total_credits: None,
            total_tokens: None,
            total_tool_calls: None,
            default_max_time_ms: 60_000,
            overrun_failure_threshold: 3,
            overrun_recovery_timeout_ms: 60_000,
        }
    }
}

impl ResourceLimits {
    fn total(&self, kind: ResourceKind) -> Option<u64> {
        match kind {
            ResourceKind::Credits => self.total_credits,
            ResourceKind::Tokens => self.total_tokens,
            ResourceKind::ToolCalls => self.total_tool_calls,
            ResourceKind::Time => None,
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    reserved: ResourceUsage,
    consumed: ResourceUsage,
    reservations: HashMap<String, ResourceReservation>,
    /// reservation_id -> 执行中上报的累计用量（同名步骤在不同分支各有一份）
    tracked: HashMap<String, ResourceUsage>,
}

/// 资源管理器
#[derive(Debug)]
pub struct ResourceManager {
    limits: ResourceLimits,
    ledger: Mutex<Ledger>,
    overrun_breakers: HashMap<ResourceKind, CircuitBreaker>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Result<Self, RuntimeError> {
        let mut overrun_breakers = HashMap::new();
        for kind in ResourceKind::pooled() {
            let breaker = CircuitBreaker::new(
                CircuitBreakerConfig::new(format!("resource:{kind}"))
                    .with_failure_threshold(limits.overrun_failure_threshold)
                    .with_recovery_timeout_ms(limits.overrun_recovery_timeout_ms)
                    .with_half_open_timeout_ms(0),
            )?;
            overrun_breakers.insert(kind, breaker);
        }
        Ok(Self {
            limits,
            ledger: Mutex::new(Ledger::default()),
            overrun_breakers,
        })
    }

    /// 不限额度的管理器
    pub fn unlimited() -> Result<Self, RuntimeError> {
        Self::new(ResourceLimits::default())
    }

    /// 预留预算
    ///
    /// 超预算不会返回 Err：返回 approved=false 与原因，由调用方优雅地失败该步骤。
    pub fn reserve_budget(
        &self,
        step_id: &str,
        requested: ResourceUsage,
        constraints: &ResourceConstraints,
    ) -> ResourceReservation {
        let reservation_id = format!("rsv_{}", uuid::Uuid::new_v4());
        let allocation = self.allocation_for(&requested, constraints);

        let reject = |reason: String| {
            tracing::warn!(step_id, reservation_id = %reservation_id, %reason, "budget reservation rejected");
            ResourceReservation {
                reservation_id: reservation_id.clone(),
                step_id: step_id.to_string(),
                requested,
                allocation: ResourceUsage::default(),
                approved: false,
                reason: Some(reason),
                created_at: Utc::now(),
            }
        };

        for kind in ResourceKind::pooled() {
            if allocation.get(kind) == 0 {
                continue;
            }
            if let Some(breaker) = self.overrun_breakers.get(&kind) {
                if !breaker.is_call_allowed() {
                    return reject(format!("{kind} admission paused after repeated overruns"));
                }
            }
        }

        let mut ledger = self.lock();
        for kind in ResourceKind::pooled() {
            let Some(total) = self.limits.total(kind) else {
                continue;
            };
            let available = total
                .saturating_sub(ledger.reserved.get(kind))
                .saturating_sub(ledger.consumed.get(kind));
            let wanted = allocation.get(kind);
            if wanted > available {
                drop(ledger);
                return reject(format!(
                    "insufficient {kind}: requested {wanted}, available {available}"
                ));
            }
        }

        ledger.reserved = ledger.reserved.saturating_add(&allocation);
        let reservation = ResourceReservation {
            reservation_id: reservation_id.clone(),
            step_id: step_id.to_string(),
            requested,
            allocation,
            approved: true,
            reason: None,
            created_at: Utc::now(),
        };
        ledger
            .reservations
            .insert(reservation_id.clone(), reservation.clone());
        tracing::debug!(step_id, reservation_id = %reservation_id, ?allocation, "budget reserved");
        reservation
    }

    /// 累计某次预留执行中的实际用量（可多次调用，如每次工具调用）
    ///
    /// 预留已结算或已释放时丢弃并返回 false。
    pub fn track_usage(&self, reservation_id: &str, partial: ResourceUsage) -> bool {
        let mut ledger = self.lock();
        if !ledger.reservations.contains_key(reservation_id) {
            tracing::debug!(reservation_id, "usage reported for unknown reservation, dropped");
            return false;
        }
        let entry = ledger.tracked.entry(reservation_id.to_string()).or_default();
        *entry = entry.saturating_add(&partial);
        true
    }

    /// 当前为某次预留累计的用量
    pub fn tracked_usage(&self, reservation_id: &str) -> ResourceUsage {
        self.lock()
            .tracked
            .get(reservation_id)
            .copied()
            .unwrap_or_default()
    }

    /// 结算：实际用量取「上报累计」与「传入值」的逐维较大值；未用部分退回资源池
    pub fn finalize_usage(
        &self,
        reservation_id: &str,
        actual_usage: ResourceUsage,
    ) -> Result<UsageReport, RuntimeError> {
        let report = {
            let mut ledger = self.lock();
            let reservation = ledger
                .reservations
                .remove(reservation_id)
                .ok_or_else(|| RuntimeError::NotFound(format!("reservation {reservation_id}")))?;
            let tracked = ledger.tracked.remove(reservation_id).unwrap_or_default();
            let actual = actual_usage.max(&tracked);

            ledger.reserved = ledger.reserved.saturating_sub(&reservation.allocation);
            ledger.consumed = ledger.consumed.saturating_add(&actual);

            UsageReport {
                reservation_id: reservation.reservation_id,
                step_id: reservation.step_id,
                reserved: reservation.allocation,
                actual,
                unused: reservation.allocation.saturating_sub(&actual),
                overruns: actual.exceeded(&reservation.allocation),
            }
        };

        for kind in ResourceKind::pooled() {
            if report.reserved.get(kind) == 0 && report.actual.get(kind) == 0 {
                continue;
            }
            if let Some(breaker) = self.overrun_breakers.get(&kind) {
                if report.overruns.contains(&kind) {
                    breaker.record_failure();
                } else {
                    breaker.record_success();
                }
            }
        }

        if !report.overruns.is_empty() {
            tracing::warn!(
                step_id = %report.step_id,
                reservation_id = %report.reservation_id,
                overruns = ?report.overruns,
                "step exceeded its reserved budget"
            );
        }
        Ok(report)
    }

    /// 取消未使用的预留，分配量全部退回
    pub fn release(&self, reservation_id: &str) -> bool {
        let mut ledger = self.lock();
        match ledger.reservations.remove(reservation_id) {
            Some(reservation) => {
                ledger.reserved = ledger.reserved.saturating_sub(&reservation.allocation);
                ledger.tracked.remove(reservation_id);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let ledger = self.lock();
        let available = |kind: ResourceKind| {
            self.limits.total(kind).map(|total| {
                total
                    .saturating_sub(ledger.reserved.get(kind))
                    .saturating_sub(ledger.consumed.get(kind))
            })
        };
        ResourceSnapshot {
            reserved: ledger.reserved,
            consumed: ledger.consumed,
            available_credits: available(ResourceKind::Credits),
            available_tokens: available(ResourceKind::Tokens),
            available_tool_calls: available(ResourceKind::ToolCalls),
            active_reservations: ledger.reservations.len(),
        }
    }

    /// 分配量 = min(请求量, 约束上限)；时间未给出时使用默认配额
    fn allocation_for(
        &self,
        requested: &ResourceUsage,
        constraints: &ResourceConstraints,
    ) -> ResourceUsage {
        let mut allocation = ResourceUsage::default();
        for kind in ResourceKind::all() {
            let mut wanted = requested.get(kind);
            if kind == ResourceKind::Time && wanted == 0 {
                wanted = self.limits.default_max_time_ms;
            }
            let granted = constraints.cap(kind).map_or(wanted, |cap| wanted.min(cap));
            allocation.set(kind, granted);
        }
        allocation
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 交给执行策略的用量上报句柄：绑定到一次已批准的预留
#[derive(Debug, Clone)]
pub struct UsageTracker {
    manager: Arc<ResourceManager>,
    reservation_id: String,
    step_id: String,
}

impl UsageTracker {
    pub fn new(manager: Arc<ResourceManager>, reservation: &ResourceReservation) -> Self {
        Self {
            manager,
            reservation_id: reservation.reservation_id.clone(),
            step_id: reservation.step_id.clone(),
        }
    }

    pub fn record(&self, partial: ResourceUsage) {
        self.manager.track_usage(&self.reservation_id, partial);
    }

    /// 记录一次工具调用
    pub fn record_tool_call(&self) {
        self.record(ResourceUsage {
            tool_calls: 1,
            ..ResourceUsage::default()
        });
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn reservation_id(&self) -> &str {
        &self.reservation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credits(n: u64) -> ResourceUsage {
        ResourceUsage {
            credits: n,
            ..ResourceUsage::default()
        }
    }

    fn limited(total_credits: u64) -> ResourceManager {
        ResourceManager::new(ResourceLimits {
            total_credits: Some(total_credits),
            ..ResourceLimits::default()
        })
        .unwrap()
    }

    #[test]
    fn test_reserve_within_budget() {
        let rm = limited(100);
        let r = rm.reserve_budget("s1", credits(40), &ResourceConstraints::default());
        assert!(r.approved);
        assert_eq!(r.allocation.credits, 40);
        assert_eq!(r.allocation.time_ms, 60_000);
        assert_eq!(rm.snapshot().available_credits, Some(60));
    }

    #[test]
    fn test_over_budget_is_rejected_not_error() {
        let rm = limited(10);
        let r = rm.reserve_budget("s1", credits(11), &ResourceConstraints::default());
        assert!(!r.approved);
        assert!(r.reason.unwrap().contains("credits"));
        assert_eq!(rm.snapshot().active_reservations, 0);
    }

    #[test]
    fn test_constraints_cap_allocation() {
        let rm = limited(100);
        let constraints = ResourceConstraints {
            max_credits: Some(5),
            max_time_ms: Some(1_000),
            ..ResourceConstraints::default()
        };
        let r = rm.reserve_budget("s1", credits(50), &constraints);
        assert!(r.approved);
        assert_eq!(r.allocation.credits, 5);
        assert_eq!(r.allocation.time_ms, 1_000);
    }

    #[test]
    fn test_finalize_returns_unused_to_pool() {
        let rm = limited(100);
        let r = rm.reserve_budget("s1", credits(50), &ResourceConstraints::default());
        assert!(rm.track_usage(&r.reservation_id, credits(10)));
        assert!(rm.track_usage(&r.reservation_id, credits(5)));
        let report = rm.finalize_usage(&r.reservation_id, credits(12)).unwrap();
        assert_eq!(report.actual.credits, 15);
        assert_eq!(report.unused.credits, 35);
        assert!(report.overruns.is_empty());

        let snap = rm.snapshot();
        assert_eq!(snap.consumed.credits, 15);
        assert_eq!(snap.reserved.credits, 0);
        assert_eq!(snap.available_credits, Some(85));
        assert!(rm.finalize_usage(&r.reservation_id, credits(1)).is_err());
        assert!(!rm.track_usage(&r.reservation_id, credits(1)));
    }

    #[test]
    fn test_same_step_in_two_branches_tracks_separately() {
        let rm = ResourceManager::new(ResourceLimits {
            total_tokens: Some(1_000),
            ..ResourceLimits::default()
        })
        .unwrap();
        let tokens = |n| ResourceUsage {
            tokens: n,
            ..ResourceUsage::default()
        };
        let a = rm.reserve_budget("p1_s0", tokens(50), &ResourceConstraints::default());
        let b = rm.reserve_budget("p1_s0", tokens(50), &ResourceConstraints::default());
        rm.track_usage(&a.reservation_id, tokens(40));
        rm.track_usage(&b.reservation_id, tokens(40));

        let report_a = rm.finalize_usage(&a.reservation_id, ResourceUsage::default()).unwrap();
        let report_b = rm.finalize_usage(&b.reservation_id, ResourceUsage::default()).unwrap();
        assert_eq!((report_a.actual.tokens, report_b.actual.tokens), (40, 40));
        assert!(report_a.overruns.is_empty());
        assert!(report_b.overruns.is_empty());
        assert_eq!(rm.snapshot().consumed.tokens, 80);
    }

    #[test]
    fn test_release_returns_allocation() {
        let rm = limited(20);
        let r = rm.reserve_budget("s1", credits(20), &ResourceConstraints::default());
        assert!(!rm.reserve_budget("s2", credits(1), &ResourceConstraints::default()).approved);
        assert!(rm.release(&r.reservation_id));
        assert!(!rm.release(&r.reservation_id));
        assert!(rm.reserve_budget("s2", credits(1), &ResourceConstraints::default()).approved);
    }

    #[test]
    fn test_repeated_overruns_pause_admission() {
        let rm = ResourceManager::new(ResourceLimits {
            overrun_failure_threshold: 2,
            ..ResourceLimits::default()
        })
        .unwrap();
        for i in 0..2 {
            let r = rm.reserve_budget(&format!("s{i}"), credits(1), &ResourceConstraints::default());
            assert!(r.approved);
            let report = rm.finalize_usage(&r.reservation_id, credits(5)).unwrap();
            assert_eq!(report.overruns, vec![ResourceKind::Credits]);
        }
        let r = rm.reserve_budget("s9", credits(1), &ResourceConstraints::default());
        assert!(!r.approved);
        assert!(r.reason.unwrap().contains("overruns"));

        let no_credits = ResourceUsage {
            tokens: 10,
            ..ResourceUsage::default()
        };
        assert!(rm.reserve_budget("s10", no_credits, &ResourceConstraints::default()).approved);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_pool() {
        let rm = Arc::new(limited(50));
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let rm = Arc::clone(&rm);
                std::thread::spawn(move || {
                    rm.reserve_budget(&format!("s{i}"), credits(5), &ResourceConstraints::default())
                        .approved
                })
            })
            .collect();
        let approved = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(approved, 10);
        assert_eq!(rm.snapshot().available_credits, Some(0));
    }

    #[test]
    fn test_usage_tracker_records_tool_calls() {
        let rm = Arc::new(ResourceManager::unlimited().unwrap());
        let reservation = rm.reserve_budget("s1", ResourceUsage::default(), &ResourceConstraints::default());
        let tracker = UsageTracker::new(Arc::clone(&rm), &reservation);
        tracker.record_tool_call();
        tracker.record_tool_call();
        assert_eq!(rm.tracked_usage(&reservation.reservation_id).tool_calls, 2);
        assert_eq!(tracker.step_id(), "s1");
    }
}
