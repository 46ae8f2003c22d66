//! Daily quota accounting
//!
//! Usage is kept against the start of the cycle it was spent in. A stored
//! cycle start that differs from the current one means the cycle rolled over
//! and the usage counts as zero; the record itself is only rewritten on the
//! next spend.

use chrono::{DateTime, Local};
use gatehouse_api::{QuotaStatus, QuotaUsage, StartDenied};
use gatehouse_config::QuotaPolicy;
use gatehouse_util::{cycle_start, resolve_local};
use tracing::{debug, info};

use crate::{CoreEngine, CoreError, CoreResult};

/// Units used in the cycle containing `now`
pub(crate) fn units_used_in_cycle(
    usage: Option<&QuotaUsage>,
    current_cycle: DateTime<Local>,
) -> u32 {
    match usage {
        Some(usage) if usage.cycle_start == current_cycle => usage.units_used,
        _ => 0,
    }
}

fn next_reset(cycle: DateTime<Local>, policy: &QuotaPolicy) -> DateTime<Local> {
    match cycle.date_naive().succ_opt() {
        Some(tomorrow) => resolve_local(&Local, tomorrow.and_time(policy.reset_time.to_naive_time())),
        None => cycle + chrono::Duration::days(1),
    }
}

impl CoreEngine {
    /// Quota units left in the cycle containing `now`
    pub fn quota_remaining(&self, now: DateTime<Local>) -> CoreResult<u32> {
        Ok(self.quota_status(now)?.remaining)
    }

    pub fn quota_status(&self, now: DateTime<Local>) -> CoreResult<QuotaStatus> {
        let policy = self.policy().quota;
        let cycle = cycle_start(&now, policy.reset_time);
        let snapshot = self.store.read_quota()?;
        let used = units_used_in_cycle(snapshot.usage.as_ref(), cycle);

        Ok(QuotaStatus {
            limit: policy.daily_unlimited,
            used,
            remaining: policy.daily_unlimited.saturating_sub(used),
            cycle_start: cycle,
            next_reset: next_reset(cycle, &policy),
        })
    }

    /// Spend one unit. Returns the usage after spending, or `NoQuota`.
    pub fn spend_unit(&self, now: DateTime<Local>) -> CoreResult<Result<QuotaStatus, StartDenied>> {
        let policy = self.policy().quota;
        let cycle = cycle_start(&now, policy.reset_time);

        for attempt in 1..=crate::engine::MAX_CAS_ATTEMPTS {
            let snapshot = self.store.read_quota()?;
            let used = units_used_in_cycle(snapshot.usage.as_ref(), cycle);

            if used >= policy.daily_unlimited {
                debug!(used, limit = policy.daily_unlimited, "Quota exhausted");
                return Ok(Err(StartDenied::NoQuota));
            }

            let next = QuotaUsage {
                cycle_start: cycle,
                units_used: used + 1,
            };
            if self.store.write_quota_if_unchanged(&snapshot, next)?.is_committed() {
                info!(
                    units_used = next.units_used,
                    limit = policy.daily_unlimited,
                    cycle_start = %cycle,
                    "Quota unit spent"
                );
                return Ok(Ok(QuotaStatus {
                    limit: policy.daily_unlimited,
                    used: next.units_used,
                    remaining: policy.daily_unlimited - next.units_used,
                    cycle_start: cycle,
                    next_reset: next_reset(cycle, &policy),
                }));
            }
            debug!(attempt, "Quota write conflict, retrying");
        }

        Err(CoreError::QuotaContention {
            attempts: crate::engine::MAX_CAS_ATTEMPTS,
        })
    }
}
