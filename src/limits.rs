//! Spending limits and their enforcement.

use crate::asset::Amount;
use crate::error::SettlementError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Accumulator period reset by the external scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// Day rollover: resets daily spend.
    Daily,
    /// Week rollover: resets weekly spend.
    Weekly,
}

/// Caps and running totals of one driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverLimits {
    /// Largest single redemption.
    pub per_transaction_limit: Amount,
    /// Cap on spend within the current day.
    pub daily_limit: Amount,
    /// Cap on spend within the current week.
    pub weekly_limit: Amount,
    /// Spend so far today.
    pub daily_spent: Amount,
    /// Spend so far this week.
    pub weekly_spent: Amount,
}

impl DriverLimits {
    /// Fresh limits with nothing spent.
    pub fn new(per_transaction_limit: Amount, daily_limit: Amount, weekly_limit: Amount) -> Self {
        Self {
            per_transaction_limit,
            daily_limit,
            weekly_limit,
            daily_spent: Amount::ZERO,
            weekly_spent: Amount::ZERO,
        }
    }

    /// Limits whose weekly cap is seven days of the daily cap.
    pub fn from_daily(per_transaction_limit: Amount, daily_limit: Amount) -> Self {
        let weekly = Amount::from_base_units(daily_limit.base_units().saturating_mul(7));
        Self::new(per_transaction_limit, daily_limit, weekly)
    }

    /// Adds `amount` to both accumulators.
    pub fn record_spend(&mut self, amount: Amount) -> Result<(), SettlementError> {
        let overflow = || SettlementError::InvalidAmount("spend accumulator overflow".into());
        let daily = self.daily_spent.checked_add(amount).ok_or_else(overflow)?;
        let weekly = self.weekly_spent.checked_add(amount).ok_or_else(overflow)?;
        self.daily_spent = daily;
        self.weekly_spent = weekly;
        Ok(())
    }

    /// Zeroes the accumulators of `period`. A weekly reset also clears the day.
    pub fn reset(&mut self, period: Period) {
        match period {
            Period::Daily => self.daily_spent = Amount::ZERO,
            Period::Weekly => {
                self.daily_spent = Amount::ZERO;
                self.weekly_spent = Amount::ZERO;
            }
        }
    }

    /// Amount still spendable today.
    pub fn daily_remaining(&self) -> Amount {
        self.daily_limit.saturating_sub(self.daily_spent).max(Amount::ZERO)
    }

    /// Amount still spendable this week.
    pub fn weekly_remaining(&self) -> Amount {
        self.weekly_limit.saturating_sub(self.weekly_spent).max(Amount::ZERO)
    }
}

/// Fleet allocation pool.
///
/// `remaining` only grows through [`FleetBudget::fund`] and never exceeds
/// `total_funded` or drops below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FleetBudget {
    total_funded: Amount,
    remaining: Amount,
}

impl FleetBudget {
    /// Empty budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total ever funded.
    pub fn total_funded(&self) -> Amount {
        self.total_funded
    }

    /// Unspent balance.
    pub fn remaining(&self) -> Amount {
        self.remaining
    }

    /// Credits a confirmed purchase.
    pub fn fund(&mut self, amount: Amount) -> Result<(), SettlementError> {
        let amount = amount.require_positive()?;
        let overflow = || SettlementError::InvalidAmount("fleet budget overflow".into());
        let total = self.total_funded.checked_add(amount).ok_or_else(overflow)?;
        let remaining = self.remaining.checked_add(amount).ok_or_else(overflow)?;
        self.total_funded = total;
        self.remaining = remaining;
        Ok(())
    }

    /// Charges a distribution or redemption.
    pub fn charge(&mut self, amount: Amount) -> Result<(), SettlementError> {
        let amount = amount.require_positive()?;
        if amount > self.remaining {
            return Err(SettlementError::Denied(DenialReason::ExceedsFleetBudget));
        }
        self.remaining = self.remaining.saturating_sub(amount);
        Ok(())
    }
}

/// Why a spend was refused. Variants are listed in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DenialReason {
    /// Above the single-redemption cap.
    ExceedsPerTransactionLimit,
    /// Would push today's spend above the daily cap.
    ExceedsDailyLimit,
    /// Would push this week's spend above the weekly cap.
    ExceedsWeeklyLimit,
    /// More than the fleet has left.
    ExceedsFleetBudget,
    /// More than the driver's wallet holds.
    InsufficientChainBalance,
}

impl DenialReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::ExceedsPerTransactionLimit => "EXCEEDS_PER_TRANSACTION_LIMIT",
            DenialReason::ExceedsDailyLimit => "EXCEEDS_DAILY_LIMIT",
            DenialReason::ExceedsWeeklyLimit => "EXCEEDS_WEEKLY_LIMIT",
            DenialReason::ExceedsFleetBudget => "EXCEEDS_FLEET_BUDGET",
            DenialReason::InsufficientChainBalance => "INSUFFICIENT_CHAIN_BALANCE",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DenialReason::ExceedsPerTransactionLimit => "amount exceeds the per-transaction limit",
            DenialReason::ExceedsDailyLimit => "amount exceeds the remaining daily limit",
            DenialReason::ExceedsWeeklyLimit => "amount exceeds the remaining weekly limit",
            DenialReason::ExceedsFleetBudget => "amount exceeds the remaining fleet budget",
            DenialReason::InsufficientChainBalance => "wallet balance is too low",
        };
        f.write_str(text)
    }
}

/// Verdict of [`LimitEnforcer::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Every check passed.
    Approved,
    /// The first violated check, in evaluation order.
    Denied(DenialReason),
}

impl Decision {
    /// `Ok` when approved, `Denied` otherwise.
    pub fn into_result(self) -> Result<(), SettlementError> {
        match self {
            Decision::Approved => Ok(()),
            Decision::Denied(reason) => Err(SettlementError::Denied(reason)),
        }
    }
}

/// State the enforcer judges a spend against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendSnapshot {
    /// Driver caps and totals.
    pub limits: DriverLimits,
    /// Fleet pool, when the driver is funded by a fleet.
    pub fleet: Option<FleetBudget>,
    /// Driver wallet balance observed on the ledger.
    pub chain_balance: Amount,
}

/// Pure spend-limit evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitEnforcer;

impl LimitEnforcer {
    /// Approves `amount` or reports the first violated check in the order
    /// per-transaction, daily, weekly, fleet budget, chain balance.
    pub fn evaluate(&self, amount: Amount, snapshot: &SpendSnapshot) -> Decision {
        match self.violations(amount, snapshot).first() {
            Some(reason) => Decision::Denied(*reason),
            None => Decision::Approved,
        }
    }

    /// Every violated check, in evaluation order.
    pub fn violations(&self, amount: Amount, snapshot: &SpendSnapshot) -> Vec<DenialReason> {
        let limits = &snapshot.limits;
        let exceeds = |spent: Amount, cap: Amount| match spent.checked_add(amount) {
            Some(total) => total > cap,
            None => true,
        };
        let checks = [
            (
                amount > limits.per_transaction_limit,
                DenialReason::ExceedsPerTransactionLimit,
            ),
            (
                exceeds(limits.daily_spent, limits.daily_limit),
                DenialReason::ExceedsDailyLimit,
            ),
            (
                exceeds(limits.weekly_spent, limits.weekly_limit),
                DenialReason::ExceedsWeeklyLimit,
            ),
            (
                snapshot.fleet.map_or(false, |fleet| amount > fleet.remaining()),
                DenialReason::ExceedsFleetBudget,
            ),
            (
                amount > snapshot.chain_balance,
                DenialReason::InsufficientChainBalance,
            ),
        ];
        checks
            .into_iter()
            .filter_map(|(violated, reason)| violated.then_some(reason))
            .collect()
    }

    /// Largest amount [`LimitEnforcer::evaluate`] would approve right now.
    pub fn remaining(&self, snapshot: &SpendSnapshot) -> Amount {
        let limits = &snapshot.limits;
        let mut allowance = limits
            .per_transaction_limit
            .min(limits.daily_remaining())
            .min(limits.weekly_remaining())
            .min(snapshot.chain_balance);
        if let Some(fleet) = snapshot.fleet {
            allowance = allowance.min(fleet.remaining());
        }
        allowance.max(Amount::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn units(n: i64) -> Amount {
        Amount::from_units(n)
    }

    fn snapshot(per_tx: i64, daily: i64, daily_spent: i64, fleet: Option<i64>, chain: i64) -> SpendSnapshot {
        let mut limits = DriverLimits::from_daily(units(per_tx), units(daily));
        limits.daily_spent = units(daily_spent);
        limits.weekly_spent = units(daily_spent);
        SpendSnapshot {
            limits,
            fleet: fleet.map(|remaining| {
                let mut budget = FleetBudget::new();
                if remaining > 0 {
                    budget.fund(units(remaining)).unwrap();
                }
                budget
            }),
            chain_balance: units(chain),
        }
    }

    #[test]
    fn daily_cap_is_reported_after_per_transaction_passes() {
        let snap = snapshot(1_000, 5_000, 4_800, Some(10_000), 10_000);
        assert_eq!(
            LimitEnforcer.evaluate(units(300), &snap),
            Decision::Denied(DenialReason::ExceedsDailyLimit)
        );
    }

    #[test]
    fn first_violation_wins() {
        let snap = snapshot(100, 150, 100, Some(50), 10);
        assert_eq!(
            LimitEnforcer.violations(units(120), &snap),
            vec![
                DenialReason::ExceedsPerTransactionLimit,
                DenialReason::ExceedsDailyLimit,
                DenialReason::ExceedsFleetBudget,
                DenialReason::InsufficientChainBalance,
            ]
        );
        assert_eq!(
            LimitEnforcer.evaluate(units(120), &snap),
            Decision::Denied(DenialReason::ExceedsPerTransactionLimit)
        );
    }

    #[test]
    fn exact_limits_are_allowed() {
        let snap = snapshot(200, 1_000, 800, Some(200), 200);
        assert_eq!(LimitEnforcer.evaluate(units(200), &snap), Decision::Approved);
    }

    #[test]
    fn drivers_without_a_fleet_skip_the_budget_check() {
        let snap = snapshot(1_000, 5_000, 0, None, 500);
        assert_eq!(LimitEnforcer.evaluate(units(400), &snap), Decision::Approved);
    }

    #[test]
    fn weekly_limit_catches_spend_across_days() {
        let mut snap = snapshot(1_000, 1_000, 0, None, 10_000);
        snap.limits.weekly_spent = units(6_900);
        assert_eq!(
            LimitEnforcer.evaluate(units(200), &snap),
            Decision::Denied(DenialReason::ExceedsWeeklyLimit)
        );
    }

    #[test]
    fn fleet_budget_invariant_holds() {
        let mut budget = FleetBudget::new();
        budget.fund(units(100)).unwrap();
        budget.charge(units(60)).unwrap();
        assert_eq!(
            budget.charge(units(41)).unwrap_err(),
            SettlementError::Denied(DenialReason::ExceedsFleetBudget)
        );
        assert_eq!(budget.remaining(), units(40));
        assert!(budget.fund(units(-5)).is_err());
        assert!(budget.remaining() <= budget.total_funded());
    }

    #[test]
    fn resets_clear_the_right_accumulators() {
        let mut limits = DriverLimits::from_daily(units(10), units(100));
        limits.record_spend(units(30)).unwrap();
        limits.reset(Period::Daily);
        assert_eq!(limits.daily_spent, Amount::ZERO);
        assert_eq!(limits.weekly_spent, units(30));
        limits.reset(Period::Weekly);
        assert_eq!(limits.weekly_spent, Amount::ZERO);
    }

    #[test]
    fn remaining_allowance_is_the_tightest_cap() {
        let snap = snapshot(1_000, 500, 420, Some(900), 2_000);
        assert_eq!(LimitEnforcer.remaining(&snap), units(80));
        let snap = snapshot(1_000, 500, 0, Some(30), 2_000);
        assert_eq!(LimitEnforcer.remaining(&snap), units(30));
        let snap = snapshot(1_000, 500, 600, None, 2_000);
        assert_eq!(LimitEnforcer.remaining(&snap), Amount::ZERO);
    }

    proptest! {
        #[test]
        fn remaining_allowance_is_exactly_approvable(
            per_tx in 1i64..2_000,
            daily in 1i64..5_000,
            spent in 0i64..5_000,
            fleet in proptest::option::of(0i64..5_000),
            chain in 0i64..5_000,
        ) {
            let snap = snapshot(per_tx, daily, spent, fleet, chain);
            let allowance = LimitEnforcer.remaining(&snap);
            if allowance.is_positive() {
                prop_assert_eq!(LimitEnforcer.evaluate(allowance, &snap), Decision::Approved);
            }
            let above = allowance.checked_add(Amount::from_base_units(1)).unwrap();
            prop_assert_ne!(LimitEnforcer.evaluate(above, &snap), Decision::Approved);
        }

        #[test]
        fn reported_reason_is_the_first_violation(
            per_tx in 1i64..2_000,
            daily in 1i64..5_000,
            spent in 0i64..5_000,
            fleet in proptest::option::of(0i64..5_000),
            chain in 0i64..5_000,
            amount in 1i64..3_000,
        ) {
            let snap = snapshot(per_tx, daily, spent, fleet, chain);
            let amount = units(amount);
            let all = LimitEnforcer.violations(amount, &snap);
            match LimitEnforcer.evaluate(amount, &snap) {
                Decision::Approved => prop_assert!(all.is_empty()),
                Decision::Denied(reason) => prop_assert_eq!(Some(&reason), all.first()),
            }
            let mut sorted = all.clone();
            sorted.sort_by_key(|r| *r as u8);
            prop_assert_eq!(sorted, all);
        }
    }
}
