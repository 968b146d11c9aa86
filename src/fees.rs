use crate::dates::days_between;
use crate::grading::round_off_2_decimals;
use chrono::{Duration, NaiveDate};
use std::str::FromStr;

/// Amounts closer than this to zero count as settled.
const MONEY_EPSILON: f64 = 0.005;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeeError {
    #[error("unknown fine type: {0}")]
    UnknownFineType(String),
    #[error("payment amount must be positive")]
    NonPositivePayment,
    #[error("payment of {amount} exceeds the amount due ({due})")]
    Overpayment { amount: f64, due: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FineType {
    None,
    Flat,
    PerDay,
    Percentage,
}

impl FineType {
    pub fn as_str(self) -> &'static str {
        match self {
            FineType::None => "none",
            FineType::Flat => "flat",
            FineType::PerDay => "per_day",
            FineType::Percentage => "percentage",
        }
    }
}

impl FromStr for FineType {
    type Err = FeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(FineType::None),
            "flat" | "fixed" => Ok(FineType::Flat),
            "per_day" | "perday" | "daily" => Ok(FineType::PerDay),
            "percentage" | "percent" => Ok(FineType::Percentage),
            other => Err(FeeError::UnknownFineType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinePolicy {
    pub fine_type: FineType,
    pub value: f64,
    pub grace_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LateFee {
    pub days_late: i64,
    pub amount: f64,
}

/// Days past the end of the grace period (`due + grace_days`), never negative.
pub fn days_late(due: NaiveDate, grace_days: i64, as_of: NaiveDate) -> i64 {
    let grace_end = due + Duration::days(grace_days.max(0));
    days_between(grace_end, as_of).max(0)
}

/// Late fine owed on the outstanding principal `balance` as of `as_of`.
pub fn late_fee(policy: &FinePolicy, due: NaiveDate, balance: f64, as_of: NaiveDate) -> LateFee {
    let days = days_late(due, policy.grace_days, as_of);
    if days == 0 || balance <= MONEY_EPSILON {
        return LateFee {
            days_late: days,
            amount: 0.0,
        };
    }
    let amount = match policy.fine_type {
        FineType::None => 0.0,
        FineType::Flat => policy.value,
        FineType::PerDay => policy.value * days as f64,
        FineType::Percentage => balance * policy.value / 100.0,
    };
    LateFee {
        days_late: days,
        amount: round_off_2_decimals(amount.max(0.0)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeStatus {
    Paid,
    Partial,
    Unpaid,
    Overdue,
}

impl FeeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FeeStatus::Paid => "paid",
            FeeStatus::Partial => "partial",
            FeeStatus::Unpaid => "unpaid",
            FeeStatus::Overdue => "overdue",
        }
    }
}

pub fn fee_status(balance: f64, principal_paid: f64, days_late: i64) -> FeeStatus {
    if balance <= MONEY_EPSILON {
        FeeStatus::Paid
    } else if days_late > 0 {
        FeeStatus::Overdue
    } else if principal_paid > MONEY_EPSILON {
        FeeStatus::Partial
    } else {
        FeeStatus::Unpaid
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Allocation {
    pub fine_component: f64,
    pub principal_component: f64,
}

/// Splits a payment: the outstanding fine is settled first, the rest goes to
/// principal. Paying more than `fine_due + balance` is rejected.
pub fn allocate_payment(amount: f64, fine_due: f64, balance: f64) -> Result<Allocation, FeeError> {
    if amount <= 0.0 {
        return Err(FeeError::NonPositivePayment);
    }
    let due = round_off_2_decimals(fine_due.max(0.0) + balance.max(0.0));
    if amount > due + MONEY_EPSILON {
        return Err(FeeError::Overpayment { amount, due });
    }
    let fine_component = round_off_2_decimals(amount.min(fine_due.max(0.0)));
    Ok(Allocation {
        fine_component,
        principal_component: round_off_2_decimals(amount - fine_component),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    fn policy(fine_type: FineType, value: f64, grace_days: i64) -> FinePolicy {
        FinePolicy {
            fine_type,
            value,
            grace_days,
        }
    }

    #[test]
    fn no_fine_within_grace_period() {
        let p = policy(FineType::PerDay, 10.0, 5);
        let fee = late_fee(&p, d(2024, 4, 10), 1000.0, d(2024, 4, 15));
        assert_eq!(fee, LateFee { days_late: 0, amount: 0.0 });
    }

    #[test]
    fn per_day_fine_is_value_times_days_late() {
        let p = policy(FineType::PerDay, 10.0, 5);
        let fee = late_fee(&p, d(2024, 4, 10), 1000.0, d(2024, 4, 22));
        assert_eq!(fee.days_late, 7);
        assert_eq!(fee.amount, 70.0);
    }

    #[test]
    fn flat_and_percentage_fines() {
        let due = d(2024, 1, 31);
        let as_of = d(2024, 3, 1);
        let flat = late_fee(&policy(FineType::Flat, 250.0, 0), due, 1200.0, as_of);
        assert_eq!(flat.amount, 250.0);
        let pct = late_fee(&policy(FineType::Percentage, 2.5, 0), due, 1234.0, as_of);
        assert_eq!(pct.amount, 30.85);
    }

    #[test]
    fn settled_balance_accrues_no_fine() {
        let p = policy(FineType::Flat, 100.0, 0);
        let fee = late_fee(&p, d(2024, 1, 1), 0.0, d(2024, 2, 1));
        assert_eq!(fee.amount, 0.0);
        assert_eq!(fee.days_late, 31);
    }

    #[test]
    fn none_fine_type_never_charges() {
        let p = policy(FineType::None, 100.0, 0);
        assert_eq!(late_fee(&p, d(2024, 1, 1), 500.0, d(2024, 6, 1)).amount, 0.0);
    }

    #[test]
    fn fine_type_parsing() {
        assert_eq!("per_day".parse::<FineType>(), Ok(FineType::PerDay));
        assert_eq!("Percentage".parse::<FineType>(), Ok(FineType::Percentage));
        assert_eq!("".parse::<FineType>(), Ok(FineType::None));
        assert!(matches!(
            "weekly".parse::<FineType>(),
            Err(FeeError::UnknownFineType(_))
        ));
    }

    #[test]
    fn payment_settles_fine_first() {
        let a = allocate_payment(150.0, 70.0, 1000.0).expect("allocation");
        assert_eq!(a.fine_component, 70.0);
        assert_eq!(a.principal_component, 80.0);
    }

    #[test]
    fn overpayment_rejected() {
        assert!(matches!(
            allocate_payment(1100.0, 70.0, 1000.0),
            Err(FeeError::Overpayment { .. })
        ));
        assert_eq!(
            allocate_payment(0.0, 0.0, 10.0),
            Err(FeeError::NonPositivePayment)
        );
    }

    #[test]
    fn status_precedence() {
        assert_eq!(fee_status(0.0, 500.0, 10), FeeStatus::Paid);
        assert_eq!(fee_status(100.0, 400.0, 3), FeeStatus::Overdue);
        assert_eq!(fee_status(100.0, 400.0, 0), FeeStatus::Partial);
        assert_eq!(fee_status(500.0, 0.0, 0), FeeStatus::Unpaid);
    }
}
