//! Time-based yield on staked positions.
//!
//! Yield is `principal * rate * elapsed_days`, with the rate in parts per
//! million per day. Integer division would drop a fraction of a unit at every
//! checkpoint, so the remainder is carried into the next computation instead;
//! that makes accrual exactly additive no matter how often a position is
//! checkpointed.

use jackpot_types::{StakePosition, MS_PER_DAY, PPM_DENOMINATOR};

const DENOMINATOR: u128 = PPM_DENOMINATOR as u128 * MS_PER_DAY as u128;

/// Result of one accrual computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Accrual {
    /// Whole units earned.
    pub amount: u64,
    /// Remainder to pass into the next computation.
    pub carry: u64,
}

/// Yield earned by `principal` over `elapsed_ms` at `rate_ppm_per_day`,
/// including the `carry` left by the previous checkpoint.
///
/// Returns `None` if the result does not fit in a `u64`.
pub fn accrue(principal: u64, rate_ppm_per_day: u32, elapsed_ms: u64, carry: u64) -> Option<Accrual> {
    let numerator = (principal as u128)
        .checked_mul(rate_ppm_per_day as u128)?
        .checked_mul(elapsed_ms as u128)?
        .checked_add(carry as u128)?;
    let amount = u64::try_from(numerator / DENOMINATOR).ok()?;
    // The remainder is below DENOMINATOR, which fits in a u64.
    let carry = (numerator % DENOMINATOR) as u64;
    Some(Accrual { amount, carry })
}

/// Bring a position up to `now_ms`: compute what it earned since its last
/// checkpoint and move the checkpoint forward.
///
/// Unstaked positions earn nothing. A clock that moved backwards counts as
/// zero elapsed time. Returns the amount to credit, or `None` on overflow (in
/// which case the position is left untouched).
pub fn checkpoint(position: &mut StakePosition, rate_ppm_per_day: u32, now_ms: u64) -> Option<u64> {
    if !position.staked {
        return Some(0);
    }
    let elapsed_ms = now_ms.saturating_sub(position.stake_start_ms);
    let accrual = accrue(position.principal, rate_ppm_per_day, elapsed_ms, position.carry)?;
    let accrued_yield = position.accrued_yield.checked_add(accrual.amount)?;
    position.accrued_yield = accrued_yield;
    position.carry = accrual.carry;
    position.stake_start_ms = position.stake_start_ms.max(now_ms);
    Some(accrual.amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DAY: u64 = MS_PER_DAY;
    // 0.001 per day
    const RATE: u32 = 1_000;

    #[test]
    fn test_zero_elapsed_earns_nothing() {
        assert_eq!(accrue(1_000, RATE, 0, 0), Some(Accrual { amount: 0, carry: 0 }));
        assert_eq!(accrue(0, RATE, DAY, 0).unwrap().amount, 0);
    }

    #[test]
    fn test_two_days_equals_two_single_days() {
        let whole = accrue(1_000, RATE, 2 * DAY, 0).unwrap();
        assert_eq!(whole.amount, 2);

        let first = accrue(1_000, RATE, DAY, 0).unwrap();
        let second = accrue(1_000, RATE, DAY, first.carry).unwrap();
        assert_eq!(first.amount + second.amount, whole.amount);
        assert_eq!(second.carry, whole.carry);
    }

    #[test]
    fn test_fractions_are_carried() {
        // 1000 * 0.001 per day earns one unit per day; a third of a day is
        // not enough on its own.
        let a = accrue(1_000, RATE, DAY / 3, 0).unwrap();
        assert_eq!(a.amount, 0);
        let b = accrue(1_000, RATE, DAY / 3, a.carry).unwrap();
        let c = accrue(1_000, RATE, DAY - 2 * (DAY / 3), b.carry).unwrap();
        assert_eq!(a.amount + b.amount + c.amount, 1);
        assert_eq!(c.carry, 0);
    }

    #[test]
    fn test_overflow_is_reported() {
        assert_eq!(accrue(u64::MAX, u32::MAX, u64::MAX, 0), None);
    }

    #[test]
    fn test_checkpoint_moves_start_forward() {
        let mut position = StakePosition::new("gift".into(), 1_000);
        position.staked = true;
        position.stake_start_ms = 10;
        assert_eq!(checkpoint(&mut position, RATE, 10 + DAY), Some(1));
        assert_eq!(position.stake_start_ms, 10 + DAY);
        assert_eq!(position.accrued_yield, 1);
        // Immediately checkpointing again earns nothing.
        assert_eq!(checkpoint(&mut position, RATE, 10 + DAY), Some(0));
    }

    #[test]
    fn test_checkpoint_ignores_unstaked_and_backwards_clock() {
        let mut position = StakePosition::new("gift".into(), 1_000);
        position.stake_start_ms = 0;
        assert_eq!(checkpoint(&mut position, RATE, 5 * DAY), Some(0));

        position.staked = true;
        position.stake_start_ms = 5 * DAY;
        assert_eq!(checkpoint(&mut position, RATE, DAY), Some(0));
        assert_eq!(position.stake_start_ms, 5 * DAY);
    }

    proptest! {
        #[test]
        fn accrual_is_additive(
            principal in 0u64..1_000_000_000_000,
            rate in 0u32..100_000,
            a in 0u64..(30 * MS_PER_DAY),
            b in 0u64..(30 * MS_PER_DAY),
        ) {
            let whole = accrue(principal, rate, a + b, 0).unwrap();
            let first = accrue(principal, rate, a, 0).unwrap();
            let second = accrue(principal, rate, b, first.carry).unwrap();
            prop_assert_eq!(first.amount + second.amount, whole.amount);
            prop_assert_eq!(second.carry, whole.carry);
        }
    }
}
