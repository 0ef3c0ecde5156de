use crate::{accrual, Ledger, LedgerError};
use jackpot_types::{Account, AccountId, StakePosition, MAX_ITEM_ID_LENGTH, MAX_STAKE_POSITIONS};
use tracing::debug;

/// Applies staking yield to account balances.
///
/// Every operation is a read-compute-write against the ledger: the account is
/// snapshotted, yield is computed without holding the account lock, and the
/// result is committed only if the account did not change in the meantime.
#[derive(Clone, Copy, Debug)]
pub struct Staking {
    pub rate_ppm_per_day: u32,
    pub max_attempts: usize,
}

/// Result of bringing an account's staked positions up to date.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub credited: u64,
    pub account: Account,
}

impl Staking {
    pub fn new(rate_ppm_per_day: u32, max_attempts: usize) -> Self {
        Self {
            rate_ppm_per_day,
            max_attempts,
        }
    }

    /// Checkpoint every staked position of `account` into `updated`.
    fn accrue_all(&self, updated: &mut Account, now_ms: u64) -> Result<u64, LedgerError> {
        let mut credited = 0u64;
        for position in updated.positions.iter_mut() {
            let amount = accrual::checkpoint(position, self.rate_ppm_per_day, now_ms)
                .ok_or(LedgerError::BalanceOverflow(updated.id))?;
            credited = credited
                .checked_add(amount)
                .ok_or(LedgerError::BalanceOverflow(updated.id))?;
        }
        updated.balance = updated
            .balance
            .checked_add(credited)
            .ok_or(LedgerError::BalanceOverflow(updated.id))?;
        Ok(credited)
    }

    /// Run `op` on a fresh snapshot after accruing yield up to `now_ms`.
    fn update<T>(
        &self,
        ledger: &Ledger,
        id: AccountId,
        now_ms: u64,
        op: impl Fn(&mut Account) -> Result<T, LedgerError>,
    ) -> Result<(T, Checkpoint), LedgerError> {
        ledger.with_retry(self.max_attempts, |ledger| {
            let snapshot = ledger.snapshot(id)?;
            let mut updated = snapshot.clone();
            let credited = self.accrue_all(&mut updated, now_ms)?;
            let value = op(&mut updated)?;
            ledger.apply_versioned(id, snapshot.version, |account| {
                *account = updated.clone();
                Ok(())
            })?;
            let mut account = updated;
            account.version = snapshot.version + 1;
            if credited > 0 {
                debug!(account = id, credited, "staking yield credited");
            }
            Ok((value, Checkpoint { credited, account }))
        })
    }

    /// Credit yield earned since the last checkpoint. Called whenever a
    /// balance is queried.
    pub fn checkpoint(&self, ledger: &Ledger, id: AccountId, now_ms: u64) -> Result<Checkpoint, LedgerError> {
        let ((), checkpoint) = self.update(ledger, id, now_ms, |_| Ok(()))?;
        Ok(checkpoint)
    }

    /// Add an unstaked item to the inventory.
    pub fn add_position(
        &self,
        ledger: &Ledger,
        id: AccountId,
        item_id: &str,
        principal: u64,
        now_ms: u64,
    ) -> Result<Checkpoint, LedgerError> {
        if item_id.is_empty() || item_id.len() > MAX_ITEM_ID_LENGTH {
            return Err(LedgerError::InvalidPosition(format!(
                "item id must be 1..={MAX_ITEM_ID_LENGTH} bytes"
            )));
        }
        let ((), checkpoint) = self.update(ledger, id, now_ms, |account| {
            if account.position(item_id).is_some() {
                return Err(LedgerError::InvalidPosition(format!(
                    "{item_id} already in inventory"
                )));
            }
            if account.positions.len() >= MAX_STAKE_POSITIONS {
                return Err(LedgerError::InvalidPosition(format!(
                    "inventory holds at most {MAX_STAKE_POSITIONS} items"
                )));
            }
            account
                .positions
                .push(StakePosition::new(item_id.to_string(), principal));
            Ok(())
        })?;
        Ok(checkpoint)
    }

    /// Remove an item, crediting what it earned up to now.
    pub fn remove_position(
        &self,
        ledger: &Ledger,
        id: AccountId,
        item_id: &str,
        now_ms: u64,
    ) -> Result<Checkpoint, LedgerError> {
        let (removed, checkpoint) = self.update(ledger, id, now_ms, |account| {
            let index = account
                .positions
                .iter()
                .position(|p| p.item_id == item_id)
                .ok_or_else(|| LedgerError::UnknownPosition {
                    account: id,
                    item_id: item_id.to_string(),
                })?;
            Ok(account.positions.remove(index))
        })?;
        debug!(account = id, item = %removed.item_id, "position removed");
        Ok(checkpoint)
    }

    /// Toggle whether an item earns yield.
    ///
    /// Unstaking settles the yield earned so far; staking restarts the clock
    /// at `now_ms`.
    pub fn set_staked(
        &self,
        ledger: &Ledger,
        id: AccountId,
        item_id: &str,
        staked: bool,
        now_ms: u64,
    ) -> Result<Checkpoint, LedgerError> {
        let ((), checkpoint) = self.update(ledger, id, now_ms, |account| {
            let position = account
                .position_mut(item_id)
                .ok_or_else(|| LedgerError::UnknownPosition {
                    account: id,
                    item_id: item_id.to_string(),
                })?;
            if position.staked != staked {
                position.staked = staked;
                position.stake_start_ms = now_ms;
            }
            Ok(())
        })?;
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jackpot_types::MS_PER_DAY;

    const DAY: u64 = MS_PER_DAY;

    fn setup() -> (Ledger, Staking) {
        let ledger = Ledger::new();
        ledger.open_account(1, None);
        (ledger, Staking::new(1_000, 3))
    }

    #[test]
    fn test_checkpoint_credits_balance() {
        let (ledger, staking) = setup();
        staking.add_position(&ledger, 1, "gift", 1_000, 0).unwrap();
        staking.set_staked(&ledger, 1, "gift", true, 0).unwrap();

        let checkpoint = staking.checkpoint(&ledger, 1, DAY).unwrap();
        assert_eq!(checkpoint.credited, 1);
        assert_eq!(checkpoint.account.balance, 1);
        let checkpoint = staking.checkpoint(&ledger, 1, 2 * DAY).unwrap();
        assert_eq!(checkpoint.credited, 1);
        assert_eq!(ledger.balance(1).unwrap(), 2);
        assert_eq!(checkpoint.account, ledger.snapshot(1).unwrap());
    }

    #[test]
    fn test_unstaking_stops_accrual() {
        let (ledger, staking) = setup();
        staking.add_position(&ledger, 1, "gift", 1_000, 0).unwrap();
        staking.set_staked(&ledger, 1, "gift", true, 0).unwrap();
        // Unstaking after two days settles them.
        let checkpoint = staking.set_staked(&ledger, 1, "gift", false, 2 * DAY).unwrap();
        assert_eq!(checkpoint.credited, 2);
        // Nothing accrues while unstaked.
        assert_eq!(staking.checkpoint(&ledger, 1, 10 * DAY).unwrap().credited, 0);
        // Restaking restarts the clock at the toggle time.
        staking.set_staked(&ledger, 1, "gift", true, 10 * DAY).unwrap();
        assert_eq!(staking.checkpoint(&ledger, 1, 11 * DAY).unwrap().credited, 1);
        assert_eq!(ledger.balance(1).unwrap(), 3);
    }

    #[test]
    fn test_remove_position_settles_first() {
        let (ledger, staking) = setup();
        staking.add_position(&ledger, 1, "gift", 1_000, 0).unwrap();
        staking.set_staked(&ledger, 1, "gift", true, 0).unwrap();
        let checkpoint = staking.remove_position(&ledger, 1, "gift", 3 * DAY).unwrap();
        assert_eq!(checkpoint.credited, 3);
        assert!(checkpoint.account.positions.is_empty());
        assert!(matches!(
            staking.remove_position(&ledger, 1, "gift", 3 * DAY),
            Err(LedgerError::UnknownPosition { .. })
        ));
    }

    #[test]
    fn test_add_position_rejects_duplicates() {
        let (ledger, staking) = setup();
        staking.add_position(&ledger, 1, "gift", 1_000, 0).unwrap();
        assert!(matches!(
            staking.add_position(&ledger, 1, "gift", 5, 0),
            Err(LedgerError::InvalidPosition(_))
        ));
        assert!(matches!(
            staking.add_position(&ledger, 1, "", 5, 0),
            Err(LedgerError::InvalidPosition(_))
        ));
    }

    #[test]
    fn test_checkpoint_keeps_concurrent_credit() {
        let (ledger, staking) = setup();
        staking.add_position(&ledger, 1, "gift", 1_000, 0).unwrap();
        staking.set_staked(&ledger, 1, "gift", true, 0).unwrap();
        ledger.credit(1, 50).unwrap();
        let checkpoint = staking.checkpoint(&ledger, 1, DAY).unwrap();
        assert_eq!(checkpoint.account.balance, 51);
    }
}
