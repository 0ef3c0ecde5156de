//! Account balances.
//!
//! Every account sits behind its own mutex; the directory lock is only held
//! long enough to look an account up (or insert one), so operations on
//! different accounts never wait on each other. A balance is re-read under
//! the account lock at the moment it is mutated, which is what prevents two
//! concurrent debits from spending the same funds.
//!
//! Operations touching two accounts lock them in ascending id order. Every
//! mutation is written through to the [`AccountStore`] while the account lock
//! is still held.

use crate::{
    store::{AccountStore, MemoryAccounts},
    LedgerError,
};
use jackpot_types::{Account, AccountId, HOUSE_ACCOUNT, MAX_DESTINATION_LENGTH};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, RwLock},
};
use tracing::{debug, error, info};

pub struct Ledger {
    accounts: RwLock<BTreeMap<AccountId, Arc<Mutex<Account>>>>,
    deposits: Mutex<HashSet<String>>,
    store: Box<dyn AccountStore>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(entry: &Mutex<Account>) -> MutexGuard<'_, Account> {
    entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn ensure_active(account: &Account) -> Result<(), LedgerError> {
    if account.frozen {
        return Err(LedgerError::AccountFrozen(account.id));
    }
    Ok(())
}

fn debit_locked(account: &mut Account, amount: u64) -> Result<u64, LedgerError> {
    ensure_active(account)?;
    if account.balance < amount {
        return Err(LedgerError::InsufficientFunds {
            account: account.id,
            balance: account.balance,
            requested: amount,
        });
    }
    account.balance -= amount;
    account.version += 1;
    Ok(account.balance)
}

fn credit_locked(account: &mut Account, amount: u64) -> Result<u64, LedgerError> {
    ensure_active(account)?;
    let Some(balance) = account.balance.checked_add(amount) else {
        account.frozen = true;
        account.version += 1;
        error!(
            account = account.id,
            balance = account.balance,
            amount,
            "credit would overflow balance; account frozen"
        );
        return Err(LedgerError::BalanceOverflow(account.id));
    };
    account.balance = balance;
    account.version += 1;
    Ok(balance)
}

impl Ledger {
    /// Create an empty ledger holding only the house account.
    pub fn new() -> Self {
        Self::with_store(MemoryAccounts::default())
    }

    /// Restore accounts and credited deposit references from `store` and
    /// write every later mutation through to it.
    pub fn with_store(store: impl AccountStore) -> Self {
        let mut accounts = BTreeMap::new();
        for account in store.accounts() {
            accounts.insert(account.id, Arc::new(Mutex::new(account)));
        }
        if !accounts.contains_key(&HOUSE_ACCOUNT) {
            let house = Account::new(HOUSE_ACCOUNT, None);
            store.put_account(&house);
            accounts.insert(HOUSE_ACCOUNT, Arc::new(Mutex::new(house)));
        }
        let deposits: HashSet<String> = store.deposits().into_iter().collect();
        debug!(accounts = accounts.len(), deposits = deposits.len(), "ledger loaded");
        Self {
            accounts: RwLock::new(accounts),
            deposits: Mutex::new(deposits),
            store: Box::new(store),
        }
    }

    fn entry(&self, id: AccountId) -> Result<Arc<Mutex<Account>>, LedgerError> {
        let accounts = self
            .accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        accounts
            .get(&id)
            .cloned()
            .ok_or(LedgerError::UnknownAccount(id))
    }

    /// Run `op` under the account lock and persist the account if `op`
    /// changed it, whether or not it succeeded.
    fn update<T>(
        &self,
        id: AccountId,
        op: impl FnOnce(&mut Account) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let entry = self.entry(id)?;
        let mut account = lock(&entry);
        let version = account.version;
        let result = op(&mut account);
        if account.version != version {
            self.store.put_account(&account);
        }
        result
    }

    pub fn contains(&self, id: AccountId) -> bool {
        self.entry(id).is_ok()
    }

    /// Create an account on first authentication, or return the existing one.
    ///
    /// A referrer is only recorded at creation, and only if it already exists
    /// and is neither the account itself nor the house.
    pub fn open_account(&self, id: AccountId, referred_by: Option<AccountId>) -> Account {
        let referred_by = referred_by
            .filter(|referrer| *referrer != id && *referrer != HOUSE_ACCOUNT && self.contains(*referrer));
        let entry = {
            let mut accounts = self
                .accounts
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            accounts
                .entry(id)
                .or_insert_with(|| {
                    debug!(account = id, ?referred_by, "opened account");
                    let account = Account::new(id, referred_by);
                    self.store.put_account(&account);
                    Arc::new(Mutex::new(account))
                })
                .clone()
        };
        let account = lock(&entry).clone();
        account
    }

    pub fn snapshot(&self, id: AccountId) -> Result<Account, LedgerError> {
        let entry = self.entry(id)?;
        let account = lock(&entry).clone();
        Ok(account)
    }

    pub fn balance(&self, id: AccountId) -> Result<u64, LedgerError> {
        let entry = self.entry(id)?;
        let balance = lock(&entry).balance;
        Ok(balance)
    }

    /// Remove `amount` from the account, failing if the balance is short.
    /// Returns the new balance.
    pub fn debit(&self, id: AccountId, amount: u64) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let balance = self.update(id, |account| debit_locked(account, amount))?;
        debug!(account = id, amount, balance, "debited");
        Ok(balance)
    }

    /// Add `amount` to the account. Returns the new balance.
    pub fn credit(&self, id: AccountId, amount: u64) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let balance = self.update(id, |account| credit_locked(account, amount))?;
        debug!(account = id, amount, balance, "credited");
        Ok(balance)
    }

    /// Credit an external deposit exactly once per `external_ref`.
    pub fn credit_deposit(
        &self,
        id: AccountId,
        amount: u64,
        external_ref: &str,
    ) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if external_ref.is_empty() {
            return Err(LedgerError::EmptyReference);
        }
        if !self.contains(id) {
            return Err(LedgerError::UnknownAccount(id));
        }
        {
            let mut deposits = self
                .deposits
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !deposits.insert(external_ref.to_string()) {
                return Err(LedgerError::DuplicateDeposit(external_ref.to_string()));
            }
        }
        let result = self.update(id, |account| {
            let balance = credit_locked(account, amount)?;
            self.store.put_deposit(external_ref);
            Ok(balance)
        });
        if result.is_err() {
            // Release the reference so the deposit can be replayed later.
            self.deposits
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(external_ref);
        }
        let balance = result?;
        debug!(account = id, amount, external_ref, balance, "deposit credited");
        Ok(balance)
    }

    /// Move a referral bonus from the house to `referrer`.
    ///
    /// Both accounts are locked (the house first, as it has the lowest id)
    /// for the duration, so either the whole bonus moves or nothing does.
    /// Returns the referrer's new balance.
    pub fn pay_referral(&self, referrer: AccountId, bonus: u64) -> Result<u64, LedgerError> {
        if bonus == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if referrer == HOUSE_ACCOUNT {
            return Err(LedgerError::SameAccount(referrer));
        }
        let house_entry = self.entry(HOUSE_ACCOUNT)?;
        let referrer_entry = self.entry(referrer)?;
        let mut house = lock(&house_entry);
        let mut account = lock(&referrer_entry);
        let versions = (house.version, account.version);

        let result = match debit_locked(&mut house, bonus) {
            Ok(_) => match credit_locked(&mut account, bonus) {
                Ok(balance) => {
                    account.referral_income = account.referral_income.saturating_add(bonus);
                    Ok(balance)
                }
                Err(err) => {
                    // Undo the debit; the lock was never released.
                    house.balance += bonus;
                    house.version += 1;
                    Err(err)
                }
            },
            Err(err) => Err(err),
        };

        if house.version != versions.0 {
            self.store.put_account(&house);
        }
        if account.version != versions.1 {
            self.store.put_account(&account);
        }
        if let Ok(balance) = result {
            debug!(referrer, bonus, balance, house = house.balance, "referral paid");
        }
        result
    }

    /// Connect the payout destination used by withdrawals.
    pub fn set_wallet(&self, id: AccountId, wallet: &str) -> Result<(), LedgerError> {
        let wallet = wallet.trim();
        if wallet.is_empty() {
            return Err(LedgerError::InvalidWallet("empty".into()));
        }
        if wallet.len() > MAX_DESTINATION_LENGTH {
            return Err(LedgerError::InvalidWallet(format!(
                "longer than {MAX_DESTINATION_LENGTH} bytes"
            )));
        }
        self.update(id, |account| {
            ensure_active(account)?;
            account.wallet = Some(wallet.to_string());
            account.version += 1;
            Ok(())
        })
    }

    /// Stop all balance movement on the account until reconciled.
    pub fn freeze(&self, id: AccountId) -> Result<(), LedgerError> {
        self.update(id, |account| {
            if !account.frozen {
                account.frozen = true;
                account.version += 1;
                error!(account = id, balance = account.balance, "account frozen");
            }
            Ok(())
        })
    }

    /// Lift a freeze once the account has been reconciled.
    pub fn unfreeze(&self, id: AccountId) -> Result<(), LedgerError> {
        self.update(id, |account| {
            if account.frozen {
                account.frozen = false;
                account.version += 1;
                info!(account = id, balance = account.balance, "account unfrozen");
            }
            Ok(())
        })
    }

    /// Number of accounts that name `id` as their referrer.
    pub fn referral_count(&self, id: AccountId) -> usize {
        let accounts = self
            .accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        accounts
            .values()
            .filter(|entry| lock(entry).referred_by == Some(id))
            .count()
    }

    /// Sum of every balance (house included).
    pub fn total_balance(&self) -> u128 {
        let accounts = self
            .accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        accounts
            .values()
            .map(|entry| lock(entry).balance as u128)
            .sum()
    }

    /// Apply `op` to a copy of the account and commit it only if the account
    /// is still at `expected_version`.
    ///
    /// Pairs with [`Ledger::with_retry`] for read-compute-write updates that
    /// should not hold the account lock while computing.
    pub fn apply_versioned<T>(
        &self,
        id: AccountId,
        expected_version: u64,
        op: impl FnOnce(&mut Account) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        self.update(id, |account| {
            ensure_active(account)?;
            if account.version != expected_version {
                return Err(LedgerError::ConcurrencyConflict {
                    account: id,
                    expected: expected_version,
                    found: account.version,
                });
            }
            let mut updated = account.clone();
            let result = op(&mut updated)?;
            updated.version = expected_version + 1;
            *account = updated;
            Ok(result)
        })
    }

    /// Run `op` until it stops failing with a concurrency conflict, at most
    /// `max_attempts` times.
    pub fn with_retry<T>(
        &self,
        max_attempts: usize,
        mut op: impl FnMut(&Self) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        for attempt in 1..=max_attempts {
            match op(self) {
                Err(LedgerError::ConcurrencyConflict {
                    account, found, ..
                }) => {
                    debug!(account, found, attempt, "retrying after conflict");
                }
                other => return other,
            }
        }
        Err(LedgerError::RetriesExhausted {
            attempts: max_attempts,
        })
    }
}
