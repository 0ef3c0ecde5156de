//! Storage for accounts and withdrawal requests.
//!
//! The ledger and the withdrawal saga keep a working copy in memory and write
//! every mutation through to one of these collaborators. The in-memory stores
//! encode records as they would be on disk and are cheap to clone, so a
//! restarted ledger can be rebuilt from the same handle.

use commonware_codec::{DecodeExt, Encode};
use jackpot_types::{Account, AccountId, WithdrawalRequest};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::warn;

/// Durable home of account state and credited deposit references.
pub trait AccountStore: Send + Sync + 'static {
    fn put_account(&self, account: &Account);
    fn accounts(&self) -> Vec<Account>;
    fn put_deposit(&self, external_ref: &str);
    fn deposits(&self) -> Vec<String>;
}

/// Durable home of withdrawal requests.
pub trait WithdrawalStore: Send + Sync + 'static {
    fn put(&self, request: &WithdrawalRequest);
    fn remove(&self, id: u64);
    fn get(&self, id: u64) -> Option<WithdrawalRequest>;
    /// Requests of an account, oldest first.
    fn for_account(&self, account: AccountId) -> Vec<WithdrawalRequest>;
    fn last_id(&self) -> Option<u64>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct AccountTables {
    accounts: BTreeMap<AccountId, Vec<u8>>,
    deposits: BTreeSet<String>,
}

/// Keeps every account in memory.
#[derive(Clone, Default)]
pub struct MemoryAccounts {
    inner: Arc<Mutex<AccountTables>>,
}

impl AccountStore for MemoryAccounts {
    fn put_account(&self, account: &Account) {
        lock(&self.inner)
            .accounts
            .insert(account.id, account.encode().to_vec());
    }

    fn accounts(&self) -> Vec<Account> {
        lock(&self.inner)
            .accounts
            .iter()
            .filter_map(|(id, bytes)| match Account::decode(bytes.as_slice()) {
                Ok(account) => Some(account),
                Err(err) => {
                    warn!(account = id, ?err, "stored account failed to decode");
                    None
                }
            })
            .collect()
    }

    fn put_deposit(&self, external_ref: &str) {
        lock(&self.inner).deposits.insert(external_ref.to_string());
    }

    fn deposits(&self) -> Vec<String> {
        lock(&self.inner).deposits.iter().cloned().collect()
    }
}

struct WithdrawalTable {
    requests: BTreeMap<u64, (AccountId, bool, Vec<u8>)>,
    last_id: Option<u64>,
    capacity: usize,
}

/// Keeps withdrawal requests in memory.
///
/// Once more than `capacity` requests are held, the oldest finished ones are
/// evicted. A request still in flight is never evicted.
#[derive(Clone)]
pub struct MemoryWithdrawals {
    inner: Arc<Mutex<WithdrawalTable>>,
}

impl MemoryWithdrawals {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WithdrawalTable {
                requests: BTreeMap::new(),
                last_id: None,
                capacity: capacity.max(1),
            })),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn decode(id: u64, bytes: &[u8]) -> Option<WithdrawalRequest> {
        match WithdrawalRequest::decode(bytes) {
            Ok(request) => Some(request),
            Err(err) => {
                warn!(id, ?err, "stored withdrawal failed to decode");
                None
            }
        }
    }
}

impl WithdrawalStore for MemoryWithdrawals {
    fn put(&self, request: &WithdrawalRequest) {
        let mut table = lock(&self.inner);
        table.requests.insert(
            request.id,
            (
                request.account,
                request.status.is_terminal(),
                request.encode().to_vec(),
            ),
        );
        table.last_id = table.last_id.max(Some(request.id));

        let excess = table.requests.len().saturating_sub(table.capacity);
        if excess > 0 {
            let evicted: Vec<u64> = table
                .requests
                .iter()
                .filter(|(_, (_, terminal, _))| *terminal)
                .map(|(id, _)| *id)
                .take(excess)
                .collect();
            for id in evicted {
                table.requests.remove(&id);
            }
        }
    }

    fn remove(&self, id: u64) {
        lock(&self.inner).requests.remove(&id);
    }

    fn get(&self, id: u64) -> Option<WithdrawalRequest> {
        lock(&self.inner)
            .requests
            .get(&id)
            .and_then(|(_, _, bytes)| Self::decode(id, bytes))
    }

    fn for_account(&self, account: AccountId) -> Vec<WithdrawalRequest> {
        lock(&self.inner)
            .requests
            .iter()
            .filter(|(_, (owner, _, _))| *owner == account)
            .filter_map(|(id, (_, _, bytes))| Self::decode(*id, bytes))
            .collect()
    }

    fn last_id(&self) -> Option<u64> {
        lock(&self.inner).last_id
    }
}
