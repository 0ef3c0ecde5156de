//! Withdrawal saga.
//!
//! A withdrawal debits the ledger before the external transfer is attempted,
//! so the balance can never be spent twice while a transfer is pending. If
//! the transfer fails or times out, exactly one compensating credit restores
//! the full amount. Each account has at most one withdrawal in flight.
//!
//! Every status change is written to a [`WithdrawalStore`].

use crate::{
    store::{MemoryWithdrawals, WithdrawalStore},
    system_time_ms, Ledger, LedgerError, WithdrawalError,
};
use commonware_cryptography::{sha256::Sha256, Hasher};
use commonware_macros::select;
use commonware_runtime::Clock;
use futures::channel::mpsc;
use jackpot_types::{
    AccountId, Event, WithdrawalRequest, WithdrawalStatus, BPS_DENOMINATOR, HOUSE_ACCOUNT,
    MAX_DESTINATION_LENGTH,
};
use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Transfer handed to the payout gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub withdrawal: u64,
    pub destination: String,
    /// Amount to send, net of the fee.
    pub amount: u64,
    /// Stable across retries of the same withdrawal.
    pub idempotency_key: String,
}

/// Gateway acknowledgement of a completed transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferReceipt {
    pub reference: String,
}

/// External system that moves funds off the table.
pub trait PayoutGateway: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send funds. Must be safe to repeat with the same idempotency key.
    fn transfer(
        &self,
        request: TransferRequest,
    ) -> impl Future<Output = Result<TransferReceipt, Self::Error>> + Send;
}

#[derive(Clone, Debug)]
pub struct WithdrawalConfig {
    pub min_amount: u64,
    pub fee_bps: u16,
    /// How long to wait on the gateway before compensating.
    pub timeout: Duration,
    /// Prefix hashed into idempotency keys, unique per deployment.
    pub namespace: Vec<u8>,
}

/// Idempotency key of a withdrawal: `hex(sha256(namespace || id))`.
pub fn idempotency_key(namespace: &[u8], id: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace);
    hasher.update(&id.to_be_bytes());
    commonware_utils::hex(hasher.finalize().as_ref())
}

/// Requests kept by [`Withdrawals::new`] before a store is attached.
const DEFAULT_HISTORY: usize = 1_024;

/// Fee of a confirmed withdrawal the house has not received yet.
#[derive(Clone, Copy, Debug)]
struct UnpaidFee {
    withdrawal: u64,
    amount: u64,
}

#[derive(Default)]
struct State {
    next_id: u64,
    in_flight: HashSet<AccountId>,
    unpaid_fees: Vec<UnpaidFee>,
}

/// Releases the account's in-flight slot however the saga exits.
struct InFlight {
    state: Arc<Mutex<State>>,
    account: AccountId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.state).in_flight.remove(&self.account);
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs withdrawals against a ledger and a payout gateway.
#[derive(Clone)]
pub struct Withdrawals<E: Clock, G: PayoutGateway> {
    context: E,
    ledger: Arc<Ledger>,
    gateway: G,
    config: Arc<WithdrawalConfig>,
    state: Arc<Mutex<State>>,
    store: Arc<dyn WithdrawalStore>,
    events: Option<mpsc::UnboundedSender<Event>>,
}

impl<E: Clock + Clone, G: PayoutGateway> Withdrawals<E, G> {
    pub fn new(context: E, ledger: Arc<Ledger>, gateway: G, config: WithdrawalConfig) -> Self {
        Self {
            context,
            ledger,
            gateway,
            config: Arc::new(config),
            state: Arc::new(Mutex::new(State {
                next_id: 1,
                ..Default::default()
            })),
            store: Arc::new(MemoryWithdrawals::new(DEFAULT_HISTORY)),
            events: None,
        }
    }

    /// Keep requests in `store`. Ids continue after the newest stored one.
    pub fn with_store(mut self, store: impl WithdrawalStore) -> Self {
        lock(&self.state).next_id = store.last_id().map_or(1, |id| id + 1);
        self.store = Arc::new(store);
        self
    }

    /// Publish every status change to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn get(&self, id: u64) -> Option<WithdrawalRequest> {
        self.store.get(id)
    }

    /// Withdrawals of an account, oldest first.
    pub fn for_account(&self, account: AccountId) -> Vec<WithdrawalRequest> {
        self.store.for_account(account)
    }

    /// Confirmed withdrawals whose fee the house has not received.
    pub fn unpaid_fees(&self) -> usize {
        lock(&self.state).unpaid_fees.len()
    }

    /// Credit unpaid fees to the house. Returns how many are still unpaid.
    pub fn retry_fees(&self) -> usize {
        let mut state = lock(&self.state);
        state.unpaid_fees.retain(|fee| match self.ledger.credit(HOUSE_ACCOUNT, fee.amount) {
            Ok(balance) => {
                info!(id = fee.withdrawal, fee = fee.amount, balance, "withdrawal fee credited");
                false
            }
            Err(err) => {
                debug!(id = fee.withdrawal, ?err, "withdrawal fee still failing");
                true
            }
        });
        state.unpaid_fees.len()
    }

    pub fn in_flight(&self, account: AccountId) -> bool {
        lock(&self.state).in_flight.contains(&account)
    }

    fn fee(&self, amount: u64) -> u64 {
        ((amount as u128 * self.config.fee_bps as u128) / BPS_DENOMINATOR as u128) as u64
    }

    fn now_ms(&self) -> u64 {
        system_time_ms(self.context.current())
    }

    fn send(&self, event: Event) {
        if let Some(events) = &self.events {
            if events.unbounded_send(event).is_err() {
                debug!("withdrawal event receiver dropped");
            }
        }
    }

    fn publish(&self, request: &WithdrawalRequest) {
        self.store.put(request);
        self.send(Event::withdrawal(request));
    }

    fn advance(&self, request: &mut WithdrawalRequest, next: WithdrawalStatus) {
        // Transitions below follow the saga order, so this only fails on a bug.
        if let Err(err) = request.advance(next, self.now_ms()) {
            error!(id = request.id, %err, "withdrawal transition rejected");
            return;
        }
        self.publish(request);
    }

    /// Withdraw `amount` from `account` to `destination`, or to the account's
    /// wallet when none is given.
    ///
    /// Returns the confirmed request. A failed transfer returns
    /// [`WithdrawalError::ExternalTransferFailure`] after the debit has been
    /// compensated.
    pub async fn withdraw(
        &self,
        account: AccountId,
        amount: u64,
        destination: Option<&str>,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        if amount < self.config.min_amount {
            return Err(WithdrawalError::BelowMinimum {
                min: self.config.min_amount,
                requested: amount,
            });
        }
        let snapshot = self.ledger.snapshot(account)?;
        if snapshot.frozen {
            return Err(LedgerError::AccountFrozen(account).into());
        }
        let destination = destination
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .or(snapshot.wallet)
            .ok_or(WithdrawalError::MissingDestination)?;
        if destination.len() > MAX_DESTINATION_LENGTH {
            return Err(WithdrawalError::Validation(format!(
                "destination longer than {MAX_DESTINATION_LENGTH} bytes"
            )));
        }
        if snapshot.balance < amount {
            return Err(WithdrawalError::InsufficientFunds {
                balance: snapshot.balance,
                requested: amount,
            });
        }

        let now_ms = self.now_ms();
        let (mut request, _slot) = {
            let mut state = lock(&self.state);
            if !state.in_flight.insert(account) {
                return Err(WithdrawalError::InFlight(account));
            }
            let id = state.next_id;
            state.next_id += 1;
            let request = WithdrawalRequest {
                id,
                account,
                amount,
                fee: self.fee(amount),
                destination,
                status: WithdrawalStatus::Requested,
                idempotency_key: idempotency_key(&self.config.namespace, id),
                failure: None,
                requested_at_ms: now_ms,
                updated_at_ms: now_ms,
            };
            let slot = InFlight {
                state: self.state.clone(),
                account,
            };
            (request, slot)
        };
        self.publish(&request);

        if let Err(err) = self.ledger.debit(account, amount) {
            self.store.remove(request.id);
            return Err(err.into());
        }
        self.advance(&mut request, WithdrawalStatus::Debited);
        info!(id = request.id, account, amount, fee = request.fee, "withdrawal debited");

        self.advance(&mut request, WithdrawalStatus::TransferSent);
        let transfer = TransferRequest {
            withdrawal: request.id,
            destination: request.destination.clone(),
            amount: request.net_amount(),
            idempotency_key: request.idempotency_key.clone(),
        };
        let result = select! {
            result = self.gateway.transfer(transfer) => {
                result.map_err(|err| err.to_string())
            },
            _ = self.context.sleep(self.config.timeout) => {
                Err(format!("transfer timed out after {:?}", self.config.timeout))
            },
        };

        match result {
            Ok(receipt) => {
                self.advance(&mut request, WithdrawalStatus::Confirmed);
                if request.fee > 0 {
                    if let Err(err) = self.ledger.credit(HOUSE_ACCOUNT, request.fee) {
                        error!(id = request.id, fee = request.fee, ?err, "withdrawal fee credit failed");
                        self.send(Event::InvariantViolated {
                            scope: format!("withdrawal:{}", request.id),
                            detail: format!("fee of {} to the house failed: {err}", request.fee),
                        });
                        lock(&self.state).unpaid_fees.push(UnpaidFee {
                            withdrawal: request.id,
                            amount: request.fee,
                        });
                    }
                }
                info!(id = request.id, account, reference = %receipt.reference, "withdrawal confirmed");
                Ok(request)
            }
            Err(reason) => {
                warn!(id = request.id, account, %reason, "withdrawal transfer failed");
                request.failure = Some(reason.clone());
                self.advance(&mut request, WithdrawalStatus::TransferFailed);
                self.compensate(&mut request, reason)
            }
        }
    }

    fn compensate(
        &self,
        request: &mut WithdrawalRequest,
        reason: String,
    ) -> Result<WithdrawalRequest, WithdrawalError> {
        match self.ledger.credit(request.account, request.amount) {
            Ok(balance) => {
                self.advance(request, WithdrawalStatus::Compensated);
                info!(id = request.id, account = request.account, balance, "withdrawal compensated");
                Err(WithdrawalError::ExternalTransferFailure {
                    id: request.id,
                    reason,
                })
            }
            Err(err) => {
                error!(id = request.id, account = request.account, amount = request.amount, ?err, "compensation failed");
                if let Err(freeze) = self.ledger.freeze(request.account) {
                    error!(account = request.account, ?freeze, "failed to freeze account");
                }
                self.send(Event::InvariantViolated {
                    scope: format!("withdrawal:{}", request.id),
                    detail: err.to_string(),
                });
                Err(WithdrawalError::CompensationFailed {
                    id: request.id,
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[cfg(any(test, feature = "mocks"))]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    pub struct MockError(pub String);

    /// Scripted result of one transfer.
    #[derive(Clone, Debug)]
    pub enum MockOutcome {
        Succeed,
        Fail(String),
        /// Never completes.
        Hang,
    }

    type Hook = Arc<dyn Fn(&TransferRequest) + Send + Sync>;

    /// Gateway that replays scripted outcomes and records every transfer.
    /// Succeeds once the script runs out.
    #[derive(Clone, Default)]
    pub struct MockGateway {
        outcomes: Arc<Mutex<VecDeque<MockOutcome>>>,
        transfers: Arc<Mutex<Vec<TransferRequest>>>,
        hook: Option<Hook>,
    }

    impl MockGateway {
        pub fn new(outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
            Self {
                outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
                ..Default::default()
            }
        }

        /// Run `hook` as each transfer starts.
        pub fn with_hook(mut self, hook: impl Fn(&TransferRequest) + Send + Sync + 'static) -> Self {
            self.hook = Some(Arc::new(hook));
            self
        }

        pub fn transfers(&self) -> Vec<TransferRequest> {
            self.transfers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }
    }

    impl PayoutGateway for MockGateway {
        type Error = MockError;

        fn transfer(
            &self,
            request: TransferRequest,
        ) -> impl Future<Output = Result<TransferReceipt, Self::Error>> + Send {
            if let Some(hook) = &self.hook {
                hook(&request);
            }
            let outcome = self
                .outcomes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front()
                .unwrap_or(MockOutcome::Succeed);
            let reference = format!("mock-{}", request.withdrawal);
            self.transfers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(request);
            async move {
                match outcome {
                    MockOutcome::Succeed => Ok(TransferReceipt { reference }),
                    MockOutcome::Fail(reason) => Err(MockError(reason)),
                    MockOutcome::Hang => futures::future::pending().await,
                }
            }
        }
    }
}
