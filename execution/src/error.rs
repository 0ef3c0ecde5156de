use jackpot_types::{AccountId, RoundStatus};
use thiserror::Error;

/// Failures of balance and inventory mutations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown account {0}")]
    UnknownAccount(AccountId),
    #[error("account {0} is frozen")]
    AccountFrozen(AccountId),
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("insufficient funds on account {account} (balance={balance}, requested={requested})")]
    InsufficientFunds {
        account: AccountId,
        balance: u64,
        requested: u64,
    },
    #[error("account {account} changed concurrently (expected version {expected}, found {found})")]
    ConcurrencyConflict {
        account: AccountId,
        expected: u64,
        found: u64,
    },
    #[error("gave up after {attempts} conflicting attempts")]
    RetriesExhausted { attempts: usize },
    #[error("deposit {0} already credited")]
    DuplicateDeposit(String),
    #[error("deposit reference must not be empty")]
    EmptyReference,
    #[error("unknown stake position {item_id} on account {account}")]
    UnknownPosition { account: AccountId, item_id: String },
    #[error("invalid stake position: {0}")]
    InvalidPosition(String),
    #[error("invalid wallet: {0}")]
    InvalidWallet(String),
    #[error("balance overflow on account {0}")]
    BalanceOverflow(AccountId),
    #[error("account {0} cannot pay itself")]
    SameAccount(AccountId),
}

impl LedgerError {
    /// Errors that leave the account frozen for reconciliation.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, LedgerError::BalanceOverflow(_))
    }
}

/// Failures of the wager path.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WagerError {
    #[error("invalid wager: {0}")]
    Validation(String),
    #[error("insufficient funds (balance={balance}, requested={requested})")]
    InsufficientFunds { balance: u64, requested: u64 },
    #[error("round is {status:?} and not accepting wagers")]
    RoundNotAcceptingWagers { status: RoundStatus },
    #[error("no active round")]
    NoActiveRound,
    #[error("table is full ({max} participants)")]
    TableFull { max: usize },
    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<LedgerError> for WagerError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                balance, requested, ..
            } => WagerError::InsufficientFunds { balance, requested },
            LedgerError::ZeroAmount => WagerError::Validation("amount must be positive".into()),
            other => WagerError::Ledger(other),
        }
    }
}

/// Failures of the withdrawal saga.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WithdrawalError {
    #[error("invalid withdrawal: {0}")]
    Validation(String),
    #[error("withdrawal below minimum (min={min}, requested={requested})")]
    BelowMinimum { min: u64, requested: u64 },
    #[error("no payout destination connected")]
    MissingDestination,
    #[error("insufficient funds (balance={balance}, requested={requested})")]
    InsufficientFunds { balance: u64, requested: u64 },
    #[error("account {0} already has a withdrawal in flight")]
    InFlight(AccountId),
    /// The transfer failed and the debit was compensated.
    #[error("transfer for withdrawal {id} failed: {reason}")]
    ExternalTransferFailure { id: u64, reason: String },
    /// The compensating credit could not be applied; the account is frozen.
    #[error("withdrawal {id} could not be compensated: {reason}")]
    CompensationFailed { id: u64, reason: String },
    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<LedgerError> for WithdrawalError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                balance, requested, ..
            } => WithdrawalError::InsufficientFunds { balance, requested },
            LedgerError::ZeroAmount => {
                WithdrawalError::Validation("amount must be positive".into())
            }
            other => WithdrawalError::Ledger(other),
        }
    }
}
