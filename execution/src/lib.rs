//! Jackpot table execution layer.
//!
//! Everything here is synchronous and clock-free except the withdrawal saga,
//! which awaits an external [`PayoutGateway`] on a runtime [`Clock`]:
//!
//! - [`Ledger`]: account balances with per-account locking and optimistic
//!   versioned updates.
//! - [`accrual`] and [`Staking`]: time-proportional yield on staked items.
//! - [`draw`]: stake-weighted winner selection.
//! - [`settlement`]: pot split between winner, referrer and house.
//! - [`RoundController`]: the round state machine, the single writer of round
//!   state.
//! - [`Withdrawals`]: debit, transfer, compensate.
//! - [`archive`] and [`store`]: where rounds, accounts and withdrawal requests
//!   are kept.
//!
//! Amounts are integers in the smallest currency unit. No operation creates or
//! destroys money: every debit is matched by a pot entry, a transfer or a
//! compensating credit.
//!
//! [`Clock`]: commonware_runtime::Clock

use std::time::SystemTime;

pub mod accrual;
pub mod archive;
pub mod draw;
mod error;
mod ledger;
pub mod round;
pub mod settlement;
mod staking;
pub mod store;
pub mod withdrawal;

pub use archive::RoundArchive;
pub use error::{LedgerError, WagerError, WithdrawalError};
pub use ledger::Ledger;
pub use round::{RoundConfig, RoundController, WagerReceipt};
pub use settlement::{RakePolicy, SettlementConfig};
pub use staking::{Checkpoint, Staking};
pub use store::{AccountStore, MemoryAccounts, MemoryWithdrawals, WithdrawalStore};
pub use withdrawal::{PayoutGateway, TransferReceipt, TransferRequest, WithdrawalConfig, Withdrawals};

/// Milliseconds since the Unix epoch, or zero for times before it.
pub fn system_time_ms(now: SystemTime) -> u64 {
    match now.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as u64,
        Err(_) => 0,
    }
}
