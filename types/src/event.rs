use serde::{Deserialize, Serialize};

use crate::{AccountId, Round, TapeEntry, WithdrawalRequest, WithdrawalStatus};

/// Notifications pushed to connected clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Event {
    /// Full round snapshot, sent on every status change and on connect.
    RoundSync { round: Option<Round> },
    CountdownTick {
        round_id: u64,
        seconds_remaining: u64,
    },
    /// Everything a client needs to animate the draw.
    DrawStarted {
        round_id: u64,
        pot: u64,
        participants: Vec<TapeEntry>,
        winner: AccountId,
        draw_value: u64,
    },
    RoundSettled {
        round_id: u64,
        winner: AccountId,
        payout: u64,
        rake: u64,
    },
    RoundCancelled {
        round_id: u64,
        reason: String,
    },
    BalanceChanged {
        account: AccountId,
        balance: u64,
    },
    ReferralCredited {
        round_id: u64,
        referrer: AccountId,
        amount: u64,
    },
    WithdrawalUpdated {
        id: u64,
        account: AccountId,
        status: WithdrawalStatus,
        amount: u64,
        net_amount: u64,
        failure: Option<String>,
    },
    /// A money invariant failed and the named scope was frozen.
    InvariantViolated { scope: String, detail: String },
}

impl Event {
    pub fn withdrawal(request: &WithdrawalRequest) -> Self {
        Event::WithdrawalUpdated {
            id: request.id,
            account: request.account,
            status: request.status,
            amount: request.amount,
            net_amount: request.net_amount(),
            failure: request.failure.clone(),
        }
    }

    /// Account the event is addressed to, if it is private.
    pub fn recipient(&self) -> Option<AccountId> {
        match self {
            Event::BalanceChanged { account, .. } => Some(*account),
            Event::WithdrawalUpdated { account, .. } => Some(*account),
            Event::ReferralCredited { referrer, .. } => Some(*referrer),
            _ => None,
        }
    }
}
