//! The table actor: single owner of the round state machine.

use jackpot_execution::{PayoutGateway, RoundConfig, Staking, WithdrawalConfig};
use std::time::Duration;

mod actor;
pub use actor::Actor;
mod ingress;
pub use ingress::{AccountView, Closed, Mailbox, Message, PositionChange, TableView};


/// Configuration for the table.
pub struct Config<G: PayoutGateway> {
    pub round: RoundConfig,

    /// Number of settled rounds kept for history queries.
    pub history_limit: usize,

    pub staking: Staking,

    pub withdrawal: WithdrawalConfig,

    /// Number of withdrawal requests kept once they finish.
    pub withdrawal_history_limit: usize,

    /// Where withdrawals are sent.
    pub gateway: G,

    /// Number of requests to hold in the mailbox before blocking.
    pub mailbox_size: usize,

    /// Capacity of the event channel. Slow subscribers lag past this.
    pub event_buffer: usize,

    /// How often deadlines are checked and countdown ticks are sent.
    pub tick_interval: Duration,

    /// Initial and maximum delay between retries of owed credits (refunds,
    /// rake, withdrawal fees and referral bonuses).
    pub referral_retry: Duration,
    pub referral_retry_max: Duration,
}
