//! Default values for optional config fields.

use jackpot_types::{MIN_WITHDRAWAL, NANOTON_PER_TON, WITHDRAWAL_FEE_BPS};

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_WORKER_THREADS: usize = 2;
pub const DEFAULT_MAILBOX_SIZE: usize = 1_024;
pub const DEFAULT_EVENT_BUFFER: usize = 1_024;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 250;

pub const DEFAULT_COUNTDOWN_MS: u64 = 15_000;
pub const DEFAULT_REVEAL_MS: u64 = 5_000;
pub const DEFAULT_COOLDOWN_MS: u64 = 8_000;
pub const DEFAULT_MIN_WAGER: u64 = NANOTON_PER_TON / 10;
pub const DEFAULT_MAX_WAGER: u64 = 10_000 * NANOTON_PER_TON;
pub const DEFAULT_MAX_PARTICIPANTS: usize = 100;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

pub const DEFAULT_RAKE_POLICY: &str = "profit_only";
pub const DEFAULT_RAKE_BPS: u16 = 500;
pub const DEFAULT_REFERRAL_BPS: u16 = 100;

/// 0.1% per day.
pub const DEFAULT_STAKING_RATE_PPM_PER_DAY: u32 = 1_000;
pub const DEFAULT_MAX_UPDATE_ATTEMPTS: usize = 8;

pub const DEFAULT_MIN_WITHDRAWAL: u64 = MIN_WITHDRAWAL;
pub const DEFAULT_WITHDRAWAL_FEE_BPS: u16 = WITHDRAWAL_FEE_BPS;
pub const DEFAULT_WITHDRAWAL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_IDEMPOTENCY_NAMESPACE: &str = "_JACKPOT_WITHDRAWAL";
pub const DEFAULT_WITHDRAWAL_HISTORY_LIMIT: usize = 10_000;

pub const DEFAULT_REFERRAL_RETRY_MS: u64 = 5_000;
pub const DEFAULT_REFERRAL_RETRY_MAX_MS: u64 = 300_000;

pub const DEFAULT_WAGER_RATE_PER_SECOND: u32 = 10;
