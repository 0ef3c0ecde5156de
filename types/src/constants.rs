use crate::AccountId;

/// Minor units per whole TON.
pub const NANOTON_PER_TON: u64 = 1_000_000_000;

/// Denominator for percentages expressed in basis points.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Denominator for accrual rates expressed in parts per million per day.
pub const PPM_DENOMINATOR: u64 = 1_000_000;

/// Milliseconds in one accrual day.
pub const MS_PER_DAY: u64 = 86_400_000;

/// Account that collects rake and withdrawal fees.
pub const HOUSE_ACCOUNT: AccountId = 0;

/// Maximum distinct wagers recorded on a single round.
pub const MAX_ROUND_WAGERS: usize = 512;

/// Maximum staked positions held by one account.
pub const MAX_STAKE_POSITIONS: usize = 256;

/// Maximum length of an inventory item identifier.
pub const MAX_ITEM_ID_LENGTH: usize = 64;

/// Maximum length of a payout destination (wallet address).
pub const MAX_DESTINATION_LENGTH: usize = 128;

/// Maximum length of a recorded failure reason.
pub const MAX_REASON_LENGTH: usize = 256;

/// Length of a hex-encoded idempotency key.
pub const IDEMPOTENCY_KEY_LENGTH: usize = 64;

/// Smallest withdrawal accepted (3 TON).
pub const MIN_WITHDRAWAL: u64 = 3 * NANOTON_PER_TON;

/// Withdrawal fee (1%).
pub const WITHDRAWAL_FEE_BPS: u16 = 100;
