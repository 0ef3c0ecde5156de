//! Pot distribution.
//!
//! A settled pot splits into the winner payout and the rake, which goes to
//! the house. The winner's referrer then receives a bonus paid out of the
//! house balance. Every unit of the pot lands in exactly one account.

use crate::{Ledger, LedgerError};
use jackpot_types::{AccountId, ReferralRecord, Round, BPS_DENOMINATOR, HOUSE_ACCOUNT};
use std::{fmt, str::FromStr};
use thiserror::Error;
use tracing::{error, info, warn};

/// Which part of the pot commission is charged on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RakePolicy {
    /// Commission on the whole pot, the winner's own stake included.
    FlatPot,
    /// Commission only on what the winner gained from others.
    #[default]
    ProfitOnly,
}

impl RakePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RakePolicy::FlatPot => "flat_pot",
            RakePolicy::ProfitOnly => "profit_only",
        }
    }
}

impl fmt::Display for RakePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RakePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "flat_pot" => Ok(RakePolicy::FlatPot),
            "profit_only" => Ok(RakePolicy::ProfitOnly),
            other => Err(format!("unknown rake policy: {other}")),
        }
    }
}

/// How a pot divides between winner and house.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Payout {
    pub pot: u64,
    pub winner_stake: u64,
    pub rake: u64,
    pub payout: u64,
}

fn bps_of(amount: u64, bps: u16) -> u64 {
    // bps <= BPS_DENOMINATOR, so the result never exceeds `amount`.
    ((amount as u128 * bps as u128) / BPS_DENOMINATOR as u128) as u64
}

/// Split `pot` under `policy`. Rake is rounded down.
///
/// Returns `None` if the winner's stake exceeds the pot or `rake_bps` is
/// above 100%.
pub fn compute_payout(policy: RakePolicy, pot: u64, winner_stake: u64, rake_bps: u16) -> Option<Payout> {
    if winner_stake > pot || rake_bps as u64 > BPS_DENOMINATOR {
        return None;
    }
    let rake = match policy {
        RakePolicy::FlatPot => bps_of(pot, rake_bps),
        RakePolicy::ProfitOnly => bps_of(pot - winner_stake, rake_bps),
    };
    Some(Payout {
        pot,
        winner_stake,
        rake,
        payout: pot - rake,
    })
}

/// Referral bonus for a payout.
///
/// The house funds the bonus from its balance rather than from this round's
/// rake, so it can exceed the rake (a winner who mostly won back their own
/// stake pays little or no rake under [`RakePolicy::ProfitOnly`]).
pub fn referral_bonus(payout: &Payout, referral_bps: u16) -> u64 {
    bps_of(payout.payout, referral_bps)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettlementConfig {
    pub policy: RakePolicy,
    pub rake_bps: u16,
    pub referral_bps: u16,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SettlementError {
    #[error("round {0} has no winner")]
    MissingWinner(u64),
    #[error("round {round} pot {pot} does not match wagers")]
    PotMismatch { round: u64, pot: u64 },
    #[error("round {round} winner {winner} holds no stake")]
    InvalidWinner { round: u64, winner: AccountId },
    #[error("round {0} cannot be split under the configured rake")]
    InvalidPayout(u64),
    #[error("winner credit failed: {0}")]
    Ledger(#[from] LedgerError),
}

/// Ledger effects of one settlement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub payout: Payout,
    pub winner: AccountId,
    pub winner_balance: u64,
    /// Why the rake did not reach the house. The full rake is still owed.
    pub rake_error: Option<LedgerError>,
    pub referral: Option<ReferralRecord>,
    /// Balance of the referrer after a successful bonus payment.
    pub referrer_balance: Option<u64>,
}

/// Pay out a drawn round and record the split on it.
///
/// The winner credit is the only step that can fail the settlement. A rake
/// credit the house cannot take is reported in [`Settlement::rake_error`].
/// A bonus the house cannot fund, or the referrer cannot receive, leaves the
/// round's referral uncredited for [`retry_referral`].
pub fn settle(
    ledger: &Ledger,
    config: &SettlementConfig,
    round: &mut Round,
) -> Result<Settlement, SettlementError> {
    let winner = round.winner.ok_or(SettlementError::MissingWinner(round.id))?;
    if !round.pot_matches_wagers() {
        return Err(SettlementError::PotMismatch {
            round: round.id,
            pot: round.pot,
        });
    }
    let winner_stake = round.stake_of(winner).ok_or(SettlementError::InvalidWinner {
        round: round.id,
        winner,
    })?;
    let payout = compute_payout(config.policy, round.pot, winner_stake, config.rake_bps)
        .ok_or(SettlementError::InvalidPayout(round.id))?;
    let referrer = ledger.snapshot(winner)?.referred_by;

    let winner_balance = if payout.payout > 0 {
        ledger.credit(winner, payout.payout)?
    } else {
        ledger.balance(winner)?
    };

    let rake_error = if payout.rake > 0 {
        ledger.credit(HOUSE_ACCOUNT, payout.rake).err()
    } else {
        None
    };
    if let Some(err) = &rake_error {
        error!(round = round.id, rake = payout.rake, ?err, "rake credit failed");
    }

    let bonus = referral_bonus(&payout, config.referral_bps);
    let (referral, referrer_balance) = match referrer.filter(|r| *r != winner && bonus > 0) {
        Some(referrer) => {
            let mut record = ReferralRecord {
                referrer,
                amount: bonus,
                credited: false,
            };
            match ledger.pay_referral(referrer, bonus) {
                Ok(balance) => {
                    record.credited = true;
                    (Some(record), Some(balance))
                }
                Err(err) => {
                    warn!(round = round.id, referrer, bonus, ?err, "referral payment failed");
                    (Some(record), None)
                }
            }
        }
        None => (None, None),
    };

    round.payout = payout.payout;
    round.rake = payout.rake;
    round.referral = referral.clone();
    info!(
        round = round.id,
        winner,
        pot = payout.pot,
        payout = payout.payout,
        rake = payout.rake,
        "round settled"
    );
    Ok(Settlement {
        payout,
        winner,
        winner_balance,
        rake_error,
        referral,
        referrer_balance,
    })
}

/// Pay an uncredited referral bonus out of the house balance.
///
/// Returns the referrer's new balance, or `None` if there was nothing to do.
pub fn retry_referral(
    ledger: &Ledger,
    round_id: u64,
    referral: &mut ReferralRecord,
) -> Result<Option<u64>, LedgerError> {
    if referral.credited {
        return Ok(None);
    }
    let balance = ledger.pay_referral(referral.referrer, referral.amount)?;
    referral.credited = true;
    info!(
        round = round_id,
        referrer = referral.referrer,
        amount = referral.amount,
        "referral retried"
    );
    Ok(Some(balance))
}
