use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, ReadExt, ReadRangeExt, Write};
use serde::{Deserialize, Serialize};

use crate::{AccountId, BPS_DENOMINATOR, MAX_ROUND_WAGERS};

/// Lifecycle of the single active round.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Idle = 0,
    Open = 1,
    Locked = 2,
    Drawing = 3,
    Settling = 4,
    Cooldown = 5,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Idle => "idle",
            RoundStatus::Open => "open",
            RoundStatus::Locked => "locked",
            RoundStatus::Drawing => "drawing",
            RoundStatus::Settling => "settling",
            RoundStatus::Cooldown => "cooldown",
        }
    }

    /// Status that follows this one. `Cooldown` wraps back to `Idle`.
    pub fn next(&self) -> RoundStatus {
        match self {
            RoundStatus::Idle => RoundStatus::Open,
            RoundStatus::Open => RoundStatus::Locked,
            RoundStatus::Locked => RoundStatus::Drawing,
            RoundStatus::Drawing => RoundStatus::Settling,
            RoundStatus::Settling => RoundStatus::Cooldown,
            RoundStatus::Cooldown => RoundStatus::Idle,
        }
    }
}

impl TryFrom<u8> for RoundStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RoundStatus::Idle),
            1 => Ok(RoundStatus::Open),
            2 => Ok(RoundStatus::Locked),
            3 => Ok(RoundStatus::Drawing),
            4 => Ok(RoundStatus::Settling),
            5 => Ok(RoundStatus::Cooldown),
            _ => Err(()),
        }
    }
}

impl Write for RoundStatus {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for RoundStatus {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let value = u8::read(reader)?;
        RoundStatus::try_from(value).map_err(|_| Error::InvalidEnum(value))
    }
}

impl EncodeSize for RoundStatus {
    fn encode_size(&self) -> usize {
        u8::SIZE
    }
}

/// How an archived round ended.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    Pending = 0,
    Settled = 1,
    /// Fewer than two participants (or an empty pot) at lock; wagers refunded.
    Cancelled = 2,
    /// An invariant check failed; left for manual reconciliation.
    Frozen = 3,
}

impl TryFrom<u8> for RoundOutcome {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RoundOutcome::Pending),
            1 => Ok(RoundOutcome::Settled),
            2 => Ok(RoundOutcome::Cancelled),
            3 => Ok(RoundOutcome::Frozen),
            _ => Err(()),
        }
    }
}

impl Write for RoundOutcome {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for RoundOutcome {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let value = u8::read(reader)?;
        RoundOutcome::try_from(value).map_err(|_| Error::InvalidEnum(value))
    }
}

impl EncodeSize for RoundOutcome {
    fn encode_size(&self) -> usize {
        u8::SIZE
    }
}

/// Funds committed by one account to a round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wager {
    pub account: AccountId,
    pub amount: u64,
    pub placed_at_ms: u64,
}

impl Write for Wager {
    fn write(&self, writer: &mut impl BufMut) {
        self.account.write(writer);
        self.amount.write(writer);
        self.placed_at_ms.write(writer);
    }
}

impl Read for Wager {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            account: u64::read(reader)?,
            amount: u64::read(reader)?,
            placed_at_ms: u64::read(reader)?,
        })
    }
}

impl EncodeSize for Wager {
    fn encode_size(&self) -> usize {
        self.account.encode_size() + self.amount.encode_size() + self.placed_at_ms.encode_size()
    }
}

/// Referral bonus attached to a settled round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRecord {
    pub referrer: AccountId,
    pub amount: u64,
    /// False when the credit failed and awaits an out-of-band retry.
    pub credited: bool,
}

impl Write for ReferralRecord {
    fn write(&self, writer: &mut impl BufMut) {
        self.referrer.write(writer);
        self.amount.write(writer);
        self.credited.write(writer);
    }
}

impl Read for ReferralRecord {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            referrer: u64::read(reader)?,
            amount: u64::read(reader)?,
            credited: bool::read(reader)?,
        })
    }
}

impl EncodeSize for ReferralRecord {
    fn encode_size(&self) -> usize {
        self.referrer.encode_size() + self.amount.encode_size() + self.credited.encode_size()
    }
}

/// One participant as shown on the draw tape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapeEntry {
    pub account: AccountId,
    pub stake: u64,
    pub chance_bps: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: u64,
    pub status: RoundStatus,
    pub outcome: RoundOutcome,
    /// At most one entry per account, in join order.
    pub wagers: Vec<Wager>,
    pub pot: u64,
    pub opened_at_ms: u64,
    pub countdown_ends_at_ms: Option<u64>,
    pub locked_at_ms: Option<u64>,
    pub draw_value: Option<u64>,
    pub winner: Option<AccountId>,
    pub payout: u64,
    pub rake: u64,
    pub referral: Option<ReferralRecord>,
}

impl Round {
    pub fn new(id: u64, now_ms: u64) -> Self {
        Self {
            id,
            status: RoundStatus::Open,
            outcome: RoundOutcome::Pending,
            wagers: Vec::new(),
            pot: 0,
            opened_at_ms: now_ms,
            countdown_ends_at_ms: None,
            locked_at_ms: None,
            draw_value: None,
            winner: None,
            payout: 0,
            rake: 0,
            referral: None,
        }
    }

    /// Number of distinct accounts with a wager.
    pub fn participants(&self) -> usize {
        self.wagers.len()
    }

    pub fn stake_of(&self, account: AccountId) -> Option<u64> {
        self.wagers
            .iter()
            .find(|w| w.account == account)
            .map(|w| w.amount)
    }

    /// Sum of wager amounts, or `None` on overflow.
    pub fn wager_total(&self) -> Option<u64> {
        self.wagers
            .iter()
            .try_fold(0u64, |acc, w| acc.checked_add(w.amount))
    }

    pub fn pot_matches_wagers(&self) -> bool {
        self.wager_total() == Some(self.pot)
    }

    /// Milliseconds left on the countdown, if it is running.
    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.countdown_ends_at_ms
            .map(|ends_at| ends_at.saturating_sub(now_ms))
    }

    /// Per-participant win chances for display. Rounded down, so the sum can
    /// fall a few bps short of 100%.
    pub fn tape(&self) -> Vec<TapeEntry> {
        self.wagers
            .iter()
            .map(|w| TapeEntry {
                account: w.account,
                stake: w.amount,
                chance_bps: if self.pot == 0 {
                    0
                } else {
                    ((w.amount as u128 * BPS_DENOMINATOR as u128) / self.pot as u128) as u64
                },
            })
            .collect()
    }
}

impl Write for Round {
    fn write(&self, writer: &mut impl BufMut) {
        self.id.write(writer);
        self.status.write(writer);
        self.outcome.write(writer);
        self.wagers.write(writer);
        self.pot.write(writer);
        self.opened_at_ms.write(writer);
        self.countdown_ends_at_ms.write(writer);
        self.locked_at_ms.write(writer);
        self.draw_value.write(writer);
        self.winner.write(writer);
        self.payout.write(writer);
        self.rake.write(writer);
        self.referral.write(writer);
    }
}

impl Read for Round {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let id = u64::read(reader)?;
        let status = RoundStatus::read(reader)?;
        let outcome = RoundOutcome::read(reader)?;
        let wagers = Vec::<Wager>::read_range(reader, 0..=MAX_ROUND_WAGERS)?;
        let pot = u64::read(reader)?;
        let opened_at_ms = u64::read(reader)?;
        let countdown_ends_at_ms = Option::<u64>::read(reader)?;
        let locked_at_ms = Option::<u64>::read(reader)?;
        let draw_value = Option::<u64>::read(reader)?;
        let winner = Option::<u64>::read(reader)?;
        let payout = u64::read(reader)?;
        let rake = u64::read(reader)?;
        let referral = Option::<ReferralRecord>::read(reader)?;

        let round = Self {
            id,
            status,
            outcome,
            wagers,
            pot,
            opened_at_ms,
            countdown_ends_at_ms,
            locked_at_ms,
            draw_value,
            winner,
            payout,
            rake,
            referral,
        };
        // Frozen rounds are archived precisely because the pot disagrees.
        if round.outcome != RoundOutcome::Frozen && !round.pot_matches_wagers() {
            return Err(Error::Invalid("Round", "pot does not match wagers"));
        }
        Ok(round)
    }
}

impl EncodeSize for Round {
    fn encode_size(&self) -> usize {
        self.id.encode_size()
            + self.status.encode_size()
            + self.outcome.encode_size()
            + self.wagers.encode_size()
            + self.pot.encode_size()
            + self.opened_at_ms.encode_size()
            + self.countdown_ends_at_ms.encode_size()
            + self.locked_at_ms.encode_size()
            + self.draw_value.encode_size()
            + self.winner.encode_size()
            + self.payout.encode_size()
            + self.rake.encode_size()
            + self.referral.encode_size()
    }
}
