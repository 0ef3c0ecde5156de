use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, ReadRangeExt, Write};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::{
    optional_string_encode_size, read_optional_string, read_string, string_encode_size,
    write_optional_string, write_string, MAX_DESTINATION_LENGTH, MAX_ITEM_ID_LENGTH,
    MAX_STAKE_POSITIONS,
};

/// Identifier handed out by the authentication collaborator.
pub type AccountId = u64;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum AccountInvariantError {
    #[error("account {id} refers itself")]
    SelfReferral { id: AccountId },
    #[error("too many stake positions (len={len}, max={max})")]
    TooManyPositions { len: usize, max: usize },
    #[error("duplicate stake position {item_id}")]
    DuplicatePosition { item_id: String },
    #[error("item id too long (len={len}, max={max})")]
    ItemIdTooLong { len: usize, max: usize },
    #[error("wallet too long (len={len}, max={max})")]
    WalletTooLong { len: usize, max: usize },
}

/// An inventory item whose valuation earns yield while staked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakePosition {
    pub item_id: String,
    /// Valuation the yield is computed on.
    pub principal: u64,
    pub staked: bool,
    /// Last checkpoint (ms). Only meaningful while staked.
    pub stake_start_ms: u64,
    /// Total yield credited from this position so far.
    pub accrued_yield: u64,
    /// Sub-unit remainder carried between checkpoints.
    #[serde(skip)]
    pub carry: u64,
}

impl StakePosition {
    pub fn new(item_id: String, principal: u64) -> Self {
        Self {
            item_id,
            principal,
            staked: false,
            stake_start_ms: 0,
            accrued_yield: 0,
            carry: 0,
        }
    }
}

impl Write for StakePosition {
    fn write(&self, writer: &mut impl BufMut) {
        write_string(&self.item_id, writer);
        self.principal.write(writer);
        self.staked.write(writer);
        self.stake_start_ms.write(writer);
        self.accrued_yield.write(writer);
        self.carry.write(writer);
    }
}

impl Read for StakePosition {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            item_id: read_string(reader, MAX_ITEM_ID_LENGTH)?,
            principal: u64::read(reader)?,
            staked: bool::read(reader)?,
            stake_start_ms: u64::read(reader)?,
            accrued_yield: u64::read(reader)?,
            carry: u64::read(reader)?,
        })
    }
}

impl EncodeSize for StakePosition {
    fn encode_size(&self) -> usize {
        string_encode_size(&self.item_id)
            + self.principal.encode_size()
            + self.staked.encode_size()
            + self.stake_start_ms.encode_size()
            + self.accrued_yield.encode_size()
            + self.carry.encode_size()
    }
}

/// A participant's money and inventory.
///
/// `balance` is only ever changed through the ledger. `version` increases on
/// every mutation so optimistic writers can detect stale reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub balance: u64,
    pub referred_by: Option<AccountId>,
    pub referral_income: u64,
    pub positions: Vec<StakePosition>,
    pub wallet: Option<String>,
    pub frozen: bool,
    pub version: u64,
}

impl Account {
    /// Create an empty account. A self-referral is dropped.
    pub fn new(id: AccountId, referred_by: Option<AccountId>) -> Self {
        Self {
            id,
            balance: 0,
            referred_by: referred_by.filter(|referrer| *referrer != id),
            referral_income: 0,
            positions: Vec::new(),
            wallet: None,
            frozen: false,
            version: 0,
        }
    }

    pub fn position(&self, item_id: &str) -> Option<&StakePosition> {
        self.positions.iter().find(|p| p.item_id == item_id)
    }

    pub fn position_mut(&mut self, item_id: &str) -> Option<&mut StakePosition> {
        self.positions.iter_mut().find(|p| p.item_id == item_id)
    }

    pub fn validate_invariants(&self) -> Result<(), AccountInvariantError> {
        if self.referred_by == Some(self.id) {
            return Err(AccountInvariantError::SelfReferral { id: self.id });
        }
        if self.positions.len() > MAX_STAKE_POSITIONS {
            return Err(AccountInvariantError::TooManyPositions {
                len: self.positions.len(),
                max: MAX_STAKE_POSITIONS,
            });
        }
        for (i, position) in self.positions.iter().enumerate() {
            if position.item_id.len() > MAX_ITEM_ID_LENGTH {
                return Err(AccountInvariantError::ItemIdTooLong {
                    len: position.item_id.len(),
                    max: MAX_ITEM_ID_LENGTH,
                });
            }
            if self.positions[..i]
                .iter()
                .any(|other| other.item_id == position.item_id)
            {
                return Err(AccountInvariantError::DuplicatePosition {
                    item_id: position.item_id.clone(),
                });
            }
        }
        if let Some(wallet) = &self.wallet {
            if wallet.len() > MAX_DESTINATION_LENGTH {
                return Err(AccountInvariantError::WalletTooLong {
                    len: wallet.len(),
                    max: MAX_DESTINATION_LENGTH,
                });
            }
        }
        Ok(())
    }
}

impl Write for Account {
    fn write(&self, writer: &mut impl BufMut) {
        self.id.write(writer);
        self.balance.write(writer);
        self.referred_by.write(writer);
        self.referral_income.write(writer);
        self.positions.write(writer);
        write_optional_string(self.wallet.as_deref(), writer);
        self.frozen.write(writer);
        self.version.write(writer);
    }
}

impl Read for Account {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let account = Self {
            id: u64::read(reader)?,
            balance: u64::read(reader)?,
            referred_by: Option::<u64>::read(reader)?,
            referral_income: u64::read(reader)?,
            positions: Vec::<StakePosition>::read_range(reader, 0..=MAX_STAKE_POSITIONS)?,
            wallet: read_optional_string(reader, MAX_DESTINATION_LENGTH)?,
            frozen: bool::read(reader)?,
            version: u64::read(reader)?,
        };
        account
            .validate_invariants()
            .map_err(|_| Error::Invalid("Account", "invariant violated"))?;
        Ok(account)
    }
}

impl EncodeSize for Account {
    fn encode_size(&self) -> usize {
        self.id.encode_size()
            + self.balance.encode_size()
            + self.referred_by.encode_size()
            + self.referral_income.encode_size()
            + self.positions.encode_size()
            + optional_string_encode_size(self.wallet.as_deref())
            + self.frozen.encode_size()
            + self.version.encode_size()
    }
}
