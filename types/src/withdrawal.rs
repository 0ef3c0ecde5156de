use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, FixedSize, Read, ReadExt, Write};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::{
    optional_string_encode_size, read_optional_string, read_string, string_encode_size,
    write_optional_string, write_string, AccountId, IDEMPOTENCY_KEY_LENGTH,
    MAX_DESTINATION_LENGTH, MAX_REASON_LENGTH,
};

/// Saga position of a withdrawal.
///
/// ```text
/// Requested -> Debited -> TransferSent -> Confirmed
///                      \-> TransferFailed -> Compensated
/// ```
///
/// A timeout before the gateway answers counts as a failure, so
/// `TransferFailed` is reachable from both `Debited` and `TransferSent`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Requested = 0,
    Debited = 1,
    TransferSent = 2,
    Confirmed = 3,
    TransferFailed = 4,
    Compensated = 5,
}

#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("withdrawal cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: WithdrawalStatus,
    pub to: WithdrawalStatus,
}

impl WithdrawalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Confirmed | WithdrawalStatus::Compensated
        )
    }

    pub fn can_transition_to(&self, next: WithdrawalStatus) -> bool {
        use WithdrawalStatus::*;
        matches!(
            (self, next),
            (Requested, Debited)
                | (Debited, TransferSent)
                | (Debited, TransferFailed)
                | (TransferSent, Confirmed)
                | (TransferSent, TransferFailed)
                | (TransferFailed, Compensated)
        )
    }
}

impl TryFrom<u8> for WithdrawalStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WithdrawalStatus::Requested),
            1 => Ok(WithdrawalStatus::Debited),
            2 => Ok(WithdrawalStatus::TransferSent),
            3 => Ok(WithdrawalStatus::Confirmed),
            4 => Ok(WithdrawalStatus::TransferFailed),
            5 => Ok(WithdrawalStatus::Compensated),
            _ => Err(()),
        }
    }
}

impl Write for WithdrawalStatus {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for WithdrawalStatus {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let value = u8::read(reader)?;
        WithdrawalStatus::try_from(value).map_err(|_| Error::InvalidEnum(value))
    }
}

impl EncodeSize for WithdrawalStatus {
    fn encode_size(&self) -> usize {
        u8::SIZE
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub id: u64,
    pub account: AccountId,
    /// Amount debited from the account.
    pub amount: u64,
    /// Part of `amount` kept by the house.
    pub fee: u64,
    pub destination: String,
    pub status: WithdrawalStatus,
    /// Hex key the gateway uses to deduplicate transfers.
    pub idempotency_key: String,
    pub failure: Option<String>,
    pub requested_at_ms: u64,
    pub updated_at_ms: u64,
}

impl WithdrawalRequest {
    /// Amount that leaves the system.
    pub fn net_amount(&self) -> u64 {
        self.amount.saturating_sub(self.fee)
    }

    pub fn advance(&mut self, next: WithdrawalStatus, now_ms: u64) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at_ms = now_ms;
        Ok(())
    }
}

impl Write for WithdrawalRequest {
    fn write(&self, writer: &mut impl BufMut) {
        self.id.write(writer);
        self.account.write(writer);
        self.amount.write(writer);
        self.fee.write(writer);
        write_string(&self.destination, writer);
        self.status.write(writer);
        write_string(&self.idempotency_key, writer);
        write_optional_string(self.failure.as_deref(), writer);
        self.requested_at_ms.write(writer);
        self.updated_at_ms.write(writer);
    }
}

impl Read for WithdrawalRequest {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let id = u64::read(reader)?;
        let account = u64::read(reader)?;
        let amount = u64::read(reader)?;
        let fee = u64::read(reader)?;
        if fee > amount {
            return Err(Error::Invalid("WithdrawalRequest", "fee exceeds amount"));
        }
        let destination = read_string(reader, MAX_DESTINATION_LENGTH)?;
        let status = WithdrawalStatus::read(reader)?;
        let idempotency_key = read_string(reader, IDEMPOTENCY_KEY_LENGTH)?;
        let failure = read_optional_string(reader, MAX_REASON_LENGTH)?;
        Ok(Self {
            id,
            account,
            amount,
            fee,
            destination,
            status,
            idempotency_key,
            failure,
            requested_at_ms: u64::read(reader)?,
            updated_at_ms: u64::read(reader)?,
        })
    }
}

impl EncodeSize for WithdrawalRequest {
    fn encode_size(&self) -> usize {
        self.id.encode_size()
            + self.account.encode_size()
            + self.amount.encode_size()
            + self.fee.encode_size()
            + string_encode_size(&self.destination)
            + self.status.encode_size()
            + string_encode_size(&self.idempotency_key)
            + optional_string_encode_size(self.failure.as_deref())
            + self.requested_at_ms.encode_size()
            + self.updated_at_ms.encode_size()
    }
}
