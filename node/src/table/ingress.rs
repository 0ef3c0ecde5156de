use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use jackpot_execution::{LedgerError, WagerError, WagerReceipt, WithdrawalError};
use jackpot_types::{Account, AccountId, Event, Round, RoundStatus, WithdrawalRequest};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// Round state as seen by clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableView {
    pub status: RoundStatus,
    pub paused: bool,
    pub seconds_remaining: Option<u64>,
    pub round: Option<Round>,
}

/// Account state with the number of accounts it referred.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    #[serde(flatten)]
    pub account: Account,
    pub referral_count: usize,
}

/// Inventory mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PositionChange {
    Add { item_id: String, principal: u64 },
    Remove { item_id: String },
    SetStaked { item_id: String, staked: bool },
}

/// Messages sent to the table.
pub enum Message {
    OpenAccount {
        account: AccountId,
        referred_by: Option<AccountId>,
        response: oneshot::Sender<Account>,
    },
    Deposit {
        account: AccountId,
        amount: u64,
        reference: String,
        response: oneshot::Sender<Result<u64, LedgerError>>,
    },
    PlaceWager {
        account: AccountId,
        amount: u64,
        response: oneshot::Sender<Result<WagerReceipt, WagerError>>,
    },
    Withdraw {
        account: AccountId,
        amount: u64,
        destination: Option<String>,
        response: oneshot::Sender<Result<WithdrawalRequest, WithdrawalError>>,
    },
    Account {
        account: AccountId,
        response: oneshot::Sender<Result<AccountView, LedgerError>>,
    },
    SetWallet {
        account: AccountId,
        wallet: String,
        response: oneshot::Sender<Result<(), LedgerError>>,
    },
    Position {
        account: AccountId,
        change: PositionChange,
        response: oneshot::Sender<Result<Account, LedgerError>>,
    },
    Withdrawals {
        account: AccountId,
        response: oneshot::Sender<Vec<WithdrawalRequest>>,
    },
    Table {
        response: oneshot::Sender<TableView>,
    },
    History {
        limit: usize,
        response: oneshot::Sender<Vec<Round>>,
    },
    Resume {
        response: oneshot::Sender<()>,
    },
    /// Refund the open round and stop. Answered once the refunds are applied.
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Returned when the table actor has stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("table mailbox closed")]
pub struct Closed;

/// Mailbox for the table.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    events: broadcast::Sender<Event>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>, events: broadcast::Sender<Event>) -> Self {
        Self { sender, events }
    }

    /// Subscribe to every event the table publishes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    async fn request<T>(
        &mut self,
        name: &'static str,
        build: impl FnOnce(oneshot::Sender<T>) -> Message,
    ) -> Result<T, Closed> {
        let (response, receiver) = oneshot::channel();
        if self.sender.send(build(response)).await.is_err() {
            warn!(request = name, "table mailbox closed");
            return Err(Closed);
        }
        receiver.await.map_err(|_| {
            warn!(request = name, "table dropped response");
            Closed
        })
    }

    pub async fn open_account(
        &mut self,
        account: AccountId,
        referred_by: Option<AccountId>,
    ) -> Result<Account, Closed> {
        self.request("open_account", |response| Message::OpenAccount {
            account,
            referred_by,
            response,
        })
        .await
    }

    pub async fn deposit(
        &mut self,
        account: AccountId,
        amount: u64,
        reference: String,
    ) -> Result<Result<u64, LedgerError>, Closed> {
        self.request("deposit", |response| Message::Deposit {
            account,
            amount,
            reference,
            response,
        })
        .await
    }

    pub async fn place_wager(
        &mut self,
        account: AccountId,
        amount: u64,
    ) -> Result<Result<WagerReceipt, WagerError>, Closed> {
        self.request("place_wager", |response| Message::PlaceWager {
            account,
            amount,
            response,
        })
        .await
    }

    /// Resolves once the withdrawal reaches a final status.
    pub async fn withdraw(
        &mut self,
        account: AccountId,
        amount: u64,
        destination: Option<String>,
    ) -> Result<Result<WithdrawalRequest, WithdrawalError>, Closed> {
        self.request("withdraw", |response| Message::Withdraw {
            account,
            amount,
            destination,
            response,
        })
        .await
    }

    /// Account state with staking yield credited up to now.
    pub async fn account(
        &mut self,
        account: AccountId,
    ) -> Result<Result<AccountView, LedgerError>, Closed> {
        self.request("account", |response| Message::Account { account, response })
            .await
    }

    pub async fn set_wallet(
        &mut self,
        account: AccountId,
        wallet: String,
    ) -> Result<Result<(), LedgerError>, Closed> {
        self.request("set_wallet", |response| Message::SetWallet {
            account,
            wallet,
            response,
        })
        .await
    }

    pub async fn change_position(
        &mut self,
        account: AccountId,
        change: PositionChange,
    ) -> Result<Result<Account, LedgerError>, Closed> {
        self.request("position", |response| Message::Position {
            account,
            change,
            response,
        })
        .await
    }

    pub async fn withdrawals(
        &mut self,
        account: AccountId,
    ) -> Result<Vec<WithdrawalRequest>, Closed> {
        self.request("withdrawals", |response| Message::Withdrawals {
            account,
            response,
        })
        .await
    }

    pub async fn table(&mut self) -> Result<TableView, Closed> {
        self.request("table", |response| Message::Table { response })
            .await
    }

    /// Archived rounds, newest first.
    pub async fn history(&mut self, limit: usize) -> Result<Vec<Round>, Closed> {
        self.request("history", |response| Message::History { limit, response })
            .await
    }

    /// Reopen the table after a frozen round has been reconciled.
    pub async fn resume(&mut self) -> Result<(), Closed> {
        self.request("resume", |response| Message::Resume { response })
            .await
    }

    /// Stop the table, refunding every wager of a round still open.
    pub async fn shutdown(&mut self) -> Result<(), Closed> {
        self.request("shutdown", |response| Message::Shutdown { response })
            .await
    }
}
