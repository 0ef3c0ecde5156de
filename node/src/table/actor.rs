use super::{
    ingress::{AccountView, Mailbox, Message, PositionChange, TableView},
    Config,
};
use crate::retry::RetrySchedule;
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use jackpot_execution::{
    archive::Memory, system_time_ms, Ledger, MemoryWithdrawals, PayoutGateway, RoundArchive,
    RoundController, Staking, Withdrawals,
};
use jackpot_types::{Event, WithdrawalStatus};
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use rand::RngCore;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Table metrics.
#[derive(Default)]
struct TableMetrics {
    wagers_accepted: Counter,
    wagers_rejected: Counter,
    rounds_settled: Counter,
    rounds_cancelled: Counter,
    invariant_violations: Counter,
    withdrawals_confirmed: Counter,
    withdrawals_compensated: Counter,
    pot: Gauge,
}

impl TableMetrics {
    fn register(context: &impl Metrics) -> Self {
        let metrics = Self::default();
        context.register(
            "wagers_accepted",
            "Number of wagers added to a round",
            metrics.wagers_accepted.clone(),
        );
        context.register(
            "wagers_rejected",
            "Number of wagers rejected",
            metrics.wagers_rejected.clone(),
        );
        context.register(
            "rounds_settled",
            "Number of rounds paid out",
            metrics.rounds_settled.clone(),
        );
        context.register(
            "rounds_cancelled",
            "Number of rounds cancelled with refunds",
            metrics.rounds_cancelled.clone(),
        );
        context.register(
            "invariant_violations",
            "Number of frozen rounds and uncompensated withdrawals",
            metrics.invariant_violations.clone(),
        );
        context.register(
            "withdrawals_confirmed",
            "Number of withdrawals confirmed by the gateway",
            metrics.withdrawals_confirmed.clone(),
        );
        context.register(
            "withdrawals_compensated",
            "Number of failed withdrawals credited back",
            metrics.withdrawals_compensated.clone(),
        );
        context.register("pot", "Pot of the current round", metrics.pot.clone());
        metrics
    }

    fn observe(&self, event: &Event) {
        match event {
            Event::RoundSettled { .. } => {
                self.rounds_settled.inc();
            }
            Event::RoundCancelled { .. } => {
                self.rounds_cancelled.inc();
            }
            Event::InvariantViolated { .. } => {
                self.invariant_violations.inc();
            }
            Event::WithdrawalUpdated { status, .. } => match status {
                WithdrawalStatus::Confirmed => {
                    self.withdrawals_confirmed.inc();
                }
                WithdrawalStatus::Compensated => {
                    self.withdrawals_compensated.inc();
                }
                _ => {}
            },
            _ => {}
        }
    }
}

/// Table actor.
pub struct Actor<E: Clock + Spawner + Metrics + RngCore, G: PayoutGateway> {
    context: E,
    mailbox: mpsc::Receiver<Message>,
    events: broadcast::Sender<Event>,
    ledger: Arc<Ledger>,
    controller: RoundController<Memory>,
    staking: Staking,
    withdrawals: Withdrawals<E, G>,
    withdrawal_events: mpsc::UnboundedReceiver<Event>,
    history_limit: usize,
    tick_interval: Duration,
    referral_retry: RetrySchedule,
}

impl<E: Clock + Spawner + Metrics + RngCore, G: PayoutGateway> Actor<E, G> {
    /// Create a new table actor.
    pub fn new(context: E, config: Config<G>) -> (Self, Mailbox) {
        let (sender, mailbox) = mpsc::channel(config.mailbox_size);
        let (events, _) = broadcast::channel(config.event_buffer);
        let ledger = Arc::new(Ledger::new());
        let controller = RoundController::new(
            config.round,
            ledger.clone(),
            Memory::new(config.history_limit),
        );
        let (withdrawal_sender, withdrawal_events) = mpsc::unbounded();
        let withdrawals = Withdrawals::new(
            context.with_label("withdrawals"),
            ledger.clone(),
            config.gateway,
            config.withdrawal,
        )
        .with_store(MemoryWithdrawals::new(config.withdrawal_history_limit))
        .with_events(withdrawal_sender);

        (
            Self {
                context,
                mailbox,
                events: events.clone(),
                ledger,
                controller,
                staking: config.staking,
                withdrawals,
                withdrawal_events,
                history_limit: config.history_limit,
                tick_interval: config.tick_interval,
                referral_retry: RetrySchedule::new(
                    config.referral_retry,
                    config.referral_retry_max,
                ),
            },
            Mailbox::new(sender, events),
        )
    }

    pub fn start(mut self) -> Handle<()> {
        self.context.clone().spawn(|context| {
            self.context = context;
            self.run()
        })
    }

    fn now_ms(&self) -> u64 {
        system_time_ms(self.context.current())
    }

    fn publish(&self, event: Event) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Publish everything the controller produced and refresh gauges.
    fn flush(&mut self, metrics: &TableMetrics) {
        for event in self.controller.take_events() {
            metrics.observe(&event);
            self.publish(event);
        }
        let pot = self.controller.current().map(|round| round.pot).unwrap_or(0);
        metrics.pot.set(i64::try_from(pot).unwrap_or(i64::MAX));
    }

    /// Forward a withdrawal status change, with the balance it moved.
    fn withdrawal_update(&self, event: Event, metrics: &TableMetrics) {
        metrics.observe(&event);
        if let Event::WithdrawalUpdated {
            account, status, ..
        } = &event
        {
            if matches!(
                status,
                WithdrawalStatus::Debited | WithdrawalStatus::Compensated
            ) {
                if let Ok(balance) = self.ledger.balance(*account) {
                    self.publish(Event::BalanceChanged {
                        account: *account,
                        balance,
                    });
                }
            }
        }
        self.publish(event);
    }

    async fn run(mut self) {
        let metrics = TableMetrics::register(&self.context);
        let mut next_tick = self.context.current() + self.tick_interval;
        let mut last_countdown: Option<u64> = None;
        let mut stopped: Option<oneshot::Sender<()>> = None;

        loop {
            select! {
                message = self.mailbox.next() => {
                    let message = match message {
                        Some(Message::Shutdown { response }) => {
                            info!("table shutdown requested");
                            stopped = Some(response);
                            break;
                        }
                        Some(message) => message,
                        None => {
                            info!("table mailbox closed, shutting down");
                            break;
                        }
                    };
                    self.handle(message, &metrics);
                    self.flush(&metrics);
                },
                event = self.withdrawal_events.next() => {
                    if let Some(event) = event {
                        self.withdrawal_update(event, &metrics);
                    }
                },
                _ = self.context.sleep_until(next_tick) => {
                    next_tick = self.context.current() + self.tick_interval;
                    let now_ms = self.now_ms();
                    self.controller.advance(now_ms, &mut self.context);

                    // Countdown ticks only when the displayed second changes.
                    let remaining = self.controller.seconds_remaining(now_ms);
                    if remaining != last_countdown {
                        if let (Some(seconds_remaining), Some(round)) =
                            (remaining, self.controller.current())
                        {
                            self.publish(Event::CountdownTick {
                                round_id: round.id,
                                seconds_remaining,
                            });
                        }
                        last_countdown = remaining;
                    }

                    if self.controller.outstanding() + self.withdrawals.unpaid_fees() > 0
                        && self.referral_retry.due(now_ms, &mut self.context)
                    {
                        let outstanding =
                            self.controller.retry_pending() + self.withdrawals.retry_fees();
                        if outstanding == 0 {
                            self.referral_retry.reset();
                        } else {
                            let delay = self.referral_retry.failed(now_ms, &mut self.context);
                            warn!(outstanding, ?delay, "credits still failing");
                        }
                    }
                    self.flush(&metrics);
                },
            }
        }

        if self.controller.cancel_open_round("table shutting down") {
            self.flush(&metrics);
        }
        if let Some(response) = stopped {
            let _ = response.send(());
        }
    }

    fn handle(&mut self, message: Message, metrics: &TableMetrics) {
        match message {
            Message::OpenAccount {
                account,
                referred_by,
                response,
            } => {
                let _ = response.send(self.ledger.open_account(account, referred_by));
            }
            Message::Deposit {
                account,
                amount,
                reference,
                response,
            } => {
                let result = self.ledger.credit_deposit(account, amount, &reference);
                match &result {
                    Ok(balance) => {
                        info!(account, amount, %reference, "deposit credited");
                        self.publish(Event::BalanceChanged {
                            account,
                            balance: *balance,
                        });
                    }
                    Err(err) => debug!(account, amount, %reference, ?err, "deposit rejected"),
                }
                let _ = response.send(result);
            }
            Message::PlaceWager {
                account,
                amount,
                response,
            } => {
                let now_ms = self.now_ms();
                let result = self
                    .controller
                    .place_wager(account, amount, now_ms, &mut self.context);
                match &result {
                    Ok(_) => metrics.wagers_accepted.inc(),
                    Err(err) => {
                        debug!(account, amount, %err, "wager rejected");
                        metrics.wagers_rejected.inc()
                    }
                };
                let _ = response.send(result);
            }
            Message::Withdraw {
                account,
                amount,
                destination,
                response,
            } => {
                // The saga awaits the gateway; run it off the actor.
                self.context.with_label("withdrawal").spawn({
                    let withdrawals = self.withdrawals.clone();
                    move |_| async move {
                        let result = withdrawals
                            .withdraw(account, amount, destination.as_deref())
                            .await;
                        let _ = response.send(result);
                    }
                });
            }
            Message::Account { account, response } => {
                let now_ms = self.now_ms();
                let result = self
                    .staking
                    .checkpoint(&self.ledger, account, now_ms)
                    .map(|checkpoint| {
                        if checkpoint.credited > 0 {
                            self.publish(Event::BalanceChanged {
                                account,
                                balance: checkpoint.account.balance,
                            });
                        }
                        AccountView {
                            account: checkpoint.account,
                            referral_count: self.ledger.referral_count(account),
                        }
                    });
                let _ = response.send(result);
            }
            Message::SetWallet {
                account,
                wallet,
                response,
            } => {
                let _ = response.send(self.ledger.set_wallet(account, &wallet));
            }
            Message::Position {
                account,
                change,
                response,
            } => {
                let now_ms = self.now_ms();
                let result = match &change {
                    PositionChange::Add { item_id, principal } => {
                        self.staking
                            .add_position(&self.ledger, account, item_id, *principal, now_ms)
                    }
                    PositionChange::Remove { item_id } => {
                        self.staking
                            .remove_position(&self.ledger, account, item_id, now_ms)
                    }
                    PositionChange::SetStaked { item_id, staked } => {
                        self.staking
                            .set_staked(&self.ledger, account, item_id, *staked, now_ms)
                    }
                };
                let result = result.map(|checkpoint| {
                    if checkpoint.credited > 0 {
                        self.publish(Event::BalanceChanged {
                            account,
                            balance: checkpoint.account.balance,
                        });
                    }
                    checkpoint.account
                });
                let _ = response.send(result);
            }
            Message::Withdrawals { account, response } => {
                let _ = response.send(self.withdrawals.for_account(account));
            }
            Message::Table { response } => {
                let now_ms = self.now_ms();
                let _ = response.send(TableView {
                    status: self.controller.status(),
                    paused: self.controller.is_paused(),
                    seconds_remaining: self.controller.seconds_remaining(now_ms),
                    round: self.controller.current().cloned(),
                });
            }
            Message::History { limit, response } => {
                let limit = limit.min(self.history_limit);
                let _ = response.send(self.controller.archive().recent(limit));
            }
            Message::Resume { response } => {
                self.controller.resume();
                let _ = response.send(());
            }
            // Intercepted by the run loop.
            Message::Shutdown { .. } => {}
        }
    }
}
