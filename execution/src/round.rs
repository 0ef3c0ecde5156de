//! Round controller state machine.
//!
//! The controller is the only writer of round state. It performs no I/O and
//! reads no clock: every operation takes `now_ms`, and the owner (the table
//! actor in the node) calls [`RoundController::advance`] on a timer. Because
//! every wager also advances the machine first, a wager that arrives after the
//! countdown expired is evaluated against the locked round, never the open
//! one.
//!
//! ## Statuses
//!
//! ```text
//! Idle -> Open -> Locked -> Drawing -> Settling -> Cooldown -> Idle
//! ```
//!
//! - **Open**: accepts wagers. The countdown starts when the second distinct
//!   participant joins.
//! - **Locked**: the pot is checked against the wagers, then the draw runs.
//! - **Drawing**: the winner is known and held for `reveal_ms` so clients can
//!   animate the tape.
//! - **Settling**: the pot is paid out.
//! - **Cooldown**: the result stays visible for `cooldown_ms`, then the round
//!   is archived.
//!
//! A draw that cannot be made cancels the round and refunds every wager. An
//! invariant failure freezes the round, archives it for reconciliation and
//! pauses the table until [`RoundController::resume`] is called. A refund or
//! rake credit the ledger refuses also pauses the table; the amount is owed
//! and retried by [`RoundController::retry_pending`].

use crate::{
    archive::RoundArchive,
    draw,
    settlement::{self, SettlementConfig},
    Ledger, LedgerError, WagerError,
};
use jackpot_types::{
    AccountId, Event, ReferralRecord, Round, RoundOutcome, RoundStatus, Wager, BPS_DENOMINATOR,
    HOUSE_ACCOUNT, MAX_ROUND_WAGERS,
};
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Timing and limits for rounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundConfig {
    /// Countdown started by the second participant.
    pub countdown_ms: u64,
    /// How long the drawn winner is shown before settlement.
    pub reveal_ms: u64,
    pub cooldown_ms: u64,
    pub min_wager: u64,
    pub max_wager: u64,
    pub max_participants: usize,
    pub settlement: SettlementConfig,
}

impl RoundConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.countdown_ms == 0 {
            return Err("countdown_ms must be greater than zero");
        }
        if self.cooldown_ms == 0 {
            return Err("cooldown_ms must be greater than zero");
        }
        if self.min_wager == 0 {
            return Err("min_wager must be greater than zero");
        }
        if self.max_wager < self.min_wager {
            return Err("max_wager must be at least min_wager");
        }
        if self.max_participants < 2 || self.max_participants > MAX_ROUND_WAGERS {
            return Err("max_participants out of range");
        }
        if self.settlement.rake_bps as u64 > BPS_DENOMINATOR
            || self.settlement.referral_bps as u64 > BPS_DENOMINATOR
        {
            return Err("basis points must not exceed 10000");
        }
        Ok(())
    }
}

/// Accepted wager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WagerReceipt {
    pub round_id: u64,
    /// The account's total stake in the round after merging.
    pub stake: u64,
    pub pot: u64,
    pub participants: usize,
    /// Account balance after the debit.
    pub balance: u64,
}

#[derive(Clone, Debug)]
struct PendingReferral {
    round_id: u64,
    referral: ReferralRecord,
}

/// Funds that left the pot but were not yet credited anywhere.
#[derive(Clone, Debug)]
struct OwedCredit {
    round_id: u64,
    account: AccountId,
    amount: u64,
}

pub struct RoundController<A: RoundArchive> {
    config: RoundConfig,
    ledger: Arc<Ledger>,
    archive: A,
    current: Option<Round>,
    /// End of the reveal while drawing, or of the cooldown.
    deadline_ms: Option<u64>,
    next_round_id: u64,
    paused: bool,
    pending_referrals: Vec<PendingReferral>,
    owed: Vec<OwedCredit>,
    events: Vec<Event>,
}

impl<A: RoundArchive> RoundController<A> {
    /// Create an idle controller. Round ids continue after the newest
    /// archived round.
    pub fn new(config: RoundConfig, ledger: Arc<Ledger>, archive: A) -> Self {
        let next_round_id = archive
            .recent(1)
            .first()
            .map(|round| round.id + 1)
            .unwrap_or(1);
        Self {
            config,
            ledger,
            archive,
            current: None,
            deadline_ms: None,
            next_round_id,
            paused: false,
            pending_referrals: Vec::new(),
            owed: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    pub fn status(&self) -> RoundStatus {
        self.current
            .as_ref()
            .map(|round| round.status)
            .unwrap_or(RoundStatus::Idle)
    }

    pub fn current(&self) -> Option<&Round> {
        self.current.as_ref()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Stop opening new rounds. A round already running completes.
    pub fn pause(&mut self) {
        if !self.paused {
            info!("table paused");
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            info!("table resumed");
            self.paused = false;
        }
    }

    pub fn pending_referrals(&self) -> usize {
        self.pending_referrals.len()
    }

    /// Referrals and credits still waiting on [`RoundController::retry_pending`].
    pub fn outstanding(&self) -> usize {
        self.pending_referrals.len() + self.owed.len()
    }

    /// Sum of refunds and rake the ledger has not yet accepted.
    pub fn owed(&self) -> u128 {
        self.owed.iter().map(|credit| credit.amount as u128).sum()
    }

    /// Drain the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Whole seconds left on the countdown, rounded up.
    pub fn seconds_remaining(&self, now_ms: u64) -> Option<u64> {
        let round = self.current.as_ref()?;
        if round.status != RoundStatus::Open {
            return None;
        }
        round
            .remaining_ms(now_ms)
            .map(|remaining| remaining.div_ceil(1_000))
    }

    fn sync(&mut self) {
        self.events.push(Event::RoundSync {
            round: self.current.clone(),
        });
    }

    /// Debit `amount` from `account` and add it to the open round, opening
    /// one if the table is idle.
    pub fn place_wager(
        &mut self,
        account: AccountId,
        amount: u64,
        now_ms: u64,
        rng: &mut impl RngCore,
    ) -> Result<WagerReceipt, WagerError> {
        self.advance(now_ms, rng);

        if amount == 0 || amount < self.config.min_wager {
            return Err(WagerError::Validation(format!(
                "minimum wager is {}",
                self.config.min_wager
            )));
        }
        if amount > self.config.max_wager {
            return Err(WagerError::Validation(format!(
                "maximum wager is {}",
                self.config.max_wager
            )));
        }
        match self.status() {
            RoundStatus::Idle if self.paused => return Err(WagerError::NoActiveRound),
            RoundStatus::Idle | RoundStatus::Open => {}
            status => return Err(WagerError::RoundNotAcceptingWagers { status }),
        }

        let (existing, participants, pot) = match &self.current {
            Some(round) => (round.stake_of(account), round.participants(), round.pot),
            None => (None, 0, 0),
        };
        if existing.is_none() && participants >= self.config.max_participants {
            return Err(WagerError::TableFull {
                max: self.config.max_participants,
            });
        }
        let pot = pot
            .checked_add(amount)
            .ok_or_else(|| WagerError::Validation("pot would overflow".into()))?;

        let balance = self.ledger.debit(account, amount)?;

        // Funds are committed; nothing below can fail.
        let id = self.next_round_id;
        if self.current.is_none() {
            self.next_round_id += 1;
            info!(round = id, "round opened");
        }
        let round = self.current.get_or_insert_with(|| Round::new(id, now_ms));
        let stake = match round.wagers.iter_mut().find(|w| w.account == account) {
            Some(wager) => {
                wager.amount += amount;
                wager.amount
            }
            None => {
                round.wagers.push(Wager {
                    account,
                    amount,
                    placed_at_ms: now_ms,
                });
                amount
            }
        };
        round.pot = pot;
        if round.participants() >= 2 && round.countdown_ends_at_ms.is_none() {
            let ends_at = now_ms.saturating_add(self.config.countdown_ms);
            round.countdown_ends_at_ms = Some(ends_at);
            info!(round = round.id, ends_at, "countdown started");
        }
        let receipt = WagerReceipt {
            round_id: round.id,
            stake,
            pot,
            participants: round.participants(),
            balance,
        };
        debug!(round = receipt.round_id, account, amount, stake, pot, "wager accepted");
        self.events.push(Event::BalanceChanged { account, balance });
        self.sync();
        Ok(receipt)
    }

    /// Apply every transition due at `now_ms`.
    pub fn advance(&mut self, now_ms: u64, rng: &mut impl RngCore) {
        while self.step(now_ms, rng) {}
    }

    /// Apply at most one transition. Returns whether one happened.
    pub fn step(&mut self, now_ms: u64, rng: &mut impl RngCore) -> bool {
        let Some(round) = self.current.as_ref() else {
            return false;
        };
        let deadline_passed = self.deadline_ms.is_some_and(|deadline| now_ms >= deadline);
        match round.status {
            RoundStatus::Open => {
                let expired = round
                    .countdown_ends_at_ms
                    .is_some_and(|ends_at| now_ms >= ends_at);
                if !expired {
                    return false;
                }
                self.lock(now_ms);
            }
            RoundStatus::Locked => self.draw(now_ms, rng),
            RoundStatus::Drawing => {
                if !deadline_passed {
                    return false;
                }
                self.set_status(RoundStatus::Settling);
            }
            RoundStatus::Settling => self.settle(now_ms),
            RoundStatus::Cooldown => {
                if !deadline_passed {
                    return false;
                }
                self.finish(RoundOutcome::Settled);
            }
            RoundStatus::Idle => return false,
        }
        true
    }

    fn set_status(&mut self, status: RoundStatus) {
        if let Some(round) = self.current.as_mut() {
            debug!(round = round.id, from = round.status.as_str(), to = status.as_str(), "round transition");
            round.status = status;
        }
        self.sync();
    }

    fn lock(&mut self, now_ms: u64) {
        let Some(round) = self.current.as_mut() else {
            return;
        };
        round.locked_at_ms = Some(now_ms);
        if !round.pot_matches_wagers() {
            let detail = format!(
                "pot {} does not match wagers {:?} at lock",
                round.pot,
                round.wager_total()
            );
            self.freeze(detail);
            return;
        }
        info!(round = round.id, pot = round.pot, participants = round.participants(), "round locked");
        self.set_status(RoundStatus::Locked);
    }

    fn draw(&mut self, now_ms: u64, rng: &mut impl RngCore) {
        let Some(round) = self.current.as_mut() else {
            return;
        };
        match draw::draw(&round.wagers, rng) {
            Ok(draw) => {
                round.winner = Some(draw.winner);
                round.draw_value = Some(draw.value);
                info!(round = round.id, winner = draw.winner, value = draw.value, pot = draw.pot, "winner drawn");
                self.events.push(Event::DrawStarted {
                    round_id: round.id,
                    pot: draw.pot,
                    participants: round.tape(),
                    winner: draw.winner,
                    draw_value: draw.value,
                });
                self.deadline_ms = Some(now_ms.saturating_add(self.config.reveal_ms));
                self.set_status(RoundStatus::Drawing);
            }
            Err(abort) => self.cancel(format!("{abort:?}")),
        }
    }

    fn settle(&mut self, now_ms: u64) {
        let Some(round) = self.current.as_mut() else {
            return;
        };
        match settlement::settle(&self.ledger, &self.config.settlement, round) {
            Ok(settlement) => {
                let round_id = round.id;
                if let Some(err) = &settlement.rake_error {
                    self.owe(round_id, HOUSE_ACCOUNT, settlement.payout.rake, "rake", err);
                }
                self.events.push(Event::RoundSettled {
                    round_id,
                    winner: settlement.winner,
                    payout: settlement.payout.payout,
                    rake: settlement.payout.rake,
                });
                self.events.push(Event::BalanceChanged {
                    account: settlement.winner,
                    balance: settlement.winner_balance,
                });
                match (settlement.referral, settlement.referrer_balance) {
                    (Some(referral), Some(balance)) => {
                        self.events.push(Event::ReferralCredited {
                            round_id,
                            referrer: referral.referrer,
                            amount: referral.amount,
                        });
                        self.events.push(Event::BalanceChanged {
                            account: referral.referrer,
                            balance,
                        });
                    }
                    (Some(referral), None) => {
                        self.pending_referrals.push(PendingReferral { round_id, referral });
                    }
                    _ => {}
                }
                self.deadline_ms = Some(now_ms.saturating_add(self.config.cooldown_ms));
                self.set_status(RoundStatus::Cooldown);
            }
            Err(err) => self.freeze(err.to_string()),
        }
    }

    /// Archive the current round and return to idle.
    fn finish(&mut self, outcome: RoundOutcome) {
        let Some(mut round) = self.current.take() else {
            return;
        };
        round.outcome = outcome;
        self.archive.store(&round);
        self.deadline_ms = None;
        info!(round = round.id, outcome = ?outcome, "round archived");
        self.sync();
    }

    fn freeze(&mut self, detail: String) {
        let Some(round) = self.current.as_ref() else {
            return;
        };
        error!(round = round.id, pot = round.pot, %detail, "round frozen");
        self.events.push(Event::InvariantViolated {
            scope: format!("round:{}", round.id),
            detail,
        });
        self.paused = true;
        self.finish(RoundOutcome::Frozen);
    }

    /// Refund every wager and archive the round as cancelled.
    fn cancel(&mut self, reason: String) {
        let Some(round) = self.current.as_ref() else {
            return;
        };
        let round_id = round.id;
        let wagers = round.wagers.clone();
        for wager in wagers {
            match self.ledger.credit(wager.account, wager.amount) {
                Ok(balance) => self.events.push(Event::BalanceChanged {
                    account: wager.account,
                    balance,
                }),
                Err(err) => self.owe(round_id, wager.account, wager.amount, "refund", &err),
            }
        }
        warn!(round = round_id, %reason, "round cancelled");
        self.events.push(Event::RoundCancelled { round_id, reason });
        self.finish(RoundOutcome::Cancelled);
    }

    /// Record a credit the ledger refused and pause the table until it is
    /// reconciled.
    fn owe(
        &mut self,
        round_id: u64,
        account: AccountId,
        amount: u64,
        what: &str,
        err: &LedgerError,
    ) {
        error!(round = round_id, account, amount, ?err, "{what} credit failed");
        self.events.push(Event::InvariantViolated {
            scope: format!("round:{round_id}"),
            detail: format!("{what} of {amount} to account {account} failed: {err}"),
        });
        self.owed.push(OwedCredit {
            round_id,
            account,
            amount,
        });
        self.pause();
    }

    /// Cancel the current round if it is still open, refunding every wager.
    pub fn cancel_open_round(&mut self, reason: &str) -> bool {
        if self.status() != RoundStatus::Open {
            return false;
        }
        self.cancel(reason.to_string());
        true
    }

    /// Retry owed credits, then referral bonuses whose payment failed at
    /// settlement. Returns how many are still outstanding.
    pub fn retry_pending(&mut self) -> usize {
        for credit in std::mem::take(&mut self.owed) {
            match self.ledger.credit(credit.account, credit.amount) {
                Ok(balance) => {
                    info!(
                        round = credit.round_id,
                        account = credit.account,
                        amount = credit.amount,
                        "owed credit applied"
                    );
                    self.events.push(Event::BalanceChanged {
                        account: credit.account,
                        balance,
                    });
                }
                Err(err) => {
                    debug!(
                        round = credit.round_id,
                        account = credit.account,
                        ?err,
                        "owed credit still failing"
                    );
                    self.owed.push(credit);
                }
            }
        }

        let pending = std::mem::take(&mut self.pending_referrals);
        for mut entry in pending {
            match settlement::retry_referral(&self.ledger, entry.round_id, &mut entry.referral) {
                Ok(Some(balance)) => {
                    self.events.push(Event::ReferralCredited {
                        round_id: entry.round_id,
                        referrer: entry.referral.referrer,
                        amount: entry.referral.amount,
                    });
                    self.events.push(Event::BalanceChanged {
                        account: entry.referral.referrer,
                        balance,
                    });
                    self.record_referral(entry.round_id, entry.referral);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(round = entry.round_id, ?err, "referral still failing");
                    self.pending_referrals.push(entry);
                }
            }
        }
        self.outstanding()
    }

    fn record_referral(&mut self, round_id: u64, referral: ReferralRecord) {
        if let Some(round) = self.current.as_mut().filter(|round| round.id == round_id) {
            round.referral = Some(referral);
            return;
        }
        if let Some(mut round) = self.archive.get(round_id) {
            round.referral = Some(referral);
            self.archive.store(&round);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{archive::Memory, settlement::RakePolicy};
    use jackpot_types::HOUSE_ACCOUNT;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    const CONFIG: RoundConfig = RoundConfig {
        countdown_ms: 15_000,
        reveal_ms: 5_000,
        cooldown_ms: 8_000,
        min_wager: 1,
        max_wager: u64::MAX,
        max_participants: 4,
        settlement: SettlementConfig {
            policy: RakePolicy::ProfitOnly,
            rake_bps: 500,
            referral_bps: 100,
        },
    };

    fn setup(balances: &[(AccountId, u64)]) -> (RoundController<Memory>, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::new());
        for (account, balance) in balances {
            ledger.open_account(*account, None);
            ledger.credit(*account, *balance).unwrap();
        }
        let controller = RoundController::new(CONFIG, ledger.clone(), Memory::new(16));
        (controller, ledger)
    }

    #[test]
    fn test_config_validate() {
        assert!(CONFIG.validate().is_ok());
        assert!(RoundConfig { countdown_ms: 0, ..CONFIG }.validate().is_err());
        assert!(RoundConfig { cooldown_ms: 0, ..CONFIG }.validate().is_err());
        assert!(RoundConfig { min_wager: 0, ..CONFIG }.validate().is_err());
        assert!(RoundConfig { max_wager: 0, ..CONFIG }.validate().is_err());
        assert!(RoundConfig { max_participants: 1, ..CONFIG }.validate().is_err());
        let mut bad_rake = CONFIG;
        bad_rake.settlement.rake_bps = 10_001;
        assert!(bad_rake.validate().is_err());
    }

    #[test]
    fn test_countdown_starts_with_second_participant() {
        let (mut controller, _) = setup(&[(1, 100), (2, 100)]);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(controller.status(), RoundStatus::Idle);

        let receipt = controller.place_wager(1, 10, 1_000, &mut rng).unwrap();
        assert_eq!(receipt.round_id, 1);
        assert_eq!(controller.status(), RoundStatus::Open);
        assert_eq!(controller.current().unwrap().countdown_ends_at_ms, None);
        // A lone participant waits indefinitely.
        controller.advance(1_000_000, &mut rng);
        assert_eq!(controller.status(), RoundStatus::Open);

        controller.place_wager(2, 10, 1_000_500, &mut rng).unwrap();
        assert_eq!(
            controller.current().unwrap().countdown_ends_at_ms,
            Some(1_015_500)
        );
        assert_eq!(controller.seconds_remaining(1_001_000), Some(15));
        assert_eq!(controller.seconds_remaining(1_015_400), Some(1));
    }

    #[test]
    fn test_same_account_wagers_merge() {
        let (mut controller, ledger) = setup(&[(1, 100)]);
        let mut rng = StdRng::seed_from_u64(1);
        controller.place_wager(1, 5, 0, &mut rng).unwrap();
        let receipt = controller.place_wager(1, 7, 10, &mut rng).unwrap();
        assert_eq!(receipt.stake, 12);
        assert_eq!(receipt.participants, 1);
        let round = controller.current().unwrap();
        assert_eq!(round.wagers.len(), 1);
        assert_eq!(round.wagers[0].amount, 12);
        assert_eq!(round.pot, 12);
        // Merging does not count as a second participant.
        assert_eq!(round.countdown_ends_at_ms, None);
        assert_eq!(ledger.balance(1).unwrap(), 88);
    }

    #[test]
    fn test_insufficient_funds_changes_nothing() {
        let (mut controller, ledger) = setup(&[(1, 5)]);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            controller.place_wager(1, 6, 0, &mut rng),
            Err(WagerError::InsufficientFunds {
                balance: 5,
                requested: 6
            })
        );
        assert_eq!(controller.status(), RoundStatus::Idle);
        assert!(controller.take_events().is_empty());
        assert_eq!(ledger.balance(1).unwrap(), 5);
        // The failed attempt did not consume a round id.
        assert_eq!(controller.place_wager(1, 5, 0, &mut rng).unwrap().round_id, 1);
    }

    #[test]
    fn test_validation() {
        let (mut controller, _) = setup(&[(1, 100)]);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            controller.place_wager(1, 0, 0, &mut rng),
            Err(WagerError::Validation(_))
        ));
        assert!(matches!(
            controller.place_wager(9, 1, 0, &mut rng),
            Err(WagerError::Ledger(crate::LedgerError::UnknownAccount(9)))
        ));
    }

    #[test]
    fn test_table_full() {
        let accounts: Vec<_> = (1..=5).map(|id| (id, 100)).collect();
        let (mut controller, _) = setup(&accounts);
        let mut rng = StdRng::seed_from_u64(1);
        for id in 1..=4 {
            controller.place_wager(id, 1, 0, &mut rng).unwrap();
        }
        assert_eq!(
            controller.place_wager(5, 1, 0, &mut rng),
            Err(WagerError::TableFull { max: 4 })
        );
        // Existing participants may still add to their stake.
        controller.place_wager(4, 1, 0, &mut rng).unwrap();
    }

    #[test]
    fn test_full_lifecycle_conserves_money() {
        let (mut controller, ledger) = setup(&[(1, 1_000), (2, 1_000)]);
        let total = ledger.total_balance();
        let mut rng = StdRng::seed_from_u64(7);
        controller.place_wager(1, 800, 0, &mut rng).unwrap();
        controller.place_wager(2, 200, 0, &mut rng).unwrap();
        controller.take_events();

        controller.advance(15_000, &mut rng);
        assert_eq!(controller.status(), RoundStatus::Drawing);
        let round = controller.current().unwrap();
        assert_eq!(round.pot, 1_000);
        assert_eq!(round.locked_at_ms, Some(15_000));
        let winner = round.winner.unwrap();
        let events = controller.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::DrawStarted { winner: w, pot: 1_000, .. } if *w == winner)));

        controller.advance(20_000, &mut rng);
        assert_eq!(controller.status(), RoundStatus::Cooldown);
        let round = controller.current().unwrap();
        assert_eq!(round.payout + round.rake, 1_000);
        assert_eq!(ledger.total_balance(), total);
        assert_eq!(ledger.balance(HOUSE_ACCOUNT).unwrap(), round.rake);

        controller.advance(28_000, &mut rng);
        assert_eq!(controller.status(), RoundStatus::Idle);
        let archived = controller.archive().get(1).unwrap();
        assert_eq!(archived.outcome, RoundOutcome::Settled);
        assert_eq!(archived.winner, Some(winner));

        // The next wager opens round 2.
        assert_eq!(controller.place_wager(1, 1, 30_000, &mut rng).unwrap().round_id, 2);
    }

    #[test]
    fn test_wagers_rejected_after_lock() {
        let (mut controller, ledger) = setup(&[(1, 100), (2, 100), (3, 100)]);
        let mut rng = StdRng::seed_from_u64(3);
        controller.place_wager(1, 10, 0, &mut rng).unwrap();
        controller.place_wager(2, 10, 0, &mut rng).unwrap();

        // A wager landing exactly on expiry sees the locked round.
        assert_eq!(
            controller.place_wager(3, 5, 15_000, &mut rng),
            Err(WagerError::RoundNotAcceptingWagers {
                status: RoundStatus::Drawing
            })
        );
        assert_eq!(controller.current().unwrap().pot, 20);
        assert_eq!(ledger.balance(3).unwrap(), 100);

        // Settling is transient: the wager's own advance carries it to cooldown.
        assert!(controller.step(20_000, &mut rng));
        assert_eq!(controller.status(), RoundStatus::Settling);
        assert_eq!(
            controller.place_wager(3, 5, 20_000, &mut rng),
            Err(WagerError::RoundNotAcceptingWagers {
                status: RoundStatus::Cooldown
            })
        );
        assert_eq!(controller.current().unwrap().pot, 20);
        assert_eq!(ledger.balance(3).unwrap(), 100);

        assert_eq!(
            controller.place_wager(3, 5, 27_999, &mut rng),
            Err(WagerError::RoundNotAcceptingWagers {
                status: RoundStatus::Cooldown
            })
        );
        assert_eq!(ledger.balance(3).unwrap(), 100);

        // Cooldown over: the same wager opens the next round.
        let receipt = controller.place_wager(3, 5, 28_000, &mut rng).unwrap();
        assert_eq!(receipt.round_id, 2);
        assert_eq!(receipt.pot, 5);
    }

    #[test]
    fn test_cancel_open_round_refunds() {
        let (mut controller, ledger) = setup(&[(1, 100), (2, 100)]);
        let mut rng = StdRng::seed_from_u64(1);
        controller.place_wager(1, 30, 0, &mut rng).unwrap();
        controller.place_wager(2, 20, 0, &mut rng).unwrap();
        controller.take_events();

        assert!(controller.cancel_open_round("shutdown"));
        assert_eq!(controller.status(), RoundStatus::Idle);
        assert_eq!(ledger.balance(1).unwrap(), 100);
        assert_eq!(ledger.balance(2).unwrap(), 100);
        assert_eq!(
            controller.archive().get(1).unwrap().outcome,
            RoundOutcome::Cancelled
        );
        let events = controller.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::RoundCancelled { round_id: 1, .. })));
        assert!(!controller.cancel_open_round("again"));
    }

    #[test]
    fn test_refused_refund_is_owed() {
        let (mut controller, ledger) = setup(&[(1, 100), (2, 100)]);
        let total = ledger.total_balance();
        let mut rng = StdRng::seed_from_u64(1);
        controller.place_wager(1, 30, 0, &mut rng).unwrap();
        controller.place_wager(2, 20, 0, &mut rng).unwrap();
        ledger.freeze(2).unwrap();
        controller.take_events();

        assert!(controller.cancel_open_round("shutdown"));
        assert_eq!(ledger.balance(1).unwrap(), 100);
        assert_eq!(ledger.balance(2).unwrap(), 80);
        assert!(controller.is_paused());
        assert_eq!(controller.outstanding(), 1);
        assert_eq!(ledger.total_balance() + controller.owed(), total);
        let events = controller.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::InvariantViolated { scope, .. } if scope == "round:1"
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::RoundCancelled { round_id: 1, .. })));

        // Still frozen.
        assert_eq!(controller.retry_pending(), 1);
        assert_eq!(ledger.balance(2).unwrap(), 80);

        ledger.unfreeze(2).unwrap();
        assert_eq!(controller.retry_pending(), 0);
        assert_eq!(ledger.balance(2).unwrap(), 100);
        assert_eq!(controller.owed(), 0);
        assert_eq!(ledger.total_balance(), total);
        assert!(controller
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::BalanceChanged { account: 2, balance: 100 })));
    }

    #[test]
    fn test_refused_rake_is_owed() {
        let (mut controller, ledger) = setup(&[(1, 1_000), (2, 1_000)]);
        let total = ledger.total_balance();
        let mut rng = StdRng::seed_from_u64(7);
        controller.place_wager(1, 800, 0, &mut rng).unwrap();
        controller.place_wager(2, 200, 0, &mut rng).unwrap();
        ledger.freeze(HOUSE_ACCOUNT).unwrap();

        controller.advance(15_000, &mut rng);
        controller.advance(20_000, &mut rng);
        // The winner is paid and the round still settles.
        assert_eq!(controller.status(), RoundStatus::Cooldown);
        let rake = controller.current().unwrap().rake;
        assert!(rake > 0);
        assert!(controller.is_paused());
        assert_eq!(controller.owed(), rake as u128);
        assert_eq!(ledger.total_balance() + controller.owed(), total);
        assert!(controller
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::InvariantViolated { .. })));

        ledger.unfreeze(HOUSE_ACCOUNT).unwrap();
        assert_eq!(controller.retry_pending(), 0);
        assert_eq!(ledger.balance(HOUSE_ACCOUNT).unwrap(), rake);
        assert_eq!(ledger.total_balance(), total);

        controller.advance(28_000, &mut rng);
        assert_eq!(
            controller.archive().get(1).unwrap().outcome,
            RoundOutcome::Settled
        );
    }

    #[test]
    fn test_pot_mismatch_freezes_and_pauses() {
        let (mut controller, ledger) = setup(&[(1, 100), (2, 100)]);
        let mut rng = StdRng::seed_from_u64(1);
        controller.place_wager(1, 10, 0, &mut rng).unwrap();
        controller.place_wager(2, 10, 0, &mut rng).unwrap();
        controller.current.as_mut().unwrap().pot += 1;

        controller.advance(15_000, &mut rng);
        assert_eq!(controller.status(), RoundStatus::Idle);
        assert!(controller.is_paused());
        assert_eq!(
            controller.archive().get(1).unwrap().outcome,
            RoundOutcome::Frozen
        );
        // Funds stay debited for reconciliation.
        assert_eq!(ledger.balance(1).unwrap(), 90);
        assert!(controller
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::InvariantViolated { .. })));

        assert_eq!(
            controller.place_wager(1, 10, 16_000, &mut rng),
            Err(WagerError::NoActiveRound)
        );
        controller.resume();
        assert_eq!(
            controller.place_wager(1, 10, 16_000, &mut rng).unwrap().round_id,
            2
        );
    }

    #[test]
    fn test_pending_referral_is_retried() {
        let (mut controller, ledger) = setup(&[]);
        ledger.open_account(9, None);
        ledger.open_account(1, Some(9));
        ledger.open_account(2, Some(9));
        ledger.credit(1, 100).unwrap();
        ledger.credit(2, 100).unwrap();
        ledger.freeze(9).unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        controller.place_wager(1, 100, 0, &mut rng).unwrap();
        controller.place_wager(2, 100, 0, &mut rng).unwrap();
        // The reveal runs from the tick that locked the round.
        controller.advance(15_000, &mut rng);
        assert_eq!(controller.status(), RoundStatus::Drawing);
        controller.advance(20_000, &mut rng);
        assert_eq!(controller.status(), RoundStatus::Cooldown);
        assert_eq!(controller.pending_referrals(), 1);
        assert_eq!(controller.retry_pending(), 1);

        ledger.unfreeze(9).unwrap();
        controller.take_events();
        assert_eq!(controller.retry_pending(), 0);
        let referral = controller.current().unwrap().referral.clone().unwrap();
        assert!(referral.credited);
        assert_eq!(ledger.balance(9).unwrap(), referral.amount);
        assert!(controller
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::ReferralCredited { referrer: 9, .. })));
    }

    #[test]
    fn test_round_ids_continue_after_archive() {
        let ledger = Arc::new(Ledger::new());
        let mut archive = Memory::new(4);
        let mut round = Round::new(41, 0);
        round.outcome = RoundOutcome::Cancelled;
        archive.store(&round);
        ledger.open_account(1, None);
        ledger.credit(1, 10).unwrap();
        let mut controller = RoundController::new(CONFIG, ledger, archive);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(controller.place_wager(1, 1, 0, &mut rng).unwrap().round_id, 42);
    }

    proptest! {
        #[test]
        fn pot_matches_wagers_at_lock(
            wagers in proptest::collection::vec((1u64..=4, 1u64..=50), 2..40),
            seed in any::<u64>(),
        ) {
            let accounts: Vec<_> = (1..=4).map(|id| (id, 10_000)).collect();
            let (mut controller, ledger) = setup(&accounts);
            let total = ledger.total_balance();
            let mut rng = StdRng::seed_from_u64(seed);
            let mut accepted = 0u64;
            for (account, amount) in wagers {
                if controller.place_wager(account, amount, 0, &mut rng).is_ok() {
                    accepted += amount;
                }
            }
            let round = controller.current().unwrap();
            prop_assert_eq!(round.pot, accepted);
            prop_assert!(round.pot_matches_wagers());

            let participants = round.participants();
            controller.advance(15_000, &mut rng);
            if participants >= 2 {
                prop_assert_eq!(controller.status(), RoundStatus::Drawing);
                prop_assert_eq!(controller.current().unwrap().pot, accepted);
            }
            controller.advance(1_000_000, &mut rng);
            // A lone participant's round never locks, so its pot is still held.
            let held = controller.current().map(|round| round.pot).unwrap_or(0);
            prop_assert_eq!(ledger.total_balance() + held as u128, total);
        }
    }
}
