use commonware_codec::{DecodeExt, Encode};
use jackpot_types::Round;
use std::collections::BTreeMap;
use tracing::warn;

/// Storage for rounds once they return to idle.
pub trait RoundArchive: Send + 'static {
    fn store(&mut self, round: &Round);
    fn get(&self, id: u64) -> Option<Round>;
    /// Most recent rounds, newest first.
    fn recent(&self, limit: usize) -> Vec<Round>;
}

/// Keeps the last `capacity` rounds in memory, codec-encoded as they would
/// be on disk.
pub struct Memory {
    rounds: BTreeMap<u64, Vec<u8>>,
    capacity: usize,
}

impl Memory {
    pub fn new(capacity: usize) -> Self {
        Self {
            rounds: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    fn decode(id: u64, bytes: &[u8]) -> Option<Round> {
        match Round::decode(bytes) {
            Ok(round) => Some(round),
            Err(err) => {
                warn!(round = id, ?err, "archived round failed to decode");
                None
            }
        }
    }
}

impl RoundArchive for Memory {
    fn store(&mut self, round: &Round) {
        self.rounds.insert(round.id, round.encode().to_vec());
        while self.rounds.len() > self.capacity {
            self.rounds.pop_first();
        }
    }

    fn get(&self, id: u64) -> Option<Round> {
        self.rounds
            .get(&id)
            .and_then(|bytes| Self::decode(id, bytes))
    }

    fn recent(&self, limit: usize) -> Vec<Round> {
        self.rounds
            .iter()
            .rev()
            .take(limit)
            .filter_map(|(id, bytes)| Self::decode(*id, bytes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jackpot_types::{RoundOutcome, Wager};

    fn round(id: u64) -> Round {
        let mut round = Round::new(id, id * 1_000);
        round.wagers.push(Wager {
            account: id,
            amount: 5,
            placed_at_ms: id * 1_000,
        });
        round.pot = 5;
        round.outcome = RoundOutcome::Cancelled;
        round
    }

    #[test]
    fn test_memory_evicts_oldest() {
        let mut archive = Memory::new(2);
        for id in 1..=3 {
            archive.store(&round(id));
        }
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.get(1), None);
        assert_eq!(archive.get(3), Some(round(3)));
        let recent: Vec<u64> = archive.recent(10).iter().map(|r| r.id).collect();
        assert_eq!(recent, vec![3, 2]);
        assert_eq!(archive.recent(1).len(), 1);
    }
}
