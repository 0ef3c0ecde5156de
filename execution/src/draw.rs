//! Stake-weighted winner selection.

use jackpot_types::{AccountId, Wager};
use rand::{Rng, RngCore};

/// Why a draw could not be made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawAbort {
    EmptyPot,
    NotEnoughParticipants { participants: usize },
    /// The wager amounts overflow a `u64`.
    PotOverflow,
}

/// A completed draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Draw {
    pub winner: AccountId,
    /// Value in `[0, pot)` that selected the winner.
    pub value: u64,
    pub pot: u64,
}

/// Pick the wager whose cumulative range contains `r`.
///
/// Wagers cover consecutive half-open ranges `[cum_prev, cum)` in list order,
/// so every `r < pot` lands in exactly one of them and each wager wins with
/// probability `amount / pot`. Returns `None` if `r >= pot`.
pub fn select(wagers: &[Wager], r: u64) -> Option<AccountId> {
    let mut cumulative = 0u64;
    for wager in wagers {
        cumulative = cumulative.checked_add(wager.amount)?;
        if r < cumulative {
            return Some(wager.account);
        }
    }
    None
}

/// Check that a draw can be made and return the pot.
pub fn drawable_pot(wagers: &[Wager]) -> Result<u64, DrawAbort> {
    let pot = wagers
        .iter()
        .try_fold(0u64, |acc, w| acc.checked_add(w.amount))
        .ok_or(DrawAbort::PotOverflow)?;
    if pot == 0 {
        return Err(DrawAbort::EmptyPot);
    }
    let participants = wagers.iter().filter(|w| w.amount > 0).count();
    if participants < 2 {
        return Err(DrawAbort::NotEnoughParticipants { participants });
    }
    Ok(pot)
}

/// Draw a winner with a uniform value in `[0, pot)`.
pub fn draw(wagers: &[Wager], rng: &mut impl RngCore) -> Result<Draw, DrawAbort> {
    let pot = drawable_pot(wagers)?;
    let value = rng.gen_range(0..pot);
    // Unreachable for value < pot, checked above.
    let winner = select(wagers, value).ok_or(DrawAbort::EmptyPot)?;
    Ok(Draw { winner, value, pot })
}
