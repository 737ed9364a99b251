use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// Sentinel occupying the empty slot of a bye matchup.
pub const BYE: &str = "BYE";

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum MatchupStatus {
    Active,
    Complete,
}

/// One pairing within a round.
///
/// Only `votes_a`, `votes_b`, `winner` and `status` ever change, and only
/// while the matchup is active.
#[derive(PartialEq, Eq, Debug, Clone, FromRow, Serialize)]
pub struct Matchup {
    pub id: i64,
    pub bracket_id: i64,
    pub round: u32,
    pub position: u32,
    pub entry_a: String,
    pub entry_b: String,
    pub votes_a: u32,
    pub votes_b: u32,
    pub winner: Option<String>,
    pub status: MatchupStatus,
}

impl Matchup {
    pub fn is_bye(&self) -> bool {
        self.entry_b == BYE
    }

    pub fn side_of(&self, choice: &str) -> Option<Side> {
        if choice == self.entry_a {
            Some(Side::A)
        } else if choice == self.entry_b {
            Some(Side::B)
        } else {
            None
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Side {
    A,
    B,
}

/// A matchup that has not been written yet.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct MatchupSeed {
    pub round: u32,
    pub position: u32,
    pub entry_a: String,
    pub entry_b: String,
}

impl MatchupSeed {
    pub fn new(round: u32, position: u32, entry_a: String, entry_b: Option<String>) -> Self {
        MatchupSeed {
            round,
            position,
            entry_a,
            entry_b: entry_b.unwrap_or_else(|| BYE.to_owned()),
        }
    }

    pub fn is_bye(&self) -> bool {
        self.entry_b == BYE
    }

    /// Bye matchups are born complete with the present entry advancing.
    pub fn initial_state(&self) -> (MatchupStatus, Option<&str>) {
        if self.is_bye() {
            (MatchupStatus::Complete, Some(&self.entry_a))
        } else {
            (MatchupStatus::Active, None)
        }
    }
}

/// Where the winner of `position` lands in the following round.
///
/// Siblings `2k` and `2k + 1` both feed position `k`, filling side A and
/// side B respectively.
pub fn next_slot(position: u32) -> (u32, Side) {
    let side = if position % 2 == 0 { Side::A } else { Side::B };
    (position / 2, side)
}

/// Majority decision. A tie goes to side A.
pub fn decide(votes_a: u32, votes_b: u32) -> Side {
    if votes_a >= votes_b {
        Side::A
    } else {
        Side::B
    }
}

/// Build the matchups for `round` from the previous round's winners,
/// which must be ordered by position.
pub fn pair_winners(round: u32, winners: Vec<String>) -> Vec<MatchupSeed> {
    let mut seeds: Vec<MatchupSeed> = Vec::with_capacity(winners.len().div_ceil(2));
    for (position, winner) in winners.into_iter().enumerate() {
        let (next_position, side) = next_slot(position as u32);
        match side {
            Side::A => seeds.push(MatchupSeed::new(round, next_position, winner, None)),
            Side::B => {
                if let Some(seed) = seeds.last_mut() {
                    seed.entry_b = winner;
                }
            }
        }
    }
    seeds
}
