use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::time};

use crate::util::serialize_timestamp;

use super::matchup::{Matchup, Side};

/// One voter's pick in one matchup. Never updated or deleted.
#[derive(PartialEq, Eq, Debug, Clone, FromRow, Serialize)]
pub struct Vote {
    pub id: i64,
    pub matchup_id: i64,
    pub user_id: String,
    pub choice: String,

    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: time::OffsetDateTime,
}

/// Vote counts derived from the ledger.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Tally {
    pub votes_a: u32,
    pub votes_b: u32,
}

impl Tally {
    /// Recount a matchup from its votes.
    pub fn count(matchup: &Matchup, votes: &[Vote]) -> Self {
        votes
            .iter()
            .fold(Tally::default(), |mut tally, vote| {
                match matchup.side_of(&vote.choice) {
                    Some(Side::A) => tally.votes_a += 1,
                    Some(Side::B) => tally.votes_b += 1,
                    None => log::warn!(
                        "Vote {} names '{}', which is not in matchup {}",
                        vote.id,
                        vote.choice,
                        matchup.id
                    ),
                }
                tally
            })
    }

    pub fn cached(matchup: &Matchup) -> Self {
        Tally {
            votes_a: matchup.votes_a,
            votes_b: matchup.votes_b,
        }
    }
}

/// A matchup whose cached counters disagree with its votes.
#[derive(PartialEq, Eq, Debug, Clone, Serialize)]
pub struct TallyDrift {
    pub matchup_id: i64,
    pub cached: Tally,
    pub counted: Tally,
}

/// Outcome of a successful vote.
#[derive(PartialEq, Eq, Debug, Clone, Serialize)]
pub struct VoteReceipt {
    pub vote: Vote,

    /// Winner of the matchup, if this vote reached quorum
    pub matchup_winner: Option<String>,

    /// The round created because this vote finished the previous one
    pub advanced_to_round: Option<u32>,

    /// Winner of the bracket, if this vote finished it
    pub bracket_winner: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::matchup::MatchupStatus;

    fn vote(id: i64, choice: &str) -> Vote {
        Vote {
            id,
            matchup_id: 1,
            user_id: format!("user-{}", id),
            choice: choice.to_owned(),
            created_at: time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_count() {
        let matchup = Matchup {
            id: 1,
            bracket_id: 1,
            round: 1,
            position: 0,
            entry_a: "Cats".to_owned(),
            entry_b: "Dogs".to_owned(),
            votes_a: 9,
            votes_b: 0,
            winner: None,
            status: MatchupStatus::Active,
        };
        let votes = vec![vote(1, "Cats"), vote(2, "Dogs"), vote(3, "Dogs"), vote(4, "Fish")];

        let tally = Tally::count(&matchup, &votes);
        assert_eq!(tally, Tally { votes_a: 1, votes_b: 2 });
        assert_ne!(Tally::cached(&matchup), tally);
    }
}
