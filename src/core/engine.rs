use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};
use sqlx::{Sqlite, Transaction};

use crate::{
    error::{Error, Result},
    integrations::publisher::{PublishRequest, PublisherActor},
};

use super::{
    bracket::{Bracket, BracketStatus, NewBracket},
    db::{self, BracketDb},
    entry::{validate_entry_name, Entry},
    matchup::{decide, pair_winners, Matchup, MatchupStatus, Side},
    membership::MembershipProvider,
    seed::seed_round_one,
    vote::{Tally, TallyDrift, Vote, VoteReceipt},
};

/// Drives brackets from nomination to a winner.
///
/// The engine holds no bracket state of its own. Every mutation runs in one
/// store transaction whose first statement is a guarded write on the row
/// that scopes it, so concurrent callers are serialized by the store and each
/// later read inside the transaction is fresh.
pub struct BracketEngine {
    db: Arc<BracketDb>,
    membership: Arc<dyn MembershipProvider>,
    publisher: PublisherActor,
}

fn phase_error(bracket: &Bracket, expected: BracketStatus) -> Error {
    Error::Phase {
        bracket: bracket.id,
        expected,
        actual: bracket.status,
    }
}

impl BracketEngine {
    pub fn new(
        db: Arc<BracketDb>,
        membership: Arc<dyn MembershipProvider>,
        publisher: PublisherActor,
    ) -> Self {
        BracketEngine {
            db,
            membership,
            publisher,
        }
    }

    pub fn db(&self) -> &BracketDb {
        &self.db
    }

    pub fn membership(&self) -> &dyn MembershipProvider {
        self.membership.as_ref()
    }

    pub async fn create_bracket(&self, bracket: &NewBracket) -> Result<Bracket> {
        let bracket = self.db.create_bracket(bracket).await?;
        log::info!(
            "Opened bracket {} for nominations in conversation {}",
            bracket.id,
            bracket.conversation_id
        );
        Ok(bracket)
    }

    pub async fn get_bracket(&self, bracket_id: i64) -> Result<Bracket> {
        self.db.get_bracket(bracket_id).await
    }

    /// Nominate an option. Only allowed while the bracket is nominating.
    pub async fn add_entry(&self, bracket_id: i64, name: &str, nominator: &str) -> Result<Entry> {
        let name = validate_entry_name(name)?;

        match self.db.insert_entry(bracket_id, &name, nominator).await? {
            Some(entry) => {
                log::debug!("{} nominated '{}' in bracket {}", nominator, name, bracket_id);
                Ok(entry)
            }
            None => {
                let bracket = self.db.get_bracket(bracket_id).await?;
                log::debug!("Rejected nomination for bracket {}: {}", bracket_id, bracket.status);
                Err(phase_error(&bracket, BracketStatus::Nominating))
            }
        }
    }

    /// Close nominations and lay out round 1.
    pub async fn lock_and_seed(&self, bracket_id: i64) -> Result<Vec<Matchup>> {
        self.lock_and_seed_with(bracket_id, StdRng::from_entropy()).await
    }

    pub async fn lock_and_seed_with<R: Rng + Send>(
        &self,
        bracket_id: i64,
        mut rng: R,
    ) -> Result<Vec<Matchup>> {
        let mut tx = self.db.begin().await?;

        if !db::claim_nominating(&mut *tx, bracket_id).await? {
            tx.rollback().await?;
            let bracket = self.db.get_bracket(bracket_id).await?;
            log::debug!("Bracket {} already locked ({})", bracket_id, bracket.status);
            return Err(phase_error(&bracket, BracketStatus::Nominating));
        }

        let entries = db::fetch_entries(&mut *tx, bracket_id).await?;
        if entries.len() < 2 {
            tx.rollback().await?;
            return Err(Error::InsufficientEntries(entries.len()));
        }

        let count = entries.len();
        let seeds = seed_round_one(entries.into_iter().map(|e| e.name).collect(), &mut rng);
        db::insert_matchups(&mut *tx, bracket_id, &seeds).await?;
        let matchups = db::fetch_round(&mut *tx, bracket_id, 1).await?;
        tx.commit().await?;

        log::info!(
            "Locked bracket {} with {} entries into {} matchups",
            bracket_id,
            count,
            matchups.len()
        );
        Ok(matchups)
    }

    /// Record a vote and advance the bracket if it completed quorum.
    pub async fn cast_vote(&self, matchup_id: i64, user_id: &str, choice: &str) -> Result<VoteReceipt> {
        // Membership is read before the transaction so the write guard is never
        // held while waiting on another connection.
        let bracket_id = self.db.get_matchup(matchup_id).await?.bracket_id;
        let eligible = self.membership.eligible_voter_count(bracket_id).await?;

        let mut tx = self.db.begin().await?;

        if !db::claim_active_matchup(&mut *tx, matchup_id).await? {
            return Err(match db::fetch_matchup(&mut *tx, matchup_id).await? {
                None => Error::not_found("matchup", matchup_id),
                Some(_) => Error::InactiveMatchup(matchup_id),
            });
        }

        let matchup = db::fetch_matchup(&mut *tx, matchup_id)
            .await?
            .ok_or_else(|| Error::not_found("matchup", matchup_id))?;

        let duplicate = || Error::DuplicateVote {
            matchup: matchup_id,
            user: user_id.to_owned(),
        };
        if db::has_voted(&mut *tx, matchup_id, user_id).await? {
            log::debug!("{} already voted on matchup {}", user_id, matchup_id);
            return Err(duplicate());
        }

        let side = matchup.side_of(choice).ok_or_else(|| Error::InvalidChoice {
            matchup: matchup_id,
            choice: choice.to_owned(),
        })?;

        let vote = match db::insert_vote(&mut *tx, matchup_id, user_id, choice).await {
            Ok(vote) => vote,
            Err(e) if Error::is_unique_violation(&e) => return Err(duplicate()),
            Err(e) => return Err(e.into()),
        };
        db::increment_tally(&mut *tx, matchup_id, side).await?;

        let votes = db::fetch_votes(&mut *tx, matchup_id).await?;
        let outcome = if votes.len() as u64 >= u64::from(eligible) {
            resolve(&mut tx, &matchup, &votes).await?
        } else {
            Outcome::default()
        };

        tx.commit().await?;
        self.announce(matchup.bracket_id, &outcome);

        Ok(VoteReceipt {
            vote,
            matchup_winner: outcome.matchup_winner,
            advanced_to_round: outcome.advanced_to_round,
            bracket_winner: outcome.bracket_winner,
        })
    }

    /// Remove a member from a group and settle any open matchup that the
    /// remaining members have already fully voted on.
    pub async fn leave_group(&self, group_id: &str, user_id: &str) -> Result<bool> {
        if !self.db.leave_group(group_id, user_id).await? {
            return Ok(false);
        }

        for matchup_id in self.db.get_open_matchups_in_group(group_id).await? {
            self.settle(matchup_id).await?;
        }
        Ok(true)
    }

    /// Resolve an active matchup if its votes already meet the current quorum.
    async fn settle(&self, matchup_id: i64) -> Result<()> {
        let bracket_id = self.db.get_matchup(matchup_id).await?.bracket_id;
        let eligible = self.membership.eligible_voter_count(bracket_id).await?;

        let mut tx = self.db.begin().await?;
        if !db::claim_active_matchup(&mut *tx, matchup_id).await? {
            tx.rollback().await?;
            return Ok(());
        }

        let matchup = db::fetch_matchup(&mut *tx, matchup_id)
            .await?
            .ok_or_else(|| Error::not_found("matchup", matchup_id))?;
        let votes = db::fetch_votes(&mut *tx, matchup_id).await?;

        // A matchup nobody voted on is never decided by departures alone.
        if votes.is_empty() || (votes.len() as u64) < u64::from(eligible) {
            tx.rollback().await?;
            return Ok(());
        }

        let outcome = resolve(&mut tx, &matchup, &votes).await?;
        tx.commit().await?;
        self.announce(bracket_id, &outcome);
        Ok(())
    }

    fn announce(&self, bracket_id: i64, outcome: &Outcome) {
        if let Some(winner) = &outcome.bracket_winner {
            self.publisher.send(PublishRequest::Publish {
                bracket_id,
                winner: winner.clone(),
            });
        }
    }

    pub async fn list_entries(&self, bracket_id: i64) -> Result<Vec<Entry>> {
        self.db.get_bracket(bracket_id).await?;
        self.db.get_entries(bracket_id).await
    }

    pub async fn list_matchups(&self, bracket_id: i64) -> Result<Vec<Matchup>> {
        self.db.get_bracket(bracket_id).await?;
        self.db.get_matchups(bracket_id).await
    }

    pub async fn list_votes(&self, matchup_id: i64) -> Result<Vec<Vote>> {
        self.db.get_matchup(matchup_id).await?;
        self.db.get_votes(matchup_id).await
    }

    /// Compare every matchup's cached counters with its vote ledger.
    pub async fn audit_tallies(&self, bracket_id: i64) -> Result<Vec<TallyDrift>> {
        let mut drift = vec![];
        for matchup in self.list_matchups(bracket_id).await? {
            if matchup.is_bye() {
                continue;
            }

            let votes = self.db.get_votes(matchup.id).await?;
            let counted = Tally::count(&matchup, &votes);
            let cached = Tally::cached(&matchup);
            if counted != cached {
                drift.push(TallyDrift {
                    matchup_id: matchup.id,
                    cached,
                    counted,
                });
            }
        }
        Ok(drift)
    }

    /// Rewrite drifted counters of active matchups from the ledger. Complete
    /// matchups are left untouched and only reported by the audit.
    pub async fn repair_tallies(&self, bracket_id: i64) -> Result<Vec<TallyDrift>> {
        let mut repaired = vec![];
        for drift in self.audit_tallies(bracket_id).await? {
            if let Some(counted) = self.db.recount_active_tally(drift.matchup_id).await? {
                log::warn!(
                    "Repaired tally of matchup {}: {:?} -> {:?}",
                    drift.matchup_id,
                    drift.cached,
                    counted
                );
                repaired.push(TallyDrift { counted, ..drift });
            }
        }
        Ok(repaired)
    }
}

/// What settling one matchup changed.
#[derive(Default)]
struct Outcome {
    matchup_winner: Option<String>,
    advanced_to_round: Option<u32>,
    bracket_winner: Option<String>,
}

/// Settle a matchup that reached quorum, then advance or finish the
/// bracket if that was the last open matchup of its round.
async fn resolve(
    tx: &mut Transaction<'static, Sqlite>,
    matchup: &Matchup,
    votes: &[Vote],
) -> Result<Outcome> {
    let mut outcome = Outcome::default();
    let tally = Tally::count(matchup, votes);
    let winner = match decide(tally.votes_a, tally.votes_b) {
        Side::A => matchup.entry_a.clone(),
        Side::B => matchup.entry_b.clone(),
    };

    if !db::resolve_matchup(&mut **tx, matchup.id, tally, &winner).await? {
        return Ok(outcome);
    }
    log::info!(
        "Matchup {} (round {}) won by '{}' {}-{}",
        matchup.id,
        matchup.round,
        winner,
        tally.votes_a,
        tally.votes_b
    );
    outcome.matchup_winner = Some(winner);

    // Re-read the round inside this transaction; a snapshot from before
    // the write would let two finishing matchups both advance it.
    let round = db::fetch_round(&mut **tx, matchup.bracket_id, matchup.round).await?;
    if round.iter().any(|m| m.status != MatchupStatus::Complete) {
        return Ok(outcome);
    }

    let winners: Vec<String> = round.into_iter().filter_map(|m| m.winner).collect();

    if let [champion] = winners.as_slice() {
        if db::complete_bracket(&mut **tx, matchup.bracket_id, champion).await? {
            log::info!("Bracket {} complete, winner '{}'", matchup.bracket_id, champion);
            outcome.bracket_winner = Some(champion.clone());
        }
        return Ok(outcome);
    }

    let next_round = matchup.round + 1;
    let seeds = pair_winners(next_round, winners);
    if db::insert_matchups(&mut **tx, matchup.bracket_id, &seeds).await? > 0 {
        log::info!(
            "Bracket {} advanced to round {} with {} matchups",
            matchup.bracket_id,
            next_round,
            seeds.len()
        );
        outcome.advanced_to_round = Some(next_round);
    }

    Ok(outcome)
}

#[cfg(test)]
pub mod test_support {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Membership with a settable voter count.
    pub struct FixedMembership(pub AtomicU32);

    impl FixedMembership {
        pub fn new(voters: u32) -> Arc<Self> {
            Arc::new(FixedMembership(AtomicU32::new(voters)))
        }

        pub fn set(&self, voters: u32) {
            self.0.store(voters, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MembershipProvider for FixedMembership {
        async fn eligible_voter_count(&self, _bracket_id: i64) -> anyhow::Result<u32> {
            Ok(self.0.load(Ordering::SeqCst))
        }

        async fn is_member(&self, _bracket_id: i64, _user_id: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }
}
