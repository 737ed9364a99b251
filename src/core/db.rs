use std::{path::Path, time::Duration};

use sqlx::{
    query,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    types::time::OffsetDateTime,
    Executor, Sqlite, SqlitePool, Transaction,
};

use crate::error::{Error, Result};

use super::{
    bracket::{Bracket, BracketStatus, NewBracket},
    entry::Entry,
    matchup::{Matchup, MatchupSeed, MatchupStatus, Side},
    settings::Settings,
    vote::{Tally, Vote},
};

const SCHEMA: [&str; 11] = [
    "create table brackets(
            id integer primary key autoincrement,
            group_id text not null,
            conversation_id text not null,
            parent_conversation_id text,
            question text,
            status text not null,
            winner text,
            created_by text not null,
            created_at text not null,
            result_posted_at text
        );",
    "create table entries(
            id integer primary key autoincrement,
            bracket_id integer not null,
            name text not null,
            nominated_by text not null,
            created_at text not null,
            foreign key(bracket_id) references brackets(id) on delete cascade
        );",
    "create index entries_by_bracket on entries(bracket_id);",
    "create table matchups(
            id integer primary key autoincrement,
            bracket_id integer not null,
            round integer not null,
            position integer not null,
            entry_a text not null,
            entry_b text not null,
            votes_a integer not null default 0,
            votes_b integer not null default 0,
            winner text,
            status text not null,
            revision integer not null default 0,
            foreign key(bracket_id) references brackets(id) on delete cascade
        );",
    "create unique index matchups_by_bracket_round on matchups(bracket_id, round, position);",
    "create table votes(
            id integer primary key autoincrement,
            matchup_id integer not null,
            user_id text not null,
            choice text not null,
            created_at text not null,
            foreign key(matchup_id) references matchups(id) on delete cascade
        );",
    "create unique index votes_by_matchup_user on votes(matchup_id, user_id);",
    "create table group_members(
            group_id text not null,
            user_id text not null,
            joined_at text not null
        );",
    "create unique index group_members_by_group on group_members(group_id, user_id);",
    "create table messages(
            id integer primary key autoincrement,
            conversation_id text not null,
            author_id text not null,
            body text not null,
            message_type text not null,
            created_at text not null
        );",
    "create index messages_by_conversation on messages(conversation_id);",
];

/// SQLite-backed store for brackets and everything hanging off them.
pub struct BracketDb {
    db: SqlitePool,
}

impl BracketDb {
    async fn connect(file: &Path, settings: &Settings) -> anyhow::Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(file)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(
                settings.database_busy_timeout_secs.unwrap_or(5),
            ));

        Ok(SqlitePoolOptions::new()
            .max_connections(settings.database_max_connections.unwrap_or(8))
            .connect_with(options)
            .await?)
    }

    /// Create the database file and its schema.
    pub async fn init(file: &Path, settings: &Settings) -> anyhow::Result<Self> {
        let db = Self::connect(file, settings).await?;

        let mut tx = db.begin().await?;
        for statement in SCHEMA {
            query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        log::info!("Created bracket database at {}", file.display());
        Ok(BracketDb { db })
    }

    pub async fn load(file: &Path, settings: &Settings) -> anyhow::Result<Self> {
        let db = Self::connect(file, settings).await?;
        Ok(BracketDb { db })
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.db.begin().await?)
    }

    pub async fn create_bracket(&self, bracket: &NewBracket) -> Result<Bracket> {
        log::debug!("Creating bracket in conversation {}", bracket.conversation_id);
        // `returning` rows are drained with fetch_all so the statement runs to
        // completion and commits before this returns.
        sqlx::query_as::<_, Bracket>(
            "insert into brackets(
                group_id, conversation_id, parent_conversation_id,
                question, status, created_by, created_at
            ) values(?, ?, ?, ?, ?, ?, ?)
            returning *",
        )
        .bind(&bracket.group_id)
        .bind(&bracket.conversation_id)
        .bind(&bracket.parent_conversation_id)
        .bind(&bracket.question)
        .bind(BracketStatus::Nominating)
        .bind(&bracket.created_by)
        .bind(OffsetDateTime::now_utc())
        .fetch_all(&self.db)
        .await?
        .pop()
        .ok_or(Error::Store(sqlx::Error::RowNotFound))
    }

    pub async fn get_bracket(&self, bracket_id: i64) -> Result<Bracket> {
        fetch_bracket(&self.db, bracket_id)
            .await?
            .ok_or_else(|| Error::not_found("bracket", bracket_id))
    }

    /// The most recent bracket opened in a conversation.
    pub async fn find_bracket_by_conversation(&self, conversation_id: &str) -> Result<Bracket> {
        sqlx::query_as(
            "select * from brackets
                where conversation_id = ?
                order by id desc
                limit 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| Error::not_found("bracket in conversation", conversation_id))
    }

    /// Append an entry, provided the bracket is still taking nominations.
    ///
    /// The phase check is part of the insert, so a nomination cannot slip in
    /// after the bracket has been locked.
    pub async fn insert_entry(
        &self,
        bracket_id: i64,
        name: &str,
        nominated_by: &str,
    ) -> Result<Option<Entry>> {
        Ok(sqlx::query_as::<_, Entry>(
            "insert into entries(bracket_id, name, nominated_by, created_at)
                select ?, ?, ?, ?
                where exists (select 1 from brackets where id = ? and status = ?)
                returning *",
        )
        .bind(bracket_id)
        .bind(name)
        .bind(nominated_by)
        .bind(OffsetDateTime::now_utc())
        .bind(bracket_id)
        .bind(BracketStatus::Nominating)
        .fetch_all(&self.db)
        .await?
        .pop())
    }

    pub async fn get_entries(&self, bracket_id: i64) -> Result<Vec<Entry>> {
        Ok(fetch_entries(&self.db, bracket_id).await?)
    }

    pub async fn get_matchups(&self, bracket_id: i64) -> Result<Vec<Matchup>> {
        Ok(sqlx::query_as(
            "select * from matchups
                where bracket_id = ?
                order by round, position",
        )
        .bind(bracket_id)
        .fetch_all(&self.db)
        .await?)
    }

    pub async fn get_matchup(&self, matchup_id: i64) -> Result<Matchup> {
        fetch_matchup(&self.db, matchup_id)
            .await?
            .ok_or_else(|| Error::not_found("matchup", matchup_id))
    }

    pub async fn get_votes(&self, matchup_id: i64) -> Result<Vec<Vote>> {
        Ok(fetch_votes(&self.db, matchup_id).await?)
    }

    /// Active matchups of every bracket of a group that is still voting.
    pub async fn get_open_matchups_in_group(&self, group_id: &str) -> Result<Vec<i64>> {
        Ok(sqlx::query_scalar(
            "select m.id from matchups m
                join brackets b on b.id = m.bracket_id
                where b.group_id = ? and b.status = ? and m.status = ?
                order by m.id",
        )
        .bind(group_id)
        .bind(BracketStatus::Voting)
        .bind(MatchupStatus::Active)
        .fetch_all(&self.db)
        .await?)
    }

    pub async fn join_group(&self, group_id: &str, user_id: &str) -> Result<bool> {
        Ok(sqlx::query(
            "insert or ignore into group_members(group_id, user_id, joined_at) values(?, ?, ?)",
        )
        .bind(group_id)
        .bind(user_id)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.db)
        .await
        .map(|r| r.rows_affected() == 1)?)
    }

    pub async fn leave_group(&self, group_id: &str, user_id: &str) -> Result<bool> {
        Ok(
            sqlx::query("delete from group_members where group_id = ? and user_id = ?")
                .bind(group_id)
                .bind(user_id)
                .execute(&self.db)
                .await
                .map(|r| r.rows_affected() == 1)?,
        )
    }

    pub async fn count_group_members(&self, group_id: &str) -> Result<u32> {
        Ok(
            sqlx::query_scalar("select count(*) from group_members where group_id = ?")
                .bind(group_id)
                .fetch_one(&self.db)
                .await?,
        )
    }

    pub async fn is_group_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        Ok(sqlx::query_scalar(
            "select exists(select 1 from group_members where group_id = ? and user_id = ?)",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_one(&self.db)
        .await?)
    }

    pub async fn post_message(
        &self,
        conversation_id: &str,
        author_id: &str,
        body: &str,
        message_type: &str,
    ) -> Result<()> {
        Ok(sqlx::query(
            "insert into messages(conversation_id, author_id, body, message_type, created_at)
                values(?, ?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(author_id)
        .bind(body)
        .bind(message_type)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.db)
        .await
        .map(|_| ())?)
    }

    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            "select body from messages
                where conversation_id = ?
                order by id",
        )
        .bind(conversation_id)
        .fetch_all(&self.db)
        .await?)
    }

    pub async fn mark_result_posted(&self, bracket_id: i64) -> Result<bool> {
        Ok(sqlx::query(
            "update brackets set result_posted_at = ?
                where id = ? and result_posted_at is null",
        )
        .bind(OffsetDateTime::now_utc())
        .bind(bracket_id)
        .execute(&self.db)
        .await
        .map(|r| r.rows_affected() == 1)?)
    }

    /// Recount an active matchup from its votes and overwrite the cached
    /// counters. Returns `None` when the matchup is no longer active.
    pub async fn recount_active_tally(&self, matchup_id: i64) -> Result<Option<Tally>> {
        let mut tx = self.db.begin().await?;
        if !claim_active_matchup(&mut *tx, matchup_id).await? {
            tx.rollback().await?;
            return Ok(None);
        }

        let matchup = fetch_matchup(&mut *tx, matchup_id)
            .await?
            .ok_or_else(|| Error::not_found("matchup", matchup_id))?;
        let votes = fetch_votes(&mut *tx, matchup_id).await?;
        let tally = Tally::count(&matchup, &votes);
        write_tally(&mut *tx, matchup_id, tally).await?;
        tx.commit().await?;
        Ok(Some(tally))
    }
}

// Statements shared between pool reads and transactional engine steps.

pub async fn fetch_bracket<'e, E>(executor: E, bracket_id: i64) -> sqlx::Result<Option<Bracket>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as("select * from brackets where id = ?")
        .bind(bracket_id)
        .fetch_optional(executor)
        .await
}

pub async fn fetch_entries<'e, E>(executor: E, bracket_id: i64) -> sqlx::Result<Vec<Entry>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as("select * from entries where bracket_id = ? order by id")
        .bind(bracket_id)
        .fetch_all(executor)
        .await
}

pub async fn fetch_matchup<'e, E>(executor: E, matchup_id: i64) -> sqlx::Result<Option<Matchup>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as("select * from matchups where id = ?")
        .bind(matchup_id)
        .fetch_optional(executor)
        .await
}

pub async fn fetch_round<'e, E>(
    executor: E,
    bracket_id: i64,
    round: u32,
) -> sqlx::Result<Vec<Matchup>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as(
        "select * from matchups
            where bracket_id = ? and round = ?
            order by position",
    )
    .bind(bracket_id)
    .bind(round)
    .fetch_all(executor)
    .await
}

pub async fn fetch_votes<'e, E>(executor: E, matchup_id: i64) -> sqlx::Result<Vec<Vote>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as("select * from votes where matchup_id = ? order by id")
        .bind(matchup_id)
        .fetch_all(executor)
        .await
}

pub async fn has_voted<'e, E>(executor: E, matchup_id: i64, user_id: &str) -> sqlx::Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar("select exists(select 1 from votes where matchup_id = ? and user_id = ?)")
        .bind(matchup_id)
        .bind(user_id)
        .fetch_one(executor)
        .await
}

/// Move a bracket from nominating to voting. Returns false when another
/// caller got there first or the bracket was never nominating.
pub async fn claim_nominating<'e, E>(executor: E, bracket_id: i64) -> sqlx::Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("update brackets set status = ? where id = ? and status = ?")
        .bind(BracketStatus::Voting)
        .bind(bracket_id)
        .bind(BracketStatus::Nominating)
        .execute(executor)
        .await
        .map(|r| r.rows_affected() == 1)
}

/// Take the write guard on an active matchup. Returns false when the matchup
/// is missing or already complete.
///
/// SQLite has a single writer, so this also holds off votes on every other
/// matchup until the transaction ends.
pub async fn claim_active_matchup<'e, E>(executor: E, matchup_id: i64) -> sqlx::Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("update matchups set revision = revision + 1 where id = ? and status = 'active'")
        .bind(matchup_id)
        .execute(executor)
        .await
        .map(|r| r.rows_affected() == 1)
}

/// Insert matchups, skipping any `(round, position)` that already exists.
/// Returns how many rows were new.
pub async fn insert_matchups(
    conn: &mut sqlx::SqliteConnection,
    bracket_id: i64,
    seeds: &[MatchupSeed],
) -> sqlx::Result<u64> {
    let mut inserted = 0;
    for seed in seeds {
        let (status, winner) = seed.initial_state();
        inserted += sqlx::query(
            "insert or ignore into matchups(
                bracket_id, round, position, entry_a, entry_b, winner, status
            ) values(?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(bracket_id)
        .bind(seed.round)
        .bind(seed.position)
        .bind(&seed.entry_a)
        .bind(&seed.entry_b)
        .bind(winner)
        .bind(status)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    }
    Ok(inserted)
}

pub async fn insert_vote<'e, E>(
    executor: E,
    matchup_id: i64,
    user_id: &str,
    choice: &str,
) -> sqlx::Result<Vote>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Vote>(
        "insert into votes(matchup_id, user_id, choice, created_at)
            values(?, ?, ?, ?)
            returning *",
    )
    .bind(matchup_id)
    .bind(user_id)
    .bind(choice)
    .bind(OffsetDateTime::now_utc())
    .fetch_all(executor)
    .await?
    .pop()
    .ok_or(sqlx::Error::RowNotFound)
}

pub async fn increment_tally<'e, E>(executor: E, matchup_id: i64, side: Side) -> sqlx::Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let statement = match side {
        Side::A => "update matchups set votes_a = votes_a + 1 where id = ? and status = 'active'",
        Side::B => "update matchups set votes_b = votes_b + 1 where id = ? and status = 'active'",
    };
    sqlx::query(statement)
        .bind(matchup_id)
        .execute(executor)
        .await
        .map(|_| ())
}

pub async fn write_tally<'e, E>(executor: E, matchup_id: i64, tally: Tally) -> sqlx::Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "update matchups set votes_a = ?, votes_b = ?
            where id = ? and status = 'active'",
    )
    .bind(tally.votes_a)
    .bind(tally.votes_b)
    .bind(matchup_id)
    .execute(executor)
    .await
    .map(|r| r.rows_affected() == 1)
}

pub async fn resolve_matchup<'e, E>(
    executor: E,
    matchup_id: i64,
    tally: Tally,
    winner: &str,
) -> sqlx::Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "update matchups set votes_a = ?, votes_b = ?, winner = ?, status = 'complete'
            where id = ? and status = 'active'",
    )
    .bind(tally.votes_a)
    .bind(tally.votes_b)
    .bind(winner)
    .bind(matchup_id)
    .execute(executor)
    .await
    .map(|r| r.rows_affected() == 1)
}

/// Move a bracket from voting to complete. Only the caller that sees `true`
/// owns the completion.
pub async fn complete_bracket<'e, E>(
    executor: E,
    bracket_id: i64,
    winner: &str,
) -> sqlx::Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("update brackets set status = ?, winner = ? where id = ? and status = ?")
        .bind(BracketStatus::Complete)
        .bind(winner)
        .bind(bracket_id)
        .bind(BracketStatus::Voting)
        .execute(executor)
        .await
        .map(|r| r.rows_affected() == 1)
}


#[cfg(test)]
mod tests {
    use super::{test_support::*, *};

    #[tokio::test]
    async fn test_bracket_roundtrip() {
        let (_dir, db) = temp_db().await;
        let bracket = db.create_bracket(&new_bracket(Some("general"))).await.unwrap();

        assert_eq!(bracket.status, BracketStatus::Nominating);
        assert_eq!(db.get_bracket(bracket.id).await.unwrap(), bracket);
        assert_eq!(
            db.find_bracket_by_conversation("bracket-channel").await.unwrap().id,
            bracket.id
        );
        assert!(matches!(db.get_bracket(999).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_writes_visible_to_other_pool() {
        let (dir, db) = temp_db().await;
        let other = BracketDb::load(&dir.path().join("brackets.db"), &Settings::default())
            .await
            .unwrap();

        for round in 0..20 {
            let bracket = db.create_bracket(&new_bracket(None)).await.unwrap();
            assert_eq!(other.get_bracket(bracket.id).await.unwrap(), bracket);

            db.insert_entry(bracket.id, "Chips", "alice").await.unwrap().unwrap();
            db.insert_entry(bracket.id, "Pretzels", "bob").await.unwrap().unwrap();
            assert_eq!(
                other.get_entries(bracket.id).await.unwrap().len(),
                2,
                "entries missing on bracket {} (round {})",
                bracket.id,
                round
            );
        }
    }

    #[tokio::test]
    async fn test_entries_only_while_nominating() {
        let (_dir, db) = temp_db().await;
        let bracket = db.create_bracket(&new_bracket(None)).await.unwrap();

        let entry = db.insert_entry(bracket.id, "Chips", "alice").await.unwrap().unwrap();
        assert_eq!(entry.name, "Chips");
        assert!(db.insert_entry(bracket.id, "Chips", "bob").await.unwrap().is_some());

        assert!(claim_nominating(&db.db, bracket.id).await.unwrap());
        assert!(!claim_nominating(&db.db, bracket.id).await.unwrap());
        assert!(db.insert_entry(bracket.id, "Pretzels", "carol").await.unwrap().is_none());
        assert_eq!(db.get_entries(bracket.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_matchup_positions_unique() {
        let (_dir, db) = temp_db().await;
        let bracket = db.create_bracket(&new_bracket(None)).await.unwrap();
        let seeds = vec![
            MatchupSeed::new(1, 0, "A".to_owned(), Some("B".to_owned())),
            MatchupSeed::new(1, 1, "C".to_owned(), None),
        ];

        let mut tx = db.begin().await.unwrap();
        assert_eq!(insert_matchups(&mut *tx, bracket.id, &seeds).await.unwrap(), 2);
        assert_eq!(insert_matchups(&mut *tx, bracket.id, &seeds).await.unwrap(), 0);
        tx.commit().await.unwrap();

        let matchups = db.get_matchups(bracket.id).await.unwrap();
        assert_eq!(matchups.len(), 2);
        assert_eq!(matchups[1].winner.as_deref(), Some("C"));
        assert!(!claim_active_matchup(&db.db, matchups[1].id).await.unwrap());
        assert!(claim_active_matchup(&db.db, matchups[0].id).await.unwrap());
    }

    #[tokio::test]
    async fn test_group_membership() {
        let (_dir, db) = temp_db().await;

        assert!(db.join_group("g", "alice").await.unwrap());
        assert!(!db.join_group("g", "alice").await.unwrap());
        assert!(db.join_group("g", "bob").await.unwrap());
        assert!(db.join_group("other", "carol").await.unwrap());

        assert_eq!(db.count_group_members("g").await.unwrap(), 2);
        assert!(db.is_group_member("g", "bob").await.unwrap());
        assert!(db.leave_group("g", "bob").await.unwrap());
        assert!(!db.is_group_member("g", "bob").await.unwrap());
        assert_eq!(db.count_group_members("g").await.unwrap(), 1);
    }
}
