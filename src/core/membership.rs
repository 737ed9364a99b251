use std::sync::Arc;

use async_trait::async_trait;

use super::db::BracketDb;

/// Live view of who may vote on a bracket.
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Number of members currently eligible to vote. Read fresh on every call.
    async fn eligible_voter_count(&self, bracket_id: i64) -> anyhow::Result<u32>;

    async fn is_member(&self, bracket_id: i64, user_id: &str) -> anyhow::Result<bool>;
}

/// Membership backed by the `group_members` table of the bracket's group.
pub struct DbMembership {
    db: Arc<BracketDb>,
}

impl DbMembership {
    pub fn new(db: Arc<BracketDb>) -> Self {
        DbMembership { db }
    }
}

#[async_trait]
impl MembershipProvider for DbMembership {
    async fn eligible_voter_count(&self, bracket_id: i64) -> anyhow::Result<u32> {
        let bracket = self.db.get_bracket(bracket_id).await?;
        Ok(self.db.count_group_members(&bracket.group_id).await?)
    }

    async fn is_member(&self, bracket_id: i64, user_id: &str) -> anyhow::Result<bool> {
        let bracket = self.db.get_bracket(bracket_id).await?;
        Ok(self.db.is_group_member(&bracket.group_id, user_id).await?)
    }
}
