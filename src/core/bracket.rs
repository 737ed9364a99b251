use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::time};

use crate::util::{serialize_datetime, serialize_timestamp};

/// Bracket lifecycle. Transitions only move forward:
/// `Nominating -> Voting -> Complete`.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum BracketStatus {
    Nominating,
    Voting,
    Complete,
}

impl fmt::Display for BracketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BracketStatus::Nominating => write!(f, "nominating"),
            BracketStatus::Voting => write!(f, "voting"),
            BracketStatus::Complete => write!(f, "complete"),
        }
    }
}

/// A single-elimination tournament tied to a conversation.
#[derive(PartialEq, Eq, Debug, Clone, FromRow, Serialize)]
pub struct Bracket {
    pub id: i64,

    /// The group whose live membership votes on this bracket
    pub group_id: String,

    /// The conversation this bracket lives in
    pub conversation_id: String,

    /// The conversation this bracket was forked from, if any. Results are
    /// posted back here.
    pub parent_conversation_id: Option<String>,

    pub question: Option<String>,
    pub status: BracketStatus,
    pub winner: Option<String>,

    /// Author of the published result
    pub created_by: String,

    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: time::OffsetDateTime,

    /// Set once the result reached the parent conversation
    #[serde(serialize_with = "serialize_datetime")]
    pub result_posted_at: Option<time::OffsetDateTime>,
}

impl Bracket {
    /// The line posted into the parent conversation once a winner is known.
    pub fn result_text(&self, winner: &str) -> String {
        format!(
            "\u{1F3C6} Bracket result: {} | Winner: {}",
            self.question.as_deref().unwrap_or("Bracket"),
            winner
        )
    }
}

/// Fields supplied when opening a new bracket for nominations.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBracket {
    pub group_id: String,
    pub conversation_id: String,
    pub parent_conversation_id: Option<String>,
    pub question: Option<String>,
    pub created_by: String,
}
