use serde::Serialize;
use sqlx::{prelude::FromRow, types::time};

use crate::{core::matchup::BYE, error::Error, util::serialize_timestamp};

/// A nominated option competing in a bracket. Immutable once created.
#[derive(PartialEq, Eq, Debug, Clone, FromRow, Serialize)]
pub struct Entry {
    pub id: i64,
    pub bracket_id: i64,
    pub name: String,
    pub nominated_by: String,

    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: time::OffsetDateTime,
}

/// Normalize a nominated name, rejecting names that cannot be told apart
/// from an empty slot or a bye.
pub fn validate_entry_name(name: &str) -> Result<String, Error> {
    let name = name.trim();
    if name.is_empty() {
        Err(Error::InvalidEntry("name is empty".to_owned()))
    } else if name == BYE {
        Err(Error::InvalidEntry(format!("'{}' is reserved", BYE)))
    } else {
        Ok(name.to_owned())
    }
}
