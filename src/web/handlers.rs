use std::{convert::Infallible, sync::Arc};

use serde::{Deserialize, Serialize};
use warp::{
    http::StatusCode,
    reply::{Json, WithStatus},
};

use crate::{
    core::{bracket::NewBracket, engine::BracketEngine},
    error::{Error, Result},
};

pub type JsonReply = WithStatus<Json>;

/// A Json struct to open a bracket. The caller becomes its author.
#[derive(Serialize, Deserialize, Debug)]
pub struct CreateBracket {
    pub group_id: String,
    pub conversation_id: String,
    pub parent_conversation_id: Option<String>,
    pub question: Option<String>,
}

/// A Json struct to nominate an entry
#[derive(Serialize, Deserialize, Debug)]
pub struct NewEntry {
    pub name: String,
}

/// A Json struct to cast a vote
#[derive(Serialize, Deserialize, Debug)]
pub struct NewVote {
    pub choice: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorBody {
    pub error: String,
}

pub fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Phase { .. } | Error::InactiveMatchup(_) | Error::DuplicateVote { .. } => {
            StatusCode::CONFLICT
        }
        Error::InsufficientEntries(_) | Error::InvalidChoice { .. } | Error::InvalidEntry(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Collaborator(inner) => inner
            .downcast_ref::<Error>()
            .map(status_of)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub fn error_reply(status: StatusCode, error: String) -> JsonReply {
    warp::reply::with_status(warp::reply::json(&ErrorBody { error }), status)
}

fn to_error_reply(err: &Error) -> JsonReply {
    let status = status_of(err);
    if status.is_server_error() {
        log::warn!("{}", err);
    } else {
        log::debug!("Rejected request: {}", err);
    }
    error_reply(status, err.to_string())
}

pub fn to_http_output<T: Serialize>(
    result: Result<T>,
    status: StatusCode,
) -> std::result::Result<JsonReply, Infallible> {
    Ok(match result {
        Ok(data) => warp::reply::with_status(warp::reply::json(&data), status),
        Err(e) => to_error_reply(&e),
    })
}

fn forbidden(user: &str, bracket_id: i64) -> JsonReply {
    log::debug!("{} is not allowed on bracket {}", user, bracket_id);
    error_reply(
        StatusCode::FORBIDDEN,
        format!("{} is not a member of the group of bracket {}", user, bracket_id),
    )
}

/// Only members of a bracket's group may see or act on it.
async fn require_member(
    engine: &BracketEngine,
    bracket_id: i64,
    user: &str,
) -> std::result::Result<(), JsonReply> {
    match engine.membership().is_member(bracket_id, user).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(forbidden(user, bracket_id)),
        Err(e) => Err(to_error_reply(&Error::from(e))),
    }
}

/// Resolve the bracket of a matchup and check membership on it.
async fn require_matchup_member(
    engine: &BracketEngine,
    matchup_id: i64,
    user: &str,
) -> std::result::Result<(), JsonReply> {
    let bracket_id = engine
        .db()
        .get_matchup(matchup_id)
        .await
        .map_err(|e| to_error_reply(&e))?
        .bracket_id;
    require_member(engine, bracket_id, user).await
}

macro_rules! gate {
    ($check:expr) => {
        if let Err(reply) = $check.await {
            return Ok(reply);
        }
    };
}

pub async fn create_bracket(
    user: String,
    body: CreateBracket,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    match engine.db().is_group_member(&body.group_id, &user).await {
        Ok(true) => {}
        Ok(false) => {
            return Ok(error_reply(
                StatusCode::FORBIDDEN,
                format!("{} is not a member of group {}", user, body.group_id),
            ))
        }
        Err(e) => return Ok(to_error_reply(&e)),
    }

    let bracket = NewBracket {
        group_id: body.group_id,
        conversation_id: body.conversation_id,
        parent_conversation_id: body.parent_conversation_id,
        question: body.question,
        created_by: user,
    };
    to_http_output(engine.create_bracket(&bracket).await, StatusCode::CREATED)
}

pub async fn get_bracket(
    bracket_id: i64,
    user: String,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    gate!(require_member(&engine, bracket_id, &user));
    to_http_output(engine.get_bracket(bracket_id).await, StatusCode::OK)
}

pub async fn list_entries(
    bracket_id: i64,
    user: String,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    gate!(require_member(&engine, bracket_id, &user));
    to_http_output(engine.list_entries(bracket_id).await, StatusCode::OK)
}

pub async fn add_entry(
    bracket_id: i64,
    user: String,
    body: NewEntry,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    gate!(require_member(&engine, bracket_id, &user));
    to_http_output(
        engine.add_entry(bracket_id, &body.name, &user).await,
        StatusCode::CREATED,
    )
}

pub async fn lock_bracket(
    bracket_id: i64,
    user: String,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    gate!(require_member(&engine, bracket_id, &user));
    to_http_output(engine.lock_and_seed(bracket_id).await, StatusCode::OK)
}

pub async fn list_matchups(
    bracket_id: i64,
    user: String,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    gate!(require_member(&engine, bracket_id, &user));
    to_http_output(engine.list_matchups(bracket_id).await, StatusCode::OK)
}

pub async fn audit_tallies(
    bracket_id: i64,
    user: String,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    gate!(require_member(&engine, bracket_id, &user));
    to_http_output(engine.audit_tallies(bracket_id).await, StatusCode::OK)
}

pub async fn repair_tallies(
    bracket_id: i64,
    user: String,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    gate!(require_member(&engine, bracket_id, &user));
    to_http_output(engine.repair_tallies(bracket_id).await, StatusCode::OK)
}

pub async fn list_votes(
    matchup_id: i64,
    user: String,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    gate!(require_matchup_member(&engine, matchup_id, &user));
    to_http_output(engine.list_votes(matchup_id).await, StatusCode::OK)
}

pub async fn cast_vote(
    matchup_id: i64,
    user: String,
    body: NewVote,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    gate!(require_matchup_member(&engine, matchup_id, &user));
    to_http_output(
        engine.cast_vote(matchup_id, &user, &body.choice).await,
        StatusCode::CREATED,
    )
}

pub async fn join_group(
    group_id: String,
    user: String,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    to_http_output(engine.db().join_group(&group_id, &user).await, StatusCode::OK)
}

pub async fn leave_group(
    group_id: String,
    user: String,
    engine: Arc<BracketEngine>,
) -> std::result::Result<JsonReply, Infallible> {
    to_http_output(engine.leave_group(&group_id, &user).await, StatusCode::OK)
}
