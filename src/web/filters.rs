use std::{convert::Infallible, sync::Arc};

use warp::{reject::Rejection, Filter};

use crate::core::engine::BracketEngine;

use super::handlers;

pub fn with_engine(
    engine: Arc<BracketEngine>,
) -> impl Filter<Extract = (Arc<BracketEngine>,), Error = Infallible> + Clone {
    warp::any().map(move || engine.clone())
}

/// The calling user, taken from the `x-user-id` header.
pub fn caller() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::<String>("x-user-id")
}

fn bracket_filters(
    engine: Arc<BracketEngine>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    let create_bracket = warp::path!("bracket")
        .and(warp::post())
        .and(caller())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(handlers::create_bracket);

    let get_bracket = warp::path!("bracket" / i64)
        .and(warp::get())
        .and(caller())
        .and(with_engine(engine.clone()))
        .and_then(handlers::get_bracket);

    let list_entries = warp::path!("bracket" / i64 / "entries")
        .and(warp::get())
        .and(caller())
        .and(with_engine(engine.clone()))
        .and_then(handlers::list_entries);

    let add_entry = warp::path!("bracket" / i64 / "entries")
        .and(warp::post())
        .and(caller())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(handlers::add_entry);

    let lock_bracket = warp::path!("bracket" / i64 / "lock")
        .and(warp::post())
        .and(caller())
        .and(with_engine(engine.clone()))
        .and_then(handlers::lock_bracket);

    let list_matchups = warp::path!("bracket" / i64 / "matchups")
        .and(warp::get())
        .and(caller())
        .and(with_engine(engine.clone()))
        .and_then(handlers::list_matchups);

    let audit = warp::path!("bracket" / i64 / "audit")
        .and(warp::get())
        .and(caller())
        .and(with_engine(engine.clone()))
        .and_then(handlers::audit_tallies);

    let repair = warp::path!("bracket" / i64 / "repair")
        .and(warp::post())
        .and(caller())
        .and(with_engine(engine))
        .and_then(handlers::repair_tallies);

    create_bracket
        .or(get_bracket)
        .or(list_entries)
        .or(add_entry)
        .or(lock_bracket)
        .or(list_matchups)
        .or(audit)
        .or(repair)
}

fn matchup_filters(
    engine: Arc<BracketEngine>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    let list_votes = warp::path!("matchup" / i64 / "votes")
        .and(warp::get())
        .and(caller())
        .and(with_engine(engine.clone()))
        .and_then(handlers::list_votes);

    let cast_vote = warp::path!("matchup" / i64 / "vote")
        .and(warp::post())
        .and(caller())
        .and(warp::body::json())
        .and(with_engine(engine))
        .and_then(handlers::cast_vote);

    list_votes.or(cast_vote)
}

fn group_filters(
    engine: Arc<BracketEngine>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    let join = warp::path!("group" / String / "members")
        .and(warp::post())
        .and(caller())
        .and(with_engine(engine.clone()))
        .and_then(handlers::join_group);

    let leave = warp::path!("group" / String / "members")
        .and(warp::delete())
        .and(caller())
        .and(with_engine(engine))
        .and_then(handlers::leave_group);

    join.or(leave)
}

pub fn api_filters(
    engine: Arc<BracketEngine>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    bracket_filters(engine.clone())
        .or(matchup_filters(engine.clone()))
        .or(group_filters(engine))
}
