use std::{convert::Infallible, sync::Arc};

use filters::api_filters;
use warp::{http::Method, reject::Rejection, Filter};

use crate::core::{engine::BracketEngine, settings::Settings};

pub mod filters;
pub mod handlers;

async fn handle_rejection(err: Rejection) -> Result<impl warp::Reply, Infallible> {
    let (code, msg) = if err.is_not_found() {
        (warp::http::StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(err) = err.find::<warp::reject::MissingHeader>() {
        log::debug!("{}", err);
        (warp::http::StatusCode::BAD_REQUEST, err.to_string())
    } else if let Some(err) = err.find::<warp::filters::body::BodyDeserializeError>() {
        log::error!("{}", err);
        (warp::http::StatusCode::BAD_REQUEST, err.to_string())
    } else if let Some(err) = err.find::<warp::reject::MethodNotAllowed>() {
        log::error!("Method Not Allowed: {}", err);
        (warp::http::StatusCode::METHOD_NOT_ALLOWED, err.to_string())
    } else {
        log::error!("Unhandled Rejection: {:?}", err);
        (
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        )
    };

    Ok(handlers::error_reply(code, msg))
}

pub fn routes(
    engine: Arc<BracketEngine>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
    api_filters(engine).recover(handle_rejection)
}

pub async fn run_http_server(
    engine: Arc<BracketEngine>,
    settings: Arc<Settings>,
) -> anyhow::Result<()> {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec![
            "User-Agent",
            "Origin",
            "Content-Type",
            "X-User-Id",
            "Access-Control-Request-Method",
            "Access-Control-Request-Headers",
        ])
        .allow_methods(&[Method::GET, Method::POST, Method::DELETE, Method::OPTIONS]);

    let port = settings.web_port.unwrap_or(28010);
    log::info!("Serving bracket API on port {}", port);

    warp::serve(routes(engine).with(cors))
        .run(([0, 0, 0, 0], port))
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedReceiver;
    use warp::http::StatusCode;

    use super::*;
    use crate::{
        core::{db::test_support::temp_db, membership::DbMembership},
        integrations::publisher::{PublishRequest, PublisherActor},
    };

    async fn api() -> (
        tempfile::TempDir,
        Arc<BracketEngine>,
        UnboundedReceiver<PublishRequest>,
    ) {
        let (dir, db) = temp_db().await;
        let db = Arc::new(db);
        let (publisher, rx) = PublisherActor::new();
        let engine = BracketEngine::new(db.clone(), Arc::new(DbMembership::new(db)), publisher);
        (dir, Arc::new(engine), rx)
    }

    async fn call(
        engine: &Arc<BracketEngine>,
        method: &str,
        path: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = warp::test::request().method(method).path(path);
        if let Some(user) = user {
            request = request.header("x-user-id", user);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.reply(&routes(engine.clone())).await;
        let value = serde_json::from_slice(response.body()).unwrap_or(Value::Null);
        (response.status(), value)
    }

    #[tokio::test]
    async fn test_bracket_over_http() {
        let (_dir, engine, mut rx) = api().await;

        for user in ["alice", "bob"] {
            let (status, _) = call(&engine, "POST", "/group/friends/members", Some(user), None).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, bracket) = call(
            &engine,
            "POST",
            "/bracket",
            Some("alice"),
            Some(json!({
                "group_id": "friends",
                "conversation_id": "thread-1",
                "parent_conversation_id": "general",
                "question": "Best snack?"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(bracket["status"], "nominating");
        assert_eq!(bracket["created_by"], "alice");
        let id = bracket["id"].as_i64().unwrap();

        for name in ["Chips", "Pretzels"] {
            let (status, _) = call(
                &engine,
                "POST",
                &format!("/bracket/{}/entries", id),
                Some("bob"),
                Some(json!({ "name": name })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, matchups) =
            call(&engine, "POST", &format!("/bracket/{}/lock", id), Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        let matchup = &matchups[0];
        let matchup_id = matchup["id"].as_i64().unwrap();
        let pick = matchup["entry_a"].as_str().unwrap().to_owned();

        let (status, _) = call(
            &engine,
            "POST",
            &format!("/bracket/{}/entries", id),
            Some("bob"),
            Some(json!({ "name": "Popcorn" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        for user in ["alice", "bob"] {
            let (status, _) = call(
                &engine,
                "POST",
                &format!("/matchup/{}/vote", matchup_id),
                Some(user),
                Some(json!({ "choice": pick })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, votes) = call(
            &engine,
            "GET",
            &format!("/matchup/{}/votes", matchup_id),
            Some("bob"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(votes.as_array().unwrap().len(), 2);

        let (_, bracket) = call(&engine, "GET", &format!("/bracket/{}", id), Some("bob"), None).await;
        assert_eq!(bracket["status"], "complete");
        assert_eq!(bracket["winner"], pick.as_str());

        match rx.try_recv().unwrap() {
            PublishRequest::Publish { bracket_id, winner } => {
                assert_eq!(bracket_id, id);
                assert_eq!(winner, pick);
            }
        }
    }

    #[tokio::test]
    async fn test_http_errors() {
        let (_dir, engine, _rx) = api().await;
        call(&engine, "POST", "/group/friends/members", Some("alice"), None).await;

        let (status, _) = call(
            &engine,
            "POST",
            "/bracket",
            Some("mallory"),
            Some(json!({ "group_id": "friends", "conversation_id": "thread-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, bracket) = call(
            &engine,
            "POST",
            "/bracket",
            Some("alice"),
            Some(json!({ "group_id": "friends", "conversation_id": "thread-1" })),
        )
        .await;
        let id = bracket["id"].as_i64().unwrap();

        let (status, _) = call(&engine, "GET", &format!("/bracket/{}", id), Some("mallory"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&engine, "GET", &format!("/bracket/{}", id), None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&engine, "GET", "/bracket/999", Some("alice"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) =
            call(&engine, "POST", &format!("/bracket/{}/lock", id), Some("alice"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("at least 2 entries"));

        let (status, _) = call(
            &engine,
            "POST",
            &format!("/bracket/{}/entries", id),
            Some("alice"),
            Some(json!({ "name": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&engine, "DELETE", "/group/friends/members", Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&engine, "GET", &format!("/bracket/{}/entries", id), Some("alice"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
