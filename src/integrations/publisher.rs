use std::{num::NonZeroU64, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use poise::serenity_prelude as serenity;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    core::{
        db::BracketDb,
        settings::{ResultSink, Settings},
    },
    ActorRef,
};

/// Requests for the result publisher
pub enum PublishRequest {
    /// A bracket just completed with this winner.
    Publish { bracket_id: i64, winner: String },
}

pub type PublisherActor = ActorRef<PublishRequest>;

/// Destination for messages posted into a conversation.
#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn post_result(
        &self,
        parent_conversation_id: &str,
        author_id: &str,
        text: &str,
    ) -> anyhow::Result<()>;
}

/// Stores results as message rows.
pub struct DbConversationSink {
    db: Arc<BracketDb>,
}

impl DbConversationSink {
    pub fn new(db: Arc<BracketDb>) -> Self {
        DbConversationSink { db }
    }
}

#[async_trait]
impl ConversationSink for DbConversationSink {
    async fn post_result(
        &self,
        parent_conversation_id: &str,
        author_id: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        Ok(self
            .db
            .post_message(parent_conversation_id, author_id, text, "bracket_result")
            .await?)
    }
}

#[derive(Serialize, Debug)]
struct WebhookPayload<'a> {
    conversation_id: &'a str,
    author_id: &'a str,
    message_type: &'a str,
    body: &'a str,
}

/// Posts results to an HTTP endpoint of the chat service.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        WebhookSink {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl ConversationSink for WebhookSink {
    async fn post_result(
        &self,
        parent_conversation_id: &str,
        author_id: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&WebhookPayload {
                conversation_id: parent_conversation_id,
                author_id,
                message_type: "bracket_result",
                body: text,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Posts results into a Discord channel. Conversation IDs are channel IDs.
pub struct DiscordSink {
    http: serenity::Http,
}

impl DiscordSink {
    pub fn new(token: &str) -> Self {
        DiscordSink {
            http: serenity::Http::new(token),
        }
    }
}

#[async_trait]
impl ConversationSink for DiscordSink {
    async fn post_result(
        &self,
        parent_conversation_id: &str,
        _author_id: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        let channel: NonZeroU64 = parent_conversation_id
            .parse()
            .map_err(|_| anyhow!("'{}' is not a Discord channel", parent_conversation_id))?;
        serenity::ChannelId::from(channel)
            .say(&self.http, text)
            .await?;
        Ok(())
    }
}

pub fn sink_from_settings(
    settings: &Settings,
    db: Arc<BracketDb>,
) -> anyhow::Result<Arc<dyn ConversationSink>> {
    Ok(match settings.result_sink() {
        ResultSink::Database => Arc::new(DbConversationSink::new(db)),
        ResultSink::Webhook { url } => Arc::new(WebhookSink::new(url)),
        ResultSink::Discord => {
            let token = settings
                .discord_token
                .as_deref()
                .ok_or_else(|| anyhow!("Discord result sink needs 'discord_token'"))?;
            Arc::new(DiscordSink::new(token.trim()))
        }
    })
}

/// Deliver one finished bracket to its parent conversation.
///
/// Brackets without a parent have nowhere to post and are skipped.
pub async fn publish(
    db: &BracketDb,
    sink: &dyn ConversationSink,
    bracket_id: i64,
    winner: &str,
) -> anyhow::Result<bool> {
    let bracket = db.get_bracket(bracket_id).await?;
    let Some(parent) = &bracket.parent_conversation_id else {
        log::debug!("Bracket {} has no parent conversation, nothing to post", bracket_id);
        return Ok(false);
    };

    sink.post_result(parent, &bracket.created_by, &bracket.result_text(winner))
        .await?;
    db.mark_result_posted(bracket_id).await?;
    log::info!("Posted result of bracket {} to {}", bracket_id, parent);
    Ok(true)
}

pub async fn run_result_publisher(
    db: Arc<BracketDb>,
    sink: Arc<dyn ConversationSink>,
    mut rx: UnboundedReceiver<PublishRequest>,
) -> anyhow::Result<()> {
    log::debug!("Started result publisher");
    while let Some(msg) = rx.recv().await {
        match msg {
            PublishRequest::Publish { bracket_id, winner } => {
                if let Err(e) = publish(&db, sink.as_ref(), bracket_id, &winner).await {
                    log::error!("Failed to publish result of bracket {}: {}", bracket_id, e);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::{
        bracket::BracketStatus,
        db::test_support::{new_bracket, temp_db},
        engine::{test_support::FixedMembership, BracketEngine},
    };

    struct FailingSink;

    #[async_trait]
    impl ConversationSink for FailingSink {
        async fn post_result(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
            Err(anyhow!("parent conversation is gone"))
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(String, String, String)>>);

    #[async_trait]
    impl ConversationSink for RecordingSink {
        async fn post_result(&self, parent: &str, author: &str, text: &str) -> anyhow::Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((parent.to_owned(), author.to_owned(), text.to_owned()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_posts_to_parent() {
        let (_dir, db) = temp_db().await;
        let db = Arc::new(db);
        let bracket = db.create_bracket(&new_bracket(Some("general"))).await.unwrap();
        let sink = DbConversationSink::new(db.clone());

        assert!(publish(&db, &sink, bracket.id, "Chips").await.unwrap());
        assert_eq!(
            db.get_messages("general").await.unwrap(),
            vec!["\u{1F3C6} Bracket result: Best snack? | Winner: Chips".to_owned()]
        );
        assert!(db.get_bracket(bracket.id).await.unwrap().result_posted_at.is_some());
    }

    #[tokio::test]
    async fn test_no_parent_is_noop() {
        let (_dir, db) = temp_db().await;
        let bracket = db.create_bracket(&new_bracket(None)).await.unwrap();
        let sink = RecordingSink::default();

        assert!(!publish(&db, &sink, bracket.id, "Chips").await.unwrap());
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_not_fatal() {
        let (_dir, db) = temp_db().await;
        let db = Arc::new(db);
        let (publisher, rx) = PublisherActor::new();
        let engine = BracketEngine::new(db.clone(), FixedMembership::new(1), publisher.clone());

        let bracket = engine.create_bracket(&new_bracket(Some("general"))).await.unwrap();
        engine.add_entry(bracket.id, "Chips", "alice").await.unwrap();
        engine.add_entry(bracket.id, "Pretzels", "bob").await.unwrap();
        let matchups = engine.lock_and_seed(bracket.id).await.unwrap();
        let receipt = engine
            .cast_vote(matchups[0].id, "alice", &matchups[0].entry_a)
            .await
            .unwrap();
        let winner = receipt.bracket_winner.unwrap();

        // Both requests fail to post, and the actor keeps serving after the first.
        let task = tokio::spawn(run_result_publisher(db.clone(), Arc::new(FailingSink), rx));
        publisher.send(PublishRequest::Publish {
            bracket_id: bracket.id,
            winner: winner.clone(),
        });
        drop(engine);
        drop(publisher);
        task.await.unwrap().unwrap();

        let bracket = db.get_bracket(bracket.id).await.unwrap();
        assert_eq!(bracket.status, BracketStatus::Complete);
        assert_eq!(bracket.winner, Some(winner));
        assert!(bracket.result_posted_at.is_none());
        assert!(db.get_messages("general").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discord_rejects_bad_channel() {
        let sink = DiscordSink::new("token");
        for channel in ["0", "general", "-4"] {
            assert!(sink.post_result(channel, "host", "text").await.is_err());
        }

        let (_dir, db) = temp_db().await;
        let db = Arc::new(db);
        let bracket = db.create_bracket(&new_bracket(Some("0"))).await.unwrap();

        let (actor, rx) = PublisherActor::new();
        let task = tokio::spawn(run_result_publisher(db.clone(), Arc::new(sink), rx));
        actor.send(PublishRequest::Publish {
            bracket_id: bracket.id,
            winner: "Chips".to_owned(),
        });
        drop(actor);

        // The publisher ends cleanly once its mailbox closes instead of panicking.
        task.await.unwrap().unwrap();
        assert!(db.get_bracket(bracket.id).await.unwrap().result_posted_at.is_none());
    }

    #[tokio::test]
    async fn test_recorded_author() {
        let (_dir, db) = temp_db().await;
        let bracket = db.create_bracket(&new_bracket(Some("lobby"))).await.unwrap();
        let sink = RecordingSink::default();

        publish(&db, &sink, bracket.id, "Pretzels").await.unwrap();
        let posted = sink.0.lock().unwrap().clone();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].0, "lobby");
        assert_eq!(posted[0].1, "host");
        assert!(posted[0].2.ends_with("Winner: Pretzels"));
    }
}
