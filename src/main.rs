use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinSet,
};

use crate::{
    core::{
        db::BracketDb, engine::BracketEngine, membership::DbMembership, settings::Settings,
    },
    integrations::{init_integrations, publisher::PublisherActor},
};

mod core;
mod error;
mod integrations;
mod util;
mod web;

#[derive(Parser, Debug)]
#[command(name = "bracketeer")]
#[command(version = "0.1")]
#[command(about = "Group voting brackets for chat servers.", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: RunType,
}

#[derive(Subcommand, Debug)]
enum RunType {
    /// Create a new bracket database and a settings file to fill in.
    Init {
        /// Location of the settings file to create.
        #[arg(short, long, default_value = "settings.json")]
        settings_file: PathBuf,

        /// Location of the database to create.
        #[arg(short, long, default_value = "brackets.db")]
        db_file: PathBuf,
    },

    /// Run the bracket server.
    Run {
        /// Location of the settings file.
        /// DO NOT SHARE THIS FILE if it contains a Discord token.
        #[arg(short, long, default_value = "settings.json")]
        settings_file: PathBuf,

        /// Location of the bracket database.
        #[arg(short, long, default_value = "brackets.db")]
        db_file: PathBuf,
    },
}

/// Handle used to send messages to an actor task.
pub struct ActorRef<T> {
    tx: UnboundedSender<T>,
}

impl<T> Clone for ActorRef<T> {
    fn clone(&self) -> Self {
        ActorRef {
            tx: self.tx.clone(),
        }
    }
}

impl<T> ActorRef<T> {
    /// Create a handle and the mailbox the actor reads from.
    pub fn new() -> (Self, UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ActorRef { tx }, rx)
    }

    /// Fire and forget. A closed mailbox is logged, never returned.
    pub fn send(&self, msg: T) {
        if self.tx.send(msg).is_err() {
            log::warn!("Actor mailbox is closed, message dropped");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        RunType::Init {
            settings_file,
            db_file,
        } => {
            let settings = Settings::default();
            BracketDb::init(&db_file, &settings).await?;

            if settings_file.exists() {
                log::warn!(
                    "Settings file {} already exists, leaving it untouched",
                    settings_file.display()
                );
            } else {
                std::fs::write(&settings_file, serde_json::to_string_pretty(&settings)?)?;
            }

            log::info!("Bracket database created at {}", db_file.display());
            Ok(())
        }
        RunType::Run {
            settings_file,
            db_file,
        } => {
            let settings = Arc::new(Settings::load(&settings_file)?);
            let db = Arc::new(BracketDb::load(&db_file, &settings).await?);

            let membership = Arc::new(DbMembership::new(db.clone()));
            let (publisher, publisher_rx) = PublisherActor::new();
            let engine = Arc::new(BracketEngine::new(db.clone(), membership, publisher));

            let mut tasks = JoinSet::new();
            init_integrations(&mut tasks, settings, db, engine, publisher_rx)?;

            log::info!("Bracket server initialized");

            while let Some(task) = tasks.join_next().await {
                match task {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("Service stopped: {}", e),
                    Err(e) => log::error!("Service panicked: {}", e),
                }
            }

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_actor_ref() {
        let (actor, mut rx) = ActorRef::<u32>::new();
        let other = actor.clone();
        actor.send(1);
        other.send(2);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));

        drop(rx);
        // Sending into a closed mailbox only logs.
        actor.send(3);
    }

    #[test]
    fn test_args() {
        let args = Args::parse_from(["bracketeer", "run", "-s", "prod.json"]);
        match args.command {
            RunType::Run {
                settings_file,
                db_file,
            } => {
                assert_eq!(settings_file, PathBuf::from("prod.json"));
                assert_eq!(db_file, PathBuf::from("brackets.db"));
            }
            _ => panic!("expected run"),
        }
    }
}
