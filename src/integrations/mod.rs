use std::sync::Arc;

use tokio::{sync::mpsc::UnboundedReceiver, task::JoinSet};

use crate::core::{db::BracketDb, engine::BracketEngine, settings::Settings};

use self::publisher::{run_result_publisher, sink_from_settings, PublishRequest};

pub mod discord;
pub mod publisher;

pub fn init_integrations(
    tasks: &mut JoinSet<Result<(), anyhow::Error>>,
    settings: Arc<Settings>,
    db: Arc<BracketDb>,
    engine: Arc<BracketEngine>,
    publisher_rx: UnboundedReceiver<PublishRequest>,
) -> anyhow::Result<()> {
    // Add result publisher to tasks
    let sink = sink_from_settings(&settings, db.clone())?;
    log::info!("Posting bracket results to {:?}", settings.result_sink());
    tasks.spawn(run_result_publisher(db, sink, publisher_rx));

    // Add discord integration to tasks
    if settings.discord_token.is_some() {
        tasks.spawn(discord::init_discord(settings.clone(), engine.clone()));
    } else {
        log::info!("No 'discord_token' set, Discord bot disabled");
    }

    // Add webserver to tasks
    tasks.spawn(crate::web::run_http_server(engine, settings));

    Ok(())
}
