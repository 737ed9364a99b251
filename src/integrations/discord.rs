use std::sync::Arc;

use anyhow::anyhow;
use poise::serenity_prelude as serenity;
use serenity::{ChannelId, GuildChannel};

use crate::core::{
    bracket::{Bracket, NewBracket},
    engine::BracketEngine,
    matchup::{Matchup, MatchupStatus},
    settings::Settings,
};

struct Data {
    engine: Arc<BracketEngine>,
    settings: Arc<Settings>,
}

type Context<'a> = poise::Context<'a, Data, anyhow::Error>;

/// Convert a ChannelID to a GuildChannel
async fn to_guild_channel(
    channel_id: ChannelId,
    context: &serenity::Context,
) -> Option<GuildChannel> {
    match channel_id.to_channel(context).await {
        Ok(channel) => channel.guild(),
        Err(why) => {
            log::error!("Err w/ channel {}", why);

            None
        }
    }
}

async fn check_channel(context: &Context<'_>) -> anyhow::Result<bool> {
    let settings = &context.data().settings;
    let _ = context.defer().await;

    let Some(desired_channel) = &settings.discord_command_channel else {
        return Ok(true);
    };

    // Threads forked from the command channel are allowed too.
    if let Some(channel) = to_guild_channel(context.channel_id(), context.serenity_context()).await
    {
        let parent = match channel.parent_id {
            Some(parent) if channel.thread_metadata.is_some() => {
                to_guild_channel(parent, context.serenity_context()).await
            }
            _ => None,
        };

        let allowed = std::iter::once(&channel)
            .chain(parent.as_ref())
            .any(|c| c.name().eq_ignore_ascii_case(desired_channel));

        if !allowed {
            log::debug!("Command ignored, incorrect channel '{}'", channel.name());
            context
                .say("Commands are not read on this channel.")
                .await
                .map_err(|why| anyhow!(why.to_string()))?;
            return Ok(false);
        }
    }

    Ok(true)
}

async fn wrap_fallible<T>(context: &Context<'_>, result: anyhow::Result<T>) -> anyhow::Result<T> {
    if let Err(err) = &result {
        if let Err(why) = context.say(format!("Failed to run command: {}", err)).await {
            log::warn!("Failed to react: {}", why);
        }
    }

    result
}

async fn reply(context: &Context<'_>, text: impl Into<String>) -> anyhow::Result<()> {
    context.say(text).await?;
    Ok(())
}

/// The guild a command ran in. Guilds are the voting groups.
fn group_of(context: &Context<'_>) -> anyhow::Result<String> {
    context
        .guild_id()
        .map(|g| g.to_string())
        .ok_or_else(|| anyhow!("Brackets can only be run inside a server"))
}

/// The bracket living in the channel a command was sent from.
async fn current_bracket(context: &Context<'_>) -> anyhow::Result<Bracket> {
    Ok(context
        .data()
        .engine
        .db()
        .find_bracket_by_conversation(&context.channel_id().to_string())
        .await?)
}

async fn require_member(context: &Context<'_>) -> anyhow::Result<String> {
    let group = group_of(context)?;
    let user = context.author().id.to_string();
    if context.data().engine.db().is_group_member(&group, &user).await? {
        Ok(user)
    } else {
        Err(anyhow!("Use /join before taking part in brackets"))
    }
}

fn describe_matchup(matchup: &Matchup) -> String {
    match (&matchup.status, &matchup.winner) {
        (MatchupStatus::Complete, Some(winner)) if matchup.is_bye() => {
            format!("#{} {} advances on a bye", matchup.id, winner)
        }
        (MatchupStatus::Complete, Some(winner)) => format!(
            "#{} {} ({}) vs {} ({}), {} wins",
            matchup.id, matchup.entry_a, matchup.votes_a, matchup.entry_b, matchup.votes_b, winner
        ),
        _ => format!(
            "#{} {} ({}) vs {} ({})",
            matchup.id, matchup.entry_a, matchup.votes_a, matchup.entry_b, matchup.votes_b
        ),
    }
}

fn describe_rounds(matchups: &[Matchup]) -> String {
    let mut lines = Vec::new();
    let mut round = 0;
    for matchup in matchups {
        if matchup.round != round {
            round = matchup.round;
            lines.push(format!("**Round {}**", round));
        }
        lines.push(describe_matchup(matchup));
    }
    lines.join("\n")
}

/// Open a bracket for nominations in this channel.
///
/// When run inside a thread, the result is posted back to the thread's
/// parent channel.
/// ```
/// /bracket Best snack?
/// ```
#[poise::command(prefix_command, slash_command)]
async fn bracket(
    context: Context<'_>,
    #[description = "What the bracket decides"] question: Option<String>,
) -> Result<(), anyhow::Error> {
    let result = async {
        let group_id = group_of(&context)?;
        let created_by = require_member(&context).await?;
        let channel = to_guild_channel(context.channel_id(), context.serenity_context()).await;
        let parent_conversation_id = channel
            .filter(|c| c.thread_metadata.is_some())
            .and_then(|c| c.parent_id)
            .map(|p| p.to_string());

        let bracket = context
            .data()
            .engine
            .create_bracket(&NewBracket {
                group_id,
                conversation_id: context.channel_id().to_string(),
                parent_conversation_id,
                question,
                created_by,
            })
            .await?;

        reply(
            &context,
            format!(
                "Bracket '{}' is open, use /nominate to add entries",
                bracket.question.as_deref().unwrap_or("Bracket")
            ),
        )
        .await
    }
    .await;

    wrap_fallible(&context, result).await
}

/// Join this server's voting group.
#[poise::command(prefix_command, slash_command)]
async fn join(context: Context<'_>) -> Result<(), anyhow::Error> {
    let result = async {
        let group = group_of(&context)?;
        let user = context.author().id.to_string();
        if context.data().engine.db().join_group(&group, &user).await? {
            reply(&context, "You can now vote on brackets").await
        } else {
            reply(&context, "You are already in the voting group").await
        }
    }
    .await;

    wrap_fallible(&context, result).await
}

/// Leave this server's voting group.
///
/// Open matchups need one vote fewer afterwards, and any that everyone left
/// has already voted on are decided right away.
#[poise::command(prefix_command, slash_command)]
async fn leave(context: Context<'_>) -> Result<(), anyhow::Error> {
    let result = async {
        let group = group_of(&context)?;
        let user = context.author().id.to_string();
        if context.data().engine.leave_group(&group, &user).await? {
            reply(&context, "You left the voting group").await
        } else {
            reply(&context, "You are not in the voting group").await
        }
    }
    .await;

    wrap_fallible(&context, result).await
}

/// Nominate an entry for the bracket in this channel.
/// ```
/// /nominate Pretzels
/// ```
#[poise::command(prefix_command, slash_command)]
async fn nominate(
    context: Context<'_>,
    #[description = "Entry to nominate"]
    #[rest]
    name: String,
) -> Result<(), anyhow::Error> {
    let result = async {
        let user = require_member(&context).await?;
        let bracket = current_bracket(&context).await?;
        let entry = context
            .data()
            .engine
            .add_entry(bracket.id, &name, &user)
            .await?;
        reply(&context, format!("Nominated '{}'", entry.name)).await
    }
    .await;

    wrap_fallible(&context, result).await
}

/// Close nominations and seed the first round.
#[poise::command(prefix_command, slash_command)]
async fn lock(context: Context<'_>) -> Result<(), anyhow::Error> {
    let result = async {
        require_member(&context).await?;
        let bracket = current_bracket(&context).await?;
        let matchups = context.data().engine.lock_and_seed(bracket.id).await?;
        reply(
            &context,
            format!(
                "Nominations closed, vote with /vote <matchup> <choice>\n{}",
                describe_rounds(&matchups)
            ),
        )
        .await
    }
    .await;

    wrap_fallible(&context, result).await
}

/// Vote for one side of a matchup.
/// ```
/// /vote 12 Pretzels
/// ```
#[poise::command(prefix_command, slash_command)]
async fn vote(
    context: Context<'_>,
    #[description = "Matchup number"] matchup: i64,
    #[description = "Entry to vote for"]
    #[rest]
    choice: String,
) -> Result<(), anyhow::Error> {
    let result = async {
        let user = require_member(&context).await?;
        let receipt = context
            .data()
            .engine
            .cast_vote(matchup, &user, choice.trim())
            .await?;

        let mut text = format!("Vote for '{}' recorded", receipt.vote.choice);
        if let Some(winner) = &receipt.matchup_winner {
            text.push_str(&format!("\n{} wins matchup #{}", winner, matchup));
        }
        if let Some(round) = receipt.advanced_to_round {
            text.push_str(&format!("\nRound {} is open, see /standings", round));
        }
        if let Some(winner) = &receipt.bracket_winner {
            text.push_str(&format!("\n\u{1F3C6} {} wins the bracket!", winner));
        }
        reply(&context, text).await
    }
    .await;

    wrap_fallible(&context, result).await
}

/// Show entries or matchups of the bracket in this channel.
#[poise::command(prefix_command, slash_command)]
async fn standings(context: Context<'_>) -> Result<(), anyhow::Error> {
    let result = async {
        let bracket = current_bracket(&context).await?;
        let engine = &context.data().engine;
        let matchups = engine.list_matchups(bracket.id).await?;

        let text = if matchups.is_empty() {
            let entries = engine.list_entries(bracket.id).await?;
            let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
            format!("Nominated so far: {}", names.join(", "))
        } else {
            describe_rounds(&matchups)
        };
        reply(&context, text).await
    }
    .await;

    wrap_fallible(&context, result).await
}

pub async fn init_discord(
    settings: Arc<Settings>,
    engine: Arc<BracketEngine>,
) -> Result<(), anyhow::Error> {
    log::info!("Initializing Discord bot");

    let token = settings
        .discord_token
        .clone()
        .ok_or_else(|| anyhow!("No 'discord_token' in the settings file"))?;

    if let Some(channel) = &settings.discord_command_channel {
        log::info!("Receiving Discord commands on '{}'", channel);
    } else {
        log::warn!("No channel specified for 'discord_command_channel' in the settings file, this bot will accept commands on any channel!");
    }

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT;

    let commands = vec![
        bracket(),
        join(),
        leave(),
        nominate(),
        lock(),
        vote(),
        standings(),
    ];

    let options = poise::FrameworkOptions::<Data, anyhow::Error> {
        commands,
        command_check: Some(|ctx| Box::pin(async move { check_channel(&ctx).await })),
        prefix_options: poise::PrefixFrameworkOptions {
            prefix: Some("/".into()),
            edit_tracker: None,
            ..Default::default()
        },
        ..Default::default()
    };

    let framework = poise::Framework::<Data, anyhow::Error>::builder()
        .options(options)
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                log::info!("Logged in as {}", ready.user.name);
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(Data { engine, settings })
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(token.trim(), intents)
        .framework(framework)
        .await?;

    client.start().await?;

    Ok(())
}
