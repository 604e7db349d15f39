use bot_lib::{
    IntoCloneableCtx,
    commands::{
        audit::audit,
        close::close,
        help::help,
        register::register,
        staff::staff,
        stats::{cleanup, stats},
        tempchannel::tempchannel,
        tempvoice::tempvoice,
        ticket::ticket,
    },
    config,
    data::{RawAppState, State},
    event_handler::event_handler,
    tasks::TaskSupervisor,
};
use bot_traits::ForwardRefToTracing;
use clap::Parser;
use color_eyre::eyre::{Error, Result, WrapErr};
use dotenvy::dotenv;
use poise::{CreateReply, serenity_prelude as serenity};
use std::sync::Arc;
use tracing_subscriber::util::SubscriberInitExt;

/// The cli arguments for the bot
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Don't start the discord bot
    #[arg(short, long, default_value = "false")]
    pub dry_run: bool,

    /// Path to the config file
    #[arg(short, long, default_value_t = String::from("config.toml"))]
    pub config: String,
}

async fn on_error(error: poise::FrameworkError<'_, State, Error>) {
    match error {
        poise::FrameworkError::Command { error, ctx, .. } => {
            tracing::error!(
                "Command `{}` failed: {:?}",
                ctx.command().qualified_name,
                error
            );

            ctx.send(
                CreateReply::default()
                    .content("Sorry, something went wrong. The staff can find the details in the logs.")
                    .ephemeral(true),
            )
            .await
            .trace_err_ok();
        }
        error => {
            poise::builtins::on_error(error).await.trace_err_ok();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().wrap_err("Failed to load .env file. Add a file with the following contents: `DISCORD_TOKEN=\"your token\"` to a .env file in the root directory of the repo.")?;
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .finish()
        .init();

    let Args {
        dry_run,
        config: config_path,
    } = Args::parse();
    let token =
        std::env::var("DISCORD_TOKEN").wrap_err("Expected a discord token environment variable")?;
    let config =
        config::Config::create_from_file(&config_path).wrap_err("Failed to load config")?;

    let tasks = TaskSupervisor::new();

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                help(),
                register(),
                tempvoice(),
                tempchannel(),
                ticket(),
                close(),
                staff(),
                stats(),
                cleanup(),
                audit(),
            ],
            event_handler: |ctx, event, _framework, data| {
                Box::pin(event_handler(ctx, event, data.clone()))
            },
            on_error: |error| Box::pin(on_error(error)),
            ..Default::default()
        })
        .setup({
            let tasks = tasks.clone();
            move |ctx, _ready, framework| {
                Box::pin(async move {
                    poise::builtins::register_in_guild(
                        ctx,
                        &framework.options().commands,
                        serenity::GuildId::from(config.guild_id),
                    )
                    .await?;

                    let state = RawAppState::new(ctx.get_cloneable_ctx(), config, config_path, tasks)
                        .wrap_err("Failed to set up the bot state")?;

                    Ok(Arc::new(state))
                })
            }
        })
        .build();

    let client = serenity::ClientBuilder::new(
        token,
        serenity::GatewayIntents::non_privileged()
            | serenity::GatewayIntents::MESSAGE_CONTENT
            | serenity::GatewayIntents::GUILD_MEMBERS
            | serenity::GatewayIntents::GUILD_MESSAGES
            | serenity::GatewayIntents::GUILD_VOICE_STATES,
    )
    .framework(framework)
    .await;

    if dry_run {
        println!("Bot setup worked, dry run enabled, exiting");
        return Ok(());
    }

    let mut client = client.wrap_err("Failed to start bot (serenity)")?;

    {
        let shard_manager = client.shard_manager.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.trace_err_ok();
            tracing::info!("Shutting down");
            shard_manager.shutdown_all().await;
        });
    }

    tracing::info!("Starting bot");

    let result = client
        .start()
        .await
        .wrap_err("Failed to start bot (startup)");

    tasks.shutdown().await;

    result
}
