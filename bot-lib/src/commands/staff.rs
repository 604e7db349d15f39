use crate::{config::Config, data::PoiseContext};
use color_eyre::eyre::Result;
use poise::serenity_prelude::{User, UserId};
use std::path::Path;

/// Manage who counts as staff without a Discord permission
#[poise::command(
    slash_command,
    subcommands("add", "remove"),
    guild_only,
    owners_only,
    hide_in_help
)]
pub async fn staff(_: PoiseContext<'_>) -> Result<()> {
    Ok(())
}

/// Adds or removes `user` and saves the file. Returns whether anything changed.
fn update_staff(config: &mut Config, path: &Path, user: UserId, add: bool) -> Result<bool> {
    let changed = if add {
        let missing = !config.is_privileged(user);
        if missing {
            config.privileged_users.push(user);
        }
        missing
    } else {
        let before = config.privileged_users.len();
        config.privileged_users.retain(|&id| id != user);
        config.privileged_users.len() != before
    };

    if changed {
        config.save(path)?;
    }

    Ok(changed)
}

/// Let someone claim tickets, close channels and use the moderator commands
#[poise::command(slash_command, ephemeral = true, guild_only, owners_only)]
async fn add(ctx: PoiseContext<'_>, #[description = "The new staff member"] user: User) -> Result<()> {
    let data = ctx.data();
    let added = {
        let mut config = data.config.write().await;
        update_staff(&mut config, &data.config_path, user.id, true)?
    };

    if added {
        tracing::info!("{} added {} to the staff", ctx.author().name, user.name);
        ctx.say(format!("<@{}> is now staff.", user.id)).await?;
    } else {
        ctx.say(format!("<@{}> is already staff.", user.id)).await?;
    }

    Ok(())
}

#[poise::command(slash_command, ephemeral = true, guild_only, owners_only)]
async fn remove(
    ctx: PoiseContext<'_>,
    #[description = "The staff member to remove"] user: User,
) -> Result<()> {
    let data = ctx.data();
    let removed = {
        let mut config = data.config.write().await;
        update_staff(&mut config, &data.config_path, user.id, false)?
    };

    if removed {
        tracing::info!("{} removed {} from the staff", ctx.author().name, user.name);
        ctx.say(format!("<@{}> is no longer staff.", user.id)).await?;
    } else {
        ctx.say(format!("<@{}> isn't staff.", user.id)).await?;
    }

    Ok(())
}
