use crate::data::PoiseContext;
use color_eyre::eyre::Result;
use itertools::Itertools;

#[poise::command(slash_command, prefix_command, ephemeral = true)]
pub async fn help(ctx: PoiseContext<'_>) -> Result<()> {
    let help_text = ctx.data().config.read().await.help_text.clone();

    match help_text {
        Some(help_text) => {
            ctx.say(&*help_text).await?;
        }
        None => {
            let commands = ctx
                .framework()
                .options()
                .commands
                .iter()
                .filter(|command| !command.hide_in_help)
                .map(|command| format!("`/{}`", command.name))
                .join(", ");

            ctx.say(format!("Available commands: {commands}")).await?;
        }
    }

    Ok(())
}
