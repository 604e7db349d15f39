pub mod audit;
pub mod close;
pub mod help;
pub mod register;
pub mod staff;
pub mod stats;
pub mod tempchannel;
pub mod tempvoice;
pub mod ticket;

use crate::data::PoiseContext;
use color_eyre::eyre::Result;

/// Staff check: channel managers, administrators and anyone listed in
/// `privileged_users`.
pub async fn is_moderator(ctx: PoiseContext<'_>) -> Result<bool> {
    if ctx.data().is_privileged(ctx.author().id).await {
        return Ok(true);
    }

    let Some(member) = ctx.author_member().await else {
        return Ok(false);
    };

    let permissions = member
        .permissions
        .or_else(|| ctx.guild().map(|guild| guild.member_permissions(&member)));

    Ok(permissions.is_some_and(|p| p.manage_channels() || p.administrator()))
}
