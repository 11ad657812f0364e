use crate::{data::State, fireboard::ReactionEvent};
use bot_traits::ForwardRefToTracing;
use color_eyre::eyre::Result;
use poise::serenity_prelude as serenity;

/// Maps a gateway reaction payload to the engine's event type. DMs carry no
/// guild id and are skipped.
fn reaction_event(reaction: &serenity::Reaction) -> Option<ReactionEvent> {
    Some(ReactionEvent {
        guild_id: reaction.guild_id?,
        channel_id: reaction.channel_id,
        message_id: reaction.message_id,
        user_id: reaction.user_id,
        message_author_id: reaction.message_author_id,
        emoji: reaction.emoji.clone(),
    })
}

pub async fn event_handler(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    data: State,
) -> Result<()> {
    match event {
        serenity::FullEvent::ReactionAdd {
            add_reaction: reaction,
        } => {
            if let Some(event) = reaction_event(reaction) {
                data.fireboard.reaction_added(event).await.trace_err_ok();
            }
        }
        serenity::FullEvent::ReactionRemove {
            removed_reaction: reaction,
        } => {
            if let Some(event) = reaction_event(reaction) {
                data.fireboard.reaction_removed(event).await.trace_err_ok();
            }
        }
        serenity::FullEvent::ReactionRemoveAll {
            removed_from_message_id,
            ..
        } => {
            data.fireboard
                .reactions_cleared(*removed_from_message_id)
                .await
                .trace_err_ok();
        }
        serenity::FullEvent::ReactionRemoveEmoji { removed_reactions } => {
            data.fireboard
                .reaction_cleared_for_emoji(
                    removed_reactions.message_id,
                    &removed_reactions.emoji,
                )
                .await
                .trace_err_ok();
        }
        serenity::FullEvent::MessageUpdate { event, .. } => {
            data.fireboard
                .message_edited(event.channel_id, event.id)
                .await
                .trace_err_ok();
        }
        serenity::FullEvent::MessageDelete {
            deleted_message_id, ..
        } => {
            data.fireboard
                .message_deleted(*deleted_message_id)
                .await
                .trace_err_ok();
        }
        serenity::FullEvent::ChannelDelete { channel, .. } => {
            data.fireboard.channel_deleted(channel.id).await.trace_err_ok();
        }
        serenity::FullEvent::GuildDelete { incomplete, .. } => {
            // `unavailable` means an outage, not a removal.
            if !incomplete.unavailable {
                data.fireboard.guild_removed(incomplete.id).await.trace_err_ok();
            }
        }
        serenity::FullEvent::Ratelimit { data } => {
            tracing::warn!("Ratelimited: {:?}", data);
        }
        _ => {}
    };

    Ok(())
}
