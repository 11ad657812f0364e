//! The engine's view of Discord.
//!
//! The fireboard engine only ever talks to this trait, which keeps the
//! decision logic testable and keeps serenity's builder types out of it.
//! `DiscordGateway` is the real implementation over the shared cache and
//! http handles.

use std::sync::Arc;

use poise::serenity_prelude::{
    Cache, CacheHttp, Channel, ChannelId, CreateEmbed, CreateEmbedAuthor, CreateMessage,
    EditMessage, Error as SerenityError, GuildId, Http, HttpError, Message, MessageId,
    ReactionType, RoleId, Timestamp, UserId,
};
use thiserror::Error;

const DEFAULT_AVATAR_URL: &str = "https://cdn.discordapp.com/embed/avatars/0.png";

/// Failures the engine reacts to differently.
///
/// `NotFound` triggers self healing cleanup, `Forbidden` is logged and leaves
/// persisted state alone, everything else aborts the event untouched.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("referenced message or channel no longer exists")]
    NotFound,
    #[error("missing permissions")]
    Forbidden,
    #[error("gateway call failed: {0}")]
    Other(#[from] SerenityError),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

fn classify(error: SerenityError) -> GatewayError {
    if let SerenityError::Http(HttpError::UnsuccessfulRequest(response)) = &error {
        match response.status_code.as_u16() {
            404 => return GatewayError::NotFound,
            403 => return GatewayError::Forbidden,
            _ => {}
        }
    }

    GatewayError::Other(error)
}

/// A message as the engine sees it, stripped down to what the fireboard
/// needs. Mirror messages come back through here too, with the first embed's
/// description exposed for the idempotent edit check.
#[derive(Debug, Clone)]
pub struct GatewayMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_is_bot: bool,
    pub author_name: String,
    pub author_avatar_url: Option<String>,
    pub content: String,
    pub embed_description: Option<String>,
    pub timestamp: Timestamp,
    pub image_url: Option<String>,
    pub replied_to: Option<(ChannelId, MessageId)>,
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub nsfw: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Reactor {
    pub user_id: UserId,
    pub is_bot: bool,
}

/// Everything needed to render a mirror message.
#[derive(Debug, Clone)]
pub struct MirrorContent {
    /// The count line, e.g. `🔥 **4** <#123>`.
    pub content: String,
    pub embed: MirrorEmbed,
    /// Present when the source message was itself a reply.
    pub reply_embed: Option<MirrorEmbed>,
}

#[derive(Debug, Clone)]
pub struct MirrorEmbed {
    pub author_name: String,
    pub author_icon_url: Option<String>,
    pub description: String,
    pub timestamp: Timestamp,
    pub image_url: Option<String>,
}

/// A partial edit of an existing mirror. Reaction count updates only touch
/// the content line; source edits only touch the embeds.
#[derive(Debug, Clone, Default)]
pub struct MirrorUpdate {
    pub content: Option<String>,
    pub embeds: Option<Vec<MirrorEmbed>>,
}

pub trait Gateway: Send + Sync {
    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> GatewayResult<GatewayMessage>;

    async fn fetch_channel(&self, channel_id: ChannelId) -> GatewayResult<ChannelInfo>;

    /// Every user currently reacting to the message with `reaction`.
    async fn reaction_users(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        reaction: &ReactionType,
    ) -> GatewayResult<Vec<Reactor>>;

    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &MirrorContent,
    ) -> GatewayResult<MessageId>;

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        update: &MirrorUpdate,
    ) -> GatewayResult<()>;

    async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> GatewayResult<()>;

    async fn member_roles(&self, guild_id: GuildId, user_id: UserId)
    -> GatewayResult<Vec<RoleId>>;
}

/// Cheaply cloneable cache + http pair implementing [`Gateway`].
#[derive(Debug)]
pub struct DiscordGateway {
    cache: Arc<Cache>,
    http: Arc<Http>,
}

impl From<&poise::serenity_prelude::Context> for DiscordGateway {
    fn from(ctx: &poise::serenity_prelude::Context) -> Self {
        Self {
            cache: Arc::clone(&ctx.cache),
            http: Arc::clone(&ctx.http),
        }
    }
}

impl Clone for DiscordGateway {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            http: Arc::clone(&self.http),
        }
    }
}

impl CacheHttp for DiscordGateway {
    fn http(&self) -> &Http {
        &self.http
    }

    fn cache(&self) -> Option<&Arc<Cache>> {
        Some(&self.cache)
    }
}

fn convert_message(message: &Message) -> GatewayMessage {
    GatewayMessage {
        id: message.id,
        channel_id: message.channel_id,
        author_id: message.author.id,
        author_is_bot: message.author.bot,
        author_name: message.author.name.clone(),
        author_avatar_url: message.author.avatar_url(),
        content: message.content.clone(),
        embed_description: message
            .embeds
            .first()
            .and_then(|embed| embed.description.clone()),
        timestamp: message.timestamp,
        image_url: message
            .attachments
            .iter()
            .find(|attachment| {
                attachment
                    .content_type
                    .as_ref()
                    .is_some_and(|content_type| content_type.starts_with("image"))
            })
            .map(|attachment| attachment.url.clone()),
        replied_to: message
            .message_reference
            .as_ref()
            .and_then(|reference| reference.message_id.map(|id| (reference.channel_id, id))),
    }
}

fn build_embed(embed: &MirrorEmbed) -> CreateEmbed {
    let author = CreateEmbedAuthor::new(&embed.author_name)
        .icon_url(embed.author_icon_url.as_deref().unwrap_or(DEFAULT_AVATAR_URL));

    let builder = CreateEmbed::new()
        .author(author)
        .description(&embed.description)
        .timestamp(embed.timestamp);

    match &embed.image_url {
        Some(url) => builder.image(url),
        None => builder,
    }
}

impl Gateway for DiscordGateway {
    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> GatewayResult<GatewayMessage> {
        self.http
            .get_message(channel_id, message_id)
            .await
            .map(|message| convert_message(&message))
            .map_err(classify)
    }

    async fn fetch_channel(&self, channel_id: ChannelId) -> GatewayResult<ChannelInfo> {
        if let Some(channel) = self.cache.channel(channel_id) {
            return Ok(ChannelInfo { nsfw: channel.nsfw });
        }

        match self.http.get_channel(channel_id).await.map_err(classify)? {
            Channel::Guild(channel) => Ok(ChannelInfo { nsfw: channel.nsfw }),
            _ => Ok(ChannelInfo { nsfw: false }),
        }
    }

    async fn reaction_users(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        reaction: &ReactionType,
    ) -> GatewayResult<Vec<Reactor>> {
        const PAGE_SIZE: u8 = 100;

        let mut reactors = Vec::new();
        let mut after: Option<UserId> = None;

        loop {
            let page = channel_id
                .reaction_users(&self.http, message_id, reaction.clone(), Some(PAGE_SIZE), after)
                .await
                .map_err(classify)?;

            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);

            reactors.extend(page.iter().map(|user| Reactor {
                user_id: user.id,
                is_bot: user.bot,
            }));

            if page.len() < usize::from(PAGE_SIZE) {
                break;
            }
        }

        Ok(reactors)
    }

    async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &MirrorContent,
    ) -> GatewayResult<MessageId> {
        let mut embeds = vec![build_embed(&content.embed)];
        embeds.extend(content.reply_embed.as_ref().map(build_embed));

        let message = channel_id
            .send_message(
                self,
                CreateMessage::new().content(&content.content).embeds(embeds),
            )
            .await
            .map_err(classify)?;

        Ok(message.id)
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        update: &MirrorUpdate,
    ) -> GatewayResult<()> {
        let mut builder = EditMessage::new();

        if let Some(content) = &update.content {
            builder = builder.content(content);
        }

        if let Some(embeds) = &update.embeds {
            builder = builder.embeds(embeds.iter().map(build_embed).collect());
        }

        channel_id
            .edit_message(self, message_id, builder)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> GatewayResult<()> {
        channel_id
            .delete_message(&self.http, message_id)
            .await
            .map_err(classify)
    }

    async fn member_roles(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> GatewayResult<Vec<RoleId>> {
        guild_id
            .member(self, user_id)
            .await
            .map(|member| member.roles)
            .map_err(classify)
    }
}
