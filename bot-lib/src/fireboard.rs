//! The fireboard engine.
//!
//! Consumes reaction/edit/delete events, decides whether a message belongs on
//! a board, and keeps the mirrored message in the board channel consistent
//! with the source. All decisions about a single source message run under
//! that message's lock; see [`crate::message_locks`].

use bot_db::{BoardConfig, FireboardStore, IgnoreList, MirrorEntry};
use bot_traits::ForwardRefToTracing;
use color_eyre::eyre::Result;
use poise::serenity_prelude::{ChannelId, GuildId, MessageId, ReactionType, UserId};

use crate::{
    gateway::{Gateway, GatewayError, GatewayMessage, MirrorContent, MirrorEmbed, MirrorUpdate},
    message_locks::MessageLocks,
};

/// A reaction add/remove as delivered by the gateway, reduced to the fields
/// the engine decides on.
#[derive(Debug, Clone)]
pub struct ReactionEvent {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub user_id: Option<UserId>,
    pub message_author_id: Option<UserId>,
    pub emoji: ReactionType,
}

#[derive(Debug, Clone, Copy)]
enum ReactionChange {
    Added,
    Removed,
}

#[derive(Debug)]
pub struct Fireboard<G, S> {
    gateway: G,
    store: S,
    locks: MessageLocks,
    bot_user_id: UserId,
}

impl<G: Gateway, S: FireboardStore> Fireboard<G, S> {
    pub fn new(gateway: G, store: S, bot_user_id: UserId) -> Self {
        Self {
            gateway,
            store,
            locks: MessageLocks::new(),
            bot_user_id,
        }
    }

    #[tracing::instrument(level = "trace", skip(self, event), fields(guild = event.guild_id.get(), message = event.message_id.get()))]
    pub async fn reaction_added(&self, event: ReactionEvent) -> Result<()> {
        self.reaction_changed(event, ReactionChange::Added).await
    }

    #[tracing::instrument(level = "trace", skip(self, event), fields(guild = event.guild_id.get(), message = event.message_id.get()))]
    pub async fn reaction_removed(&self, event: ReactionEvent) -> Result<()> {
        self.reaction_changed(event, ReactionChange::Removed).await
    }

    async fn reaction_changed(&self, event: ReactionEvent, change: ReactionChange) -> Result<()> {
        let Some(board) = self
            .store
            .board(event.guild_id.get(), &emoji_key(&event.emoji))?
        else {
            return Ok(());
        };

        if event.message_author_id == Some(self.bot_user_id) {
            return Ok(());
        }

        // A board never mirrors its own channel.
        if event.channel_id.get() == board.channel_id {
            return Ok(());
        }

        let ignore = self.store.ignore_list(event.guild_id.get())?;
        if ignore.ignored_channel_ids.contains(&event.channel_id.get()) {
            return Ok(());
        }

        match self.gateway.fetch_channel(event.channel_id).await {
            Ok(channel) if channel.nsfw => return Ok(()),
            Ok(_) => {}
            Err(GatewayError::NotFound) => return Ok(()),
            Err(error) => return Err(error.into()),
        }

        let guard = self.locks.acquire(event.message_id).await;

        match self.store.mirror(event.message_id.get())? {
            Some(entry) => {
                self.update_mirror_count(&board, entry, &event, change, guard.contended())
                    .await
            }
            None => self.mirror_if_qualified(&board, &ignore, &event).await,
        }
    }

    async fn update_mirror_count(
        &self,
        board: &BoardConfig,
        mut entry: MirrorEntry,
        event: &ReactionEvent,
        change: ReactionChange,
        contended: bool,
    ) -> Result<()> {
        let displayed = entry.last_known_reaction_count;

        let count = if contended || displayed.is_none() {
            // A local delta cannot be trusted: either another handler just
            // processed this message, or the last count never made it to
            // the store.
            match self
                .gateway
                .reaction_users(event.channel_id, event.message_id, &event.emoji)
                .await
            {
                Ok(reactors) => count_reactors(&reactors, board.ignore_bots),
                // The source message is gone; the count is effectively zero
                // and the cleanup below takes care of the rest.
                Err(GatewayError::NotFound) => 0,
                Err(error) => return Err(error.into()),
            }
        } else {
            let displayed = displayed.unwrap_or(0);
            match change {
                ReactionChange::Added => displayed.saturating_add(1),
                ReactionChange::Removed => displayed.saturating_sub(1),
            }
        };

        if count < board.threshold {
            return self.remove_mirror(board, &entry).await;
        }

        if displayed == Some(count) {
            // The mirror already shows this count.
            return Ok(());
        }

        let update = MirrorUpdate {
            content: Some(count_line(&event.emoji, count, entry.source_channel_id)),
            embeds: None,
        };

        match self
            .gateway
            .edit_message(
                ChannelId::new(board.channel_id),
                MessageId::new(entry.mirror_message_id),
                &update,
            )
            .await
        {
            Ok(()) => {
                entry.last_known_reaction_count = Some(count);
                self.store.upsert_mirror(&entry)
            }
            Err(GatewayError::NotFound) => self.heal_missing_mirror(board, &entry).await,
            Err(GatewayError::Forbidden) => {
                tracing::warn!(
                    guild = entry.guild_id,
                    message = entry.source_message_id,
                    "cannot edit mirror message, leaving it untouched"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn mirror_if_qualified(
        &self,
        board: &BoardConfig,
        ignore: &IgnoreList,
        event: &ReactionEvent,
    ) -> Result<()> {
        let source = match self
            .gateway
            .fetch_message(event.channel_id, event.message_id)
            .await
        {
            Ok(source) => source,
            // Stale event for a message that is already gone.
            Err(GatewayError::NotFound) => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        if source.author_id == self.bot_user_id {
            return Ok(());
        }

        if board.ignore_bots && source.author_is_bot {
            return Ok(());
        }

        // Role blacklists need a member lookup, so they are checked only
        // once everything cheaper has passed.
        if !ignore.ignored_role_ids.is_empty() {
            match self
                .gateway
                .member_roles(event.guild_id, source.author_id)
                .await
            {
                Ok(roles) => {
                    if roles
                        .iter()
                        .any(|role| ignore.ignored_role_ids.contains(&role.get()))
                    {
                        return Ok(());
                    }
                }
                // The author already left the guild; nothing to blacklist on.
                Err(GatewayError::NotFound) => {}
                Err(error) => return Err(error.into()),
            }
        }

        let count = match self
            .gateway
            .reaction_users(event.channel_id, event.message_id, &event.emoji)
            .await
        {
            Ok(reactors) => count_reactors(&reactors, board.ignore_bots),
            Err(GatewayError::NotFound) => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        if count < board.threshold {
            return Ok(());
        }

        let content = MirrorContent {
            content: count_line(&event.emoji, count, event.channel_id.get()),
            embed: source_embed(&source, event.guild_id.get()),
            reply_embed: self.reply_embed(&source, event.guild_id.get()).await,
        };

        match self
            .gateway
            .send_message(ChannelId::new(board.channel_id), &content)
            .await
        {
            Ok(mirror_message_id) => self.store.upsert_mirror(&MirrorEntry {
                guild_id: event.guild_id.get(),
                source_channel_id: event.channel_id.get(),
                source_message_id: event.message_id.get(),
                mirror_message_id: mirror_message_id.get(),
                board_reaction: board.reaction.clone(),
                last_known_reaction_count: Some(count),
            }),
            // The mirror channel itself is gone.
            Err(GatewayError::NotFound) => self.remove_board(board).await,
            Err(GatewayError::Forbidden) => {
                tracing::warn!(
                    guild = board.guild_id,
                    channel = board.channel_id,
                    "cannot post to mirror channel"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Rebuilds the mirror's embed after the source message was edited. The
    /// count line and links are left alone.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn message_edited(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<()> {
        if self.store.mirror(message_id.get())?.is_none() {
            return Ok(());
        }

        let _guard = self.locks.acquire(message_id).await;
        let Some(entry) = self.store.mirror(message_id.get())? else {
            return Ok(());
        };

        let Some(board) = self.store.board(entry.guild_id, &entry.board_reaction)? else {
            // The board disappeared underneath this entry.
            self.store.delete_mirror(entry.source_message_id)?;
            return Ok(());
        };

        let source = match self.gateway.fetch_message(channel_id, message_id).await {
            Ok(source) => source,
            // Deletion is handled by its own event.
            Err(GatewayError::NotFound) => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        let mirror_channel = ChannelId::new(board.channel_id);
        let mirror_id = MessageId::new(entry.mirror_message_id);
        let desired = source_embed(&source, entry.guild_id);

        let mirror = match self.gateway.fetch_message(mirror_channel, mirror_id).await {
            Ok(mirror) => mirror,
            Err(GatewayError::NotFound) => return self.heal_missing_mirror(&board, &entry).await,
            Err(error) => return Err(error.into()),
        };

        if mirror.embed_description.as_deref() == Some(desired.description.as_str()) {
            // Mirror already reflects the edit.
            return Ok(());
        }

        let mut embeds = vec![desired];
        embeds.extend(self.reply_embed(&source, entry.guild_id).await);

        match self
            .gateway
            .edit_message(
                mirror_channel,
                mirror_id,
                &MirrorUpdate {
                    content: None,
                    embeds: Some(embeds),
                },
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(GatewayError::NotFound) => self.heal_missing_mirror(&board, &entry).await,
            Err(GatewayError::Forbidden) => {
                tracing::warn!(
                    guild = entry.guild_id,
                    message = entry.source_message_id,
                    "cannot edit mirror message, leaving it untouched"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn message_deleted(&self, message_id: MessageId) -> Result<()> {
        self.retire_mirror(message_id).await
    }

    /// All reactions were cleared at once, so the message no longer
    /// qualifies regardless of the last known count.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn reactions_cleared(&self, message_id: MessageId) -> Result<()> {
        self.retire_mirror(message_id).await
    }

    #[tracing::instrument(level = "trace", skip(self, emoji))]
    pub async fn reaction_cleared_for_emoji(
        &self,
        message_id: MessageId,
        emoji: &ReactionType,
    ) -> Result<()> {
        let Some(entry) = self.store.mirror(message_id.get())? else {
            return Ok(());
        };

        if entry.board_reaction != emoji_key(emoji) {
            return Ok(());
        }

        self.retire_mirror(message_id).await
    }

    /// A channel went away. Boards mirroring into it are torn down with all
    /// their entries; mirrors of messages that lived in it are retired.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn channel_deleted(&self, channel_id: ChannelId) -> Result<()> {
        for board in self.store.boards_targeting(channel_id.get())? {
            self.remove_board(&board).await?;
        }

        for entry in self.store.mirrors_in_channel(channel_id.get())? {
            let _guard = self
                .locks
                .acquire(MessageId::new(entry.source_message_id))
                .await;

            let result = match self.store.board(entry.guild_id, &entry.board_reaction)? {
                Some(board) => self.remove_mirror(&board, &entry).await,
                None => self.store.delete_mirror(entry.source_message_id),
            };

            // Keep sweeping the rest even if one mirror fails to delete.
            result.trace_err_ok();
        }

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn guild_removed(&self, guild_id: GuildId) -> Result<()> {
        self.store.delete_guild(guild_id.get())
    }

    async fn retire_mirror(&self, message_id: MessageId) -> Result<()> {
        if self.store.mirror(message_id.get())?.is_none() {
            return Ok(());
        }

        let _guard = self.locks.acquire(message_id).await;
        let Some(entry) = self.store.mirror(message_id.get())? else {
            return Ok(());
        };

        match self.store.board(entry.guild_id, &entry.board_reaction)? {
            Some(board) => self.remove_mirror(&board, &entry).await,
            None => self.store.delete_mirror(entry.source_message_id),
        }
    }

    async fn remove_mirror(&self, board: &BoardConfig, entry: &MirrorEntry) -> Result<()> {
        match self
            .gateway
            .delete_message(
                ChannelId::new(board.channel_id),
                MessageId::new(entry.mirror_message_id),
            )
            .await
        {
            Ok(()) => self.store.delete_mirror(entry.source_message_id),
            Err(GatewayError::NotFound) => self.heal_missing_mirror(board, entry).await,
            Err(GatewayError::Forbidden) => {
                tracing::warn!(
                    guild = entry.guild_id,
                    message = entry.source_message_id,
                    "cannot delete mirror message, leaving state untouched"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// An edit/delete against the mirror came back not-found. Work out
    /// whether only the message is gone or the whole channel, and clean up
    /// accordingly.
    ///
    /// The caller holds `entry`'s message lock, so the entry is deleted here
    /// before the board sweep rather than inside it.
    async fn heal_missing_mirror(&self, board: &BoardConfig, entry: &MirrorEntry) -> Result<()> {
        match self
            .gateway
            .fetch_channel(ChannelId::new(board.channel_id))
            .await
        {
            Ok(_) => self.store.delete_mirror(entry.source_message_id),
            Err(GatewayError::NotFound) => {
                self.store.delete_mirror(entry.source_message_id)?;
                self.remove_board(board).await
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn remove_board(&self, board: &BoardConfig) -> Result<()> {
        tracing::info!(
            guild = board.guild_id,
            reaction = %board.reaction,
            "removing board and all of its mirror entries"
        );

        for entry in self
            .store
            .mirrors_for_board(board.guild_id, &board.reaction)?
        {
            let _guard = self
                .locks
                .acquire(MessageId::new(entry.source_message_id))
                .await;

            self.store.delete_mirror(entry.source_message_id)?;
        }

        self.store.delete_board(board.guild_id, &board.reaction)
    }

    async fn reply_embed(&self, source: &GatewayMessage, guild_id: u64) -> Option<MirrorEmbed> {
        let (channel_id, message_id) = source.replied_to?;

        match self.gateway.fetch_message(channel_id, message_id).await {
            Ok(replied) => Some(source_embed(&replied, guild_id)),
            Err(GatewayError::NotFound) => None,
            Err(error) => {
                tracing::warn!("failed to fetch replied-to message: {error:?}");
                None
            }
        }
    }
}

fn count_reactors(reactors: &[crate::gateway::Reactor], ignore_bots: bool) -> u64 {
    reactors
        .iter()
        .filter(|reactor| !(ignore_bots && reactor.is_bot))
        .count() as u64
}

/// The identity a reaction is keyed by in board configs: the unicode emoji
/// itself, or a custom emoji's numeric id as a string (names can change,
/// ids cannot).
pub fn emoji_key(reaction: &ReactionType) -> String {
    match reaction {
        ReactionType::Unicode(emoji) => emoji.clone(),
        ReactionType::Custom { id, .. } => id.get().to_string(),
        other => other.to_string(),
    }
}

fn count_line(emoji: &ReactionType, count: u64, source_channel_id: u64) -> String {
    format!("{emoji} **{count}** <#{source_channel_id}>")
}

fn message_link(guild_id: u64, channel_id: ChannelId, message_id: MessageId) -> String {
    format!("https://discord.com/channels/{guild_id}/{channel_id}/{message_id}")
}

fn source_embed(source: &GatewayMessage, guild_id: u64) -> MirrorEmbed {
    let link = message_link(guild_id, source.channel_id, source.id);
    let description = if source.content.is_empty() {
        format!("[Jump to message]({link})")
    } else {
        format!("{}\n\n[Jump to message]({link})", source.content)
    };

    MirrorEmbed {
        author_name: source.author_name.clone(),
        author_icon_url: source.author_avatar_url.clone(),
        description,
        timestamp: source.timestamp,
        image_url: source.image_url.clone(),
    }
}
