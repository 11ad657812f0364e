use std::collections::{HashMap, HashSet};

use color_eyre::eyre::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One configured board: when messages in `guild_id` collect `threshold`
/// reactions matching `reaction`, they are mirrored into `channel_id`.
///
/// `reaction` is the emoji identity used everywhere as the board key: the
/// unicode emoji itself, or a custom emoji's numeric id rendered as a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BoardConfig {
    pub guild_id: u64,
    pub channel_id: u64,
    pub reaction: String,
    pub threshold: u64,
    #[serde(default = "default_ignore_bots")]
    pub ignore_bots: bool,
}

fn default_ignore_bots() -> bool {
    true
}

/// Per guild blacklists. NSFW channels are always ignored regardless of
/// what is in here.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct IgnoreList {
    #[serde(default)]
    pub ignored_channel_ids: HashSet<u64>,
    #[serde(default)]
    pub ignored_role_ids: HashSet<u64>,
}

/// The persisted link between a source message and its mirror.
///
/// `last_known_reaction_count` is what the mirror currently displays. `None`
/// means the next event must re-count from the gateway instead of trusting a
/// local delta.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MirrorEntry {
    pub guild_id: u64,
    pub source_channel_id: u64,
    pub source_message_id: u64,
    pub mirror_message_id: u64,
    pub board_reaction: String,
    pub last_known_reaction_count: Option<u64>,
}

/// Storage the fireboard engine is constructed with.
///
/// Every call is atomic on its own; the engine's per-message lock provides
/// consistency across calls. Mirror entries are keyed by source message id
/// alone since snowflakes are globally unique, which lets events that carry
/// no guild id (reaction clear) find their entry.
pub trait FireboardStore: Send + Sync {
    fn board(&self, guild_id: u64, reaction: &str) -> Result<Option<BoardConfig>>;
    fn boards_for_guild(&self, guild_id: u64) -> Result<Vec<BoardConfig>>;
    /// Boards whose mirror channel is `channel_id`, across all guilds.
    fn boards_targeting(&self, channel_id: u64) -> Result<Vec<BoardConfig>>;
    fn upsert_board(&self, board: &BoardConfig) -> Result<()>;
    fn delete_board(&self, guild_id: u64, reaction: &str) -> Result<()>;

    fn ignore_list(&self, guild_id: u64) -> Result<IgnoreList>;
    fn set_ignore_list(&self, guild_id: u64, list: &IgnoreList) -> Result<()>;

    fn mirror(&self, source_message_id: u64) -> Result<Option<MirrorEntry>>;
    fn upsert_mirror(&self, entry: &MirrorEntry) -> Result<()>;
    fn delete_mirror(&self, source_message_id: u64) -> Result<()>;
    fn mirrors_for_guild(&self, guild_id: u64) -> Result<Vec<MirrorEntry>>;
    fn mirrors_for_board(&self, guild_id: u64, reaction: &str) -> Result<Vec<MirrorEntry>>;
    fn mirrors_in_channel(&self, source_channel_id: u64) -> Result<Vec<MirrorEntry>>;

    /// Cascade for when the bot leaves a guild.
    fn delete_guild(&self, guild_id: u64) -> Result<()>;
}

impl<S: FireboardStore + ?Sized> FireboardStore for std::sync::Arc<S> {
    fn board(&self, guild_id: u64, reaction: &str) -> Result<Option<BoardConfig>> {
        (**self).board(guild_id, reaction)
    }

    fn boards_for_guild(&self, guild_id: u64) -> Result<Vec<BoardConfig>> {
        (**self).boards_for_guild(guild_id)
    }

    fn boards_targeting(&self, channel_id: u64) -> Result<Vec<BoardConfig>> {
        (**self).boards_targeting(channel_id)
    }

    fn upsert_board(&self, board: &BoardConfig) -> Result<()> {
        (**self).upsert_board(board)
    }

    fn delete_board(&self, guild_id: u64, reaction: &str) -> Result<()> {
        (**self).delete_board(guild_id, reaction)
    }

    fn ignore_list(&self, guild_id: u64) -> Result<IgnoreList> {
        (**self).ignore_list(guild_id)
    }

    fn set_ignore_list(&self, guild_id: u64, list: &IgnoreList) -> Result<()> {
        (**self).set_ignore_list(guild_id, list)
    }

    fn mirror(&self, source_message_id: u64) -> Result<Option<MirrorEntry>> {
        (**self).mirror(source_message_id)
    }

    fn upsert_mirror(&self, entry: &MirrorEntry) -> Result<()> {
        (**self).upsert_mirror(entry)
    }

    fn delete_mirror(&self, source_message_id: u64) -> Result<()> {
        (**self).delete_mirror(source_message_id)
    }

    fn mirrors_for_guild(&self, guild_id: u64) -> Result<Vec<MirrorEntry>> {
        (**self).mirrors_for_guild(guild_id)
    }

    fn mirrors_for_board(&self, guild_id: u64, reaction: &str) -> Result<Vec<MirrorEntry>> {
        (**self).mirrors_for_board(guild_id, reaction)
    }

    fn mirrors_in_channel(&self, source_channel_id: u64) -> Result<Vec<MirrorEntry>> {
        (**self).mirrors_in_channel(source_channel_id)
    }

    fn delete_guild(&self, guild_id: u64) -> Result<()> {
        (**self).delete_guild(guild_id)
    }
}

/// In-memory store with the same semantics as the sled one. Used by the
/// engine unit tests, usable as a throwaway backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    boards: HashMap<(u64, String), BoardConfig>,
    ignore_lists: HashMap<u64, IgnoreList>,
    mirrors: HashMap<u64, MirrorEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FireboardStore for MemoryStore {
    fn board(&self, guild_id: u64, reaction: &str) -> Result<Option<BoardConfig>> {
        Ok(self
            .inner
            .lock()
            .boards
            .get(&(guild_id, reaction.to_string()))
            .cloned())
    }

    fn boards_for_guild(&self, guild_id: u64) -> Result<Vec<BoardConfig>> {
        Ok(self
            .inner
            .lock()
            .boards
            .values()
            .filter(|board| board.guild_id == guild_id)
            .cloned()
            .collect())
    }

    fn boards_targeting(&self, channel_id: u64) -> Result<Vec<BoardConfig>> {
        Ok(self
            .inner
            .lock()
            .boards
            .values()
            .filter(|board| board.channel_id == channel_id)
            .cloned()
            .collect())
    }

    fn upsert_board(&self, board: &BoardConfig) -> Result<()> {
        self.inner
            .lock()
            .boards
            .insert((board.guild_id, board.reaction.clone()), board.clone());
        Ok(())
    }

    fn delete_board(&self, guild_id: u64, reaction: &str) -> Result<()> {
        self.inner
            .lock()
            .boards
            .remove(&(guild_id, reaction.to_string()));
        Ok(())
    }

    fn ignore_list(&self, guild_id: u64) -> Result<IgnoreList> {
        Ok(self
            .inner
            .lock()
            .ignore_lists
            .get(&guild_id)
            .cloned()
            .unwrap_or_default())
    }

    fn set_ignore_list(&self, guild_id: u64, list: &IgnoreList) -> Result<()> {
        self.inner.lock().ignore_lists.insert(guild_id, list.clone());
        Ok(())
    }

    fn mirror(&self, source_message_id: u64) -> Result<Option<MirrorEntry>> {
        Ok(self.inner.lock().mirrors.get(&source_message_id).cloned())
    }

    fn upsert_mirror(&self, entry: &MirrorEntry) -> Result<()> {
        self.inner
            .lock()
            .mirrors
            .insert(entry.source_message_id, entry.clone());
        Ok(())
    }

    fn delete_mirror(&self, source_message_id: u64) -> Result<()> {
        self.inner.lock().mirrors.remove(&source_message_id);
        Ok(())
    }

    fn mirrors_for_guild(&self, guild_id: u64) -> Result<Vec<MirrorEntry>> {
        Ok(self
            .inner
            .lock()
            .mirrors
            .values()
            .filter(|entry| entry.guild_id == guild_id)
            .cloned()
            .collect())
    }

    fn mirrors_for_board(&self, guild_id: u64, reaction: &str) -> Result<Vec<MirrorEntry>> {
        Ok(self
            .inner
            .lock()
            .mirrors
            .values()
            .filter(|entry| entry.guild_id == guild_id && entry.board_reaction == reaction)
            .cloned()
            .collect())
    }

    fn mirrors_in_channel(&self, source_channel_id: u64) -> Result<Vec<MirrorEntry>> {
        Ok(self
            .inner
            .lock()
            .mirrors
            .values()
            .filter(|entry| entry.source_channel_id == source_channel_id)
            .cloned()
            .collect())
    }

    fn delete_guild(&self, guild_id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.boards.retain(|_, board| board.guild_id != guild_id);
        inner.mirrors.retain(|_, entry| entry.guild_id != guild_id);
        inner.ignore_lists.remove(&guild_id);
        Ok(())
    }
}
