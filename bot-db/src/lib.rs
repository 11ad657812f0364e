pub mod fireboard;

pub use fireboard::{BoardConfig, FireboardStore, IgnoreList, MemoryStore, MirrorEntry};

use bot_traits::ForwardRefToTracing;
use color_eyre::eyre::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};
use sled::{Db, Tree};

pub trait ReadWriteTree {
    fn typed_insert<K: Serialize, V: DeserializeOwned + Serialize>(
        &self,
        key: &K,
        value: &V,
    ) -> Result<()>;

    fn typed_get<K: Serialize, V: DeserializeOwned + Serialize>(
        &self,
        key: &K,
    ) -> Result<Option<V>>;

    fn typed_remove<K: Serialize>(&self, key: &K) -> Result<()>;

    /// Iterates every value in the tree, skipping (and tracing) any entry
    /// that fails to deserialize.
    fn typed_values<V: DeserializeOwned + Serialize>(&self) -> impl Iterator<Item = V>;
}

impl ReadWriteTree for Tree {
    fn typed_insert<K: Serialize, V: DeserializeOwned + Serialize>(
        &self,
        key: &K,
        value: &V,
    ) -> Result<()> {
        let key = bincode::serialize::<K>(key)?;
        let value = bincode::serialize::<V>(value)?;
        self.insert(key, value)?;
        Ok(())
    }

    fn typed_get<K: Serialize, V: DeserializeOwned + Serialize>(
        &self,
        key: &K,
    ) -> Result<Option<V>> {
        Ok(self
            .get(bincode::serialize::<K>(key)?)?
            .map(|value| bincode::deserialize::<V>(&value))
            .transpose()?)
    }

    fn typed_remove<K: Serialize>(&self, key: &K) -> Result<()> {
        self.remove(bincode::serialize::<K>(key)?)?;
        Ok(())
    }

    fn typed_values<V: DeserializeOwned + Serialize>(&self) -> impl Iterator<Item = V> {
        self.iter()
            .filter_map(|entry| entry.trace_err_ok())
            .filter_map(|(_, value)| bincode::deserialize::<V>(&value).trace_err_ok())
    }
}

/// The sled database backing the fireboard. One tree per record kind.
#[derive(Debug)]
pub struct FireboardDb {
    boards: Tree,
    ignore_lists: Tree,
    mirrors: Tree,
}

impl FireboardDb {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::from_db(sled::open(path).wrap_err("Failed to open fireboard db")?)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            boards: db.open_tree("boards")?,
            ignore_lists: db.open_tree("ignore_lists")?,
            mirrors: db.open_tree("mirrors")?,
        })
    }
}

impl FireboardStore for FireboardDb {
    fn board(&self, guild_id: u64, reaction: &str) -> Result<Option<BoardConfig>> {
        self.boards.typed_get(&(guild_id, reaction))
    }

    fn boards_for_guild(&self, guild_id: u64) -> Result<Vec<BoardConfig>> {
        Ok(self
            .boards
            .typed_values::<BoardConfig>()
            .filter(|board| board.guild_id == guild_id)
            .collect())
    }

    fn boards_targeting(&self, channel_id: u64) -> Result<Vec<BoardConfig>> {
        Ok(self
            .boards
            .typed_values::<BoardConfig>()
            .filter(|board| board.channel_id == channel_id)
            .collect())
    }

    fn upsert_board(&self, board: &BoardConfig) -> Result<()> {
        self.boards
            .typed_insert(&(board.guild_id, board.reaction.as_str()), board)
    }

    fn delete_board(&self, guild_id: u64, reaction: &str) -> Result<()> {
        self.boards.typed_remove(&(guild_id, reaction))
    }

    fn ignore_list(&self, guild_id: u64) -> Result<IgnoreList> {
        Ok(self
            .ignore_lists
            .typed_get::<u64, IgnoreList>(&guild_id)?
            .unwrap_or_default())
    }

    fn set_ignore_list(&self, guild_id: u64, list: &IgnoreList) -> Result<()> {
        self.ignore_lists.typed_insert(&guild_id, list)
    }

    fn mirror(&self, source_message_id: u64) -> Result<Option<MirrorEntry>> {
        self.mirrors.typed_get(&source_message_id)
    }

    fn upsert_mirror(&self, entry: &MirrorEntry) -> Result<()> {
        self.mirrors.typed_insert(&entry.source_message_id, entry)
    }

    fn delete_mirror(&self, source_message_id: u64) -> Result<()> {
        self.mirrors.typed_remove(&source_message_id)
    }

    fn mirrors_for_guild(&self, guild_id: u64) -> Result<Vec<MirrorEntry>> {
        Ok(self
            .mirrors
            .typed_values::<MirrorEntry>()
            .filter(|entry| entry.guild_id == guild_id)
            .collect())
    }

    fn mirrors_for_board(&self, guild_id: u64, reaction: &str) -> Result<Vec<MirrorEntry>> {
        Ok(self
            .mirrors
            .typed_values::<MirrorEntry>()
            .filter(|entry| entry.guild_id == guild_id && entry.board_reaction == reaction)
            .collect())
    }

    fn mirrors_in_channel(&self, source_channel_id: u64) -> Result<Vec<MirrorEntry>> {
        Ok(self
            .mirrors
            .typed_values::<MirrorEntry>()
            .filter(|entry| entry.source_channel_id == source_channel_id)
            .collect())
    }

    fn delete_guild(&self, guild_id: u64) -> Result<()> {
        let boards = self.boards_for_guild(guild_id)?;
        let entries = self.mirrors_for_guild(guild_id)?;

        tracing::info!(
            guild = guild_id,
            boards = boards.len(),
            mirrors = entries.len(),
            "dropping all stored state for guild"
        );

        for board in boards {
            self.delete_board(guild_id, &board.reaction)?;
        }
        for entry in entries {
            self.delete_mirror(entry.source_message_id)?;
        }
        self.ignore_lists.typed_remove(&guild_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temporary_db() -> FireboardDb {
        FireboardDb::from_db(
            sled::Config::new()
                .temporary(true)
                .open()
                .expect("temporary sled db"),
        )
        .expect("open trees")
    }

    fn board(guild_id: u64, reaction: &str, channel_id: u64) -> BoardConfig {
        BoardConfig {
            guild_id,
            channel_id,
            reaction: reaction.to_string(),
            threshold: 3,
            ignore_bots: true,
        }
    }

    fn mirror(guild_id: u64, source_message_id: u64, reaction: &str) -> MirrorEntry {
        MirrorEntry {
            guild_id,
            source_channel_id: 10,
            source_message_id,
            mirror_message_id: source_message_id + 1000,
            board_reaction: reaction.to_string(),
            last_known_reaction_count: Some(3),
        }
    }

    #[test]
    fn board_round_trip() {
        let db = temporary_db();
        db.upsert_board(&board(1, "🔥", 42)).unwrap();

        assert_eq!(db.board(1, "🔥").unwrap(), Some(board(1, "🔥", 42)));
        assert_eq!(db.board(1, "⭐").unwrap(), None);
        assert_eq!(db.board(2, "🔥").unwrap(), None);

        db.delete_board(1, "🔥").unwrap();
        assert_eq!(db.board(1, "🔥").unwrap(), None);
    }

    #[test]
    fn boards_are_scoped_by_guild_and_target() {
        let db = temporary_db();
        db.upsert_board(&board(1, "🔥", 42)).unwrap();
        db.upsert_board(&board(1, "⭐", 43)).unwrap();
        db.upsert_board(&board(2, "🔥", 42)).unwrap();

        assert_eq!(db.boards_for_guild(1).unwrap().len(), 2);
        assert_eq!(db.boards_targeting(42).unwrap().len(), 2);
        assert_eq!(db.boards_targeting(43).unwrap().len(), 1);
    }

    #[test]
    fn mirror_entry_lifecycle() {
        let db = temporary_db();
        db.upsert_mirror(&mirror(1, 100, "🔥")).unwrap();

        let mut updated = mirror(1, 100, "🔥");
        updated.last_known_reaction_count = None;
        db.upsert_mirror(&updated).unwrap();
        assert_eq!(db.mirror(100).unwrap(), Some(updated));

        db.delete_mirror(100).unwrap();
        assert_eq!(db.mirror(100).unwrap(), None);
    }

    #[test]
    fn guild_cascade_removes_everything() {
        let db = temporary_db();
        db.upsert_board(&board(1, "🔥", 42)).unwrap();
        db.upsert_mirror(&mirror(1, 100, "🔥")).unwrap();
        db.upsert_mirror(&mirror(2, 200, "🔥")).unwrap();
        db.set_ignore_list(
            1,
            &IgnoreList {
                ignored_channel_ids: [7].into_iter().collect(),
                ignored_role_ids: Default::default(),
            },
        )
        .unwrap();

        db.delete_guild(1).unwrap();

        assert_eq!(db.board(1, "🔥").unwrap(), None);
        assert_eq!(db.mirror(100).unwrap(), None);
        assert_eq!(db.mirror(200).unwrap(), Some(mirror(2, 200, "🔥")));
        assert!(db.ignore_list(1).unwrap().ignored_channel_ids.is_empty());
    }
}
