use bot_db::{BoardConfig, IgnoreList};
use color_eyre::eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct Config {
    /// Where the sled database lives.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// The boards the bot will listen for / update.
    #[serde(default, rename = "board")]
    pub boards: Vec<BoardConfig>,
    /// Per guild channel/role blacklists.
    #[serde(default, rename = "ignore")]
    pub ignore_lists: Vec<GuildIgnoreList>,
}

fn default_db_path() -> String {
    "fireboard.db".to_owned()
}

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct GuildIgnoreList {
    pub guild_id: u64,
    #[serde(flatten)]
    pub list: IgnoreList,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: default_db_path(),
            boards: vec![],
            ignore_lists: vec![],
        }
    }
}

impl Config {
    /// Fetches the config from the config file in the root directory.
    pub fn create_from_file(config_path: impl AsRef<Path>) -> Result<Config> {
        let file = std::fs::read_to_string(config_path).wrap_err("Could not read config file")?;

        toml::from_str(&file).wrap_err("Could not parse config file")
    }

    /// Reloads the config file and updates the configuration.
    pub fn reload(&mut self, config_path: impl AsRef<Path>) {
        if let Ok(config) = Config::create_from_file(config_path) {
            *self = config;
        }
    }

    pub fn save(&self, config_path: impl AsRef<Path>) -> Result<()> {
        let toml = toml::to_string(&self).wrap_err("Could not serialize config")?;

        std::fs::write(config_path, toml).wrap_err("Could not save config")
    }
}
