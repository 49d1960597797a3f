use serde::{Deserialize, Serialize};
use tilestream_map::StreamingConfig;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub streaming: StreamingConfig,
    pub database: DatabaseConfig,
}

impl Config {
    pub fn read_file(path: &str) -> Result<Self, ron::Error> {
        let reader = std::fs::File::open(path)?;

        ron::de::from_reader(reader)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory of the sled database.
    pub path: String,
    /// Prefix of the sled trees holding this map's chunks, so one database can hold several maps.
    pub map_name: String,
    /// Opens a fresh database in a temporary location, ignoring `path`, and deletes it when dropped.
    pub temporary: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "world.db".into(),
            map_name: "overworld".into(),
            temporary: false,
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
