use anyhow::{bail, Result};
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use sruth_archive::ArchiveConfig;
use sruth_core::PIECE_SIZE;

/// Default first port of the range scanned for three consecutive free
/// server ports.
pub const DEFAULT_PORT_RANGE_START: u16 = 38800;
pub const DEFAULT_PORT_RANGE_END: u16 = 38899;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Ceiling on simultaneously open archive files. Must be positive.
    pub active_file_cache_size: i64,
    /// Time-to-live, in seconds, for files outside the admin subtree.
    pub default_ttl_seconds: i32,
    /// The server binds the first three consecutive free ports in this
    /// range.
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Upper bound on concurrent outbound peers per client manager.
    pub max_clients: usize,
    /// Seconds between tracker polls.
    pub tracker_poll_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            active_file_cache_size: 512,
            default_ttl_seconds: 3600,
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            max_clients: 8,
            tracker_poll_seconds: 30,
        }
    }
}

impl Config {
    pub fn archive_config(&self) -> ArchiveConfig {
        ArchiveConfig {
            active_file_cache_size: self.active_file_cache_size as usize,
            default_ttl_seconds: self.default_ttl_seconds,
            piece_size: PIECE_SIZE,
        }
    }
}

/// Loads the configuration: built-in defaults, overridden by `SRUTH_*`
/// environment variables, overridden by serialized CLI flags.
pub fn load_config(cli: impl Serialize) -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Env::prefixed("SRUTH_"))
        .merge(Serialized::defaults(cli))
        .extract()?;

    if config.active_file_cache_size <= 0 {
        bail!(
            "invalid active file cache size: {}",
            config.active_file_cache_size
        );
    }
    if config.port_range_start > config.port_range_end.saturating_sub(2) {
        bail!(
            "port range {}..{} cannot hold three consecutive ports",
            config.port_range_start,
            config.port_range_end
        );
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use serde::Serialize;

    use super::load_config;

    #[derive(Serialize)]
    struct NoCli {}

    #[derive(Serialize)]
    struct CacheCli {
        active_file_cache_size: i64,
    }

    #[test]
    fn defaults_apply() {
        let config = load_config(NoCli {}).unwrap();
        assert_eq!(config.active_file_cache_size, 512);
        assert_eq!(config.max_clients, 8);
    }

    #[test]
    fn non_positive_cache_size_is_rejected() {
        assert!(load_config(CacheCli {
            active_file_cache_size: 0
        })
        .is_err());
        assert!(load_config(CacheCli {
            active_file_cache_size: -3
        })
        .is_err());
    }
}
