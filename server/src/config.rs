//! Environment-sourced configuration.
//!
//! One immutable record, constructed at startup from `VECBASE_*` variables
//! with CLI flags taking precedence, then passed by reference to whatever
//! needs it. `PORT` is honored as a fallback for platform launchers.

use std::path::PathBuf;

use vecbase_core::model::{IndexConfig, IndexKind, LshParams};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Unset = in-memory only: no load at startup, no persistence.
    pub snapshot_path: Option<PathBuf>,
    /// Index defaults applied to newly created libraries.
    pub index: IndexConfig,
    /// Seconds between background snapshot persists.
    pub persist_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            snapshot_path: None,
            index: IndexConfig::default(),
            persist_interval_secs: 60,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, String> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("{name}={raw} is not valid")),
    }
}

impl Config {
    /// Resolve from the process environment. Returns a human-readable
    /// message on the first malformed variable; startup aborts on it.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Config::default();

        if let Some(host) = env_var("VECBASE_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_env::<u16>("VECBASE_PORT")? {
            config.port = port;
        } else if let Some(port) = parse_env::<u16>("PORT")? {
            config.port = port;
        }
        if let Some(path) = env_var("VECBASE_SNAPSHOT") {
            config.snapshot_path = Some(PathBuf::from(path));
        }
        if let Some(kind) = env_var("VECBASE_INDEX") {
            config.index.kind = kind
                .parse::<IndexKind>()
                .map_err(|e| format!("VECBASE_INDEX: {e}"))?;
        }

        let mut lsh = LshParams::default();
        if let Some(bands) = parse_env::<usize>("VECBASE_LSH_BANDS")? {
            lsh.bands = bands;
        }
        if let Some(hashes) = parse_env::<u32>("VECBASE_LSH_HASHES")? {
            lsh.hashes = Some(hashes);
        }
        if let Some(seed) = parse_env::<u64>("VECBASE_LSH_SEED")? {
            lsh.seed = seed;
        }
        config.index.lsh = lsh;

        if let Some(secs) = parse_env::<u64>("VECBASE_PERSIST_INTERVAL")? {
            config.persist_interval_secs = secs.max(1);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_memory_linear() {
        let c = Config::default();
        assert_eq!(c.port, 8000);
        assert!(c.snapshot_path.is_none());
        assert_eq!(c.index.kind, IndexKind::Linear);
        assert_eq!(c.index.lsh.bands, 10);
    }
}
