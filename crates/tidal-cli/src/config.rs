use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tidal_core::StoreConfig;
use tidal_mirror::DEFAULT_SETTINGS;
use tidal_swarm::SwarmConfig;

use crate::cli::Cli;

/// Stager configuration, read from `--config` and overridden by flags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// How long to wait for a remote drive's head to reach a length.
    pub open_timeout_secs: u64,
    /// Settings carried from the staged checkout into the release.
    pub settings: Vec<String>,
    pub store: StoreConfig,
    pub swarm: SwarmConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            open_timeout_secs: 60,
            settings: DEFAULT_SETTINGS.iter().map(|s| s.to_string()).collect(),
            store: StoreConfig::default(),
            swarm: SwarmConfig::default(),
        }
    }
}

impl StageConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply command-line overrides.
    pub fn with_cli(mut self, cli: &Cli) -> Self {
        if let Some(listen) = cli.listen {
            self.swarm.listen_addr = listen;
        }
        for peer in &cli.peers {
            if !self.swarm.peers.contains(peer) {
                self.swarm.peers.push(*peer);
            }
        }
        self
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn settings_allow_list(&self) -> Vec<&str> {
        self.settings.iter().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = StageConfig::load(None).unwrap();
        assert_eq!(config, StageConfig::default());
        assert_eq!(config.settings_allow_list(), DEFAULT_SETTINGS);
        assert_eq!(config.swarm.idle_window(), Duration::from_secs(15));
    }

    #[test]
    fn file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
open_timeout_secs = 5
settings = ["channel"]

[store]
sync_every_write = true

[swarm]
peers = ["10.0.0.1:4977"]
grace_period_secs = 0
"#
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "tidal",
            "aa",
            "1",
            "bb",
            "--listen",
            "127.0.0.1:4977",
            "--peer",
            "10.0.0.1:4977",
            "--peer",
            "10.0.0.2:4977",
        ])
        .unwrap();
        let config = StageConfig::load(Some(file.path())).unwrap().with_cli(&cli);
        assert_eq!(config.open_timeout(), Duration::from_secs(5));
        assert_eq!(config.settings_allow_list(), vec!["channel"]);
        assert!(config.store.sync_every_write);
        assert_eq!(config.swarm.grace_period(), Duration::ZERO);
        assert_eq!(config.swarm.idle_window(), Duration::from_secs(15));
        assert_eq!(config.swarm.listen_addr.port(), 4977);
        assert_eq!(config.swarm.peers.len(), 2);
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StageConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
