//! Load config from file and environment.

use serde::Deserialize;
use shoal_core::{LedbatConfig, TransferConfig};
use std::path::{Path, PathBuf};

/// Node configuration. File: ~/.config/shoal/config.toml or /etc/shoal/config.toml.
/// Env overrides: SHOAL_PORT, SHOAL_PIECE_SIZE, SHOAL_BLOCK_SIZE, SHOAL_TARGET_DELAY_MS,
/// SHOAL_TICK_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port a seeding node listens on (default 45680).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Timer resolution of the session loop in milliseconds (default 10).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub ledbat: LedbatConfig,
}

fn default_port() -> u16 {
    45680
}
fn default_tick_ms() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            tick_ms: default_tick_ms(),
            transfer: TransferConfig::default(),
            ledbat: LedbatConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file(&config_paths()).unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/shoal/config.toml"));
    }
    out.push(PathBuf::from("/etc/shoal/config.toml"));
    out
}

/// First existing path wins. A file that fails to parse is reported and ignored.
fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let path = paths.iter().find(|p| p.exists())?;
    match parse_file(path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring config file");
            None
        }
    }
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<Config>(&s)?)
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(p) = var("SHOAL_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.port = p;
    }
    if let Some(t) = var("SHOAL_TICK_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.tick_ms = t.max(1);
    }
    if let Some(p) = var("SHOAL_PIECE_SIZE").and_then(|s| s.parse::<u32>().ok()) {
        if p > 0 {
            c.transfer.piece_size = p;
        }
    }
    // Block size is applied after piece size and rounded down to whole pieces.
    if let Some(b) = var("SHOAL_BLOCK_SIZE").and_then(|s| s.parse::<u64>().ok()) {
        let pieces = b / c.transfer.piece_size as u64;
        if pieces > 0 {
            c.transfer.pieces_per_block = pieces.min(u32::MAX as u64) as u32;
        }
    }
    if let Some(t) = var("SHOAL_TARGET_DELAY_MS").and_then(|s| s.parse::<u64>().ok()) {
        if t > 0 {
            c.ledbat.target_ms = t;
        }
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::{HashAlg, LossPolicy};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
port = 5000

[transfer]
piece_size = 512
hash_alg = "sha512"

[ledbat]
target_ms = 25
multi_pane = true
loss_policy = { kind = "percentage", threshold = 0.1 }
"#,
        )
        .unwrap();
        let c = load_file(&[dir.path().join("missing.toml"), path]).unwrap();
        assert_eq!(c.port, 5000);
        assert_eq!(c.tick_ms, 10);
        assert_eq!(c.transfer.piece_size, 512);
        assert_eq!(c.transfer.pieces_per_block, 10);
        assert_eq!(c.transfer.hash_alg, HashAlg::Sha512);
        assert_eq!(c.ledbat.target_ms, 25);
        assert!(c.ledbat.multi_pane);
        assert_eq!(c.ledbat.loss_policy, LossPolicy::Percentage { threshold: 0.1 });
        assert_eq!(c.ledbat.mss, 1024);
    }

    #[test]
    fn unknown_field_ignored_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "prot = 1\n").unwrap();
        assert!(load_file(&[path]).is_none());
    }

    #[test]
    fn no_file_gives_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_file(&[dir.path().join("config.toml")]).is_none());
    }

    #[test]
    fn env_overrides() {
        let c = apply_env(
            Config::default(),
            env(&[
                ("SHOAL_PORT", "6001"),
                ("SHOAL_PIECE_SIZE", "2048"),
                ("SHOAL_BLOCK_SIZE", "40960"),
                ("SHOAL_TARGET_DELAY_MS", "60"),
            ]),
        );
        assert_eq!(c.port, 6001);
        assert_eq!(c.transfer.piece_size, 2048);
        assert_eq!(c.transfer.pieces_per_block, 20);
        assert_eq!(c.transfer.block_size(), 40960);
        assert_eq!(c.ledbat.target_ms, 60);
    }

    #[test]
    fn bad_env_values_ignored() {
        let c = apply_env(
            Config::default(),
            env(&[
                ("SHOAL_PORT", "not-a-port"),
                ("SHOAL_PIECE_SIZE", "0"),
                ("SHOAL_BLOCK_SIZE", "100"),
            ]),
        );
        assert_eq!(c.port, 45680);
        assert_eq!(c.transfer.piece_size, 1024);
        assert_eq!(c.transfer.pieces_per_block, 10);
    }
}
