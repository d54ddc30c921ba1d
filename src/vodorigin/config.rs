// SPDX-License-Identifier: GPL-2.0-or-later

use playready::KeySeed;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Main config. The server never edits it.
#[derive(Debug)]
pub struct AppConf {
    port: u16,
    endpoint: String,
    archive_dir: PathBuf,
    dir_levels: u8,
    cache_size: usize,
    workers: usize,
    license_url: String,
    key_seed: KeySeed,
    allow_clear: bool,
}

#[derive(Debug, Deserialize)]
struct RawConf {
    port: u16,
    endpoint: Option<String>,
    archive_dir: PathBuf,
    dir_levels: Option<u8>,
    cache_size: Option<usize>,
    workers: Option<usize>,
    playready: Option<RawPlayReadyConf>,
}

#[derive(Debug, Deserialize)]
struct RawPlayReadyConf {
    license_url: Option<String>,
    key_seed: Option<String>,
    allow_clear: Option<bool>,
}

const DEFAULT_ENDPOINT: &str = "vod";
const DEFAULT_CACHE_SIZE: usize = 100;
const DEFAULT_WORKERS: usize = 1;

#[derive(Debug, Error)]
pub enum ConfNewError {
    #[error("read config file: {0}")]
    ReadFile(std::io::Error),

    #[error("generate config: {0}")]
    Generate(std::io::Error),

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("dir_levels must be at most 3, got {0}")]
    DirLevels(u8),

    #[error("playready.key_seed: {0}")]
    KeySeed(#[from] playready::ParseKeySeedError),
}

impl AppConf {
    pub fn new(config_path: &Path) -> Result<AppConf, ConfNewError> {
        use ConfNewError::*;
        if !config_path.exists() {
            print!(
                "\n\nGenerating '{}' and exiting..\n\n\n",
                config_path.to_string_lossy()
            );
            generate_config(config_path).map_err(Generate)?;
            std::process::exit(0);
        }

        let raw = fs::read_to_string(config_path).map_err(ReadFile)?;
        parse_config(&raw)
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
    #[must_use]
    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }
    #[must_use]
    pub fn dir_levels(&self) -> u8 {
        self.dir_levels
    }
    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }
    #[must_use]
    pub fn license_url(&self) -> &str {
        &self.license_url
    }
    #[must_use]
    pub fn key_seed(&self) -> KeySeed {
        self.key_seed
    }
    #[must_use]
    pub fn allow_clear(&self) -> bool {
        self.allow_clear
    }
}

fn parse_config(raw: &str) -> Result<AppConf, ConfNewError> {
    use ConfNewError::*;
    let raw: RawConf = toml::from_str(raw)?;
    let playready_conf = raw.playready.unwrap_or(RawPlayReadyConf {
        license_url: None,
        key_seed: None,
        allow_clear: None,
    });

    let dir_levels = raw.dir_levels.unwrap_or(0);
    if dir_levels > 3 {
        return Err(DirLevels(dir_levels));
    }

    let key_seed = playready::KeySeed::from_hex(
        playready_conf
            .key_seed
            .as_deref()
            .unwrap_or(playready::DEMO_KEY_SEED),
    )?;

    Ok(AppConf {
        port: raw.port,
        endpoint: raw.endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned()),
        archive_dir: raw.archive_dir,
        dir_levels,
        cache_size: raw.cache_size.unwrap_or(DEFAULT_CACHE_SIZE),
        workers: raw.workers.unwrap_or(DEFAULT_WORKERS),
        license_url: playready_conf
            .license_url
            .unwrap_or_else(|| playready::DEMO_LICENSE_URL.to_owned()),
        key_seed,
        allow_clear: playready_conf.allow_clear.unwrap_or(false),
    })
}

fn generate_config(path: &Path) -> Result<(), std::io::Error> {
    let config = "\
# Port the HTTP server listens on.
port = 8080

# URL prefix of the streaming endpoint.
#endpoint = \"vod\"

# Directory holding one subdirectory per content id.
archive_dir = \"./vod\"

# Shard the archive by the first n characters of the
# content id, at most 3.
#dir_levels = 0

# Number of presentations kept in memory.
#cache_size = 100

# Worker threads for fragment assembly and encryption.
#workers = 1

[playready]
# License server embedded in protection headers.
#license_url = \"http://playready.directtaps.net/pr/svc/rightsmanager.asmx\"

# 60 hex characters. The default is the public demo seed,
# replace it before serving protected content.
#key_seed = \"5D5068BEC9B384FF6044867159F16D6B755544FCD5116989B1ACC4278E88\"

# Serve unencrypted streams.
#allow_clear = false
";
    fs::write(path, config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_config_minimal() {
        let conf = parse_config(
            "port = 8080\narchive_dir = \"/srv/vod\"\n[playready]\n",
        )
        .unwrap();
        assert_eq!(8080, conf.port());
        assert_eq!("vod", conf.endpoint());
        assert_eq!(Path::new("/srv/vod"), conf.archive_dir());
        assert_eq!(0, conf.dir_levels());
        assert_eq!(100, conf.cache_size());
        assert_eq!(1, conf.workers());
        assert_eq!(playready::DEMO_LICENSE_URL, conf.license_url());
        assert!(!conf.allow_clear());
    }

    #[test]
    fn test_parse_config_full() {
        let conf = parse_config(
            "port = 9000\n\
             endpoint = \"stream\"\n\
             archive_dir = \"/data\"\n\
             dir_levels = 2\n\
             cache_size = 5\n\
             workers = 4\n\
             [playready]\n\
             license_url = \"https://drm.example.com/\"\n\
             key_seed = \"5D5068BEC9B384FF6044867159F16D6B755544FCD5116989B1ACC4278E88\"\n\
             allow_clear = true\n",
        )
        .unwrap();
        assert_eq!(9000, conf.port());
        assert_eq!("stream", conf.endpoint());
        assert_eq!(2, conf.dir_levels());
        assert_eq!(5, conf.cache_size());
        assert_eq!(4, conf.workers());
        assert_eq!("https://drm.example.com/", conf.license_url());
        assert!(conf.allow_clear());
    }

    #[test]
    fn test_parse_config_bad_dir_levels() {
        let err = parse_config(
            "port = 1\narchive_dir = \"/x\"\ndir_levels = 4\n[playready]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfNewError::DirLevels(4)));
    }

    #[test]
    fn test_parse_config_bad_key_seed() {
        let err = parse_config(
            "port = 1\narchive_dir = \"/x\"\n[playready]\nkey_seed = \"abc\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfNewError::KeySeed(_)));
    }

    #[test]
    fn test_generated_config_parses() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vodorigin.toml");
        generate_config(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let conf = parse_config(&raw).unwrap();
        assert_eq!(8080, conf.port());
    }
}
