use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stack_backup_compose::ComposeConfig;

use crate::engine::EngineSettings;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub backup: BackupConfig,
    pub compose: ComposeSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Option<String>,
    pub api_token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PathsConfig {
    pub stacks_dir: Option<String>,
    pub backup_dir: Option<String>,
    pub log_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BackupConfig {
    pub include_data: Option<bool>,
    pub skip_stop: Option<Vec<String>>,
    pub retention_days: Option<i64>,
    pub log_retention_days: Option<i64>,
    pub archive_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ComposeSection {
    pub docker_bin: Option<String>,
    pub command_timeout_secs: Option<u64>,
    pub status_timeout_secs: Option<u64>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

/// Effective settings after environment overrides and defaults.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub listen: String,
    #[serde(skip)]
    pub api_token: Option<String>,
    pub stacks_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub log_dir: PathBuf,
    pub include_data: bool,
    pub skip_stop: Vec<String>,
    pub retention_days: i64,
    pub log_retention_days: i64,
    pub archive_timeout_secs: u64,
    pub docker_bin: String,
    pub command_timeout_secs: u64,
    pub status_timeout_secs: u64,
}

impl Settings {
    pub fn resolve(cfg: &Config) -> Self {
        Self::resolve_with(cfg, |key| env::var(key).ok())
    }

    /// `lookup` stands in for the process environment.
    pub fn resolve_with(cfg: &Config, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, value: &Option<String>, default: &str| {
            lookup(key)
                .or_else(|| value.clone())
                .unwrap_or_else(|| default.to_owned())
        };
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<i64>().ok());
        let flag = |key: &str| {
            lookup(key).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            })
        };

        let skip_stop = lookup("STACK_BACKUP_SKIP_STOP")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .or_else(|| cfg.backup.skip_stop.clone())
            .unwrap_or_default();

        Self {
            listen: string("STACK_BACKUP_LISTEN", &cfg.server.listen, "127.0.0.1:8088"),
            api_token: lookup("STACK_BACKUP_API_TOKEN").or_else(|| cfg.server.api_token.clone()),
            stacks_dir: string("STACK_BACKUP_STACKS_DIR", &cfg.paths.stacks_dir, "/opt/stacks").into(),
            backup_dir: string("STACK_BACKUP_BACKUP_DIR", &cfg.paths.backup_dir, "/opt/backups").into(),
            log_dir: string("STACK_BACKUP_LOG_DIR", &cfg.paths.log_dir, "/opt/backup-logs").into(),
            include_data: flag("STACK_BACKUP_INCLUDE_DATA")
                .or(cfg.backup.include_data)
                .unwrap_or(true),
            skip_stop,
            retention_days: parsed("STACK_BACKUP_RETENTION_DAYS")
                .or(cfg.backup.retention_days)
                .unwrap_or(7),
            log_retention_days: parsed("STACK_BACKUP_LOG_RETENTION_DAYS")
                .or(cfg.backup.log_retention_days)
                .unwrap_or(14),
            archive_timeout_secs: cfg.backup.archive_timeout_secs.unwrap_or(3600),
            docker_bin: cfg
                .compose
                .docker_bin
                .clone()
                .unwrap_or_else(|| "docker".to_owned()),
            command_timeout_secs: cfg.compose.command_timeout_secs.unwrap_or(120),
            status_timeout_secs: cfg.compose.status_timeout_secs.unwrap_or(10),
        }
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            backup_dir: self.backup_dir.clone(),
            include_data: self.include_data,
            retention_days: self.retention_days,
            log_retention_days: self.log_retention_days,
            archive_timeout: self.archive_timeout(),
        }
    }

    pub fn compose_config(&self) -> ComposeConfig {
        ComposeConfig {
            docker_bin: self.docker_bin.clone(),
            command_timeout: self.command_timeout(),
            status_timeout: self.status_timeout(),
        }
    }

    /// Creates the stacks, backup and log directories if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.stacks_dir, &self.backup_dir, &self.log_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
        }
        Ok(())
    }
}
