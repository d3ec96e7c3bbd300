// src/config/mod.rs
pub mod zone;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fetch::RetryPolicy;
use crate::postprocess::PostProcessJob;
use crate::scheduler::anchor::AnchorSet;
use crate::store::DEFAULT_PARTITION_PREFIX;
use zone::{ReferenceZone, DEFAULT_TIMEZONE};

const ENV_PATH: &str = "FETCHER_CONFIG_PATH";
const ENV_DB_PATH: &str = "FETCHER_DB_PATH";
const ENV_LISTEN_ADDR: &str = "FETCHER_LISTEN_ADDR";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub timezone: String,
    pub anchor_hours: Vec<u32>,
    pub post_process_delay_mins: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub database_path: PathBuf,
    pub partition_prefix: String,
    pub listen_addr: String,
    pub sources_path: Option<PathBuf>,
    pub run_on_startup: bool,
    pub dispatch_concurrency: usize,
    pub retry: RetryConfig,
    pub post_process: Vec<PostProcessJob>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            anchor_hours: AnchorSet::default().hours().to_vec(),
            post_process_delay_mins: 15,
            http_timeout_secs: 10,
            user_agent: concat!("api-fetcher/", env!("CARGO_PKG_VERSION")).to_string(),
            database_path: PathBuf::from("data/fetcher.db"),
            partition_prefix: DEFAULT_PARTITION_PREFIX.to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            sources_path: None,
            run_on_startup: true,
            dispatch_concurrency: 4,
            retry: RetryConfig::default(),
            post_process: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        AnchorSet::new(self.anchor_hours.iter().copied()).context("anchor_hours")?;
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.dispatch_concurrency == 0 {
            bail!("dispatch_concurrency must be at least 1");
        }
        crate::store::check_partition_name(&self.partition_prefix).context("partition_prefix")?;
        Ok(())
    }

    pub fn zone(&self) -> ReferenceZone {
        ReferenceZone::resolve(&self.timezone)
    }

    pub fn anchors(&self) -> Result<AnchorSet> {
        AnchorSet::new(self.anchor_hours.iter().copied())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn post_process_delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.post_process_delay_mins as i64)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(p) = std::env::var(ENV_DB_PATH) {
            if !p.trim().is_empty() {
                self.database_path = PathBuf::from(p.trim());
            }
        }
        if let Ok(a) = std::env::var(ENV_LISTEN_ADDR) {
            if !a.trim().is_empty() {
                self.listen_addr = a.trim().to_string();
            }
        }
    }
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut cfg = parse_config(&content, &ext)
        .with_context(|| format!("parsing config {}", path.display()))?;
    cfg.apply_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}

/// Load config using env var + fallbacks:
/// 1) $FETCHER_CONFIG_PATH
/// 2) config/fetcher.toml
/// 3) config/fetcher.json
/// 4) built-in defaults
pub fn load_config_default() -> Result<AppConfig> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_config_from(&pb);
        }
        return Err(anyhow!("{ENV_PATH} points to non-existent path"));
    }
    for candidate in ["config/fetcher.toml", "config/fetcher.json"] {
        let p = PathBuf::from(candidate);
        if p.exists() {
            return load_config_from(&p);
        }
    }
    let mut cfg = AppConfig::default();
    cfg.apply_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}

fn parse_config(s: &str, hint_ext: &str) -> Result<AppConfig> {
    if hint_ext == "json" {
        return Ok(serde_json::from_str(s)?);
    }
    if hint_ext == "toml" {
        return Ok(toml::from_str(s)?);
    }
    // Unknown extension: JSON if it looks like an object, TOML otherwise.
    if s.trim_start().starts_with('{') {
        Ok(serde_json::from_str(s)?)
    } else {
        Ok(toml::from_str(s)?)
    }
}
