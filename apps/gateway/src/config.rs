use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use time::Duration;

use crate::rate::RateLimits;

const DEFAULT_BIND: &str = "0.0.0.0:7000";
const DEFAULT_BASE_URL: &str = "http://localhost:7000";
const DEFAULT_LINK_BASE: &str = "https://telegram.me";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite(PathBuf),
}

/// Telegram bot the gateway accepts updates for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BotConfig {
    pub id: i64,
    pub token: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    bots: Vec<BotConfig>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Public URL providers call back to, without trailing slash.
    pub public_base_url: String,
    pub raw_dir: PathBuf,
    pub store: StoreBackend,
    pub store_max_handles: usize,
    pub rate_cap: u32,
    pub rate_refill_per_sec: u32,
    pub rate_global_cap: u32,
    pub rate_global_refill_per_sec: u32,
    /// Most hook tokens tracked by the limiter at once.
    pub rate_max_tracked: usize,
    pub oauth_ttl: Duration,
    pub telegram_link_base: String,
    pub bots: Vec<BotConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 7000)),
            public_base_url: DEFAULT_BASE_URL.into(),
            raw_dir: PathBuf::from("./raw"),
            store: StoreBackend::Memory,
            store_max_handles: 64,
            rate_cap: 30,
            rate_refill_per_sec: 10,
            rate_global_cap: 600,
            rate_global_refill_per_sec: 200,
            rate_max_tracked: 10_000,
            oauth_ttl: Duration::hours(1),
            telegram_link_base: DEFAULT_LINK_BASE.into(),
            bots: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let bind: SocketAddr = get("HOOKGRAM_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.into())
            .parse()
            .context("invalid HOOKGRAM_BIND")?;
        let public_base_url = get("HOOKGRAM_BASE_URL")
            .unwrap_or(defaults.public_base_url)
            .trim_end_matches('/')
            .to_string();
        let store = match get("HOOKGRAM_STORE").as_deref().map(str::trim) {
            None | Some("") | Some("memory") => StoreBackend::Memory,
            Some(path) => StoreBackend::Sqlite(PathBuf::from(path)),
        };
        let bots = match get("HOOKGRAM_CONFIG") {
            Some(path) => load_file(Path::new(&path))?.bots,
            None => Vec::new(),
        };

        Ok(Self {
            bind,
            public_base_url,
            raw_dir: get("HOOKGRAM_RAW_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.raw_dir),
            store,
            store_max_handles: parse_or(&get, "HOOKGRAM_STORE_MAX_HANDLES", defaults.store_max_handles)?,
            rate_cap: parse_or(&get, "HOOKGRAM_RATE_CAP", defaults.rate_cap)?,
            rate_refill_per_sec: parse_or(&get, "HOOKGRAM_RATE_REFILL", defaults.rate_refill_per_sec)?,
            rate_global_cap: parse_or(&get, "HOOKGRAM_RATE_GLOBAL_CAP", defaults.rate_global_cap)?,
            rate_global_refill_per_sec: parse_or(
                &get,
                "HOOKGRAM_RATE_GLOBAL_REFILL",
                defaults.rate_global_refill_per_sec,
            )?,
            rate_max_tracked: parse_or(&get, "HOOKGRAM_RATE_MAX_TRACKED", defaults.rate_max_tracked)?,
            oauth_ttl: Duration::seconds(parse_or(&get, "HOOKGRAM_OAUTH_TTL_SECS", 3600i64)?),
            telegram_link_base: get("HOOKGRAM_TELEGRAM_LINK_BASE")
                .unwrap_or(defaults.telegram_link_base)
                .trim_end_matches('/')
                .to_string(),
            bots,
        })
    }

    pub fn bot(&self, id: i64) -> Option<&BotConfig> {
        self.bots.iter().find(|bot| bot.id == id)
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            per_token_cap: self.rate_cap,
            per_token_refill_per_sec: self.rate_refill_per_sec,
            global_cap: self.rate_global_cap,
            global_refill_per_sec: self.rate_global_refill_per_sec,
            max_tracked: self.rate_max_tracked.max(1),
        }
    }

    pub fn bot_link(&self, username: &str) -> String {
        format!("{}/{}", self.telegram_link_base, username)
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw}")),
        _ => Ok(default),
    }
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml_bw::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
