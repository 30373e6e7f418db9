//! Configuration loading from `.env` files and the process environment.

use std::{
    env,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use url::Url;

use crate::{
    identity::Identity,
    policy::RateLimitConfig,
    storage::{Engine, StorageConfig},
};

/// Which admission policy decides who may publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    Whitelist,
    Trust,
    Owner,
}

impl FromStr for AdmissionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whitelist" => Ok(Self::Whitelist),
            "trust" => Ok(Self::Trust),
            "owner" => Ok(Self::Owner),
            other => bail!("unknown admission mode {other:?}"),
        }
    }
}

/// Tunable request limits. Intervals are in minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Limits {
    pub query_auth_required: bool,
    pub event_ip_limiter_tokens_per_interval: u32,
    pub event_ip_limiter_interval: u64,
    pub event_ip_limiter_max_tokens: u32,
    pub allow_empty_filters: bool,
    pub allow_complex_filters: bool,
    pub connection_rate_limiter_tokens_per_interval: u32,
    pub connection_rate_limiter_interval: u64,
    pub connection_rate_limiter_max_tokens: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            query_auth_required: false,
            event_ip_limiter_tokens_per_interval: 50,
            event_ip_limiter_interval: 1,
            event_ip_limiter_max_tokens: 100,
            allow_empty_filters: true,
            allow_complex_filters: true,
            connection_rate_limiter_tokens_per_interval: 3,
            connection_rate_limiter_interval: 5,
            connection_rate_limiter_max_tokens: 9,
        }
    }
}

impl Limits {
    pub fn event_limiter(&self) -> RateLimitConfig {
        RateLimitConfig::new(
            self.event_ip_limiter_tokens_per_interval,
            minutes(self.event_ip_limiter_interval),
            self.event_ip_limiter_max_tokens,
        )
    }

    pub fn connection_limiter(&self) -> RateLimitConfig {
        RateLimitConfig::new(
            self.connection_rate_limiter_tokens_per_interval,
            minutes(self.connection_rate_limiter_interval),
            self.connection_rate_limiter_max_tokens,
        )
    }

    fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            query_auth_required: flag("RELAY_QUERY_AUTH_REQUIRED", d.query_auth_required)?,
            event_ip_limiter_tokens_per_interval: number(
                "RELAY_EVENT_IP_LIMITER_TOKENS_PER_INTERVAL",
                d.event_ip_limiter_tokens_per_interval,
            )?,
            event_ip_limiter_interval: interval(
                "RELAY_EVENT_IP_LIMITER_INTERVAL",
                d.event_ip_limiter_interval,
            )?,
            event_ip_limiter_max_tokens: number(
                "RELAY_EVENT_IP_LIMITER_MAX_TOKENS",
                d.event_ip_limiter_max_tokens,
            )?,
            allow_empty_filters: flag("RELAY_ALLOW_EMPTY_FILTERS", d.allow_empty_filters)?,
            allow_complex_filters: flag("RELAY_ALLOW_COMPLEX_FILTERS", d.allow_complex_filters)?,
            connection_rate_limiter_tokens_per_interval: number(
                "RELAY_CONNECTION_RATE_LIMITER_TOKENS_PER_INTERVAL",
                d.connection_rate_limiter_tokens_per_interval,
            )?,
            connection_rate_limiter_interval: interval(
                "RELAY_CONNECTION_RATE_LIMITER_INTERVAL",
                d.connection_rate_limiter_interval,
            )?,
            connection_rate_limiter_max_tokens: number(
                "RELAY_CONNECTION_RATE_LIMITER_MAX_TOKENS",
                d.connection_rate_limiter_max_tokens,
            )?,
        })
    }
}

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub storage: StorageConfig,
    /// Public host of the relay, e.g. `relay.example.com`.
    pub relay_url: String,
    /// URL AUTH events must name in their `relay` tag.
    pub service_url: Url,
    pub bind: SocketAddr,
    pub relay_name: String,
    pub relay_npub: Identity,
    pub relay_description: String,
    pub relay_icon: String,
    pub relay_contact: String,
    /// NIP-11 `software` URL.
    pub relay_software: String,
    /// Identity whose trust network or sessions gate admission.
    pub owner: Identity,
    pub admission: AdmissionMode,
    pub whitelist_file: Option<PathBuf>,
    pub trust_depth: u8,
    pub trust_refresh: Duration,
    /// Upstream relays for contact lists; empty means the local store.
    pub trust_relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Backups are disabled when unset.
    pub backup_dir: Option<PathBuf>,
    pub backup_interval: Duration,
    /// Verify event ids and Schnorr signatures on ingest.
    pub verify_sig: bool,
    pub trust_proxy_headers: bool,
    pub limits: Limits,
}

impl Settings {
    /// Load settings from the specified `.env` file (if present) and the
    /// process environment.
    pub fn from_env(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            dotenvy::from_path(path)
                .with_context(|| format!("reading env file {}", path.display()))?;
        }

        let storage = StorageConfig {
            engine: Engine::from_id(&optional("DB_ENGINE").unwrap_or_else(|| "redb".into())),
            path: PathBuf::from(optional("DB_PATH").unwrap_or_else(|| "db".into())),
            cache_size: optional("DB_CACHE_SIZE")
                .map(|v| v.parse().with_context(|| format!("DB_CACHE_SIZE={v:?}")))
                .transpose()?,
        };

        let relay_url = required("RELAY_URL")?;
        let service_url = service_url(&relay_url)?;
        let ip: IpAddr = number("RELAY_BIND_ADDRESS", IpAddr::from([0, 0, 0, 0]))?;
        let port: u16 = number("RELAY_PORT", 2121)?;
        let relay_npub = npub("RELAY_NPUB", &required("RELAY_NPUB")?)?;
        let owner = match optional("OWNER_NPUB") {
            Some(v) => npub("OWNER_NPUB", &v)?,
            None => relay_npub,
        };

        let admission: AdmissionMode = optional("ADMISSION_MODE")
            .unwrap_or_else(|| "whitelist".into())
            .parse()?;
        let whitelist_file = optional("USER_NPUBS_FILE").map(PathBuf::from);
        if admission == AdmissionMode::Whitelist && whitelist_file.is_none() {
            bail!("USER_NPUBS_FILE is required in whitelist mode");
        }

        Ok(Self {
            storage,
            relay_url,
            service_url,
            bind: SocketAddr::new(ip, port),
            relay_name: required("RELAY_NAME")?,
            relay_npub,
            relay_description: optional("RELAY_DESCRIPTION").unwrap_or_default(),
            relay_icon: optional("RELAY_ICON").unwrap_or_default(),
            relay_contact: optional("RELAY_CONTACT").unwrap_or_default(),
            relay_software: optional("RELAY_SOFTWARE").unwrap_or_else(default_software),
            owner,
            admission,
            whitelist_file,
            trust_depth: trust_depth()?,
            trust_refresh: minutes(interval("TRUST_REFRESH_INTERVAL", 60)?),
            trust_relays: csv_strings(optional("TRUST_RELAYS").unwrap_or_default()),
            tor_socks: optional("TOR_SOCKS"),
            backup_dir: optional("BACKUP_DIR").map(PathBuf::from),
            backup_interval: minutes(interval("BACKUP_INTERVAL", 60)?),
            verify_sig: flag("VERIFY_SIG", true)?,
            trust_proxy_headers: flag("TRUST_PROXY_HEADERS", false)?,
            limits: Limits::from_env()?,
        })
    }
}

/// `https://<host>/relay` for a bare host; full URLs are taken as given.
fn service_url(relay_url: &str) -> Result<Url> {
    let raw = if relay_url.contains("://") {
        relay_url.to_string()
    } else {
        format!("https://{relay_url}/relay")
    };
    let url = Url::parse(&raw).with_context(|| format!("RELAY_URL={relay_url:?}"))?;
    if url.host_str().is_none() {
        bail!("RELAY_URL={relay_url:?} has no host");
    }
    Ok(url)
}

fn default_software() -> String {
    match env!("CARGO_PKG_REPOSITORY") {
        "" => concat!("https://crates.io/crates/", env!("CARGO_PKG_NAME")).to_string(),
        repo => repo.to_string(),
    }
}

fn trust_depth() -> Result<u8> {
    let depth = number("TRUST_DEPTH", 2)?;
    if !(1..=2).contains(&depth) {
        bail!("TRUST_DEPTH must be 1 or 2, got {depth}");
    }
    Ok(depth)
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

/// Non-empty, trimmed value of `name`.
fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(name: &str) -> Result<String> {
    optional(name).ok_or_else(|| anyhow!("{name} must be set"))
}

fn number<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(name) {
        Some(v) => v.parse().with_context(|| format!("{name}={v:?}")),
        None => Ok(default),
    }
}

/// Interval in minutes; zero is rejected.
fn interval(name: &str, default: u64) -> Result<u64> {
    let n = number(name, default)?;
    if n == 0 {
        bail!("{name} must be at least one minute");
    }
    Ok(n)
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`.
fn flag(name: &str, default: bool) -> Result<bool> {
    match optional(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => bail!("{name}={v:?} is not a boolean"),
        },
    }
}

fn npub(name: &str, value: &str) -> Result<Identity> {
    Identity::from_npub(value).with_context(|| format!("{name} is not a valid npub"))
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
