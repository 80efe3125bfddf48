//! Persistent configuration model, defaults, and `config.toml` loading.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use crate::retrievers::{canonical_service_name, known_service_names};

pub const CONFIG_DIR_NAME: &str = "coverfetch";
pub const CONFIG_FILE_NAME: &str = "config.toml";

const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 50;
const MAX_RESOLUTIONS_PER_SERVICE: usize = 16;
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 120;
/// Registered services left disabled in a fresh config.
const DISABLED_BY_DEFAULT: [&str; 1] = ["VGMdb"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("no user config directory is available on this platform")]
    NoConfigDir,
}

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    pub search: SearchConfig,
    /// Ordered service list; order is display and scheduling order.
    #[serde(default = "default_services")]
    pub services: Vec<ServiceToggle>,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub lastfm: LastFmConfig,
}

/// Whether one named service takes part in searches.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ServiceToggle {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ServiceToggle {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SearchConfig {
    #[serde(default = "default_true")]
    pub front_only: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Identity sent in user agents that backends require.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct IdentityConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_contact_email")]
    pub contact_email: String,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CredentialsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discogs_token: Option<String>,
}

/// Request timeouts and resolution concurrency.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_json_timeout_secs")]
    pub json_timeout_secs: u64,
    #[serde(default = "default_html_timeout_secs")]
    pub html_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_resolutions_per_service")]
    pub max_concurrent_resolutions_per_service: usize,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LastFmConfig {
    /// Also scrape each album's artwork gallery page.
    #[serde(default)]
    pub expand_galleries: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search: SearchConfig::default(),
            services: default_services(),
            identity: IdentityConfig::default(),
            credentials: CredentialsConfig::default(),
            network: NetworkConfig::default(),
            lastfm: LastFmConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            front_only: true,
            batch_size: default_batch_size(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_version: default_app_version(),
            contact_email: default_contact_email(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            json_timeout_secs: default_json_timeout_secs(),
            html_timeout_secs: default_html_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            max_concurrent_resolutions_per_service: default_max_concurrent_resolutions_per_service(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    5
}

fn default_app_name() -> String {
    "GenericArtBot".to_string()
}

fn default_app_version() -> String {
    "0.1".to_string()
}

fn default_contact_email() -> String {
    "issues@example.com".to_string()
}

fn default_json_timeout_secs() -> u64 {
    10
}

fn default_html_timeout_secs() -> u64 {
    15
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_resolutions_per_service() -> usize {
    3
}

/// Every registered service, enabled except for the opt-in ones.
pub fn default_services() -> Vec<ServiceToggle> {
    known_service_names()
        .map(|name| ServiceToggle::new(name, !DISABLED_BY_DEFAULT.contains(&name)))
        .collect()
}

/// Canonicalizes service names, dropping unknown and duplicate entries
/// and appending missing registered services as disabled.
fn sanitize_services(services: Vec<ServiceToggle>) -> Vec<ServiceToggle> {
    let mut sanitized: Vec<ServiceToggle> = Vec::new();
    for toggle in services {
        let Some(name) = canonical_service_name(&toggle.name) else {
            warn!("Ignoring unknown service '{}' in config", toggle.name);
            continue;
        };
        if sanitized.iter().any(|existing| existing.name == name) {
            warn!("Ignoring duplicate service '{}' in config", toggle.name);
            continue;
        }
        sanitized.push(ServiceToggle::new(name, toggle.enabled));
    }
    for name in known_service_names() {
        if !sanitized.iter().any(|existing| existing.name == name) {
            sanitized.push(ServiceToggle::new(name, false));
        }
    }
    sanitized
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    if value.trim().is_empty() {
        fallback()
    } else {
        value.trim().to_string()
    }
}

/// Clamps numeric settings into usable ranges and normalizes lists.
pub fn sanitize_config(config: Config) -> Config {
    let clamp_timeout = |secs: u64| secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
    Config {
        search: SearchConfig {
            front_only: config.search.front_only,
            batch_size: config.search.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
        },
        services: sanitize_services(config.services),
        identity: IdentityConfig {
            app_name: non_blank_or(config.identity.app_name, default_app_name),
            app_version: non_blank_or(config.identity.app_version, default_app_version),
            contact_email: non_blank_or(config.identity.contact_email, default_contact_email),
        },
        credentials: CredentialsConfig {
            discogs_token: config
                .credentials
                .discogs_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        },
        network: NetworkConfig {
            json_timeout_secs: clamp_timeout(config.network.json_timeout_secs),
            html_timeout_secs: clamp_timeout(config.network.html_timeout_secs),
            probe_timeout_secs: clamp_timeout(config.network.probe_timeout_secs),
            max_concurrent_resolutions_per_service: config
                .network
                .max_concurrent_resolutions_per_service
                .clamp(1, MAX_RESOLUTIONS_PER_SERVICE),
        },
        lastfm: config.lastfm,
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

/// Loads and sanitizes the config at `path`, writing defaults on first run.
pub fn load_or_create(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        let config = sanitize_config(Config::default());
        save(&config, path)?;
        info!("Wrote default config to {}", path.display());
        return Ok(config);
    }
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str::<Config>(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Loaded config from {}", path.display());
    Ok(sanitize_config(config))
}

pub fn save(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let text = toml::to_string(config)?;
    fs::write(path, text).map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::{load_or_create, sanitize_config, save, Config, ConfigError, ServiceToggle};

    fn names(config: &Config) -> Vec<(&str, bool)> {
        config
            .services
            .iter()
            .map(|toggle| (toggle.name.as_str(), toggle.enabled))
            .collect()
    }

    #[test]
    fn test_default_services_order_and_enablement() {
        let config = Config::default();
        assert_eq!(
            names(&config),
            vec![
                ("iTunes", true),
                ("Last.fm", true),
                ("MusicBrainz", true),
                ("Bandcamp", true),
                ("Discogs", true),
                ("VGMdb", false),
            ]
        );
        assert_eq!(config.search.batch_size, 5);
        assert!(config.search.front_only);
        assert_eq!(config.network.max_concurrent_resolutions_per_service, 3);
    }

    #[test]
    fn test_sanitize_clamps_and_normalizes_services() {
        let mut config = Config::default();
        config.search.batch_size = 0;
        config.network.max_concurrent_resolutions_per_service = 500;
        config.network.probe_timeout_secs = 0;
        config.credentials.discogs_token = Some("   ".to_string());
        config.services = vec![
            ServiceToggle::new("vgmdb", true),
            ServiceToggle::new("Nope", true),
            ServiceToggle::new("ITUNES", false),
            ServiceToggle::new("VGMdb", false),
        ];

        let sanitized = sanitize_config(config);
        assert_eq!(sanitized.search.batch_size, 1);
        assert_eq!(sanitized.network.max_concurrent_resolutions_per_service, 16);
        assert_eq!(sanitized.network.probe_timeout_secs, 1);
        assert_eq!(sanitized.credentials.discogs_token, None);
        assert_eq!(
            names(&sanitized),
            vec![
                ("VGMdb", true),
                ("iTunes", false),
                ("Last.fm", false),
                ("MusicBrainz", false),
                ("Bandcamp", false),
                ("Discogs", false),
            ]
        );
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [search]
            batch_size = 8

            [[services]]
            name = "Bandcamp"

            [credentials]
            discogs_token = "abc"
            "#,
        )
        .expect("parse");
        assert_eq!(config.search.batch_size, 8);
        assert!(config.search.front_only);
        assert_eq!(config.services, vec![ServiceToggle::new("Bandcamp", true)]);
        assert_eq!(config.credentials.discogs_token.as_deref(), Some("abc"));
        assert_eq!(config.network.html_timeout_secs, 15);
        assert_eq!(config.identity.app_name, "GenericArtBot");
    }

    #[test]
    fn test_load_or_create_writes_defaults_then_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let created = load_or_create(&path).expect("create");
        assert!(path.exists());
        assert_eq!(created, sanitize_config(Config::default()));

        let mut changed = created.clone();
        changed.search.batch_size = 12;
        changed.lastfm.expand_galleries = true;
        save(&changed, &path).expect("save");
        assert_eq!(load_or_create(&path).expect("reload"), changed);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "search = [").expect("write");
        assert!(matches!(
            load_or_create(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
