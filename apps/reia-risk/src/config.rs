use crate::engine::EngineCredentials;
use crate::loader::LoadOptions;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_EXPORT_ROOT: &str = "./exports";

fn setup_config_path() -> Option<PathBuf> {
    env::var("REIA_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    db_pool_size: Option<u32>,
    #[serde(default)]
    max_processes: Option<usize>,
    #[serde(default)]
    max_entries_per_chunk: Option<usize>,
    #[serde(default)]
    oq_version: Option<u32>,
    #[serde(default)]
    oq_api_server: Option<String>,
    #[serde(default)]
    oq_user: Option<String>,
    #[serde(default)]
    oq_password: Option<String>,
    #[serde(default)]
    export_root: Option<String>,
    #[serde(default)]
    status_poll_interval_ms: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "setup config not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_config(contents.into_bytes()).or_else(|| {
        tracing::warn!(path = %path.display(), "failed to parse setup config; using env defaults");
        None
    })
}

fn parse_setup_config(mut bytes: Vec<u8>) -> Option<SetupConfigOverrides> {
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(error = %err, "setup config is not valid JSON");
            None
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Setup file values fill in whatever the environment left unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    if env_allows("REIA_DB_POOL_SIZE") {
        if let Some(value) = overrides.db_pool_size.filter(|v| *v != 0) {
            config.db_pool_size = value;
        }
    }
    if env_allows("REIA_MAX_PROCESSES") {
        if let Some(value) = overrides.max_processes.filter(|v| *v != 0) {
            config.max_processes = value;
        }
    }
    if env_allows("REIA_MAX_ENTRIES_PER_CHUNK") {
        if let Some(value) = overrides.max_entries_per_chunk.filter(|v| *v != 0) {
            config.max_entries_per_chunk = value;
        }
    }
    if env_allows("OQ_VERSION") {
        if let Some(value) = overrides.oq_version {
            config.oq_version = value;
        }
    }
    if env_allows("OQ_API_SERVER") {
        if let Some(server) = non_empty(overrides.oq_api_server.as_deref()) {
            config.oq_api_server = Some(server);
        }
    }
    if env_allows("OQ_USER") {
        if let Some(user) = non_empty(overrides.oq_user.as_deref()) {
            config.oq_user = Some(user);
        }
    }
    if env_allows("OQ_PASSWORD") {
        if let Some(password) = non_empty(overrides.oq_password.as_deref()) {
            config.oq_password = Some(password);
        }
    }
    if env_allows("REIA_EXPORT_ROOT") {
        if let Some(root) = non_empty(overrides.export_root.as_deref()) {
            config.export_root = PathBuf::from(root);
        }
    }
    if env_allows("REIA_STATUS_POLL_INTERVAL_MS") {
        if let Some(value) = overrides.status_poll_interval_ms.filter(|v| *v != 0) {
            config.status_poll_interval_ms = value;
        }
    }
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub max_processes: usize,
    pub max_entries_per_chunk: usize,
    pub oq_version: u32,
    pub oq_api_server: Option<String>,
    pub oq_user: Option<String>,
    pub oq_password: Option<String>,
    pub export_root: PathBuf,
    pub status_poll_interval_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = env::var("REIA_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .and_then(|value| non_empty(Some(&value)))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| non_empty(ov.database_url.as_deref()))
            })
            .context("REIA_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("REIA_DB_POOL_SIZE", 10),
            max_processes: env_parse("REIA_MAX_PROCESSES", LoadOptions::default().max_parallelism),
            max_entries_per_chunk: env_parse(
                "REIA_MAX_ENTRIES_PER_CHUNK",
                LoadOptions::default().max_entries_per_chunk,
            ),
            oq_version: env_parse("OQ_VERSION", 15),
            oq_api_server: non_empty(env::var("OQ_API_SERVER").ok().as_deref()),
            oq_user: non_empty(env::var("OQ_USER").ok().as_deref()),
            oq_password: env::var("OQ_PASSWORD").ok(),
            export_root: env::var("REIA_EXPORT_ROOT")
                .ok()
                .and_then(|value| non_empty(Some(&value)))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_ROOT)),
            status_poll_interval_ms: env_parse("REIA_STATUS_POLL_INTERVAL_MS", 1000),
            otlp_endpoint: non_empty(env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok().as_deref()),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, |key| !env_is_set(key));
        }

        Ok(config)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            max_parallelism: self.max_processes.max(1),
            max_entries_per_chunk: self.max_entries_per_chunk.max(1),
        }
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms.max(1))
    }

    pub fn engine_credentials(&self) -> Option<EngineCredentials> {
        match (&self.oq_user, &self.oq_password) {
            (Some(username), Some(password)) => Some(EngineCredentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

fn normalize_database_url(url: String) -> String {
    for driver in ["postgresql+psycopg2://", "postgresql+psycopg://", "postgresql+asyncpg://"] {
        if let Some(stripped) = url.strip_prefix(driver) {
            return format!("postgresql://{stripped}");
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            database_url: "postgresql://localhost/reia".to_string(),
            db_pool_size: 10,
            max_processes: 2,
            max_entries_per_chunk: 750_000,
            oq_version: 15,
            oq_api_server: None,
            oq_user: None,
            oq_password: None,
            export_root: PathBuf::from(DEFAULT_EXPORT_ROOT),
            status_poll_interval_ms: 1000,
            otlp_endpoint: None,
        }
    }

    #[test]
    fn driver_prefixes_are_stripped() {
        assert_eq!(
            normalize_database_url("postgresql+psycopg2://u:p@db/reia".to_string()),
            "postgresql://u:p@db/reia"
        );
        assert_eq!(
            normalize_database_url("postgresql+asyncpg://db/reia".to_string()),
            "postgresql://db/reia"
        );
        assert_eq!(
            normalize_database_url("postgres://db/reia".to_string()),
            "postgres://db/reia"
        );
    }

    #[test]
    fn setup_file_fills_unset_values_only() {
        let overrides = parse_setup_config(
            br#"{"max_processes": 6, "oq_version": 14, "oq_api_server": " http://oq:8800 ", "export_root": ""}"#
                .to_vec(),
        )
        .unwrap();
        let mut config = base();
        apply_setup_overrides(&mut config, &overrides, |key| key != "REIA_MAX_PROCESSES");

        assert_eq!(config.max_processes, 2);
        assert_eq!(config.oq_version, 14);
        assert_eq!(config.oq_api_server.as_deref(), Some("http://oq:8800"));
        assert_eq!(config.export_root, PathBuf::from(DEFAULT_EXPORT_ROOT));
    }

    #[test]
    fn zero_overrides_are_ignored() {
        let overrides =
            parse_setup_config(br#"{"max_entries_per_chunk": 0, "db_pool_size": 0}"#.to_vec())
                .unwrap();
        let mut config = base();
        apply_setup_overrides(&mut config, &overrides, |_| true);
        assert_eq!(config.max_entries_per_chunk, 750_000);
        assert_eq!(config.db_pool_size, 10);
    }

    #[test]
    fn malformed_setup_file_is_ignored() {
        assert!(parse_setup_config(b"{not json".to_vec()).is_none());
    }

    #[test]
    fn credentials_need_user_and_password() {
        let mut config = base();
        config.oq_user = Some("admin".to_string());
        assert!(config.engine_credentials().is_none());
        config.oq_password = Some("secret".to_string());
        let credentials = config.engine_credentials().unwrap();
        assert_eq!(credentials.username, "admin");
    }

    #[test]
    fn load_options_never_drop_below_one() {
        let mut config = base();
        config.max_processes = 0;
        config.max_entries_per_chunk = 0;
        let options = config.load_options();
        assert_eq!(options.max_parallelism, 1);
        assert_eq!(options.max_entries_per_chunk, 1);
    }
}
