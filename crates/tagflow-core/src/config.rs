//! Layered configuration for both pipeline binaries.
//!
//! Configuration merges an optional TOML file with the deployment's flat
//! environment variables (`LOCATIONNAME`, `REDIS_HOST`, `MQTT_PORT`, ...).
//! The environment layer wins, so a packaged `tagflow.toml` can be
//! overridden per site without editing files.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Format, Toml};
use figment::value::{Dict, Map, Value};
use figment::{Error as FigmentError, Figment, Metadata, Profile, Provider};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::event::ProcessContext;

/// Top-level configuration shared by the ingestor and gateway.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Process identity and document context.
    pub process: ProcessConfig,
    /// Broker connection settings.
    pub broker: BrokerConfig,
    /// Durable staging-queue store settings.
    pub staging: StagingConfig,
    /// Auth endpoint settings (gateway).
    pub auth: AuthConfig,
    /// Remote document store settings (gateway).
    pub store: StoreConfig,
    /// Control API settings (gateway).
    pub api: ApiConfig,
    /// Forwarder tuning (gateway).
    pub forwarder: ForwarderConfig,
    /// Host-group mapping file (ingestor).
    pub groups: GroupsConfig,
}

impl AppConfig {
    /// Load configuration from `tagflow.toml` (if present) and the
    /// environment.
    pub fn load() -> Result<Self, CoreError> {
        Self::load_from("tagflow.toml")
    }

    /// Load configuration from the given TOML file path (if present) and
    /// the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(LegacyEnv)
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Parse configuration from a TOML string, without the environment.
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        Figment::new()
            .merge(Toml::string(content))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Validate the fields every process needs at startup.
    pub fn validate_identity(&self) -> Result<(), CoreError> {
        if self.process.location.is_empty() {
            return Err(CoreError::MissingRequired("LOCATIONNAME"));
        }
        if self.process.company_id.is_empty() {
            return Err(CoreError::MissingRequired("COMPANY_ID"));
        }
        Ok(())
    }
}

/// Process identity and the context stamped onto every tag document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Site name (`LOCATIONNAME`). Required.
    pub location: String,
    /// Company identifier (`COMPANY_ID`). Required.
    pub company_id: String,
    /// Whether this deployment moves (`MOBILE`).
    pub mobile: bool,
    /// Reader RF frequency in Hz (`RFID_FREQUENCY`).
    pub frequency_hz: u64,
    /// Reader transmit power in centi-dBm (`RFID_TRANSMIT_POWER_CDBM`).
    pub tx_power_cdbm: i32,
    /// Tag document retention in days.
    pub retention_days: u32,
}

impl ProcessConfig {
    /// The per-document context derived from this configuration.
    #[must_use]
    pub fn context(&self) -> ProcessContext {
        ProcessContext {
            location: self.location.clone(),
            company_id: self.company_id.clone(),
            frequency_hz: self.frequency_hz,
            tx_power_cdbm: self.tx_power_cdbm,
            mobile: self.mobile,
            retention: chrono::Duration::days(i64::from(self.retention_days)),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            location: String::new(),
            company_id: String::new(),
            mobile: false,
            frequency_hz: 865_700_000,
            tx_power_cdbm: 3000,
            retention_days: 30,
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Topic pattern to subscribe to.
    pub topic: String,
    /// Keep-alive interval (`MQTT_ALIVE_INTERVAL`).
    pub keep_alive_secs: u64,
    /// Delay between reconnect attempts.
    pub reconnect_delay_secs: u64,
    /// Timeout for the initial connection.
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 1883,
            topic: "rfid/#".to_owned(),
            keep_alive_secs: 30,
            reconnect_delay_secs: 1,
            connect_timeout_secs: 30,
        }
    }
}

/// Durable staging-queue store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Enqueue rejects once this many items are pending.
    pub max_queue_size: u64,
    /// Enqueue rejects once the store reports this much memory in use.
    pub max_memory_mb: u64,
    /// Staged item time-to-live.
    pub item_ttl_secs: u64,
}

impl StagingConfig {
    /// Connection URL for the durable store.
    #[must_use]
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 6379,
            password: None,
            db: 0,
            max_queue_size: 10_000,
            max_memory_mb: 256,
            item_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Auth endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base URL of the auth functions endpoint.
    pub functions_url: String,
    /// One-time invitation code (`INVITATION_CODE`).
    pub invitation_code: Option<String>,
    /// Where the token state is persisted between runs.
    pub state_path: PathBuf,
    /// Refresh cadence; the credential's nominal lifetime is 60 minutes.
    pub refresh_interval_secs: u64,
    /// Persisted state older than this is discarded.
    pub reuse_window_secs: u64,
}

impl AuthConfig {
    /// Refresh cadence as a [`Duration`].
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            functions_url: String::new(),
            invitation_code: None,
            state_path: PathBuf::from("auth-state.json"),
            refresh_interval_secs: 45 * 60,
            reuse_window_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Remote document store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the document store REST endpoint.
    pub base_url: String,
    /// Poll cadence for the location-config snapshot stream.
    pub watch_interval_secs: u64,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            watch_interval_secs: 30,
            request_timeout_secs: 10,
        }
    }
}

/// Control API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Status file maintained by the out-of-process updater.
    pub update_status_path: PathBuf,
    /// Where the ingestor finds the gateway's control API.
    pub gateway_url: String,
    /// Ingestor config-refresh cadence.
    pub config_refresh_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8090),
            update_status_path: PathBuf::from("update-status.json"),
            gateway_url: "http://127.0.0.1:8090".to_owned(),
            config_refresh_secs: 30,
        }
    }
}

/// Forwarder tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Items leased per drain cycle.
    pub lease_batch: usize,
    /// Parallel in-flight writes.
    pub concurrency: usize,
    /// First retry delay.
    pub base_delay_ms: u64,
    /// Retry delay ceiling.
    pub max_delay_ms: u64,
    /// Attempts before an item is discarded.
    pub max_attempts: u32,
    /// Idle poll cadence when nothing is ready.
    pub poll_interval_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            lease_batch: 32,
            concurrency: 4,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            poll_interval_ms: 500,
        }
    }
}

/// Host-group mapping file location.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupsConfig {
    /// Path to the JSON mapping; absent means hostname mode.
    pub file: Option<PathBuf>,
}

/// Value kinds a legacy environment variable can carry.
enum EnvKind {
    Str,
    Int,
    Bool,
}

/// The deployment's flat environment variable names, mapped onto config
/// paths.
const LEGACY_VARS: &[(&str, &str, EnvKind)] = &[
    ("LOCATIONNAME", "process.location", EnvKind::Str),
    ("COMPANY_ID", "process.company_id", EnvKind::Str),
    ("MOBILE", "process.mobile", EnvKind::Bool),
    ("RFID_FREQUENCY", "process.frequency_hz", EnvKind::Int),
    ("RFID_TRANSMIT_POWER_CDBM", "process.tx_power_cdbm", EnvKind::Int),
    ("MQTT_HOST", "broker.host", EnvKind::Str),
    ("MQTT_PORT", "broker.port", EnvKind::Int),
    ("MQTT_TOPIC", "broker.topic", EnvKind::Str),
    ("MQTT_ALIVE_INTERVAL", "broker.keep_alive_secs", EnvKind::Int),
    ("REDIS_HOST", "staging.host", EnvKind::Str),
    ("REDIS_PORT", "staging.port", EnvKind::Int),
    ("REDIS_PASSWORD", "staging.password", EnvKind::Str),
    ("REDIS_DB", "staging.db", EnvKind::Int),
    ("REDIS_MAX_QUEUE_SIZE", "staging.max_queue_size", EnvKind::Int),
    ("REDIS_MAX_MEMORY_MB", "staging.max_memory_mb", EnvKind::Int),
    ("INVITATION_CODE", "auth.invitation_code", EnvKind::Str),
    ("FIREBASE_FUNCTIONS_URL", "auth.functions_url", EnvKind::Str),
    ("FIREBASE_DATABASE_URL", "store.base_url", EnvKind::Str),
    ("HOST_GROUP_FILE", "groups.file", EnvKind::Str),
];

/// Figment provider for the deployment's flat environment variable names.
///
/// The stock `Env` provider wants prefixed, structurally-named variables;
/// the fleet's provisioning scripts predate this process and export flat
/// names, so each one is mapped explicitly.
struct LegacyEnv;

impl LegacyEnv {
    fn parse(kind: &EnvKind, raw: &str) -> Option<Value> {
        match kind {
            EnvKind::Str => Some(Value::from(raw)),
            EnvKind::Int => raw.trim().parse::<i64>().ok().map(Value::from),
            EnvKind::Bool => parse_flag(raw).map(Value::from),
        }
    }
}

impl Provider for LegacyEnv {
    fn metadata(&self) -> Metadata {
        Metadata::named("tagflow environment")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, FigmentError> {
        let mut root = Dict::new();

        for (var, path, kind) in LEGACY_VARS {
            let Ok(raw) = std::env::var(var) else {
                continue;
            };
            if raw.is_empty() {
                continue;
            }
            let Some(value) = Self::parse(kind, &raw) else {
                return Err(FigmentError::from(format!(
                    "invalid value for {var}: {raw:?}"
                )));
            };
            insert_path(&mut root, path, value);
        }

        let mut map = Map::new();
        map.insert(Profile::Default, root);
        Ok(map)
    }
}

/// Insert a value at a dotted path, creating intermediate dicts.
fn insert_path(root: &mut Dict, path: &str, value: Value) {
    let mut dict = root;
    let mut parts = path.split('.').peekable();

    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            dict.insert(part.to_owned(), value);
            return;
        }
        let entry = dict
            .entry(part.to_owned())
            .or_insert_with(|| Value::Dict(figment::value::Tag::Default, Dict::new()));
        let Value::Dict(_, inner) = entry else {
            unreachable!("legacy paths never nest under a leaf");
        };
        dict = inner;
    }
}

/// Parse a `1`/`0`/`true`/`false` environment flag.
#[must_use]
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Live location configuration, replaced atomically on every accepted
/// update.
///
/// Unknown remote fields are preserved in `extra` so a patch round-trip
/// does not drop them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocationConfig {
    pub deduplicate: bool,
    pub deduplicate_interval_minutes: u32,
    pub reporting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_deduplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_deduplicate_interval_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_reporting: Option<bool>,
    /// Consumed by the out-of-process updater; opaque here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_window: Option<serde_json::Value>,
    /// Consumed by the out-of-process updater; opaque here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_checks: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            deduplicate: true,
            deduplicate_interval_minutes: 1,
            reporting: true,
            mobile_deduplicate: None,
            mobile_deduplicate_interval_minutes: None,
            mobile_reporting: None,
            update_window: None,
            safety_checks: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl LocationConfig {
    /// Whether deduplication applies, honouring the mobile override.
    #[must_use]
    pub fn effective_deduplicate(&self, mobile: bool) -> bool {
        if mobile {
            self.mobile_deduplicate.unwrap_or(self.deduplicate)
        } else {
            self.deduplicate
        }
    }

    /// The dedup window in minutes, honouring the mobile override.
    /// Never below one minute.
    #[must_use]
    pub fn effective_interval_minutes(&self, mobile: bool) -> u32 {
        let minutes = if mobile {
            self.mobile_deduplicate_interval_minutes
                .unwrap_or(self.deduplicate_interval_minutes)
        } else {
            self.deduplicate_interval_minutes
        };
        minutes.max(1)
    }

    /// Whether accepted events are reported, honouring the mobile override.
    #[must_use]
    pub fn effective_reporting(&self, mobile: bool) -> bool {
        if mobile {
            self.mobile_reporting.unwrap_or(self.reporting)
        } else {
            self.reporting
        }
    }

    /// Whether the fields this pipeline reacts to differ between two
    /// snapshots. Cosmetic remote fields (`extra`) are ignored.
    #[must_use]
    pub fn relevant_eq(&self, other: &Self) -> bool {
        self.deduplicate == other.deduplicate
            && self.deduplicate_interval_minutes == other.deduplicate_interval_minutes
            && self.reporting == other.reporting
            && self.mobile_deduplicate == other.mobile_deduplicate
            && self.mobile_deduplicate_interval_minutes == other.mobile_deduplicate_interval_minutes
            && self.mobile_reporting == other.mobile_reporting
            && self.update_window == other.update_window
            && self.safety_checks == other.safety_checks
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AppConfig::default();
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.topic, "rfid/#");
        assert_eq!(config.staging.port, 6379);
        assert_eq!(config.staging.item_ttl_secs, 604_800);
        assert_eq!(config.forwarder.max_attempts, 5);
        assert_eq!(config.auth.refresh_interval_secs, 2700);
        assert_eq!(config.process.retention_days, 30);
    }

    #[test]
    fn parses_toml() {
        let config = AppConfig::parse(
            r#"
            [process]
            location = "warehouse-7"
            company_id = "acme"
            mobile = true

            [broker]
            host = "broker.local"
            port = 8883

            [staging]
            max_queue_size = 500
        "#,
        )
        .unwrap();

        assert_eq!(config.process.location, "warehouse-7");
        assert!(config.process.mobile);
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.staging.max_queue_size, 500);
    }

    #[test]
    fn identity_validation() {
        let config = AppConfig::default();
        assert!(matches!(
            config.validate_identity(),
            Err(CoreError::MissingRequired("LOCATIONNAME"))
        ));

        let config = AppConfig::parse("[process]\nlocation = \"x\"").unwrap();
        assert!(matches!(
            config.validate_identity(),
            Err(CoreError::MissingRequired("COMPANY_ID"))
        ));

        let config =
            AppConfig::parse("[process]\nlocation = \"x\"\ncompany_id = \"y\"").unwrap();
        assert!(config.validate_identity().is_ok());
    }

    #[test]
    fn legacy_env_overrides_file() {
        std::env::set_var("LOCATIONNAME", "env-site");
        std::env::set_var("REDIS_PORT", "6380");
        std::env::set_var("MOBILE", "1");

        let config: AppConfig = Figment::new()
            .merge(Toml::string("[process]\nlocation = \"file-site\""))
            .merge(LegacyEnv)
            .extract()
            .unwrap();

        assert_eq!(config.process.location, "env-site");
        assert_eq!(config.staging.port, 6380);
        assert!(config.process.mobile);

        std::env::remove_var("LOCATIONNAME");
        std::env::remove_var("REDIS_PORT");
        std::env::remove_var("MOBILE");
    }

    #[test]
    fn staging_url_forms() {
        let mut staging = StagingConfig::default();
        assert_eq!(staging.url(), "redis://localhost:6379/0");

        staging.password = Some("hunter2".to_owned());
        staging.db = 2;
        assert_eq!(staging.url(), "redis://:hunter2@localhost:6379/2");
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn location_config_mobile_overrides() {
        let config: LocationConfig = serde_json::from_str(
            r#"{
                "deduplicate": true,
                "deduplicateIntervalMinutes": 5,
                "reporting": true,
                "mobileDeduplicate": false,
                "mobileReporting": false
            }"#,
        )
        .unwrap();

        assert!(config.effective_deduplicate(false));
        assert!(!config.effective_deduplicate(true));
        assert!(config.effective_reporting(false));
        assert!(!config.effective_reporting(true));
        // Mobile interval falls back to the fixed one.
        assert_eq!(config.effective_interval_minutes(true), 5);
    }

    #[test]
    fn interval_never_below_one_minute() {
        let config: LocationConfig =
            serde_json::from_str(r#"{"deduplicateIntervalMinutes": 0}"#).unwrap();
        assert_eq!(config.effective_interval_minutes(false), 1);
    }

    #[test]
    fn relevant_diff_ignores_extra_fields() {
        let a: LocationConfig =
            serde_json::from_str(r#"{"deduplicate": true, "displayName": "A"}"#).unwrap();
        let b: LocationConfig =
            serde_json::from_str(r#"{"deduplicate": true, "displayName": "B"}"#).unwrap();
        assert!(a.relevant_eq(&b));
        assert_ne!(a, b);

        let c: LocationConfig = serde_json::from_str(r#"{"deduplicate": false}"#).unwrap();
        assert!(!a.relevant_eq(&c));
    }

    #[test]
    fn location_config_preserves_unknown_fields() {
        let raw = r#"{"deduplicate":false,"displayName":"Dock 4"}"#;
        let config: LocationConfig = serde_json::from_str(raw).unwrap();
        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["displayName"], "Dock 4");
    }
}
