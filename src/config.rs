//! Agent configuration: YAML file layered under `DEVWATCH_*` environment
//! variables, then validated into domain types.
//!
//! A bad `agent`, `api` or `thresholds` block is fatal. A bad device entry
//! only rejects that device.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Yaml};
use figment::value::Value;
use figment::Figment;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::domain::device::{
    DeviceConfig, HttpAuth, HttpMethod, HttpSettings, SnmpSettings, SnmpVersion,
};
use crate::domain::thresholds::{Threshold, ThresholdPolicy};
use crate::domain::types::{DeviceType, Method};
use crate::domain::vocabulary;
use crate::error::ConfigError;
use crate::logging::LogFormat;

const ENV_PREFIX: &str = "DEVWATCH_";
const DEFAULT_POLL_INTERVAL_SECS: f64 = 30.0;
const DEFAULT_TIMEOUT_SECS: f64 = 10.0;
const DEFAULT_PING_COUNT: u32 = 3;

// ── File shape ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub max_concurrent_probes: usize,
    pub sync_queue_capacity: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: None,
            log_level: "info".into(),
            log_format: LogFormat::Json,
            max_concurrent_probes: 32,
            sync_queue_capacity: 1024,
            shutdown_grace_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".into(),
            username: "Admin".into(),
            password: "Admin123".into(),
            timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    agent: AgentSection,
    api: ApiSection,
    thresholds: BTreeMap<String, HashMap<String, Threshold>>,
    /// Kept as raw values so one malformed entry does not fail the others.
    devices: BTreeMap<String, Value>,
}

/// `ping,snmp` or `[ping, snmp]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MethodList {
    Csv(String),
    List(Vec<String>),
}

impl Default for MethodList {
    fn default() -> Self {
        MethodList::List(Vec::new())
    }
}

impl MethodList {
    fn entries(&self) -> Vec<&str> {
        let raw: Vec<&str> = match self {
            MethodList::Csv(s) => s.split(',').collect(),
            MethodList::List(v) => v.iter().map(String::as_str).collect(),
        };
        raw.into_iter().map(str::trim).filter(|s| !s.is_empty()).collect()
    }
}

/// YAML reads `2c` as a string and `1` as a number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionField {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub methods: MethodList,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snmp_community: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snmp_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snmp_version: Option<VersionField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_token: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub http_fields: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Seconds, fractions allowed.
    pub poll_interval: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub thresholds: HashMap<String, Threshold>,
}

// ── Validated config ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub max_concurrent_probes: usize,
    pub sync_queue_capacity: usize,
    pub shutdown_grace: Duration,
}

#[derive(Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub username: String,
    pub password: SecretString,
    pub timeout: Duration,
    /// Total attempts for transient failures, at least 1.
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RejectedDevice {
    pub id: String,
    pub error: ConfigError,
}

#[derive(Debug)]
pub struct LoadedConfig {
    /// File that was read, `None` when running on defaults.
    pub source: Option<PathBuf>,
    pub agent: AgentConfig,
    pub api: ApiConfig,
    /// Every valid device, enabled or not, ordered by id.
    pub devices: Vec<Arc<DeviceConfig>>,
    pub rejected: Vec<RejectedDevice>,
}

impl LoadedConfig {
    pub fn device(&self, id: &str) -> Option<&Arc<DeviceConfig>> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn rejection(&self, id: &str) -> Option<&ConfigError> {
        self.rejected.iter().find(|r| r.id == id).map(|r| &r.error)
    }
}

// ── Loading ──────────────────────────────────────────────────────────

pub fn default_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("could not determine config directory")?;
    Ok(config_dir.join("devwatch").join("agent.yaml"))
}

pub fn resolve_path(explicit: Option<&str>) -> Result<PathBuf> {
    match explicit {
        Some(p) => Ok(PathBuf::from(p)),
        None => default_path(),
    }
}

/// Load from `--config` when given (the file must exist), otherwise from
/// the default location if present.
pub fn load(explicit: Option<&str>) -> Result<LoadedConfig> {
    let path = resolve_path(explicit)?;
    if explicit.is_some() && !path.exists() {
        bail!("config file {} does not exist", path.display());
    }
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<LoadedConfig> {
    let source = path.exists().then(|| path.to_path_buf());

    let file: FileConfig = Figment::new()
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .with_context(|| format!("parsing {}", path.display()))?;

    let agent = agent_config(file.agent)?;
    let api = api_config(file.api)?;
    let type_overrides = type_overrides(&file.thresholds)?;

    let mut devices = Vec::new();
    let mut rejected = Vec::new();
    for (id, value) in file.devices {
        let parsed = value
            .deserialize::<RawDevice>()
            .map_err(|e| ConfigError::Malformed(e.to_string()))
            .and_then(|raw| raw.into_device(&id, &type_overrides));
        match parsed {
            Ok(device) => devices.push(Arc::new(device)),
            Err(error) => rejected.push(RejectedDevice { id, error }),
        }
    }

    Ok(LoadedConfig {
        source,
        agent,
        api,
        devices,
        rejected,
    })
}

/// This machine's host name, used as the default agent name.
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "devwatch-agent".into())
}

fn agent_config(section: AgentSection) -> Result<AgentConfig> {
    if section.max_concurrent_probes == 0 {
        bail!("agent.max_concurrent_probes must be at least 1");
    }
    if section.sync_queue_capacity == 0 {
        bail!("agent.sync_queue_capacity must be at least 1");
    }
    Ok(AgentConfig {
        name: section
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(host_name),
        log_level: section.log_level,
        log_format: section.log_format,
        max_concurrent_probes: section.max_concurrent_probes,
        sync_queue_capacity: section.sync_queue_capacity,
        shutdown_grace: Duration::from_secs(section.shutdown_grace_secs),
    })
}

fn api_config(section: ApiSection) -> Result<ApiConfig> {
    let url = reqwest::Url::parse(&section.base_url)
        .with_context(|| format!("api.base_url '{}' is not a valid URL", section.base_url))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("api.base_url must use http or https, got '{}'", url.scheme());
    }
    if section.retry_attempts == 0 {
        bail!("api.retry_attempts must be at least 1");
    }
    if section.timeout_secs == 0 {
        bail!("api.timeout_secs must be at least 1");
    }
    Ok(ApiConfig {
        base_url: section.base_url.trim_end_matches('/').to_string(),
        username: section.username,
        password: SecretString::from(section.password),
        timeout: Duration::from_secs(section.timeout_secs),
        retry_attempts: section.retry_attempts,
        retry_delay: Duration::from_secs(section.retry_delay_secs),
    })
}

fn type_overrides(
    block: &BTreeMap<String, HashMap<String, Threshold>>,
) -> Result<HashMap<DeviceType, HashMap<String, Threshold>>> {
    let mut out = HashMap::new();
    for (type_name, entries) in block {
        let device_type: DeviceType = type_name
            .parse()
            .with_context(|| format!("thresholds.{type_name}"))?;
        for (key, threshold) in entries {
            check_threshold(device_type, key, threshold)
                .with_context(|| format!("thresholds.{type_name}.{key}"))?;
        }
        out.insert(device_type, entries.clone());
    }
    Ok(out)
}

fn check_threshold(
    device_type: DeviceType,
    key: &str,
    threshold: &Threshold,
) -> Result<(), ConfigError> {
    if !vocabulary::is_known(device_type, key) {
        return Err(ConfigError::UnknownMetric {
            key: key.to_string(),
            device_type,
        });
    }
    threshold.validate(key)
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingField(field))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl RawDevice {
    fn into_device(
        self,
        id: &str,
        type_overrides: &HashMap<DeviceType, HashMap<String, Threshold>>,
    ) -> Result<DeviceConfig, ConfigError> {
        let name = required(self.name, "name")?;
        let device_type: DeviceType = required(self.device_type, "type")?.parse()?;
        let address = required(self.address, "address")?;
        let location = required(self.location, "location")?;
        let enabled = self.enabled.unwrap_or(true);

        let mut methods: Vec<Method> = Vec::new();
        for entry in self.methods.entries() {
            let method: Method = entry.parse()?;
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        if enabled && methods.is_empty() {
            return Err(ConfigError::EmptyMethods);
        }

        let interval_secs = self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if !interval_secs.is_finite() || interval_secs < 1.0 {
            return Err(ConfigError::InvalidInterval);
        }
        let poll_interval =
            Duration::try_from_secs_f64(interval_secs).map_err(|_| ConfigError::InvalidInterval)?;
        let timeout_secs = self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if !timeout_secs.is_finite() || timeout_secs <= 0.0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if timeout_secs >= interval_secs {
            return Err(ConfigError::TimeoutNotBelowInterval {
                timeout_secs,
                interval_secs,
            });
        }
        let timeout =
            Duration::try_from_secs_f64(timeout_secs).map_err(|_| ConfigError::ZeroTimeout)?;

        let version = match self.snmp_version {
            None => SnmpVersion::V2c,
            Some(field) => parse_snmp_version(&field)?,
        };
        let snmp = SnmpSettings {
            community: non_empty(self.snmp_community).unwrap_or_else(|| "public".into()),
            port: self.snmp_port.unwrap_or(161),
            version,
        };

        let endpoint = non_empty(self.http_endpoint)
            .unwrap_or_else(|| format!("http://{address}/api/status"));
        if methods.contains(&Method::Http) {
            let valid = reqwest::Url::parse(&endpoint)
                .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::InvalidHttpEndpoint(endpoint));
            }
        }
        let http_method = match non_empty(self.http_method) {
            None => HttpMethod::Get,
            Some(m) => match m.trim().to_ascii_uppercase().as_str() {
                "GET" => HttpMethod::Get,
                "POST" => HttpMethod::Post,
                _ => return Err(ConfigError::UnsupportedHttpMethod(m)),
            },
        };
        let username = non_empty(self.http_username);
        let password = non_empty(self.http_password);
        let token = non_empty(self.http_token);
        let auth = match (username, password, token) {
            (Some(_), _, Some(_)) | (None, Some(_), Some(_)) => {
                return Err(ConfigError::ConflictingHttpAuth)
            }
            (None, Some(_), None) => return Err(ConfigError::MissingField("http_username")),
            (Some(username), password, None) => Some(HttpAuth::Basic {
                username,
                password: password.map(SecretString::from),
            }),
            (None, None, Some(token)) => Some(HttpAuth::Bearer(SecretString::from(token))),
            (None, None, None) => None,
        };
        for target in self.http_fields.values() {
            if !vocabulary::is_known(device_type, target) {
                return Err(ConfigError::UnknownMetric {
                    key: target.clone(),
                    device_type,
                });
            }
        }

        for (key, threshold) in &self.thresholds {
            check_threshold(device_type, key, threshold)?;
        }
        let mut policy = ThresholdPolicy::for_type(device_type);
        if let Some(overrides) = type_overrides.get(&device_type) {
            policy = policy.with_overrides(overrides);
        }
        let policy = policy.with_overrides(&self.thresholds);

        Ok(DeviceConfig {
            id: id.to_string(),
            name,
            device_type,
            location,
            address,
            methods,
            snmp,
            http: HttpSettings {
                endpoint,
                method: http_method,
                auth,
                fields: self.http_fields.into_iter().collect(),
            },
            ping_count: self.ping_count.unwrap_or(DEFAULT_PING_COUNT).max(1),
            poll_interval,
            timeout,
            enabled,
            thresholds: policy,
        })
    }
}

fn parse_snmp_version(field: &VersionField) -> Result<SnmpVersion, ConfigError> {
    let text = match field {
        VersionField::Number(n) => n.to_string(),
        VersionField::Text(s) => s.trim().to_ascii_lowercase(),
    };
    match text.trim_start_matches('v') {
        "1" => Ok(SnmpVersion::V1),
        "2" | "2c" => Ok(SnmpVersion::V2c),
        _ => Err(ConfigError::UnsupportedSnmpVersion(text)),
    }
}

// ── Sample file ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct SampleFile {
    agent: AgentSection,
    api: ApiSection,
    devices: BTreeMap<String, RawDevice>,
}

fn sample_device(name: &str, device_type: &str, address: &str, location: &str, methods: &str) -> RawDevice {
    RawDevice {
        name: Some(name.into()),
        device_type: Some(device_type.into()),
        address: Some(address.into()),
        location: Some(location.into()),
        methods: MethodList::Csv(methods.into()),
        poll_interval: Some(DEFAULT_POLL_INTERVAL_SECS),
        timeout: Some(DEFAULT_TIMEOUT_SECS),
        enabled: Some(true),
        ..RawDevice::default()
    }
}

/// The starter configuration written by `devwatch init`.
pub fn sample_yaml() -> Result<String> {
    let router = RawDevice {
        snmp_community: Some("public".into()),
        snmp_port: Some(161),
        ..sample_device("Main Router", "router", "192.168.1.1", "Server Room A", "ping,snmp")
    };
    let switch = RawDevice {
        snmp_community: Some("public".into()),
        snmp_port: Some(161),
        ..sample_device("Core Switch", "switch", "192.168.1.10", "Server Room A", "ping,snmp")
    };
    let firewall = RawDevice {
        http_endpoint: Some("http://192.168.1.254/api/status".into()),
        ..sample_device("Edge Firewall", "firewall", "192.168.1.254", "DMZ", "ping,http")
    };

    let sample = SampleFile {
        agent: AgentSection::default(),
        api: ApiSection::default(),
        devices: BTreeMap::from([
            ("device_firewall_01".to_string(), firewall),
            ("device_router_01".to_string(), router),
            ("device_switch_01".to_string(), switch),
        ]),
    };
    serde_yaml::to_string(&sample).context("serializing sample configuration")
}
