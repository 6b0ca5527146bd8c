//! Configuration file support for the router

use crate::orchestration::classifier::CapabilityTable;
use crate::orchestration::dispatcher::DispatchLimits;
use crate::orchestration::experts::RetryPolicy;
use crate::orchestration::types::{Expert, RequestType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default = "default_experts")]
    pub experts: Vec<ExpertConfig>,

    /// Request type -> capability keys that qualify an expert for it
    #[serde(default = "default_capabilities")]
    pub capabilities: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_per_call_timeout_ms")]
    pub per_call_timeout_ms: u64,

    #[serde(default = "default_overall_deadline_ms")]
    pub overall_deadline_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpertConfig {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
}

impl ExpertConfig {
    fn new(id: &str, name: &str, endpoint: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }
}

// Defaults

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_per_call_timeout_ms() -> u64 {
    10_000
}

fn default_overall_deadline_ms() -> u64 {
    30_000
}

fn default_refresh_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_experts() -> Vec<ExpertConfig> {
    vec![
        ExpertConfig::new(
            "credit-agent",
            "Credit Risk Agent",
            "http://localhost:8081",
            &["credit_scoring", "risk_assessment", "loan_eligibility"],
        ),
        ExpertConfig::new(
            "fraud-agent",
            "Fraud Detection Agent",
            "http://localhost:8082",
            &["transaction_analysis", "pattern_detection", "anomaly_detection"],
        ),
        ExpertConfig::new(
            "esg-agent",
            "ESG Compliance Agent",
            "http://localhost:8083",
            &["environmental_impact", "social_compliance", "governance_assessment"],
        ),
    ]
}

fn default_capabilities() -> BTreeMap<String, Vec<String>> {
    let entry = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect::<Vec<_>>();
    BTreeMap::from([
        ("credit".to_string(), entry(&["credit_scoring", "risk_assessment", "loan_eligibility"])),
        ("fraud".to_string(), entry(&["transaction_analysis", "pattern_detection", "anomaly_detection"])),
        (
            "esg".to_string(),
            entry(&["environmental_impact", "social_compliance", "governance_assessment"]),
        ),
    ])
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            per_call_timeout_ms: default_per_call_timeout_ms(),
            overall_deadline_ms: default_overall_deadline_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            dispatch: DispatchConfig::default(),
            registry: RegistryConfig::default(),
            experts: default_experts(),
            capabilities: default_capabilities(),
        }
    }
}

/// `~/.config/moe-router/config.toml` on Linux, the platform equivalent elsewhere
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("moe-router").join("config.toml"))
}

/// Environment variable overriding an expert's endpoint, e.g. `credit-agent` -> `CREDIT_AGENT_URL`
pub fn endpoint_env_key(expert_id: &str) -> String {
    let stem: String = expert_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{}_URL", stem)
}

impl RouterConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RouterConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from an explicit path, else from the default path if it exists,
    /// else fall back to built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        match default_config_path().filter(|p| p.exists()) {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                Self::from_file(path)
            }
            None => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Apply `<EXPERT_ID>_URL` and `PORT` from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for expert in &mut self.experts {
            let key = endpoint_env_key(&expert.id);
            if let Some(url) = lookup(&key).filter(|v| !v.trim().is_empty()) {
                debug!(expert = %expert.id, "Endpoint overridden by {}", key);
                expert.endpoint = url.trim().to_string();
            }
        }

        if let Some(port) = lookup("PORT").filter(|v| !v.trim().is_empty()) {
            let host = self
                .server
                .bind
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.bind = format!("{}:{}", host, port.trim());
        }
    }

    /// Reject configurations the router cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.experts.is_empty() {
            return Err(ConfigError::Invalid("at least one expert must be configured".into()));
        }

        let mut seen = HashSet::new();
        for expert in &self.experts {
            if expert.id.trim().is_empty() {
                return Err(ConfigError::Invalid("expert id must not be empty".into()));
            }
            if !seen.insert(expert.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate expert id '{}'", expert.id)));
            }
            if expert.endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("expert '{}' has no endpoint", expert.id)));
            }
            if expert.capabilities.is_empty() {
                return Err(ConfigError::Invalid(format!("expert '{}' has no capabilities", expert.id)));
            }
        }

        for (request_type, keys) in &self.capabilities {
            if keys.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "capability entry '{}' lists no capabilities",
                    request_type
                )));
            }
        }

        if self.dispatch.per_call_timeout_ms == 0 || self.dispatch.overall_deadline_ms == 0 {
            return Err(ConfigError::Invalid("dispatch timeouts must be greater than zero".into()));
        }
        if self.registry.refresh_interval_secs == 0 || self.registry.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "registry refresh interval and probe timeout must be greater than zero".into(),
            ));
        }

        if self.dispatch.overall_deadline_ms < self.dispatch.per_call_timeout_ms {
            warn!(
                "overall_deadline_ms ({}) is shorter than per_call_timeout_ms ({}); slow experts will end as deadline_exceeded",
                self.dispatch.overall_deadline_ms, self.dispatch.per_call_timeout_ms
            );
        }

        Ok(())
    }

    pub fn experts(&self) -> Vec<Expert> {
        self.experts
            .iter()
            .map(|e| Expert::new(&e.id, &e.name, &e.endpoint).with_capabilities(e.capabilities.iter().cloned()))
            .collect()
    }

    pub fn capability_table(&self) -> CapabilityTable {
        let mut table = CapabilityTable::new();
        for (request_type, keys) in &self.capabilities {
            table.insert(RequestType::new(request_type), keys.iter().cloned());
        }
        table
    }

    pub fn dispatch_limits(&self) -> DispatchLimits {
        DispatchLimits {
            per_call_timeout: Duration::from_millis(self.dispatch.per_call_timeout_ms),
            overall_deadline: Duration::from_millis(self.dispatch.overall_deadline_ms),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.registry.refresh_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.registry.probe_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
