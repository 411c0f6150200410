//! Configuration loading and validation (§6 Configuration surface).

use crate::error::{ConfigError, Result};
use crate::{Agent, ProviderKind, Registry, Team};
use anyhow::Context as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level daemon configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the database file and per-agent working directories.
    pub data_dir: PathBuf,

    /// `workspace.path` — root directory agents' working directories resolve against.
    pub workspace_path: PathBuf,

    pub registry: Registry,

    pub retry: RetryConfig,

    /// Seconds between periodic per-agent self-prompts. The heartbeat producer
    /// itself is external to the core (§6); this is only the interval it reads.
    pub heartbeat_interval_secs: u64,

    pub telemetry: TelemetryConfig,

    pub api: ApiConfig,

    pub metrics: MetricsConfig,
}

/// Prometheus metrics server bind settings (§6 `[metrics]`, feature-gated
/// behind the `metrics` cargo feature — the section is parsed regardless so
/// a build without the feature doesn't choke on an unknown table).
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: std::net::SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: std::net::SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

/// HTTP API bind settings (§6 `[api]`).
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: std::net::SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: std::net::SocketAddr::from(([127, 0, 0, 1], 7420)),
        }
    }
}

/// Retry, retention, and conversation tunables (§6 defaults).
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub stale_claim_threshold_secs: u64,
    pub response_retention_secs: u64,
    pub completed_message_retention_secs: u64,
    pub conversation_ttl_secs: u64,
    pub conversation_max_messages: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            stale_claim_threshold_secs: 10 * 60,
            response_retention_secs: 24 * 60 * 60,
            completed_message_retention_secs: 24 * 60 * 60,
            conversation_ttl_secs: 30 * 60,
            conversation_max_messages: 20,
        }
    }
}

/// Optional OTLP trace export configuration.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub otlp_headers: HashMap<String, String>,
    pub service_name: String,
    pub sample_rate: f64,
}

/// On-disk TOML shape. Kept separate from `Config` so loading can validate
/// and resolve defaults before handing callers the runtime form.
#[derive(Debug, serde::Deserialize)]
struct RawConfig {
    workspace: RawWorkspace,
    #[serde(default)]
    agents: HashMap<String, RawAgent>,
    #[serde(default)]
    teams: HashMap<String, RawTeam>,
    #[serde(default)]
    monitoring: RawMonitoring,
    #[serde(default)]
    retry: RawRetry,
    #[serde(default)]
    telemetry: RawTelemetry,
    #[serde(default)]
    api: RawApi,
    #[serde(default)]
    metrics: RawMetrics,
}

#[derive(Debug, serde::Deserialize)]
struct RawWorkspace {
    path: PathBuf,
}

#[derive(Debug, serde::Deserialize)]
struct RawAgent {
    name: String,
    provider: ProviderKind,
    model: String,
    #[serde(default)]
    working_directory: Option<PathBuf>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    prompt_file: Option<PathBuf>,
}

#[derive(Debug, serde::Deserialize)]
struct RawTeam {
    name: String,
    agents: Vec<String>,
    leader_agent: String,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RawMonitoring {
    heartbeat_interval: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RawRetry {
    max_retries: Option<u32>,
    stale_claim_threshold_secs: Option<u64>,
    response_retention_secs: Option<u64>,
    completed_message_retention_secs: Option<u64>,
    conversation_ttl_secs: Option<u64>,
    conversation_max_messages: Option<u32>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RawTelemetry {
    otlp_endpoint: Option<String>,
    #[serde(default)]
    otlp_headers: HashMap<String, String>,
    service_name: Option<String>,
    sample_rate: Option<f64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RawApi {
    enabled: Option<bool>,
    bind: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RawMetrics {
    enabled: Option<bool>,
    bind: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let workspace_path = raw.workspace.path;

        let mut agents = HashMap::new();
        for (id, raw_agent) in raw.agents {
            let agent_id: crate::AgentId = id.clone().into();
            let working_directory = match raw_agent.working_directory {
                Some(path) if path.is_absolute() => path,
                Some(path) => workspace_path.join(path),
                None => workspace_path.join(id.as_str()),
            };
            agents.insert(
                agent_id.clone(),
                Agent {
                    id: agent_id,
                    name: raw_agent.name,
                    provider: raw_agent.provider,
                    model: raw_agent.model,
                    working_directory,
                    system_prompt: raw_agent.system_prompt,
                    prompt_file: raw_agent.prompt_file,
                },
            );
        }

        if agents.is_empty() {
            return Err(ConfigError::Invalid("no agents configured".into()).into());
        }

        let mut teams = HashMap::new();
        for (id, raw_team) in raw.teams {
            let team_id: crate::TeamId = id.clone().into();
            let team = Team {
                id: team_id.clone(),
                name: raw_team.name,
                members: raw_team.agents.into_iter().map(Into::into).collect(),
                leader: raw_team.leader_agent.into(),
            };
            for member in &team.members {
                if !agents.contains_key(member) {
                    return Err(ConfigError::Invalid(format!(
                        "team {id} references unknown agent {member}"
                    ))
                    .into());
                }
            }
            team.validate().map_err(ConfigError::Invalid)?;
            teams.insert(team_id, team);
        }

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_retries: raw.retry.max_retries.unwrap_or(defaults.max_retries),
            stale_claim_threshold_secs: raw
                .retry
                .stale_claim_threshold_secs
                .unwrap_or(defaults.stale_claim_threshold_secs),
            response_retention_secs: raw
                .retry
                .response_retention_secs
                .unwrap_or(defaults.response_retention_secs),
            completed_message_retention_secs: raw
                .retry
                .completed_message_retention_secs
                .unwrap_or(defaults.completed_message_retention_secs),
            conversation_ttl_secs: raw
                .retry
                .conversation_ttl_secs
                .unwrap_or(defaults.conversation_ttl_secs),
            conversation_max_messages: raw
                .retry
                .conversation_max_messages
                .unwrap_or(defaults.conversation_max_messages),
        };

        let telemetry = TelemetryConfig {
            otlp_endpoint: raw
                .telemetry
                .otlp_endpoint
                .or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()),
            otlp_headers: raw.telemetry.otlp_headers,
            service_name: raw
                .telemetry
                .service_name
                .unwrap_or_else(|| "waypoint".to_string()),
            sample_rate: raw.telemetry.sample_rate.unwrap_or(1.0),
        };

        let data_dir = dirs::data_dir()
            .map(|d| d.join("waypoint"))
            .unwrap_or_else(|| PathBuf::from("./data"));
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let api_defaults = ApiConfig::default();
        let api = ApiConfig {
            enabled: raw.api.enabled.unwrap_or(api_defaults.enabled),
            bind: match raw.api.bind {
                Some(addr) => addr
                    .parse()
                    .map_err(|_| ConfigError::Invalid(format!("invalid api.bind address: {addr}")))?,
                None => api_defaults.bind,
            },
        };

        let metrics_defaults = MetricsConfig::default();
        let metrics = MetricsConfig {
            enabled: raw.metrics.enabled.unwrap_or(metrics_defaults.enabled),
            bind: match raw.metrics.bind {
                Some(addr) => addr.parse().map_err(|_| {
                    ConfigError::Invalid(format!("invalid metrics.bind address: {addr}"))
                })?,
                None => metrics_defaults.bind,
            },
        };

        Ok(Self {
            data_dir,
            workspace_path,
            registry: Registry { agents, teams },
            retry,
            heartbeat_interval_secs: raw.monitoring.heartbeat_interval.unwrap_or(300),
            telemetry,
            api,
            metrics,
        })
    }

    /// The SQLite database path under the data directory.
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("waypoint.db")
    }

    pub fn default_instance_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("waypoint"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }
}
