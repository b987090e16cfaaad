// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Forwarder Configuration Types
//
// Defines the configuration schema for an I/O forwarding node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Node identity and cluster rank
// - Server group and initial primary service rank
// - Capability table settings (version, growth)
// - Request retry bounds and descriptor pool sizing
// - Per-projection failover switch
// - Observability settings

use crate::domain::capability::{Rank, MAX_CAPABILITY_RANK};
use crate::domain::capability_store::{DEFAULT_CAPABILITY_VERSION, DEFAULT_GROWTH_DELTA};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub const API_VERSION: &str = "iof.io/v1";
pub const KIND: &str = "ForwarderConfig";

/// Top-level Kubernetes-style forwarder configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfigManifest {
    /// API version (must be "iof.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ForwarderConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: ForwarderSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwarderSpec {
    #[serde(default)]
    pub node: NodeIdentity,

    #[serde(default)]
    pub group: GroupConfig,

    #[serde(default)]
    pub capabilities: CapabilityConfig,

    #[serde(default)]
    pub requests: RequestConfig,

    /// Exports this node projects
    #[serde(default)]
    pub projections: Vec<ProjectionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique node identifier (UUID)
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Cluster rank of this process
    #[serde(default)]
    pub rank: Rank,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            rank: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Server group the projections are served by
    #[serde(default = "default_group_name")]
    pub name: String,

    /// Primary service rank at mount time
    #[serde(default)]
    pub primary_rank: Rank,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: default_group_name(),
            primary_rank: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Protocol version minted into capabilities
    #[serde(default = "default_capability_version")]
    pub version: u8,

    /// Slots appended when the capability table is full
    #[serde(default = "default_growth_delta")]
    pub growth_delta: usize,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            version: default_capability_version(),
            growth_delta: default_growth_delta(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Same-target resends allowed for transient transport errors
    #[serde(default = "default_max_transient_resends")]
    pub max_transient_resends: u32,

    /// Request descriptors kept ready after each pool restock
    #[serde(default = "default_pool_target")]
    pub pool_target: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_transient_resends: default_max_transient_resends(),
            pool_target: default_pool_target(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Export name as advertised by the server group
    pub name: String,

    /// Migrate capabilities on eviction instead of going offline
    #[serde(default = "default_true")]
    pub failover: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_true() -> bool {
    true
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_group_name() -> String {
    "ionss".to_string()
}

fn default_capability_version() -> u8 {
    DEFAULT_CAPABILITY_VERSION
}

fn default_growth_delta() -> usize {
    DEFAULT_GROWTH_DELTA
}

fn default_max_transient_resends() -> u32 {
    16
}

fn default_pool_target() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ForwarderConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "iof-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: ForwarderSpec::default(),
        }
    }
}

impl ForwarderConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. IOF_CONFIG_PATH environment variable
    /// 2. ./iof-config.yaml (working directory)
    /// 3. ~/.iof/config.yaml (user home)
    /// 4. /etc/iof/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("IOF_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./iof-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".iof").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/iof/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("IOF_MAX_TRANSIENT_RESENDS") {
            match val.parse::<u32>() {
                Ok(limit) => {
                    tracing::info!("Environment override: IOF_MAX_TRANSIENT_RESENDS={}", limit);
                    self.spec.requests.max_transient_resends = limit;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for IOF_MAX_TRANSIENT_RESENDS: '{}'. Expected an unsigned integer. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.node.id.is_empty() {
            anyhow::bail!("spec.node.id cannot be empty");
        }

        // Ranks travel in the 8-bit root field of a capability
        if self.spec.node.rank > MAX_CAPABILITY_RANK {
            anyhow::bail!(
                "spec.node.rank {} exceeds the capability rank limit {}",
                self.spec.node.rank,
                MAX_CAPABILITY_RANK
            );
        }
        if self.spec.group.primary_rank > MAX_CAPABILITY_RANK {
            anyhow::bail!(
                "spec.group.primary_rank {} exceeds the capability rank limit {}",
                self.spec.group.primary_rank,
                MAX_CAPABILITY_RANK
            );
        }

        if self.spec.group.name.is_empty() {
            anyhow::bail!("spec.group.name cannot be empty");
        }

        if self.spec.capabilities.version == 0 {
            anyhow::bail!("spec.capabilities.version must be non-zero");
        }

        if self.spec.capabilities.growth_delta == 0 {
            anyhow::bail!("spec.capabilities.growth_delta must be non-zero");
        }

        let mut seen = HashSet::new();
        for projection in &self.spec.projections {
            if projection.name.is_empty() {
                anyhow::bail!("Projection name cannot be empty");
            }
            if !seen.insert(projection.name.as_str()) {
                anyhow::bail!("Duplicate projection name: {}", projection.name);
            }
        }

        Ok(())
    }
}
