//! mirrorprobe.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::schedule::ScheduleSpec;
use crate::types::{Endpoint, Endpoints};

pub const DEFAULT_FEED_URL: &str =
    "https://replicate.npmjs.com/_changes?descending=true&limit=25&include_docs=true";
pub const DEFAULT_FEED_INTERVAL_MS: u64 = 180_000;
pub const DEFAULT_CANONICAL: &str = "npmjs";
pub const SLOW_RULES: [&str; 2] = ["ratio", "deviations"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorprobeConfig {
    #[serde(default)]
    pub collector: CollectorConfig,
    pub cache: Option<CacheConfig>,
    pub npm: Option<NpmAuth>,
    pub registries: Option<BTreeMap<String, RegistryConfig>>,
    #[serde(default)]
    pub probes: ProbesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_feed_url")]
    pub feed_url: String,
    #[serde(default = "default_feed_interval")]
    pub feed_interval_ms: u64,
    #[serde(default = "default_canonical")]
    pub canonical: String,
    #[serde(default)]
    pub silent: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            feed_url: default_feed_url(),
            feed_interval_ms: DEFAULT_FEED_INTERVAL_MS,
            canonical: default_canonical(),
            silent: false,
        }
    }
}

impl CollectorConfig {
    pub fn feed_interval(&self) -> Duration {
        Duration::from_millis(self.feed_interval_ms)
    }
}

fn default_feed_url() -> String {
    DEFAULT_FEED_URL.to_string()
}

fn default_feed_interval() -> u64 {
    DEFAULT_FEED_INTERVAL_MS
}

fn default_canonical() -> String {
    DEFAULT_CANONICAL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: PathBuf,
}

/// Credentials passed to the publish command.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpmAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for NpmAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NpmAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub href: String,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub pathname: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl RegistryConfig {
    fn into_endpoint(self, name: &str) -> Endpoint {
        let mut endpoint = Endpoint::from_href(name, &self.href);
        if let Some(protocol) = self.protocol {
            endpoint.protocol = protocol;
        }
        if let Some(host) = self.host {
            endpoint.host = host;
        }
        if let Some(pathname) = self.pathname {
            endpoint.pathname = pathname;
        }
        endpoint.timeout_ms = self.timeout_ms;
        endpoint
    }
}

/// Per-probe sections. Unknown probe names are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbesConfig {
    pub ping: Option<ProbeSection>,
    pub delta: Option<ProbeSection>,
    pub publish: Option<PublishSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSection {
    #[serde(flatten)]
    pub schedule: ScheduleSpec,
    /// Endpoint names; all configured registries when absent.
    pub targets: Option<Vec<String>>,
    /// Ping only: "ratio" (default) or "deviations".
    pub slow_rule: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSection {
    #[serde(flatten)]
    pub schedule: ScheduleSpec,
    pub package_dir: PathBuf,
}

impl MirrorprobeConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        debug!(?path, registries = config.endpoints().len(), "config loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> CoreResult<Self> {
        let config: MirrorprobeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The configured registries, or the built-in defaults.
    pub fn endpoints(&self) -> Endpoints {
        match &self.registries {
            Some(registries) => Endpoints::new(
                registries
                    .iter()
                    .map(|(name, r)| r.clone().into_endpoint(name)),
            ),
            None => Endpoints::defaults(),
        }
    }

    fn validate(&self) -> CoreResult<()> {
        let endpoints = self.endpoints();
        if endpoints.get(&self.collector.canonical).is_none() {
            return Err(CoreError::Config(format!(
                "canonical registry '{}' is not configured",
                self.collector.canonical
            )));
        }

        let sections = [
            ("ping", self.probes.ping.as_ref()),
            ("delta", self.probes.delta.as_ref()),
        ];
        for (name, section) in sections {
            let Some(section) = section else { continue };
            section
                .schedule
                .validate()
                .map_err(|e| CoreError::Config(format!("probes.{name}: {e}")))?;
            if let Some(rule) = &section.slow_rule {
                if name != "ping" {
                    return Err(CoreError::Config(format!(
                        "probes.{name}: slow_rule only applies to probes.ping"
                    )));
                }
                if !SLOW_RULES.contains(&rule.as_str()) {
                    return Err(CoreError::Config(format!(
                        "probes.{name}: unknown slow_rule '{rule}'"
                    )));
                }
            }
            for target in section.targets.iter().flatten() {
                if endpoints.get(target).is_none() {
                    return Err(CoreError::Config(format!(
                        "probes.{name}: unknown target '{target}'"
                    )));
                }
            }
        }
        if let Some(publish) = &self.probes.publish {
            publish
                .schedule
                .validate()
                .map_err(|e| CoreError::Config(format!("probes.publish: {e}")))?;
        }
        Ok(())
    }

    /// Scaffold a config with every probe enabled on its usual cadence.
    pub fn scaffold(package_dir: &Path) -> Self {
        MirrorprobeConfig {
            collector: CollectorConfig::default(),
            cache: None,
            npm: None,
            registries: None,
            probes: ProbesConfig {
                ping: Some(ProbeSection {
                    schedule: ScheduleSpec::seconds([0, 30]),
                    targets: None,
                    slow_rule: None,
                }),
                delta: Some(ProbeSection {
                    schedule: ScheduleSpec::minutes(0, 59, 10),
                    targets: None,
                    slow_rule: None,
                }),
                publish: Some(PublishSection {
                    schedule: ScheduleSpec::minutes(0, 59, 6),
                    package_dir: package_dir.to_path_buf(),
                }),
            },
        }
    }
}
