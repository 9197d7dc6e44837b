use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::device::DeviceConvention;
use crate::metadata::DEFAULT_METADATA_ENDPOINT;
use crate::{Error, Result};

/// How `create_stemcell` turns an image archive into a provider image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StemcellBuild {
    /// Upload the raw image straight to the image service.
    Upload,
    /// Copy the raw image onto a scratch volume attached to this instance,
    /// snapshot it and register the snapshot as an image.
    Volume,
}

impl StemcellBuild {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for StemcellBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StemcellBuild {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upload" => Ok(Self::Upload),
            "volume" => Ok(Self::Volume),
            other => Err(Error::Configuration(format!(
                "unknown stemcell build strategy `{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub endpoint: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct CloudOptions {
    pub registry: RegistryOptions,
    pub default_key_name: Option<String>,
    pub default_security_groups: Vec<String>,
    pub availability_zone: Option<String>,
    pub state_timeout: Duration,
    pub poll_interval: Duration,
    pub device_convention: DeviceConvention,
    pub stemcell_build: StemcellBuild,
    pub metadata_endpoint: String,
    /// Merged into every VM's initial agent settings.
    pub agent_properties: Map<String, Value>,
}

impl CloudOptions {
    /// Options with defaults for everything except the registry.
    pub fn new(registry: RegistryOptions) -> Self {
        Self {
            registry,
            default_key_name: None,
            default_security_groups: Vec::new(),
            availability_zone: None,
            state_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(1),
            device_convention: DeviceConvention::Virtio,
            stemcell_build: StemcellBuild::Upload,
            metadata_endpoint: DEFAULT_METADATA_ENDPOINT.into(),
            agent_properties: Map::new(),
        }
    }

    /// Create from env vars:
    ///
    /// - `CPI_REGISTRY_ENDPOINT`, `CPI_REGISTRY_USER`, `CPI_REGISTRY_PASSWORD` (required)
    /// - `CPI_DEFAULT_KEY_NAME` (optional)
    /// - `CPI_DEFAULT_SECURITY_GROUPS` (comma-separated, optional)
    /// - `CPI_AVAILABILITY_ZONE` (optional)
    /// - `CPI_STATE_TIMEOUT_SECS` (default: `3600`)
    /// - `CPI_POLL_INTERVAL_MS` (default: `1000`)
    /// - `CPI_DEVICE_CONVENTION` (`virtio` or `scsi`, default: `virtio`)
    /// - `CPI_STEMCELL_BUILD` (`upload` or `volume`, default: `upload`)
    /// - `CPI_METADATA_ENDPOINT` (default: `http://169.254.169.254`)
    /// - `CPI_AGENT_PROPERTIES` (JSON object, optional)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let registry = RegistryOptions {
            endpoint: required("CPI_REGISTRY_ENDPOINT")?,
            user: required("CPI_REGISTRY_USER")?,
            password: required("CPI_REGISTRY_PASSWORD")?,
        };

        let mut options = Self::new(registry);

        options.default_key_name = env::var("CPI_DEFAULT_KEY_NAME").ok();
        options.default_security_groups = env::var("CPI_DEFAULT_SECURITY_GROUPS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        options.availability_zone = env::var("CPI_AVAILABILITY_ZONE").ok();

        if let Some(secs) = parsed::<u64>("CPI_STATE_TIMEOUT_SECS")? {
            options.state_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parsed::<u64>("CPI_POLL_INTERVAL_MS")? {
            options.poll_interval = Duration::from_millis(ms);
        }
        if let Ok(convention) = env::var("CPI_DEVICE_CONVENTION") {
            options.device_convention = convention.parse()?;
        }
        if let Ok(build) = env::var("CPI_STEMCELL_BUILD") {
            options.stemcell_build = build.parse()?;
        }
        if let Ok(endpoint) = env::var("CPI_METADATA_ENDPOINT") {
            options.metadata_endpoint = endpoint;
        }
        if let Ok(raw) = env::var("CPI_AGENT_PROPERTIES") {
            options.agent_properties = serde_json::from_str(&raw).map_err(|e| {
                Error::Configuration(format!("CPI_AGENT_PROPERTIES is not a JSON object: {e}"))
            })?;
        }

        options.validate()?;
        Ok(options)
    }

    /// Reject option sets no workflow could run with.
    pub fn validate(&self) -> Result<()> {
        if self.registry.endpoint.trim().is_empty() {
            return Err(Error::Configuration("registry endpoint is empty".into()));
        }
        if self.registry.user.is_empty() {
            return Err(Error::Configuration("registry user is empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Configuration("poll interval must be positive".into()));
        }
        if self.state_timeout.is_zero() {
            return Err(Error::Configuration("state timeout must be positive".into()));
        }
        Ok(())
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Configuration(format!("missing env var: {name}")))
}

fn parsed<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Configuration(format!("{name} has an invalid value `{raw}'"))),
        Err(_) => Ok(None),
    }
}
