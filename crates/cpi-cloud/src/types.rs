use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Opaque provider-side server identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Servers ──────────────────────────────────────────────────────────

/// Server as reported by the provider.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: ServerId,
    /// Registry key for the server's agent settings.
    pub name: String,
    pub status: String,
    pub availability_zone: Option<String>,
    pub security_groups: Vec<String>,
}

/// Parameters for creating a server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerParams {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
    /// JSON document the agent reads on first boot to find the registry.
    pub user_data: String,
    pub availability_zone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootKind {
    Soft,
    Hard,
}

impl RebootKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soft => "SOFT",
            Self::Hard => "HARD",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Flavor {
    pub id: String,
    pub name: String,
}

/// Placement and sizing of a new VM, as passed by the orchestrator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourcePool {
    pub instance_type: String,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
}

// ── Volumes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
    pub status: String,
    pub size_gib: u32,
    pub availability_zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeParams {
    pub name: String,
    pub size_gib: u32,
    pub availability_zone: Option<String>,
}

/// A volume attached to a server. `device` is whatever the provider
/// reports, which may differ from the device that was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub server_id: ServerId,
    pub device: String,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub status: String,
}

// ── Images ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub status: String,
    pub properties: BTreeMap<String, String>,
}

/// Image registered from a volume snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotImageParams {
    pub name: String,
    pub snapshot_id: String,
    pub properties: BTreeMap<String, String>,
}

/// Image uploaded directly to the image service from a local file.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageUpload {
    pub name: String,
    pub disk_format: String,
    pub container_format: String,
    pub location: PathBuf,
    pub is_public: bool,
    pub properties: BTreeMap<String, String>,
}

/// Stemcell metadata shipped alongside the image archive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StemcellProperties {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub disk_format: Option<String>,
    #[serde(default)]
    pub container_format: Option<String>,
    /// Kernel image file inside the archive.
    #[serde(default)]
    pub kernel_file: Option<String>,
    /// Ramdisk image file inside the archive.
    #[serde(default)]
    pub ramdisk_file: Option<String>,
    /// Pre-existing kernel image to reference instead of uploading one.
    #[serde(default)]
    pub kernel_id: Option<String>,
    #[serde(default)]
    pub ramdisk_id: Option<String>,
    /// Size of the temporary build volume in MiB.
    #[serde(default)]
    pub disk: Option<u64>,
}

// ── Floating IPs ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FloatingIp {
    pub id: String,
    pub ip: String,
    pub server_id: Option<ServerId>,
}
