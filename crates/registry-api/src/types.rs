use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ── Agent settings ───────────────────────────────────────────────────

/// Settings blob the in-guest agent reads from the registry to configure
/// its identity, networking and disks.
///
/// Operator-supplied agent properties and any keys this crate does not know
/// about are kept in `extra` and written back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub vm: VmSettings,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub networks: NetworkSpec,
    #[serde(default)]
    pub disks: DiskSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmSettings {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<String>,
    /// Volume id -> device path.
    #[serde(default)]
    pub persistent: BTreeMap<String, String>,
}

impl DiskSettings {
    /// Record `volume_id` at `device`, dropping any other volume still
    /// recorded at the same device.
    pub fn insert_persistent(&mut self, volume_id: &str, device: &str) {
        self.persistent
            .retain(|id, path| id == volume_id || path != device);
        self.persistent
            .insert(volume_id.to_string(), device.to_string());
    }

    pub fn remove_persistent(&mut self, volume_id: &str) -> Option<String> {
        self.persistent.remove(volume_id)
    }
}

// ── Networks ─────────────────────────────────────────────────────────

/// Logical network name -> network descriptor, as handed over by the
/// orchestrator and stored verbatim in the agent settings.
pub type NetworkSpec = BTreeMap<String, NetworkSettings>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Raw network type tag (`dynamic`, `vip`).
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_properties: Option<NetworkCloudProperties>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCloudProperties {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Wire envelope ────────────────────────────────────────────────────

/// GET response body: the settings object is itself a JSON-encoded string.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SettingsEnvelope {
    pub settings: String,
}
