use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::ServerId;
use crate::{Error, Result};

/// Device naming scheme used when requesting a volume attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceConvention {
    /// `/dev/vdc` .. `/dev/vdz`. `vda` and `vdb` hold the system and
    /// ephemeral disks.
    Virtio,
    /// `/dev/sdf` .. `/dev/sdp`.
    Scsi,
}

impl DeviceConvention {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Virtio => "virtio",
            Self::Scsi => "scsi",
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Virtio => "/dev/vd",
            Self::Scsi => "/dev/sd",
        }
    }

    /// Letters handed out for persistent disks, in allocation order.
    pub fn letters(&self) -> RangeInclusive<char> {
        match self {
            Self::Virtio => 'c'..='z',
            Self::Scsi => 'f'..='p',
        }
    }

    /// System and ephemeral disk devices written into fresh agent settings.
    pub fn system_devices(&self) -> (&'static str, &'static str) {
        match self {
            Self::Virtio => ("/dev/vda", "/dev/vdb"),
            Self::Scsi => ("/dev/sda", "/dev/sdb"),
        }
    }
}

impl fmt::Display for DeviceConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceConvention {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "virtio" => Ok(Self::Virtio),
            "scsi" => Ok(Self::Scsi),
            other => Err(Error::Configuration(format!(
                "unknown device convention `{other}'"
            ))),
        }
    }
}

/// Pick the first device of `convention` not present in `existing`.
///
/// The result is only a request: the provider may attach the volume under a
/// different name, and that reported name is the one to record.
pub fn allocate(
    server: &ServerId,
    existing: &HashSet<String>,
    convention: DeviceConvention,
) -> Result<String> {
    convention
        .letters()
        .map(|letter| format!("{}{letter}", convention.prefix()))
        .find(|device| !existing.contains(device))
        .ok_or_else(|| Error::TooManyDisks(server.clone()))
}

/// Host paths a requested device may show up under. Xen kernels expose
/// `sd*` and `vd*` devices as `xvd*`.
pub fn device_candidates(device: &str) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(device)];
    for prefix in ["/dev/sd", "/dev/vd"] {
        if let Some(letter) = device.strip_prefix(prefix) {
            candidates.push(PathBuf::from(format!("/dev/xvd{letter}")));
        }
    }
    candidates
}
