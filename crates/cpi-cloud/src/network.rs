//! Network spec validation and floating IP reconciliation.
//!
//! A server has a single NIC on a dynamic network, whose address the
//! provider assigns at boot, and optionally one floating IP (the `vip`
//! network) that the guest itself is not aware of. Anything else in the spec
//! is rejected before the provider is touched.

use std::fmt;
use std::str::FromStr;

use registry_api::NetworkSpec;
use tracing::{debug, info};

use crate::types::Server;
use crate::{CloudProvider, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("more than one dynamic network for `{0}'")]
    DuplicateDynamic(String),

    #[error("more than one vip network for `{0}'")]
    DuplicateVip(String),

    #[error("invalid network type `{kind}' for `{name}': only `dynamic' and `vip' are supported")]
    InvalidType { name: String, kind: String },

    #[error("at least one dynamic network should be defined")]
    NoDynamic,

    #[error("no IP provided for vip network `{0}'")]
    MissingVipIp(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Dynamic,
    Vip,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dynamic => "dynamic",
            Self::Vip => "vip",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "dynamic" => Ok(Self::Dynamic),
            "vip" => Ok(Self::Vip),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct VipNetwork {
    name: String,
    ip: String,
}

/// Validated view of a [`NetworkSpec`].
#[derive(Debug, Clone)]
pub struct NetworkConfigurator {
    dynamic: String,
    vip: Option<VipNetwork>,
    security_groups: Vec<String>,
}

impl NetworkConfigurator {
    pub fn new(spec: &NetworkSpec) -> std::result::Result<Self, NetworkError> {
        let mut dynamic = None;
        let mut vip = None;
        let mut security_groups: Vec<String> = Vec::new();

        for (name, network) in spec {
            let kind = network
                .kind
                .parse::<NetworkType>()
                .map_err(|kind| NetworkError::InvalidType {
                    name: name.clone(),
                    kind,
                })?;

            match kind {
                NetworkType::Dynamic => {
                    if dynamic.is_some() {
                        return Err(NetworkError::DuplicateDynamic(name.clone()));
                    }
                    dynamic = Some(name.clone());
                    // Only dynamic networks carry security groups.
                    let groups = network
                        .cloud_properties
                        .iter()
                        .flat_map(|props| props.security_groups.iter());
                    for group in groups {
                        if !security_groups.contains(group) {
                            security_groups.push(group.clone());
                        }
                    }
                }
                NetworkType::Vip => {
                    if vip.is_some() {
                        return Err(NetworkError::DuplicateVip(name.clone()));
                    }
                    let ip = network
                        .ip
                        .clone()
                        .ok_or_else(|| NetworkError::MissingVipIp(name.clone()))?;
                    vip = Some(VipNetwork {
                        name: name.clone(),
                        ip,
                    });
                }
            }
        }

        let dynamic = dynamic.ok_or(NetworkError::NoDynamic)?;

        Ok(Self {
            dynamic,
            vip,
            security_groups,
        })
    }

    pub fn dynamic_network(&self) -> &str {
        &self.dynamic
    }

    pub fn vip_ip(&self) -> Option<&str> {
        self.vip.as_ref().map(|vip| vip.ip.as_str())
    }

    /// Security groups requested by the spec, or `default` when it names none.
    pub fn security_groups(&self, default: &[String]) -> Vec<String> {
        if self.security_groups.is_empty() {
            default.to_vec()
        } else {
            self.security_groups.clone()
        }
    }

    /// Bring the server's floating IP in line with the spec.
    ///
    /// The dynamic network needs no call: its address is assigned when the
    /// server is created.
    pub async fn configure(&self, provider: &dyn CloudProvider, server: &Server) -> Result<()> {
        let addresses = provider.list_floating_ips().await?;

        let Some(vip) = &self.vip else {
            // The server may still hold a floating IP from an earlier spec.
            for address in addresses
                .iter()
                .filter(|a| a.server_id.as_ref() == Some(&server.id))
            {
                info!(ip = %address.ip, server_id = %server.id, "disassociating floating IP");
                provider
                    .disassociate_floating_ip(&address.ip, &server.id)
                    .await?;
            }
            return Ok(());
        };

        let address = addresses
            .iter()
            .find(|a| a.ip == vip.ip)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "floating IP `{}' for vip network `{}' not allocated",
                    vip.ip, vip.name
                ))
            })?;

        match &address.server_id {
            Some(current) if *current == server.id => {
                debug!(ip = %vip.ip, server_id = %server.id, "floating IP already associated");
                return Ok(());
            }
            Some(current) => {
                info!(ip = %vip.ip, server_id = %current, "disassociating floating IP from previous server");
                provider.disassociate_floating_ip(&vip.ip, current).await?;
            }
            None => {}
        }

        info!(ip = %vip.ip, server_id = %server.id, "associating floating IP");
        provider.associate_floating_ip(&vip.ip, &server.id).await
    }
}
