use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use registry_api::{AgentSettings, DiskSettings, NetworkSpec, RegistryClient, VmSettings};
use serde_json::{Map, Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CloudOptions;
use crate::device;
use crate::metadata::MetadataClient;
use crate::network::NetworkConfigurator;
use crate::poller::{WaitSpec, state, wait_resource};
use crate::types::{
    Flavor, Image, RebootKind, ResourcePool, Server, ServerId, ServerParams, Volume, VolumeParams,
};
use crate::{CloudProvider, Error, Result};

/// Smallest volume accepted by `create_disk`, in MiB.
pub const MIN_DISK_MIB: u64 = 1024;
/// Largest volume accepted by `create_disk`, in MiB.
pub const MAX_DISK_MIB: u64 = 1024 * 1024;

/// Top-level keys of [`AgentSettings`] that operator agent properties may
/// not shadow.
const RESERVED_SETTINGS_KEYS: [&str; 5] = ["vm", "agent_id", "networks", "disks", "env"];

/// VM, disk and network workflows against a [`CloudProvider`].
///
/// Each public method drives one operation to completion, polling the
/// provider until the affected resources settle. Calls on different
/// resources may run concurrently; calls that touch the same VM's agent
/// settings are not serialized here.
pub struct Cloud {
    pub(crate) provider: Arc<dyn CloudProvider>,
    pub(crate) registry: RegistryClient,
    pub(crate) options: CloudOptions,
    metadata: MetadataClient,
    current_server: OnceCell<ServerId>,
}

impl Cloud {
    pub fn new(provider: Arc<dyn CloudProvider>, options: CloudOptions) -> Result<Self> {
        options.validate()?;

        let registry = RegistryClient::new(
            options.registry.endpoint.as_str(),
            options.registry.user.as_str(),
            &options.registry.password,
        )?;
        let metadata = MetadataClient::new(options.metadata_endpoint.as_str())?;

        Ok(Self {
            provider,
            registry,
            options,
            metadata,
            current_server: OnceCell::new(),
        })
    }

    pub fn options(&self) -> &CloudOptions {
        &self.options
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    // ── VMs ──────────────────────────────────────────────────────────

    /// Create a server, wait for it to become active, attach its floating
    /// IP and publish its initial agent settings.
    ///
    /// If anything fails once the server exists, the server is destroyed
    /// before the error is returned.
    pub async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_id: &str,
        resource_pool: &ResourcePool,
        networks: &NetworkSpec,
        disk_locality: &[String],
        env: Option<Map<String, Value>>,
    ) -> Result<ServerId> {
        let network = NetworkConfigurator::new(networks)?;

        if !disk_locality.is_empty() {
            debug!(disks = ?disk_locality, "disk locality is ignored");
        }

        let image = self.find_image(stemcell_id).await?;
        let flavor = self.find_flavor(&resource_pool.instance_type).await?;

        let name = format!("vm-{}", Uuid::new_v4());
        let user_data = json!({
            "registry": { "endpoint": self.registry.endpoint() },
            "server": { "name": name },
            "agent": { "id": agent_id },
        });

        let params = ServerParams {
            name,
            image_id: image.id,
            flavor_id: flavor.id,
            key_name: resource_pool
                .key_name
                .clone()
                .or_else(|| self.options.default_key_name.clone()),
            security_groups: network.security_groups(&self.options.default_security_groups),
            user_data: user_data.to_string(),
            availability_zone: resource_pool
                .availability_zone
                .clone()
                .or_else(|| self.options.availability_zone.clone()),
        };

        info!(name = %params.name, flavor = %flavor.name, "creating new server");
        let server = self.provider.create_server(&params).await?;
        info!(server_id = %server.id, state = %server.status, "server created");

        match self
            .provision_server(&server, &network, agent_id, networks, env)
            .await
        {
            Ok(()) => Ok(server.id),
            Err(e) => {
                error!(server_id = %server.id, error = %e, "provisioning failed, cleaning up");
                if let Err(cleanup) = self.provider.destroy_server(&server.id).await {
                    error!(server_id = %server.id, error = %cleanup, "failed to destroy server");
                }
                Err(e)
            }
        }
    }

    async fn provision_server(
        &self,
        server: &Server,
        network: &NetworkConfigurator,
        agent_id: &str,
        networks: &NetworkSpec,
        env: Option<Map<String, Value>>,
    ) -> Result<()> {
        self.wait_server(&server.id, self.wait_spec(state::ACTIVE))
            .await?;

        network.configure(&*self.provider, server).await?;

        let settings = self.initial_agent_settings(&server.name, agent_id, networks, env);
        self.registry.update_settings(&server.name, &settings).await?;
        Ok(())
    }

    /// Settings the agent boots with. Persistent disks are added later by
    /// `attach_disk`.
    fn initial_agent_settings(
        &self,
        vm_name: &str,
        agent_id: &str,
        networks: &NetworkSpec,
        env: Option<Map<String, Value>>,
    ) -> AgentSettings {
        let (system, ephemeral) = self.options.device_convention.system_devices();

        let extra = self
            .options
            .agent_properties
            .iter()
            .filter(|(key, _)| !RESERVED_SETTINGS_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        AgentSettings {
            vm: VmSettings {
                name: vm_name.to_string(),
            },
            agent_id: agent_id.to_string(),
            networks: networks.clone(),
            disks: DiskSettings {
                system: Some(system.to_string()),
                ephemeral: Some(ephemeral.to_string()),
                persistent: Default::default(),
            },
            env,
            extra,
        }
    }

    /// Destroy a server and drop its agent settings. A server that is
    /// already gone is not an error.
    pub async fn delete_vm(&self, server_id: &ServerId) -> Result<()> {
        let server = match self.provider.get_server(server_id).await? {
            Some(server) if !is_state(&server.status, state::DELETED) => server,
            _ => {
                info!(server_id = %server_id, "server not found, nothing to delete");
                return Ok(());
            }
        };

        self.provider.destroy_server(server_id).await?;
        info!(server_id = %server_id, state = %server.status, "deleting server");

        self.wait_server(server_id, self.wait_spec(state::DELETED).allow_missing())
            .await?;

        self.registry.delete_settings(&server.name).await?;
        info!(server_id = %server_id, "server deleted");
        Ok(())
    }

    /// Soft-reboot a server and wait until it is active again.
    pub async fn reboot_vm(&self, server_id: &ServerId) -> Result<()> {
        self.reboot(server_id, RebootKind::Soft).await
    }

    /// Hard-reboot a server. Never chosen automatically: callers decide when
    /// a soft reboot is not enough.
    pub async fn hard_reboot_vm(&self, server_id: &ServerId) -> Result<()> {
        self.reboot(server_id, RebootKind::Hard).await
    }

    async fn reboot(&self, server_id: &ServerId, kind: RebootKind) -> Result<()> {
        self.server(server_id).await?;

        self.provider.reboot_server(server_id, kind).await?;
        info!(server_id = %server_id, kind = kind.as_str(), "rebooting server");

        self.wait_server(server_id, self.wait_spec(state::ACTIVE))
            .await
    }

    pub async fn has_vm(&self, server_id: &ServerId) -> Result<bool> {
        Ok(self
            .provider
            .get_server(server_id)
            .await?
            .is_some_and(|server| !is_state(&server.status, state::DELETED)))
    }

    /// Apply a new network spec to a running server.
    ///
    /// Only the floating IP can change in place; a different set of security
    /// groups needs a new server.
    pub async fn configure_networks(
        &self,
        server_id: &ServerId,
        networks: &NetworkSpec,
    ) -> Result<()> {
        let network = NetworkConfigurator::new(networks)?;
        let server = self.server(server_id).await?;

        let desired: BTreeSet<String> = network
            .security_groups(&self.options.default_security_groups)
            .into_iter()
            .collect();
        let actual: BTreeSet<String> = server.security_groups.iter().cloned().collect();
        if desired != actual {
            warn!(
                server_id = %server_id,
                ?actual,
                ?desired,
                "security groups differ from the running server"
            );
            return Err(Error::NotSupported(
                "security group change requires VM recreation".into(),
            ));
        }

        network.configure(&*self.provider, &server).await?;

        self.update_agent_settings(&server.name, |settings| {
            settings.networks = networks.clone();
        })
        .await
    }

    /// Id of the server this process runs on, looked up once.
    pub async fn current_vm_id(&self) -> Result<ServerId> {
        self.current_server
            .get_or_try_init(|| self.metadata.instance_id())
            .await
            .cloned()
    }

    /// Deployment validation is left to the orchestrator.
    pub fn validate_deployment(&self, _old: &Value, _new: &Value) -> Result<()> {
        Err(Error::NotSupported("validate_deployment".into()))
    }

    // ── Disks ────────────────────────────────────────────────────────

    /// Create a volume of `size_mib` (rounded up to whole GiB), placed in
    /// the availability zone of `server_id` when given.
    pub async fn create_disk(&self, size_mib: u64, server_id: Option<&ServerId>) -> Result<String> {
        if size_mib < MIN_DISK_MIB {
            return Err(Error::InvalidDiskSize("minimum disk size is 1 GiB".into()));
        }
        if size_mib > MAX_DISK_MIB {
            return Err(Error::InvalidDiskSize("maximum disk size is 1 TiB".into()));
        }
        let size_gib = u32::try_from(size_mib.div_ceil(1024))
            .map_err(|_| Error::InvalidDiskSize(format!("disk size {size_mib} MiB is too large")))?;

        let availability_zone = match server_id {
            Some(id) => self
                .server(id)
                .await?
                .availability_zone
                .or_else(|| self.options.availability_zone.clone()),
            None => self.options.availability_zone.clone(),
        };

        let params = VolumeParams {
            name: format!("volume-{}", Uuid::new_v4()),
            size_gib,
            availability_zone,
        };

        let volume = self.provider.create_volume(&params).await?;
        info!(volume_id = %volume.id, size_gib, state = %volume.status, "creating volume");

        if let Err(e) = self
            .wait_volume(&volume.id, self.wait_spec(state::AVAILABLE))
            .await
        {
            error!(volume_id = %volume.id, error = %e, "volume did not become available, cleaning up");
            if let Err(cleanup) = self.provider.destroy_volume(&volume.id).await {
                error!(volume_id = %volume.id, error = %cleanup, "failed to destroy volume");
            }
            return Err(e);
        }

        Ok(volume.id)
    }

    /// Delete a volume. Only detached (`available`) volumes can be deleted.
    pub async fn delete_disk(&self, volume_id: &str) -> Result<()> {
        let volume = self.volume(volume_id).await?;

        if !is_state(&volume.status, state::AVAILABLE) {
            return Err(Error::State(format!(
                "cannot delete volume `{volume_id}', state is {}",
                volume.status
            )));
        }

        self.provider.destroy_volume(volume_id).await?;
        info!(volume_id, "deleting volume");

        self.wait_volume(volume_id, self.wait_spec(state::DELETED).allow_missing())
            .await?;
        info!(volume_id, "volume deleted");
        Ok(())
    }

    /// Attach a volume and record it in the server's agent settings.
    /// Returns the device the provider attached the volume as.
    pub async fn attach_disk(&self, server_id: &ServerId, volume_id: &str) -> Result<String> {
        let server = self.server(server_id).await?;
        let device = self.attach_volume(&server, volume_id).await?;

        self.update_agent_settings(&server.name, |settings| {
            settings.disks.insert_persistent(volume_id, &device);
        })
        .await?;

        info!(server_id = %server_id, volume_id, device = %device, "attached disk");
        Ok(device)
    }

    /// Attach without touching agent settings. A volume already attached to
    /// `server` keeps its device.
    pub(crate) async fn attach_volume(&self, server: &Server, volume_id: &str) -> Result<String> {
        let volume = self.volume(volume_id).await?;
        let attachments = self.provider.list_server_volumes(&server.id).await?;

        if let Some(existing) = attachments.iter().find(|a| a.volume_id == volume.id) {
            info!(
                server_id = %server.id,
                volume_id,
                device = %existing.device,
                "volume already attached"
            );
            return Ok(existing.device.clone());
        }

        let in_use: HashSet<String> = attachments.into_iter().map(|a| a.device).collect();
        let requested = device::allocate(&server.id, &in_use, self.options.device_convention)?;

        let attachment = self
            .provider
            .attach_volume(&server.id, &volume.id, &requested)
            .await?;
        info!(server_id = %server.id, volume_id, device = %requested, "attaching volume");

        self.wait_volume(volume_id, self.wait_spec(state::IN_USE))
            .await?;

        if attachment.device != requested {
            info!(
                requested = %requested,
                device = %attachment.device,
                "provider attached volume under a different device"
            );
        }
        Ok(attachment.device)
    }

    /// Detach a volume and drop it from the server's agent settings.
    pub async fn detach_disk(&self, server_id: &ServerId, volume_id: &str) -> Result<()> {
        let server = self.server(server_id).await?;
        self.detach_volume(&server, volume_id).await?;

        self.update_agent_settings(&server.name, |settings| {
            settings.disks.remove_persistent(volume_id);
        })
        .await?;

        info!(server_id = %server_id, volume_id, "detached disk");
        Ok(())
    }

    pub(crate) async fn detach_volume(&self, server: &Server, volume_id: &str) -> Result<()> {
        self.volume(volume_id).await?;

        let attachments = self.provider.list_server_volumes(&server.id).await?;
        if !attachments.iter().any(|a| a.volume_id == volume_id) {
            return Err(Error::State(format!(
                "disk `{volume_id}' is not attached to server `{}'",
                server.id
            )));
        }

        self.provider.detach_volume(&server.id, volume_id).await?;
        info!(server_id = %server.id, volume_id, "detaching volume");

        self.wait_volume(volume_id, self.wait_spec(state::AVAILABLE))
            .await
    }

    // ── Agent settings ───────────────────────────────────────────────

    /// Read a VM's agent settings, apply `mutate` and write them back.
    ///
    /// This is the unit of change for a single VM's settings. It is not
    /// atomic: two concurrent updates of the same VM can lose one of the
    /// writes, so callers that need ordering must serialize per VM.
    pub async fn update_agent_settings<F>(&self, vm_name: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut AgentSettings),
    {
        let mut settings = self.registry.read_settings(vm_name).await?;
        mutate(&mut settings);
        self.registry.update_settings(vm_name, &settings).await?;
        Ok(())
    }

    // ── Lookups and waits ────────────────────────────────────────────

    pub(crate) async fn server(&self, id: &ServerId) -> Result<Server> {
        self.provider
            .get_server(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("server `{id}' not found")))
    }

    pub(crate) async fn volume(&self, id: &str) -> Result<Volume> {
        self.provider
            .get_volume(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("volume `{id}' not found")))
    }

    async fn find_image(&self, stemcell_id: &str) -> Result<Image> {
        self.provider
            .list_images()
            .await?
            .into_iter()
            .find(|image| image.id == stemcell_id || image.name == stemcell_id)
            .ok_or_else(|| Error::NotFound(format!("stemcell `{stemcell_id}' not found")))
    }

    async fn find_flavor(&self, instance_type: &str) -> Result<Flavor> {
        self.provider
            .list_flavors()
            .await?
            .into_iter()
            .find(|flavor| flavor.id == instance_type || flavor.name == instance_type)
            .ok_or_else(|| Error::NotFound(format!("instance type `{instance_type}' not found")))
    }

    pub(crate) fn wait_spec(&self, target: &str) -> WaitSpec {
        WaitSpec::new(target, self.options.poll_interval, self.options.state_timeout)
    }

    pub(crate) async fn wait_server(&self, id: &ServerId, spec: WaitSpec) -> Result<()> {
        let provider = &*self.provider;
        wait_resource(&format!("server `{id}'"), &spec, || async move {
            Ok::<_, Error>(provider.get_server(id).await?.map(|server| server.status))
        })
        .await
    }

    pub(crate) async fn wait_volume(&self, id: &str, spec: WaitSpec) -> Result<()> {
        let provider = &*self.provider;
        wait_resource(&format!("volume `{id}'"), &spec, || async move {
            Ok::<_, Error>(provider.get_volume(id).await?.map(|volume| volume.status))
        })
        .await
    }

    pub(crate) async fn wait_snapshot(&self, id: &str, spec: WaitSpec) -> Result<()> {
        let provider = &*self.provider;
        wait_resource(&format!("snapshot `{id}'"), &spec, || async move {
            Ok::<_, Error>(provider.get_snapshot(id).await?.map(|snapshot| snapshot.status))
        })
        .await
    }

    pub(crate) async fn wait_image(&self, id: &str, spec: WaitSpec) -> Result<()> {
        let provider = &*self.provider;
        wait_resource(&format!("image `{id}'"), &spec, || async move {
            Ok::<_, Error>(provider.get_image(id).await?.map(|image| image.status))
        })
        .await
    }
}

fn is_state(status: &str, expected: &str) -> bool {
    status.trim().eq_ignore_ascii_case(expected)
}
