pub mod cloud;
pub mod config;
pub mod device;
pub mod image;
pub mod metadata;
pub mod network;
pub mod poller;
pub mod stemcell;
pub mod types;

use async_trait::async_trait;

pub use cloud::Cloud;
pub use config::{CloudOptions, StemcellBuild};
pub use network::{NetworkConfigurator, NetworkError, NetworkType};
pub use registry_api::{AgentSettings, DiskSettings, NetworkSettings, NetworkSpec, RegistryClient};

use types::{
    FloatingIp, Flavor, Image, ImageUpload, RebootKind, Server, ServerId, ServerParams,
    Snapshot, SnapshotImageParams, Volume, VolumeAttachment, VolumeParams,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    State(String),

    #[error("timed out waiting for {resource} to be {target}")]
    Timeout { resource: String, target: String },

    #[error("{resource} is {state}, expected to be {target}")]
    TerminalState {
        resource: String,
        state: String,
        target: String,
    },

    #[error("too many disks attached to server `{0}'")]
    TooManyDisks(ServerId),

    #[error("{0}")]
    InvalidDiskSize(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("registry error: {0}")]
    Registry(#[from] registry_api::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Compute, volume, image and floating-IP operations of the IaaS API.
///
/// `get_*` calls return `Ok(None)` once the resource no longer exists; the
/// poller relies on that to confirm deletions. Implementations report their
/// own failures as [`Error::Provider`].
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    // Servers
    async fn create_server(&self, params: &ServerParams) -> Result<Server>;
    async fn get_server(&self, id: &ServerId) -> Result<Option<Server>>;
    async fn destroy_server(&self, id: &ServerId) -> Result<()>;
    async fn reboot_server(&self, id: &ServerId, kind: RebootKind) -> Result<()>;

    // Catalog
    async fn list_images(&self) -> Result<Vec<Image>>;
    async fn get_image(&self, id: &str) -> Result<Option<Image>>;
    async fn list_flavors(&self) -> Result<Vec<Flavor>>;

    // Volumes
    async fn create_volume(&self, params: &VolumeParams) -> Result<Volume>;
    async fn get_volume(&self, id: &str) -> Result<Option<Volume>>;
    async fn destroy_volume(&self, id: &str) -> Result<()>;
    async fn list_server_volumes(&self, server: &ServerId) -> Result<Vec<VolumeAttachment>>;
    async fn attach_volume(
        &self,
        server: &ServerId,
        volume_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment>;
    async fn detach_volume(&self, server: &ServerId, volume_id: &str) -> Result<()>;

    // Snapshots and images
    async fn create_snapshot(&self, volume_id: &str, description: &str) -> Result<Snapshot>;
    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>>;
    async fn create_image(&self, params: &SnapshotImageParams) -> Result<Image>;
    async fn upload_image(&self, params: &ImageUpload) -> Result<Image>;
    async fn destroy_image(&self, id: &str) -> Result<()>;

    // Floating IPs
    async fn list_floating_ips(&self) -> Result<Vec<FloatingIp>>;
    async fn associate_floating_ip(&self, ip: &str, server: &ServerId) -> Result<()>;
    async fn disassociate_floating_ip(&self, ip: &str, server: &ServerId) -> Result<()>;
}
