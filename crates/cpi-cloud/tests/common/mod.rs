#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cpi_cloud::config::RegistryOptions;
use cpi_cloud::types::{
    FloatingIp, Flavor, Image, ImageUpload, RebootKind, Server, ServerId, ServerParams, Snapshot,
    SnapshotImageParams, Volume, VolumeAttachment, VolumeParams,
};
use cpi_cloud::{AgentSettings, Cloud, CloudOptions, CloudProvider, Error, Result};
use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const BUILDER_ID: &str = "i-builder";

/// Provider state the tests arrange and inspect.
pub struct State {
    pub servers: HashMap<String, Server>,
    pub volumes: HashMap<String, Volume>,
    pub attachments: Vec<VolumeAttachment>,
    pub snapshots: HashMap<String, Snapshot>,
    pub images: HashMap<String, Image>,
    pub flavors: Vec<Flavor>,
    pub floating_ips: Vec<FloatingIp>,

    /// Status a server settles in after create/reboot.
    pub server_status: String,
    /// Status a volume settles in after create.
    pub volume_status: String,
    /// Status a snapshot settles in after create.
    pub snapshot_status: String,
    /// Device reported for new attachments instead of the requested one.
    pub attach_device: Option<String>,
    /// Error returned by the next `attach_volume` call.
    pub attach_error: Option<String>,

    pub created_servers: Vec<ServerParams>,
    pub created_volumes: Vec<VolumeParams>,
    pub uploads: Vec<ImageUpload>,
    pub calls: Vec<String>,
    next_id: u32,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// In-memory provider. Resources settle in their target state immediately.
pub struct FakeProvider {
    state: Mutex<State>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        let images = HashMap::from([(
            "sc-id".to_string(),
            Image {
                id: "sc-id".into(),
                name: "bosh-stemcell".into(),
                status: "active".into(),
                properties: Default::default(),
            },
        )]);

        Arc::new(Self {
            state: Mutex::new(State {
                servers: HashMap::new(),
                volumes: HashMap::new(),
                attachments: Vec::new(),
                snapshots: HashMap::new(),
                images,
                flavors: vec![Flavor {
                    id: "f-test".into(),
                    name: "m1.tiny".into(),
                }],
                floating_ips: Vec::new(),
                server_status: "active".into(),
                volume_status: "available".into(),
                snapshot_status: "available".into(),
                attach_device: None,
                attach_error: None,
                created_servers: Vec::new(),
                created_volumes: Vec::new(),
                uploads: Vec::new(),
                calls: Vec::new(),
                next_id: 0,
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_server(&self, id: &str, name: &str, security_groups: &[&str]) {
        self.state().servers.insert(
            id.into(),
            Server {
                id: ServerId(id.into()),
                name: name.into(),
                status: "ACTIVE".into(),
                availability_zone: Some("zone-a".into()),
                security_groups: security_groups.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    pub fn add_volume(&self, id: &str, status: &str) {
        self.state().volumes.insert(
            id.into(),
            Volume {
                id: id.into(),
                status: status.into(),
                size_gib: 1,
                availability_zone: Some("zone-a".into()),
            },
        );
    }

    pub fn add_attachment(&self, server: &str, volume: &str, device: &str) {
        self.state().attachments.push(VolumeAttachment {
            volume_id: volume.into(),
            server_id: ServerId(server.into()),
            device: device.into(),
        });
    }

    pub fn add_floating_ip(&self, ip: &str, server: Option<&str>) {
        self.state().floating_ips.push(FloatingIp {
            id: format!("fip-{ip}"),
            ip: ip.into(),
            server_id: server.map(|s| ServerId(s.into())),
        });
    }

    pub fn add_image(&self, id: &str, name: &str, properties: &[(&str, &str)]) {
        self.state().images.insert(
            id.into(),
            Image {
                id: id.into(),
                name: name.into(),
                status: "active".into(),
                properties: properties
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn floating_ip_owner(&self, ip: &str) -> Option<String> {
        self.state()
            .floating_ips
            .iter()
            .find(|f| f.ip == ip)
            .and_then(|f| f.server_id.clone())
            .map(|id| id.0)
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn create_server(&self, params: &ServerParams) -> Result<Server> {
        let mut state = self.state();
        let id = state.next_id("i");
        let server = Server {
            id: ServerId(id.clone()),
            name: params.name.clone(),
            status: state.server_status.clone(),
            availability_zone: params.availability_zone.clone(),
            security_groups: params.security_groups.clone(),
        };
        state.servers.insert(id.clone(), server.clone());
        state.created_servers.push(params.clone());
        state.calls.push(format!("create_server {id}"));
        Ok(Server {
            status: "BUILD".into(),
            ..server
        })
    }

    async fn get_server(&self, id: &ServerId) -> Result<Option<Server>> {
        Ok(self.state().servers.get(&id.0).cloned())
    }

    async fn destroy_server(&self, id: &ServerId) -> Result<()> {
        let mut state = self.state();
        state.servers.remove(&id.0);
        state.attachments.retain(|a| a.server_id != *id);
        state.calls.push(format!("destroy_server {id}"));
        Ok(())
    }

    async fn reboot_server(&self, id: &ServerId, kind: RebootKind) -> Result<()> {
        self.record(format!("reboot_server {id} {}", kind.as_str()));
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        Ok(self.state().images.values().cloned().collect())
    }

    async fn get_image(&self, id: &str) -> Result<Option<Image>> {
        Ok(self.state().images.get(id).cloned())
    }

    async fn list_flavors(&self) -> Result<Vec<Flavor>> {
        Ok(self.state().flavors.clone())
    }

    async fn create_volume(&self, params: &VolumeParams) -> Result<Volume> {
        let mut state = self.state();
        let id = state.next_id("v");
        let volume = Volume {
            id: id.clone(),
            status: state.volume_status.clone(),
            size_gib: params.size_gib,
            availability_zone: params.availability_zone.clone(),
        };
        state.volumes.insert(id.clone(), volume.clone());
        state.created_volumes.push(params.clone());
        state.calls.push(format!("create_volume {id}"));
        Ok(Volume {
            status: "creating".into(),
            ..volume
        })
    }

    async fn get_volume(&self, id: &str) -> Result<Option<Volume>> {
        Ok(self.state().volumes.get(id).cloned())
    }

    async fn destroy_volume(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.volumes.remove(id);
        state.calls.push(format!("destroy_volume {id}"));
        Ok(())
    }

    async fn list_server_volumes(&self, server: &ServerId) -> Result<Vec<VolumeAttachment>> {
        Ok(self
            .state()
            .attachments
            .iter()
            .filter(|a| a.server_id == *server)
            .cloned()
            .collect())
    }

    async fn attach_volume(
        &self,
        server: &ServerId,
        volume_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment> {
        let mut state = self.state();
        state
            .calls
            .push(format!("attach_volume {server} {volume_id} {device}"));
        if let Some(message) = state.attach_error.take() {
            return Err(Error::Provider(message));
        }
        if state
            .attachments
            .iter()
            .any(|a| a.server_id == *server && a.device == device)
        {
            return Err(Error::Provider(format!("device {device} is already in use")));
        }

        let attachment = VolumeAttachment {
            volume_id: volume_id.into(),
            server_id: server.clone(),
            device: state.attach_device.clone().unwrap_or_else(|| device.into()),
        };
        state.attachments.push(attachment.clone());
        if let Some(volume) = state.volumes.get_mut(volume_id) {
            volume.status = "in-use".into();
        }
        Ok(attachment)
    }

    async fn detach_volume(&self, server: &ServerId, volume_id: &str) -> Result<()> {
        let mut state = self.state();
        state
            .attachments
            .retain(|a| !(a.server_id == *server && a.volume_id == volume_id));
        if let Some(volume) = state.volumes.get_mut(volume_id) {
            volume.status = "available".into();
        }
        state.calls.push(format!("detach_volume {server} {volume_id}"));
        Ok(())
    }

    async fn create_snapshot(&self, volume_id: &str, _description: &str) -> Result<Snapshot> {
        let mut state = self.state();
        let id = state.next_id("snap");
        let snapshot = Snapshot {
            id: id.clone(),
            volume_id: volume_id.into(),
            status: state.snapshot_status.clone(),
        };
        state.snapshots.insert(id.clone(), snapshot.clone());
        state.calls.push(format!("create_snapshot {volume_id}"));
        Ok(snapshot)
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        Ok(self.state().snapshots.get(id).cloned())
    }

    async fn create_image(&self, params: &SnapshotImageParams) -> Result<Image> {
        let mut state = self.state();
        let id = state.next_id("img");
        let image = Image {
            id: id.clone(),
            name: params.name.clone(),
            status: "active".into(),
            properties: params.properties.clone(),
        };
        state.images.insert(id.clone(), image.clone());
        state
            .calls
            .push(format!("create_image {}", params.snapshot_id));
        Ok(image)
    }

    async fn upload_image(&self, params: &ImageUpload) -> Result<Image> {
        let mut state = self.state();
        let id = state.next_id("img");
        let image = Image {
            id: id.clone(),
            name: params.name.clone(),
            status: "active".into(),
            properties: params.properties.clone(),
        };
        state.images.insert(id.clone(), image.clone());
        state.uploads.push(params.clone());
        state.calls.push(format!("upload_image {}", params.name));
        Ok(Image {
            status: "queued".into(),
            ..image
        })
    }

    async fn destroy_image(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.images.remove(id);
        state.calls.push(format!("destroy_image {id}"));
        Ok(())
    }

    async fn list_floating_ips(&self) -> Result<Vec<FloatingIp>> {
        Ok(self.state().floating_ips.clone())
    }

    async fn associate_floating_ip(&self, ip: &str, server: &ServerId) -> Result<()> {
        let mut state = self.state();
        if let Some(fip) = state.floating_ips.iter_mut().find(|f| f.ip == ip) {
            fip.server_id = Some(server.clone());
        }
        state.calls.push(format!("associate_floating_ip {ip} {server}"));
        Ok(())
    }

    async fn disassociate_floating_ip(&self, ip: &str, server: &ServerId) -> Result<()> {
        let mut state = self.state();
        if let Some(fip) = state.floating_ips.iter_mut().find(|f| f.ip == ip) {
            fip.server_id = None;
        }
        state
            .calls
            .push(format!("disassociate_floating_ip {ip} {server}"));
        Ok(())
    }
}

/// Settings registry backed by a map of VM name -> settings JSON.
#[derive(Clone, Default)]
pub struct RegistryStub {
    documents: Arc<Mutex<HashMap<String, String>>>,
}

impl RegistryStub {
    pub fn get(&self, vm_name: &str) -> Option<AgentSettings> {
        self.documents
            .lock()
            .unwrap()
            .get(vm_name)
            .map(|raw| serde_json::from_str(raw).unwrap())
    }

    pub fn put(&self, vm_name: &str, settings: &AgentSettings) {
        self.documents
            .lock()
            .unwrap()
            .insert(vm_name.into(), serde_json::to_string(settings).unwrap());
    }

    pub fn contains(&self, vm_name: &str) -> bool {
        self.documents.lock().unwrap().contains_key(vm_name)
    }
}

impl Respond for RegistryStub {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Some(name) = request
            .url
            .path()
            .strip_prefix("/servers/")
            .and_then(|rest| rest.strip_suffix("/settings"))
        else {
            return ResponseTemplate::new(404);
        };

        let mut documents = self.documents.lock().unwrap();
        match request.method.as_str() {
            "GET" => match documents.get(name) {
                Some(raw) => ResponseTemplate::new(200).set_body_json(json!({ "settings": raw })),
                None => ResponseTemplate::new(404),
            },
            "PUT" => {
                documents.insert(name.into(), String::from_utf8(request.body.clone()).unwrap());
                ResponseTemplate::new(200)
            }
            "DELETE" => match documents.remove(name) {
                Some(_) => ResponseTemplate::new(200),
                None => ResponseTemplate::new(404),
            },
            _ => ResponseTemplate::new(405),
        }
    }
}

pub struct Harness {
    pub cloud: Cloud,
    pub provider: Arc<FakeProvider>,
    pub registry: RegistryStub,
    pub server: MockServer,
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

/// Cloud wired to a fake provider and to a mock server playing both the
/// settings registry and the instance metadata service.
pub async fn harness_with(configure: impl FnOnce(&mut CloudOptions)) -> Harness {
    let server = MockServer::start().await;
    let registry = RegistryStub::default();

    Mock::given(path_regex(r"^/servers/[^/]+/settings$"))
        .respond_with(registry.clone())
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/latest/meta-data/instance-id"))
        .respond_with(ResponseTemplate::new(200).set_body_string(BUILDER_ID))
        .mount(&server)
        .await;

    let mut options = CloudOptions::new(RegistryOptions {
        endpoint: server.uri(),
        user: "admin".into(),
        password: "admin".into(),
    });
    options.poll_interval = Duration::from_millis(1);
    options.state_timeout = Duration::from_secs(5);
    options.metadata_endpoint = server.uri();
    options.default_security_groups = vec!["default".into()];
    configure(&mut options);

    let provider = FakeProvider::new();
    let cloud = Cloud::new(provider.clone(), options).unwrap();

    Harness {
        cloud,
        provider,
        registry,
        server,
    }
}

/// Settings as `create_vm` would have left them, for VMs arranged by hand.
pub fn seeded_settings(vm_name: &str) -> AgentSettings {
    let mut settings = AgentSettings::default();
    settings.vm.name = vm_name.into();
    settings.agent_id = "agent-id".into();
    settings
}
