//! Stemcell (base image) creation and removal.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cloud::{Cloud, MIN_DISK_MIB};
use crate::config::StemcellBuild;
use crate::image::{self, ROOT_IMAGE};
use crate::poller::{WaitSpec, state};
use crate::types::{ImageUpload, ServerId, SnapshotImageParams, StemcellProperties};
use crate::{Error, Result};

/// Image property naming the stemcell a kernel or ramdisk image was
/// uploaded for.
pub const STEMCELL_TAG: &str = "stemcell";

const KERNEL_ID: &str = "kernel_id";
const RAMDISK_ID: &str = "ramdisk_id";
const STEMCELL_NAME: &str = "stemcell_name";
const VERSION: &str = "version";

/// How many times to look for the build volume's device node.
const DEVICE_ATTEMPTS: u32 = 30;

impl Cloud {
    /// Turn a stemcell archive into a provider image and return its id.
    pub async fn create_stemcell(
        &self,
        archive: &Path,
        properties: &StemcellProperties,
    ) -> Result<String> {
        let workdir = tempfile::tempdir()?;
        image::unpack_archive(archive, workdir.path()).await?;

        let name = format!("BOSH-{}", Uuid::new_v4());
        info!(name, strategy = %self.options.stemcell_build, "creating stemcell");

        match self.options.stemcell_build {
            StemcellBuild::Upload => {
                self.upload_stemcell(&name, workdir.path(), properties)
                    .await
            }
            StemcellBuild::Volume => {
                self.build_stemcell_on_volume(&name, workdir.path(), properties)
                    .await
            }
        }
    }

    async fn upload_stemcell(
        &self,
        name: &str,
        workdir: &Path,
        props: &StemcellProperties,
    ) -> Result<String> {
        let mut uploaded = Vec::new();

        let result = self
            .upload_stemcell_images(name, workdir, props, &mut uploaded)
            .await;

        if result.is_err() {
            for id in &uploaded {
                if let Err(e) = self.provider.destroy_image(id).await {
                    error!(image_id = %id, error = %e, "failed to remove partially uploaded image");
                }
            }
        }
        result
    }

    async fn upload_stemcell_images(
        &self,
        name: &str,
        workdir: &Path,
        props: &StemcellProperties,
        uploaded: &mut Vec<String>,
    ) -> Result<String> {
        let mut properties = image_properties(props);

        let kernel_id = match &props.kernel_file {
            Some(file) => {
                let path = archive_member(workdir, file)?;
                let id = self
                    .upload_sub_image(&format!("{name}-kernel"), name, &path, "aki")
                    .await?;
                uploaded.push(id.clone());
                Some(id)
            }
            None => props.kernel_id.clone(),
        };
        let ramdisk_id = match &props.ramdisk_file {
            Some(file) => {
                let path = archive_member(workdir, file)?;
                let id = self
                    .upload_sub_image(&format!("{name}-ramdisk"), name, &path, "ari")
                    .await?;
                uploaded.push(id.clone());
                Some(id)
            }
            None => props.ramdisk_id.clone(),
        };

        if let Some(id) = kernel_id {
            properties.insert(KERNEL_ID.to_string(), id);
        }
        if let Some(id) = ramdisk_id {
            properties.insert(RAMDISK_ID.to_string(), id);
        }

        let upload = ImageUpload {
            name: name.to_string(),
            disk_format: props.disk_format.clone().unwrap_or_else(|| "qcow2".into()),
            container_format: props
                .container_format
                .clone()
                .unwrap_or_else(|| "bare".into()),
            location: workdir.join(ROOT_IMAGE),
            is_public: true,
            properties,
        };

        let image = self.provider.upload_image(&upload).await?;
        uploaded.push(image.id.clone());
        info!(image_id = %image.id, state = %image.status, "uploading stemcell image");

        self.wait_image(&image.id, self.image_wait_spec()).await?;
        Ok(image.id)
    }

    /// Upload a kernel or ramdisk image tagged as belonging to `stemcell`.
    async fn upload_sub_image(
        &self,
        name: &str,
        stemcell: &str,
        path: &Path,
        format: &str,
    ) -> Result<String> {
        if !image::is_regular_file(path) {
            return Err(Error::NotFound(format!(
                "stemcell archive has no `{}'",
                path.display()
            )));
        }

        let upload = ImageUpload {
            name: name.to_string(),
            disk_format: format.to_string(),
            container_format: format.to_string(),
            location: path.to_path_buf(),
            is_public: true,
            properties: BTreeMap::from([(STEMCELL_TAG.to_string(), stemcell.to_string())]),
        };

        let image = self.provider.upload_image(&upload).await?;
        info!(image_id = %image.id, format, "uploading stemcell sub-image");

        self.wait_image(&image.id, self.image_wait_spec()).await?;
        Ok(image.id)
    }

    /// Build the stemcell on a scratch volume attached to this instance.
    ///
    /// Once the volume exists it is detached and deleted again no matter how
    /// the build ends.
    async fn build_stemcell_on_volume(
        &self,
        name: &str,
        workdir: &Path,
        props: &StemcellProperties,
    ) -> Result<String> {
        let root = workdir.join(ROOT_IMAGE);
        let size_mib = match props.disk {
            Some(size) => size,
            None => image::size_mib(&root).await?,
        }
        .max(MIN_DISK_MIB);

        let server_id = self.current_vm_id().await?;
        let volume_id = self.create_disk(size_mib, Some(&server_id)).await?;

        let result = self
            .snapshot_stemcell(name, props, &server_id, &volume_id, &root)
            .await;
        let cleanup = self.release_build_volume(&server_id, &volume_id).await;

        match (result, cleanup) {
            (Ok(image_id), Ok(())) => Ok(image_id),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                error!(volume_id = %volume_id, error = %cleanup, "failed to clean up stemcell build volume");
                Err(e)
            }
        }
    }

    async fn snapshot_stemcell(
        &self,
        name: &str,
        props: &StemcellProperties,
        server_id: &ServerId,
        volume_id: &str,
        root: &Path,
    ) -> Result<String> {
        let server = self.server(server_id).await?;
        let device = self.attach_volume(&server, volume_id).await?;

        let path =
            image::wait_for_device(&device, DEVICE_ATTEMPTS, self.options.poll_interval).await?;
        image::copy_image(root, &path).await?;

        let snapshot = self
            .provider
            .create_snapshot(volume_id, &format!("stemcell {name}"))
            .await?;
        info!(snapshot_id = %snapshot.id, volume_id, "creating snapshot");
        self.wait_snapshot(&snapshot.id, self.wait_spec(state::AVAILABLE))
            .await?;

        let image = self
            .provider
            .create_image(&SnapshotImageParams {
                name: name.to_string(),
                snapshot_id: snapshot.id.clone(),
                properties: image_properties(props),
            })
            .await?;
        info!(image_id = %image.id, snapshot_id = %snapshot.id, "registering stemcell image");

        self.wait_image(&image.id, self.image_wait_spec()).await?;
        Ok(image.id)
    }

    async fn release_build_volume(&self, server_id: &ServerId, volume_id: &str) -> Result<()> {
        let attached = self
            .provider
            .list_server_volumes(server_id)
            .await?
            .iter()
            .any(|a| a.volume_id == volume_id);

        if attached {
            let server = self.server(server_id).await?;
            self.detach_volume(&server, volume_id).await?;
        }

        self.delete_disk(volume_id).await
    }

    /// Delete a stemcell image together with the kernel and ramdisk images
    /// that were uploaded for it.
    pub async fn delete_stemcell(&self, image_id: &str) -> Result<()> {
        let Some(image) = self.provider.get_image(image_id).await? else {
            info!(image_id, "stemcell image not found, nothing to delete");
            return Ok(());
        };

        self.provider.destroy_image(&image.id).await?;
        info!(image_id, name = %image.name, "deleted stemcell image");

        for key in [KERNEL_ID, RAMDISK_ID] {
            let Some(sub_id) = image.properties.get(key) else {
                continue;
            };

            match self.provider.get_image(sub_id).await? {
                Some(sub) if sub.properties.get(STEMCELL_TAG) == Some(&image.name) => {
                    self.provider.destroy_image(&sub.id).await?;
                    info!(image_id = %sub.id, key, "deleted stemcell sub-image");
                }
                Some(sub) => {
                    debug!(image_id = %sub.id, key, "sub-image not owned by this stemcell, keeping it");
                }
                None => debug!(image_id = %sub_id, key, "sub-image already gone"),
            }
        }

        Ok(())
    }

    fn image_wait_spec(&self) -> WaitSpec {
        self.wait_spec(state::ACTIVE)
            .failing_on(&[state::ERROR, state::KILLED])
    }
}

/// Image properties describing the stemcell itself.
fn image_properties(props: &StemcellProperties) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    if let Some(name) = &props.name {
        properties.insert(STEMCELL_NAME.to_string(), name.clone());
    }
    if let Some(version) = &props.version {
        properties.insert(VERSION.to_string(), version.clone());
    }
    properties
}

/// Path of an archive file named in the stemcell properties. Only plain
/// file names are accepted, so the upload cannot leave `workdir`.
fn archive_member(workdir: &Path, file: &str) -> Result<PathBuf> {
    let mut components = Path::new(file).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(member)), None) => Ok(workdir.join(member)),
        _ => Err(Error::Configuration(format!(
            "stemcell file `{file}' is not a file name inside the archive"
        ))),
    }
}
