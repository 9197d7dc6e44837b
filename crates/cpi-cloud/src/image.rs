//! Local file plumbing for stemcell builds: archive unpacking, block device
//! discovery and raw image copies.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use tar::Archive;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::device::device_candidates;
use crate::{Error, Result};

/// Raw disk image at the root of every stemcell archive.
pub const ROOT_IMAGE: &str = "root.img";

const MIB: u64 = 1024 * 1024;

/// Unpack a gzipped tar archive into `dest`.
pub async fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || extract(&archive, &dest))
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
}

fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        // Rejects `..` and writes through symlinks that leave `dest`.
        if !entry.unpack_in(dest)? {
            warn!(path = %path.display(), "skipping archive entry outside of destination");
        }
    }

    if !is_regular_file(&dest.join(ROOT_IMAGE)) {
        return Err(Error::NotFound(format!(
            "stemcell archive has no `{ROOT_IMAGE}'"
        )));
    }
    Ok(())
}

/// Whether `path` is a regular file itself, not a symlink to one.
pub fn is_regular_file(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_file())
        .unwrap_or(false)
}

/// Size of `path` in MiB, rounded up.
pub async fn size_mib(path: &Path) -> Result<u64> {
    let len = tokio::fs::metadata(path).await?.len();
    Ok(len.div_ceil(MIB))
}

/// Wait for the device node behind `device` to show up on this host,
/// checking both the requested name and its kernel-remapped aliases.
pub async fn wait_for_device(device: &str, attempts: u32, interval: Duration) -> Result<PathBuf> {
    let candidates = device_candidates(device);

    for attempt in 1..=attempts {
        for candidate in &candidates {
            if tokio::fs::try_exists(candidate).await.unwrap_or(false) {
                info!(device, path = %candidate.display(), "found block device");
                return Ok(candidate.clone());
            }
        }
        debug!(device, attempt, "waiting for block device");
        tokio::time::sleep(interval).await;
    }

    Err(Error::NotFound(format!(
        "cannot find block device for `{device}' after {attempts} attempts"
    )))
}

/// Copy a raw image onto a block device, byte for byte.
pub async fn copy_image(image: &Path, device: &Path) -> Result<u64> {
    let mut source = tokio::fs::File::open(image).await?;
    let mut target = tokio::fs::OpenOptions::new()
        .write(true)
        .open(device)
        .await?;

    let copied = tokio::io::copy(&mut source, &mut target).await?;
    target.flush().await?;
    target.sync_all().await?;

    info!(
        image = %image.display(),
        device = %device.display(),
        bytes = copied,
        "copied stemcell image"
    );
    Ok(copied)
}
