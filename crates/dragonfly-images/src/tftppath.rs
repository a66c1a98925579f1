//! Boot images present in the TFTP resource root
//!
//! Images live under `<root>/current/<arch>/<subarch>/<release>/<label>/`.
//! What a label directory can be used for follows from the files in it.

use crate::error::{ImageError, Result};
use crate::sync::CURRENT_LINK;
use dragonfly_common::{BootImage, BootPurpose};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const BOOT_KERNEL: &str = "boot-kernel";
pub const BOOT_INITRD: &str = "boot-initrd";
pub const ROOT_TGZ: &str = "root-tgz";
pub const ROOT_IMAGE: &str = "root-image.gz";

/// Directory holding one image's files
pub fn image_dir(resource_root: &Path, arch: &str, subarch: &str, release: &str, label: &str) -> PathBuf {
    resource_root
        .join(CURRENT_LINK)
        .join(arch)
        .join(subarch)
        .join(release)
        .join(label)
}

/// Purposes a label directory supports, given the file names it contains
pub fn purposes_for<S: AsRef<str>>(files: &[S]) -> Vec<BootPurpose> {
    let has = |name: &str| files.iter().any(|f| f.as_ref() == name);
    let mut purposes = Vec::new();
    if has(BOOT_KERNEL) && has(BOOT_INITRD) {
        purposes.push(BootPurpose::Commissioning);
        purposes.push(BootPurpose::Install);
    }
    if has(ROOT_TGZ) || has(ROOT_IMAGE) {
        purposes.push(BootPurpose::Xinstall);
    }
    purposes
}

/// List every boot image under `resource_root`
///
/// A root without a `current` snapshot is an empty store. A missing or
/// unreadable root is an error. Directories vanishing mid-scan (an import
/// cleaning up) are skipped.
pub async fn list_boot_images(resource_root: &Path) -> Result<Vec<BootImage>> {
    let metadata = fs::metadata(resource_root)
        .await
        .map_err(|source| listing_error(resource_root, source))?;
    if !metadata.is_dir() {
        return Err(listing_error(
            resource_root,
            io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        ));
    }

    let current = resource_root.join(CURRENT_LINK);
    if !fs::try_exists(&current)
        .await
        .map_err(|source| listing_error(&current, source))?
    {
        debug!(root = %resource_root.display(), "No current snapshot");
        return Ok(Vec::new());
    }

    let mut images = Vec::new();
    for arch in subdirs(&current).await? {
        let arch_dir = current.join(&arch);
        for subarch in subdirs(&arch_dir).await? {
            let subarch_dir = arch_dir.join(&subarch);
            for release in subdirs(&subarch_dir).await? {
                let release_dir = subarch_dir.join(&release);
                for label in subdirs(&release_dir).await? {
                    let files = file_names(&release_dir.join(&label)).await?;
                    for purpose in purposes_for(&files) {
                        images.push(BootImage {
                            architecture: arch.clone(),
                            subarchitecture: subarch.clone(),
                            release: release.clone(),
                            label: label.clone(),
                            purpose,
                        });
                    }
                }
            }
        }
    }

    images.sort();
    Ok(images)
}

fn listing_error(path: &Path, source: io::Error) -> ImageError {
    ImageError::Listing {
        path: path.to_path_buf(),
        source,
    }
}

/// Names of entries in `dir` matching `want_dir`, following symlinks
async fn entries(dir: &Path, want_dir: bool) -> Result<Vec<String>> {
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(listing_error(dir, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|source| listing_error(dir, source))?
    {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let is_dir = match fs::metadata(entry.path()).await {
            Ok(metadata) => metadata.is_dir(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(listing_error(&entry.path(), e)),
        };
        if is_dir == want_dir {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

async fn subdirs(dir: &Path) -> Result<Vec<String>> {
    entries(dir, true).await
}

async fn file_names(dir: &Path) -> Result<Vec<String>> {
    entries(dir, false).await
}
