//! Builds a layer from a directory tree on disk. Used to cross-check the
//! installer against trees produced by a reference installer, and by callers
//! that already materialized content on the filesystem.

use crate::clock::ReproducibleClock;
use crate::install::Ownership;
use crate::layer::{Layer, LayerError};
use crate::utils::path_to_key;
use crate::vfs::{FileData, FileIdentity, FileReference, Vfs, VfsError, MODE_REGULAR};
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// An error produced while packing a directory into a layer.
#[derive(Debug, Error)]
pub enum PackError {
    /// Reading the tree failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Walking the tree failed.
    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    /// A path could not be stored.
    #[error(transparent)]
    Vfs(#[from] VfsError),

    /// Serializing the layer failed.
    #[error(transparent)]
    Layer(#[from] LayerError),

    /// The cancellation token tripped.
    #[error("packing was cancelled")]
    Cancelled,
}

/// Options for [`pack_directory`].
#[derive(Debug, Default)]
pub struct PackOptions {
    /// A synthetic directory chain to place the tree under, e.g.
    /// `opt/app`. The chain itself becomes directory entries in the layer.
    pub prefix: Option<String>,

    /// When set, every entry is stamped with this ownership. When `None`,
    /// ownership is taken from the filesystem.
    pub ownership: Option<Ownership>,
}

/// Pack the contents of `root` into an uncompressed tar layer.
///
/// Hard links are detected through their inode identity and emitted as
/// `LINK` entries. The result uses the same deterministic ordering and
/// timestamp clamping as the wheel installer.
pub fn pack_directory(
    root: &Path,
    options: &PackOptions,
    clock: &ReproducibleClock,
    cancel: &CancellationToken,
) -> Result<Layer, PackError> {
    let prefix = options.prefix.as_deref().unwrap_or("");
    let clamp_time = clock.clamp_time();
    let mut vfs = Vfs::new();

    let walk = WalkDir::new(root).sort_by(|a, b| a.file_name().cmp(b.file_name()));
    for entry in walk {
        if cancel.is_cancelled() {
            return Err(PackError::Cancelled);
        }
        let entry = entry?;
        if entry.path() == root {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields children of the root");
        let key = if prefix.is_empty() {
            path_to_key(relative)
        } else {
            format!("{prefix}/{}", path_to_key(relative))
        };

        let metadata = entry.metadata()?;
        let mut file = if entry.file_type().is_dir() {
            FileReference::directory(permissions_of(&metadata))
        } else if entry.file_type().is_symlink() {
            let target = fs_err::read_link(entry.path())?;
            FileReference::symlink(target.to_string_lossy().into_owned())
        } else {
            let mut file = FileReference {
                mode: MODE_REGULAR | permissions_of(&metadata),
                size: metadata.len(),
                data: FileData::Path(entry.path().to_path_buf()),
                ..FileReference::regular(0o644, Vec::new())
            };
            file.identity = identity_of(&metadata);
            file
        };

        file.mtime = Some(modified_of(&metadata));
        match &options.ownership {
            Some(ownership) => apply_ownership(&mut file, ownership),
            None => take_filesystem_ownership(&mut file, &metadata),
        }
        vfs.insert(key, file)?;
    }

    // The synthetic prefix chain and any other missing ancestors.
    vfs.add_missing_directories(|| {
        let mut directory = FileReference::directory(0o755);
        directory.mtime = Some(clamp_time);
        if let Some(ownership) = &options.ownership {
            apply_ownership(&mut directory, ownership);
        }
        directory
    });

    if cancel.is_cancelled() {
        return Err(PackError::Cancelled);
    }
    Ok(Layer::from_vfs(&vfs, clock)?)
}

fn apply_ownership(file: &mut FileReference, ownership: &Ownership) {
    file.uid = Some(ownership.uid);
    file.gid = Some(ownership.gid);
    file.uname = Some(ownership.uname.clone());
    file.gname = Some(ownership.gname.clone());
}

#[cfg(unix)]
fn permissions_of(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode() & 0o7777
}

#[cfg(not(unix))]
fn permissions_of(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(unix)]
fn identity_of(metadata: &std::fs::Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    (metadata.nlink() > 1).then(|| FileIdentity {
        dev: metadata.dev(),
        ino: metadata.ino(),
    })
}

#[cfg(not(unix))]
fn identity_of(_metadata: &std::fs::Metadata) -> Option<FileIdentity> {
    None
}

#[cfg(unix)]
fn modified_of(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.mtime().max(0) as u64
}

#[cfg(not(unix))]
fn modified_of(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(unix)]
fn take_filesystem_ownership(file: &mut FileReference, metadata: &std::fs::Metadata) {
    use std::os::unix::fs::MetadataExt;
    file.uid = Some(metadata.uid() as u64);
    file.gid = Some(metadata.gid() as u64);
}

#[cfg(not(unix))]
fn take_filesystem_ownership(_file: &mut FileReference, _metadata: &std::fs::Metadata) {}
