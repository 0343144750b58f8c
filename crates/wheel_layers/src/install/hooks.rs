//! The post-install hooks that append bookkeeping files to an installed
//! tree: `REQUESTED`, `INSTALLER`, `direct_url.json` and, always last,
//! `RECORD`.

use super::InstallError;
use crate::types::{DirectUrlJson, HashAlgorithm, Record, RecordEntry};
use crate::utils::relative_to;
use crate::vfs::{FileReference, Vfs};
use tokio_util::sync::CancellationToken;

/// A transformation applied to the installed filesystem after all files are
/// in place. Hooks run in a fixed order; the first failure aborts the
/// install.
pub(crate) type PostInstallHook<'a> =
    Box<dyn FnOnce(&CancellationToken, u64, &mut Vfs, &str) -> Result<(), InstallError> + 'a>;

fn write_dist_info_file(
    vfs: &mut Vfs,
    dist_info: &str,
    file_name: &str,
    content: Vec<u8>,
    clamp_time: u64,
) -> Result<(), InstallError> {
    let mut file = FileReference::regular(0o644, content);
    file.mtime = Some(clamp_time);
    vfs.insert(format!("{dist_info}/{file_name}"), file)?;
    Ok(())
}

/// Records that the install was requested by a user rather than pulled in
/// as a dependency. A non-empty reason is stored followed by a newline,
/// otherwise the file is empty.
pub(crate) fn requested_hook(reason: String) -> PostInstallHook<'static> {
    Box::new(move |_cancel, clamp_time, vfs, dist_info| {
        let content = if reason.is_empty() {
            Vec::new()
        } else {
            format!("{reason}\n").into_bytes()
        };
        write_dist_info_file(vfs, dist_info, "REQUESTED", content, clamp_time)
    })
}

/// Records the name of the tool that performed the install. See
/// [PEP 376](https://peps.python.org/pep-0376/) for more information.
pub(crate) fn installer_hook(installer: String) -> PostInstallHook<'static> {
    Box::new(move |_cancel, clamp_time, vfs, dist_info| {
        let content = format!("{}\n", installer.trim()).into_bytes();
        write_dist_info_file(vfs, dist_info, "INSTALLER", content, clamp_time)
    })
}

/// Records where the installed artifact came from. See
/// [PEP 610](https://peps.python.org/pep-0610/) for more information.
pub(crate) fn direct_url_hook(direct_url: &DirectUrlJson) -> PostInstallHook<'_> {
    Box::new(move |_cancel, clamp_time, vfs, dist_info| {
        let content = direct_url.to_canonical_bytes()?;
        write_dist_info_file(vfs, dist_info, "direct_url.json", content, clamp_time)
    })
}

/// Regenerates `RECORD` over the installed tree. Must run after every other
/// hook so all files are accounted for.
///
/// Paths are stored relative to the site-packages directory, `.pyc` rows
/// carry no hash and no size (they are derived artifacts, their sources are
/// hashed instead), and the `RECORD` row itself is empty as well.
pub(crate) fn record_hook(algorithm: HashAlgorithm) -> PostInstallHook<'static> {
    Box::new(move |cancel, clamp_time, vfs, dist_info| {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        let site_packages = dist_info
            .rsplit_once('/')
            .map(|(parent, _)| parent)
            .unwrap_or("");
        let record_path = format!("{dist_info}/RECORD");

        let mut entries = Vec::new();
        for (full_name, file) in vfs.iter() {
            if !file.is_file() || full_name == record_path {
                continue;
            }
            let path = relative_to(full_name, site_packages);
            if full_name.ends_with(".pyc") {
                entries.push(RecordEntry {
                    path,
                    hash: None,
                    size: None,
                });
            } else {
                let content = file
                    .data
                    .resolve()
                    .map_err(|err| InstallError::IoError(full_name.to_string(), err))?;
                entries.push(RecordEntry {
                    path,
                    hash: Some(algorithm.format_record_hash(&content)),
                    size: Some(content.len() as u64),
                });
            }
        }
        entries.push(RecordEntry {
            path: relative_to(&record_path, site_packages),
            hash: None,
            size: None,
        });

        let content = Record::from_iter(entries).to_bytes()?;
        write_dist_info_file(vfs, dist_info, "RECORD", content, clamp_time)
    })
}
