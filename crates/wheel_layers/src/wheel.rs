//! Reading and validating wheel archives.

use crate::types::{
    HashAlgorithm, NormalizedPackageName, PackageName, Record, UnsupportedHashError, Version,
    WheelFilename,
};
use crate::utils::ReadAndSeek;
use crate::vfs::{FileReference, Vfs, VfsError};
use data_encoding::BASE64URL_NOPAD;
use miette::IntoDiagnostic;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use zip::{result::ZipError, ZipArchive};

/// Wheel file in the PyPI ecosystem.
/// See the [Reference Page](https://packaging.python.org/en/latest/specifications/binary-distribution-format/)
/// for more information.
pub struct Wheel {
    name: WheelFilename,
    archive: Mutex<ZipArchive<Box<dyn ReadAndSeek + Send>>>,
}

/// An error that can occur when reading a wheel archive.
#[derive(Debug, Error)]
pub enum WheelError {
    /// The wheel does not contain a `.dist-info` directory.
    #[error(".dist-info/ missing")]
    DistInfoMissing,

    /// The wheel does not contain a `METADATA` file.
    #[error(".dist-info/METADATA missing")]
    MetadataMissing,

    /// The wheel contains more than one candidate special directory.
    #[error("found multiple {0} directories in wheel")]
    MultipleSpecialDirs(String),

    /// A required key is absent from the `WHEEL` metadata block.
    #[error("missing key from WHEEL '{0}'")]
    MissingKeyInWheel(String),

    /// The `WHEEL` file declares a version this library does not understand.
    #[error("unsupported WHEEL version {0}")]
    UnsupportedWheelVersion(String),

    /// A metadata file could not be parsed.
    #[error("failed to parse {0}: {1}")]
    FailedToParse(String, String),

    /// The zip archive could not be read.
    #[error("failed to read the wheel file {0}")]
    ZipError(String, #[source] ZipError),

    /// An underlying read failed.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// A member path escapes the archive root.
    #[error("member path escapes the archive root: {0}")]
    UnsafePath(String),

    /// The `RECORD` file could not be parsed.
    #[error("RECORD file is invalid")]
    RecordCsv(#[from] csv::Error),

    /// The `RECORD` file disagrees with the archive contents.
    #[error("RECORD file doesn't match wheel contents: {0}")]
    RecordMismatch(String),

    /// The `RECORD` file references an unsupported hash algorithm.
    #[error(transparent)]
    UnsupportedHash(#[from] UnsupportedHashError),

    /// A member path cannot be stored in a virtual filesystem.
    #[error(transparent)]
    Vfs(#[from] VfsError),
}

impl WheelError {
    pub(crate) fn from_zip(file: String, err: ZipError) -> Self {
        match err {
            ZipError::Io(err) => WheelError::IoError(err),
            _ => WheelError::ZipError(file, err),
        }
    }
}

/// The parsed `WHEEL` metadata block of an archive.
#[derive(Debug, Clone)]
pub struct WheelMetadata {
    /// Whether the archive root belongs in `purelib` (as opposed to
    /// `platlib`).
    pub root_is_purelib: bool,

    /// The compatibility tags the wheel was built for.
    pub tags: Vec<String>,

    /// The tool that produced the wheel.
    pub generator: Option<String>,
}

/// The information needed to install a wheel: the names of its special
/// directories, the parsed `WHEEL` block and the validated `RECORD`.
#[derive(Debug, Clone)]
pub struct WheelVitals {
    /// Name of the `<dist>-<ver>.dist-info` directory.
    pub dist_info: String,

    /// Name of the `<dist>-<ver>.data` directory (whether present or not).
    pub data: String,

    /// The parsed `WHEEL` metadata block.
    pub metadata: WheelMetadata,

    /// The manifest of archive members with their declared hashes and sizes.
    pub record: Record,
}

impl Wheel {
    /// Open a wheel by reading a file on disk. The distribution name and
    /// version are taken from the filename.
    pub fn from_path(path: &Path) -> miette::Result<Self> {
        let file_name = path
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| miette::miette!("path does not contain a filename"))?;
        let name = WheelFilename::from_str(file_name).into_diagnostic()?;
        let file = File::open(path).into_diagnostic()?;
        Self::new(name, Box::new(file)).into_diagnostic()
    }

    /// Open a wheel from a readable, seekable byte source.
    pub fn new(
        name: WheelFilename,
        bytes: Box<dyn ReadAndSeek + Send>,
    ) -> Result<Self, WheelError> {
        Ok(Self {
            name,
            archive: Mutex::new(
                ZipArchive::new(bytes).map_err(|err| WheelError::from_zip("/".to_string(), err))?,
            ),
        })
    }

    /// The name this wheel was opened under.
    pub fn name(&self) -> &WheelFilename {
        &self.name
    }

    /// A wheel file always contains special directories that carry the
    /// metadata of the package. This function finds the one with the given
    /// suffix.
    fn find_special_wheel_dir<'a>(
        top_level_names: impl IntoIterator<Item = &'a str>,
        name: &WheelFilename,
        suffix: &str,
    ) -> Result<Option<&'a str>, WheelError> {
        let normalized: NormalizedPackageName = name.distribution.clone().into();

        // Find all directories that end in the suffix
        let mut candidates = top_level_names.into_iter().filter(|dir_name| {
            let Some(candidate) = dir_name.strip_suffix(suffix) else {
                return false;
            };
            let Some((candidate_name, candidate_version)) = candidate.rsplit_once('-') else {
                return false;
            };

            let Ok(candidate_name) = PackageName::from_str(candidate_name) else {
                return false;
            };
            let Ok(candidate_version) = Version::from_str(candidate_version) else {
                return false;
            };

            NormalizedPackageName::from(candidate_name) == normalized
                && candidate_version == name.version
        });

        // Get the first candidate
        let candidate = match candidates.next() {
            Some(candidate) => candidate,
            None => return Ok(None),
        };

        // Error out if there are multiple directories
        if candidates.next().is_some() {
            return Err(WheelError::MultipleSpecialDirs(suffix.to_owned()));
        }

        Ok(Some(candidate))
    }

    /// Parse the archive into a virtual filesystem of its members plus the
    /// vitals needed to install it.
    ///
    /// Every non-directory member except `RECORD` itself is checked against
    /// the manifest: its digest is recomputed with the declared algorithm
    /// and compared in constant time, and its size must match. A wheel that
    /// fails any of these checks is rejected.
    pub fn to_vfs(&self) -> Result<(Vfs, WheelVitals), WheelError> {
        let mut archive = self.archive.lock();

        // Determine the top level filenames in the wheel
        let top_level_names = archive
            .file_names()
            .map(|filename| {
                filename
                    .split_once(['/', '\\'])
                    .map_or_else(|| filename, |(base, _)| base)
            })
            .collect::<HashSet<_>>();

        // Determine the names of the special directories
        let dist_info =
            Wheel::find_special_wheel_dir(top_level_names.iter().copied(), &self.name, ".dist-info")?
                .ok_or(WheelError::DistInfoMissing)?
                .to_owned();
        let data = Wheel::find_special_wheel_dir(top_level_names, &self.name, ".data")?
            .map_or_else(
                || {
                    format!(
                        "{}.data",
                        dist_info
                            .strip_suffix(".dist-info")
                            .expect("the dist-info directory ends in .dist-info")
                    )
                },
                ToOwned::to_owned,
            );

        let wheel_path = format!("{dist_info}/WHEEL");
        let wheel_block = read_entry_to_end(&mut archive, &wheel_path)?;
        let metadata = parse_wheel_metadata(&wheel_block)?;

        // Read the RECORD file from the wheel
        let record_path = format!("{dist_info}/RECORD");
        let record = Record::from_reader(
            archive
                .by_name(&record_path)
                .map_err(|err| WheelError::from_zip(record_path.clone(), err))?,
        )?;

        tracing::debug!(
            wheel = %self.name,
            members = archive.len(),
            "reading wheel archive"
        );

        let mut vfs = Vfs::new();
        for index in 0..archive.len() {
            let mut zip_entry = archive
                .by_index(index)
                .map_err(|err| WheelError::from_zip(format!("<index {index}>"), err))?;

            // enclosed_name takes care of evil zip paths
            let Some(relative_path) = zip_entry.enclosed_name().map(ToOwned::to_owned) else {
                return Err(WheelError::UnsafePath(zip_entry.name().to_string()));
            };
            let full_name = crate::utils::path_to_key(&relative_path);

            // Directory placeholders carry no content.
            if zip_entry.is_dir() {
                continue;
            }

            // Skip the RECORD file itself. It is regenerated to reflect the
            // installed files. PEP 491 defines two signature files that
            // refer to RECORD and are equally skipped:
            // > 6. RECORD.jws is used for digital signatures. It is not mentioned in RECORD.
            // > 7. RECORD.p7s is allowed as a courtesy to anyone who would prefer to use S/MIME
            // >    signatures to secure their wheel files. It is not mentioned in RECORD.
            if full_name == record_path
                || full_name == format!("{record_path}.jws")
                || full_name == format!("{record_path}.p7s")
            {
                continue;
            }

            let mut content = Vec::new();
            zip_entry.read_to_end(&mut content)?;

            verify_record_entry(&record, &full_name, &content)?;

            let executable = zip_entry
                .unix_mode()
                .map(|mode| mode & 0o111 != 0)
                .unwrap_or(false);
            let permissions = zip_entry
                .unix_mode()
                .map(|mode| mode & 0o7777)
                .filter(|&mode| mode != 0)
                .unwrap_or(if executable { 0o755 } else { 0o644 });

            vfs.insert(full_name, FileReference::regular(permissions, content))?;
        }

        if !vfs.contains(&format!("{dist_info}/METADATA")) {
            return Err(WheelError::MetadataMissing);
        }

        Ok((
            vfs,
            WheelVitals {
                dist_info,
                data,
                metadata,
                record,
            },
        ))
    }
}

/// Check a member against its `RECORD` row.
fn verify_record_entry(
    record: &Record,
    full_name: &str,
    content: &[u8],
) -> Result<(), WheelError> {
    let entry = record.entry(full_name).ok_or_else(|| {
        WheelError::RecordMismatch(format!("missing RECORD entry for {full_name}"))
    })?;

    let Some(recorded_hash) = entry.hash.as_deref().filter(|hash| !hash.is_empty()) else {
        return Ok(());
    };

    let (algorithm, recorded_digest) = HashAlgorithm::parse_record_hash(recorded_hash)?;
    let recorded_digest = BASE64URL_NOPAD
        .decode(recorded_digest.as_bytes())
        .map_err(|_| {
            WheelError::RecordMismatch(format!("undecodable hash for {full_name}"))
        })?;
    let actual_digest = algorithm.digest(content);
    if !constant_time_eq(&actual_digest, &recorded_digest) {
        return Err(WheelError::RecordMismatch(format!(
            "hash mismatch for {}. Recorded: {}, Actual: {}",
            full_name,
            recorded_hash,
            algorithm.format_record_hash(content),
        )));
    }

    if let Some(size) = entry.size {
        if size != content.len() as u64 {
            return Err(WheelError::RecordMismatch(format!(
                "size mismatch for {}. Recorded: {}, Actual: {}",
                full_name,
                size,
                content.len(),
            )));
        }
    }

    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Parse the `WHEEL` metadata block and verify its format version.
fn parse_wheel_metadata(input: &[u8]) -> Result<WheelMetadata, WheelError> {
    let fields = parse_key_value_block(input, "WHEEL")?;

    let version = fields
        .get("Wheel-Version")
        .and_then(|values| values.first())
        .ok_or_else(|| WheelError::MissingKeyInWheel("Wheel-Version".to_string()))?;
    if !version.starts_with("1.") {
        return Err(WheelError::UnsupportedWheelVersion(version.clone()));
    }

    let root_is_purelib = match fields
        .get("Root-Is-Purelib")
        .and_then(|values| values.first())
        .ok_or_else(|| WheelError::MissingKeyInWheel("Root-Is-Purelib".to_string()))?
        .to_lowercase()
        .as_str()
    {
        "true" => true,
        "false" => false,
        other => {
            return Err(WheelError::FailedToParse(
                "WHEEL".to_string(),
                format!("expected 'true' or 'false' for Root-Is-Purelib, not {other}"),
            ))
        }
    };

    Ok(WheelMetadata {
        root_is_purelib,
        tags: fields.get("Tag").cloned().unwrap_or_default(),
        generator: fields
            .get("Generator")
            .and_then(|values| values.first())
            .cloned(),
    })
}

/// Parse a file with `Key: value` lines such as WHEEL.
fn parse_key_value_block(
    input: &[u8],
    debug_filename: &str,
) -> Result<HashMap<String, Vec<String>>, WheelError> {
    let input = String::from_utf8_lossy(input);
    let mut fields: HashMap<String, Vec<String>> = HashMap::new();
    for (line_number, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':').ok_or_else(|| {
            WheelError::FailedToParse(
                debug_filename.to_string(),
                format!("line {} is not a 'Key: value' pair", line_number + 1),
            )
        })?;
        fields
            .entry(key.trim().to_string())
            .or_default()
            .push(value.trim().to_string());
    }
    Ok(fields)
}

/// Helper method to read a particular file from a zip archive.
fn read_entry_to_end<R: ReadAndSeek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, WheelError> {
    let mut bytes = Vec::new();
    archive
        .by_name(name)
        .map_err(|err| WheelError::from_zip(name.to_string(), err))?
        .read_to_end(&mut bytes)?;

    Ok(bytes)
}
