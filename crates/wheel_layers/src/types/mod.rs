//! This module contains the types for working with the artifacts of the
//! Python packaging ecosystem that the installer consumes and produces.

mod artifact_name;

mod package_name;

mod record;

mod entry_points;

mod direct_url_json;

pub use artifact_name::{ParseWheelFilenameError, WheelFilename};

pub use package_name::{NormalizedPackageName, PackageName, ParsePackageNameError};

pub use record::{HashAlgorithm, Record, RecordEntry, UnsupportedHashError};

pub use entry_points::{EntryPoint, ParseEntryPointError};

pub use direct_url_json::{DirectUrlHashes, DirectUrlJson, DirectUrlSource, DirectUrlVcs};

pub use pep440_rs::Version;
