//! `wheel_layers` builds reproducible OCI image layers directly from Python
//! wheels, without running a Python interpreter to perform the install. The
//! output of an installation is an uncompressed tar stream whose contents are
//! bit-identical to what `pip install --prefix=...` would place on disk,
//! including rewritten script shebangs, byte-compiled `.pyc` files and the
//! `RECORD`/`INSTALLER`/`REQUESTED`/`direct_url.json` bookkeeping files.
//! Like its siblings in the Rattler family, this library is not an image
//! builder itself but provides the low-level plumbing to be used in one.

#![deny(missing_docs)]

/// Contains the types that are used throughout the library.
pub mod types;

mod utils;

mod clock;
mod layer;
mod pack;
mod vfs;
mod wheel;

pub mod install;
pub mod python_env;

pub use clock::ReproducibleClock;
pub use layer::{Layer, LayerError};
pub use pack::{pack_directory, PackError, PackOptions};
pub use utils::ReadAndSeek;
pub use vfs::{FileData, FileIdentity, FileReference, Vfs, VfsError};
pub use wheel::{Wheel, WheelError, WheelMetadata, WheelVitals};

pub use install::{install_wheel, InstallError, InstallOptions, InstallPaths, Ownership, Platform};
