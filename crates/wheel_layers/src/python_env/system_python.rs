use itertools::Itertools;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Error that can occur while finding the python executable.
#[derive(Debug, Error)]
pub enum FindPythonError {
    /// No interpreter could be located on the system.
    #[error("could not find python executable")]
    NotFound,
    /// Running the interpreter failed.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Try to find the python executable in the current environment.
/// Asking the interpreter for `sys.executable` returns the original
/// interpreter path and not a shim.
pub fn system_python_executable() -> Result<PathBuf, FindPythonError> {
    // When installed with homebrew on macOS the executable is called
    // `python3` instead of `python`, same for some ubuntu installs.
    let output = match std::process::Command::new("python3")
        .arg("-c")
        .arg("import sys; print(sys.executable, end='')")
        .output()
        .or_else(|_| {
            std::process::Command::new("python")
                .arg("-c")
                .arg("import sys; print(sys.executable, end='')")
                .output()
        }) {
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(FindPythonError::NotFound),
        Err(e) => return Err(FindPythonError::IoError(e)),
        Ok(output) => output,
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let python_path = PathBuf::from(stdout.as_ref());

    // sys.executable can return an empty string or python's None
    if !python_path.exists() {
        return Err(FindPythonError::NotFound);
    }

    Ok(python_path)
}

/// Errors that can occur while trying to parse the python version
#[derive(Debug, Error)]
pub enum ParsePythonInterpreterVersionError {
    /// The version output did not look like `Python x.y.z`.
    #[error("failed to parse version string, found '{0}' expect something like 'Python x.x.x'")]
    InvalidVersion(String),
    /// The interpreter could not be located or executed.
    #[error(transparent)]
    FindPythonError(#[from] FindPythonError),
}

/// The version of a python interpreter, e.g. `3.11.4`.
#[derive(Debug, Clone)]
pub struct PythonInterpreterVersion {
    /// The major version.
    pub major: u32,
    /// The minor version.
    pub minor: u32,
    /// The patch version.
    pub patch: u32,
}

impl From<(u32, u32, u32)> for PythonInterpreterVersion {
    fn from(value: (u32, u32, u32)) -> Self {
        Self {
            major: value.0,
            minor: value.1,
            patch: value.2,
        }
    }
}

impl PythonInterpreterVersion {
    /// Construct a version from its parts.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the version of a python interpreter from the output of
    /// `python --version`, something along the lines of `Python 3.8.5`.
    pub fn from_python_output(
        version_str: &str,
    ) -> Result<Self, ParsePythonInterpreterVersionError> {
        use ParsePythonInterpreterVersionError::InvalidVersion;

        // Split "Python 3.9.1" into "Python" and "3.9.1"
        let version_str = match version_str.split_once(' ') {
            Some(("Python", version)) => version,
            _ => return Err(InvalidVersion(version_str.to_owned())),
        };

        // Split the version into strings separated by '.' and parse them
        let parts = version_str
            .split('.')
            .map(str::trim)
            .map(FromStr::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| InvalidVersion(version_str.to_owned()))?;

        // Extract the major, minor and patch version
        let Some((major, minor, patch)) = parts.into_iter().collect_tuple() else {
            return Err(InvalidVersion(version_str.to_owned()));
        };

        Ok(Self::new(major, minor, patch))
    }

    /// Get the version of the given python executable.
    pub fn from_path(path: &Path) -> Result<Self, ParsePythonInterpreterVersionError> {
        let output = std::process::Command::new(path)
            .arg("--version")
            .output()
            .map_err(|_| FindPythonError::NotFound)?;
        let version_str = String::from_utf8_lossy(&output.stdout);
        Self::from_python_output(&version_str)
    }

    /// The bytecode cache tag of a CPython interpreter with this version,
    /// e.g. `cpython-311`. Used to name `__pycache__` entries.
    pub fn cache_tag(&self) -> String {
        format!("cpython-{}{}", self.major, self.minor)
    }
}
