use super::{PackageName, ParsePackageNameError};
use pep440_rs::Version;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Structure that contains the information encoded in a wheel filename.
/// See [File Name Convention](https://www.python.org/dev/peps/pep-0427/#file-name-convention)
/// for more details regarding the structure of a wheel name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelFilename {
    /// Distribution name, e.g. `django`, `pyramid`.
    pub distribution: PackageName,

    /// Distribution version, e.g. `1.0`.
    pub version: Version,

    /// Optional build number, e.g. `1`.
    pub build_tag: Option<String>,

    /// Language implementation and version tags, e.g. `py2.py3`.
    pub py_tags: Vec<String>,

    /// ABI specific tags, e.g. `none`, `abi3`.
    pub abi_tags: Vec<String>,

    /// Architecture specific tags, e.g. `any`, `manylinux_2_17_x86_64`.
    pub arch_tags: Vec<String>,
}

/// An error that may occur when parsing a [`WheelFilename`].
#[derive(Debug, Clone, Error)]
pub enum ParseWheelFilenameError {
    /// The filename does not end in `.whl`.
    #[error("'{0}' is not a wheel filename, missing .whl extension")]
    NotAWheelFilename(String),

    /// The filename does not have the expected number of `-` separated parts.
    #[error("'{0}' does not follow the <name>-<version>(-<build>)-<py>-<abi>-<platform>.whl convention")]
    InvalidStructure(String),

    /// The distribution part is not a valid package name.
    #[error(transparent)]
    InvalidPackageName(#[from] ParsePackageNameError),

    /// The version part is not a valid PEP 440 version.
    #[error("'{0}' contains an invalid version: {1}")]
    InvalidVersion(String, String),
}

impl FromStr for WheelFilename {
    type Err = ParseWheelFilenameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stem = s
            .strip_suffix(".whl")
            .ok_or_else(|| ParseWheelFilenameError::NotAWheelFilename(s.to_string()))?;

        // In a canonical wheel filename the distribution name has `-` runs
        // replaced by `_`, so splitting yields exactly 5 or 6 parts.
        let parts: Vec<&str> = stem.split('-').collect();
        let (distribution, version, build_tag, py, abi, arch) = match parts.as_slice() {
            [distribution, version, py, abi, arch] => (distribution, version, None, py, abi, arch),
            [distribution, version, build, py, abi, arch] => {
                (distribution, version, Some(build.to_string()), py, abi, arch)
            }
            _ => return Err(ParseWheelFilenameError::InvalidStructure(s.to_string())),
        };

        let version = Version::from_str(version)
            .map_err(|err| ParseWheelFilenameError::InvalidVersion(s.to_string(), err.to_string()))?;

        Ok(WheelFilename {
            distribution: PackageName::from_str(distribution)?,
            version,
            build_tag,
            py_tags: py.split('.').map(ToString::to_string).collect(),
            abi_tags: abi.split('.').map(ToString::to_string).collect(),
            arch_tags: arch.split('.').map(ToString::to_string).collect(),
        })
    }
}

impl Display for WheelFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}",
            self.distribution.as_source_str(),
            self.version
        )?;
        if let Some(build_tag) = &self.build_tag {
            write!(f, "-{build_tag}")?;
        }
        write!(
            f,
            "-{}-{}-{}.whl",
            self.py_tags.join("."),
            self.abi_tags.join("."),
            self.arch_tags.join(".")
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_simple_filename() {
        let name: WheelFilename = "six-1.15.0-py2.py3-none-any.whl".parse().unwrap();
        assert_eq!(name.distribution.as_str(), "six");
        assert_eq!(name.version.to_string(), "1.15.0");
        assert_eq!(name.build_tag, None);
        assert_eq!(name.py_tags, vec!["py2", "py3"]);
        assert_eq!(name.abi_tags, vec!["none"]);
        assert_eq!(name.arch_tags, vec!["any"]);
        assert_eq!(name.to_string(), "six-1.15.0-py2.py3-none-any.whl");
    }

    #[test]
    fn parse_build_tag() {
        let name: WheelFilename = "mypkg-0.1-2-py3-none-any.whl".parse().unwrap();
        assert_eq!(name.build_tag.as_deref(), Some("2"));
    }

    #[test]
    fn reject_malformed_filenames() {
        assert!("six-1.15.0-py2.py3-none-any.zip"
            .parse::<WheelFilename>()
            .is_err());
        assert!("six-1.15.0.whl".parse::<WheelFilename>().is_err());
    }
}
