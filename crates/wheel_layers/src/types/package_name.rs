use regex::Regex;
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// A representation of a python package name. This struct stores both the
/// source string from which this instance was created and a normalized name
/// that can be used to compare different names. The normalized name is
/// guaranteed to be a valid python package name.
#[derive(Debug, Clone, Eq)]
pub struct PackageName {
    /// The original string this instance was created from
    source: Box<str>,

    /// The normalized version of `source`.
    normalized: Box<str>,
}

impl PackageName {
    /// Returns the string from which this instance was created.
    pub fn as_source_str(&self) -> &str {
        self.source.as_ref()
    }

    /// Returns the normalized version of the package name, following the
    /// rules of [PEP 503](https://www.python.org/dev/peps/pep-0503/#normalized-names).
    pub fn as_str(&self) -> &str {
        self.normalized.as_ref()
    }
}

/// Error when parsing a package name
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ParsePackageNameError {
    #[error("invalid package name '{0}'")]
    InvalidPackageName(String),
}

impl FromStr for PackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static NAME_VALIDATE: OnceLock<Regex> = OnceLock::new();
        let name_validate = NAME_VALIDATE.get_or_init(|| {
            // https://packaging.python.org/specifications/core-metadata/#name
            Regex::new(r"(?i-u)^([A-Z0-9]|[A-Z0-9][A-Z0-9._-]*[A-Z0-9])$").unwrap()
        });

        if !name_validate.is_match(s) {
            return Err(ParsePackageNameError::InvalidPackageName(s.into()));
        }

        let mut normalized = s.replace(['-', '_', '.'], "-");
        normalized.make_ascii_lowercase();

        Ok(PackageName {
            source: s.to_owned().into_boxed_str(),
            normalized: normalized.into_boxed_str(),
        })
    }
}

impl Hash for PackageName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state)
    }
}

impl PartialEq for PackageName {
    fn eq(&self, other: &Self) -> bool {
        self.normalized.eq(&other.normalized)
    }
}

impl PartialOrd for PackageName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl Display for PackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// A normalized package name: a string that is guaranteed to follow
/// [PEP 503 (Normalized Names)](https://www.python.org/dev/peps/pep-0503/#normalized-names).
#[repr(transparent)]
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NormalizedPackageName(Box<str>);

impl NormalizedPackageName {
    /// Returns the normalized name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<PackageName> for NormalizedPackageName {
    fn from(value: PackageName) -> Self {
        Self(value.normalized)
    }
}

impl From<NormalizedPackageName> for PackageName {
    fn from(value: NormalizedPackageName) -> Self {
        Self {
            source: value.0.clone(),
            normalized: value.0,
        }
    }
}

impl FromStr for NormalizedPackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PackageName::from_str(s)?.into())
    }
}

impl Display for NormalizedPackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for NormalizedPackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}
