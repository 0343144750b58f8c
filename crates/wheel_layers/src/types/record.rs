//! Defines the [`Record`] struct which holds the information stored in a
//! `RECORD` file, found in the `dist-info` directory of a wheel archive or of
//! an installation.

use data_encoding::BASE64URL_NOPAD;
use itertools::Itertools;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::io::Read;
use thiserror::Error;

/// Represents the RECORD file found in a wheels .dist-info folder.
///
/// See <https://www.python.org/dev/peps/pep-0376/#record> for more
/// information about the format.
#[derive(Debug, Clone)]
pub struct Record {
    entries: Vec<RecordEntry>,
}

/// A single entry in a `RECORD` file
///
/// ```csv
/// six.py,sha256=TOOfQi7nFGfMrIvtdr6wX4wyHH8M7aknmuLfo2cBBrM,34074
/// six-1.15.0.dist-info/RECORD,,
/// ```
#[derive(Debug, Deserialize, Serialize, PartialOrd, PartialEq, Ord, Eq, Clone)]
pub struct RecordEntry {
    /// The path relative to the site-packages directory of the installation.
    pub path: String,

    /// The hash of the file, as `<algorithm>=<urlsafe-base64-nopad digest>`.
    pub hash: Option<String>,

    /// The size of the file in bytes.
    pub size: Option<u64>,
}

impl Record {
    /// Reads the contents of a `RECORD` file from a reader.
    pub fn from_reader(reader: impl Read) -> csv::Result<Self> {
        Ok(Self {
            entries: csv::ReaderBuilder::new()
                .has_headers(false)
                .escape(Some(b'"'))
                .from_reader(reader)
                .deserialize()
                .collect::<Result<Vec<RecordEntry>, csv::Error>>()?,
        })
    }

    /// Serialize the record to the CSV byte representation that is stored on
    /// disk: no header, CRLF line endings, rows sorted by path.
    pub fn to_bytes(&self) -> csv::Result<Vec<u8>> {
        let mut record_writer = csv::WriterBuilder::new()
            .has_headers(false)
            .escape(b'"')
            .terminator(csv::Terminator::CRLF)
            .from_writer(Vec::new());
        for entry in self.entries.iter().sorted() {
            record_writer.serialize(entry)?;
        }
        record_writer
            .into_inner()
            .map_err(|err| csv::Error::from(err.into_error()))
    }

    /// Returns an iterator over the entries in this instance.
    pub fn iter(&self) -> std::slice::Iter<'_, RecordEntry> {
        self.entries.iter()
    }

    /// Find the entry for the given path, if any.
    pub fn entry(&self, path: &str) -> Option<&RecordEntry> {
        // Strip any preceding slashes since all paths in the wheel RECORD
        // should be relative.
        self.entries
            .iter()
            .find(|entry| entry.path.trim_start_matches('/') == path)
    }
}

impl IntoIterator for Record {
    type Item = RecordEntry;
    type IntoIter = std::vec::IntoIter<RecordEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<RecordEntry> for Record {
    fn from_iter<T: IntoIterator<Item = RecordEntry>>(iter: T) -> Self {
        Self {
            entries: FromIterator::from_iter(iter),
        }
    }
}

/// The RECORD file referenced a hash algorithm outside the guaranteed set.
#[derive(Debug, Clone, Error)]
#[error("unsupported hash algorithm '{0}'")]
pub struct UnsupportedHashError(pub String);

/// The hash algorithms that may appear in a `RECORD` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Parse an algorithm from its `RECORD` name.
    pub fn from_name(name: &str) -> Result<Self, UnsupportedHashError> {
        match name {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha224" => Ok(HashAlgorithm::Sha224),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(UnsupportedHashError(other.to_string())),
        }
    }

    /// The name of the algorithm as it appears in a `RECORD` file.
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Compute the digest of the given content.
    pub fn digest(&self, content: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Md5 => Md5::digest(content).to_vec(),
            HashAlgorithm::Sha1 => Sha1::digest(content).to_vec(),
            HashAlgorithm::Sha224 => Sha224::digest(content).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(content).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(content).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(content).to_vec(),
        }
    }

    /// Format the digest of `content` the way `RECORD` stores it:
    /// `<name>=<urlsafe-base64-nopad digest>`.
    pub fn format_record_hash(&self, content: &[u8]) -> String {
        format!(
            "{}={}",
            self.name(),
            BASE64URL_NOPAD.encode(&self.digest(content))
        )
    }

    /// Split a `RECORD` hash value of the form `<algorithm>=<digest>` into
    /// the algorithm and the encoded digest.
    pub fn parse_record_hash(value: &str) -> Result<(Self, &str), UnsupportedHashError> {
        let (name, digest) = value
            .split_once('=')
            .ok_or_else(|| UnsupportedHashError(value.to_string()))?;
        Ok((Self::from_name(name)?, digest))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_sort_record() {
        let input = "\
six.py,sha256=TOOfQi7nFGfMrIvtdr6wX4wyHH8M7aknmuLfo2cBBrM,34074\r\n\
six-1.15.0.dist-info/RECORD,,\r\n";
        let record = Record::from_reader(input.as_bytes()).unwrap();
        assert_eq!(record.iter().count(), 2);
        assert_eq!(record.entry("six.py").unwrap().size, Some(34074));
        assert!(record
            .entry("six-1.15.0.dist-info/RECORD")
            .unwrap()
            .hash
            .is_none());

        // Rows come back sorted by path, with CRLF line endings and empty
        // fields for missing hash and size.
        let bytes = record.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "six-1.15.0.dist-info/RECORD,,\r\n\
             six.py,sha256=TOOfQi7nFGfMrIvtdr6wX4wyHH8M7aknmuLfo2cBBrM,34074\r\n"
        );
    }

    #[test]
    fn record_entry_with_absolute_path_is_found() {
        let input = "/selenium/__init__.py,sha256=l8nEsTP4D2dZVula_p4ZuCe8AGnxOq7MxMeAWNvR0Qc,811\r\n";
        let record = Record::from_reader(input.as_bytes()).unwrap();
        assert!(record.entry("selenium/__init__.py").is_some());
    }

    #[test]
    fn hash_algorithm_round_trip() {
        for name in ["md5", "sha1", "sha224", "sha256", "sha384", "sha512"] {
            let algorithm = HashAlgorithm::from_name(name).unwrap();
            assert_eq!(algorithm.name(), name);
        }
        assert!(HashAlgorithm::from_name("crc32").is_err());
    }

    #[test]
    fn format_record_hash_uses_urlsafe_base64() {
        let value = HashAlgorithm::Sha256.format_record_hash(b"hello");
        assert_eq!(
            value,
            "sha256=LPJNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ"
        );
        let (algorithm, digest) = HashAlgorithm::parse_record_hash(&value).unwrap();
        assert_eq!(algorithm, HashAlgorithm::Sha256);
        assert_eq!(digest, "LPJNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ");
    }
}
