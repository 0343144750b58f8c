use serde::{Deserialize, Serialize};
use url::Url;

/// Specifies the PyPA `direct_url.json` format.
/// See: <https://packaging.python.org/en/latest/specifications/direct-url-data-structure/>
#[derive(Debug, Serialize, Deserialize)]
pub struct DirectUrlJson {
    /// Url to the source.
    pub url: Url,
    /// Information about the source.
    #[serde(flatten)]
    pub source: DirectUrlSource,
}

impl DirectUrlJson {
    /// Serialize to the canonical on-disk representation: UTF-8 JSON with
    /// object keys sorted and no trailing newline.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        // Round-tripping through `Value` sorts the object keys.
        let value = serde_json::to_value(self)?;
        serde_json::to_vec(&value)
    }
}

/// Specifies the source of a direct url.
///
/// Currently we do not support the deprecated `hash` field.
#[derive(Debug, Serialize, Deserialize)]
pub enum DirectUrlSource {
    /// Information about the archive file.
    #[serde(rename = "archive_info")]
    Archive {
        /// Hashes of the archive file.
        hashes: Option<DirectUrlHashes>,
    },
    /// Information about a source from a VCS directly.
    #[serde(rename = "vcs_info")]
    Vcs {
        /// The VCS used.
        vcs: DirectUrlVcs,
        /// Revision of the source.
        requested_revision: Option<String>,
        /// Actual commit.
        commit_id: String,
    },
    /// Information about a local directory source.
    #[serde(rename = "dir_info")]
    Dir {
        /// Whether this is an editable source.
        /// See: <https://pip.pypa.io/en/stable/topics/local-project-installs/>
        #[serde(skip_serializing_if = "Option::is_none")]
        editable: Option<bool>,
    },
}

/// Hashes for referenced archive files.
/// Multiple hashes can be included but per recommendation only sha256 is used.
#[derive(Debug, Serialize, Deserialize)]
pub struct DirectUrlHashes {
    /// Sha256 hash of the archive file.
    pub sha256: String,
}

/// Name of the VCS in a [`DirectUrlSource`].
#[derive(Debug, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum DirectUrlVcs {
    #[serde(rename = "git")]
    Git,
    #[serde(rename = "svn")]
    Svn,
    #[serde(rename = "bzr")]
    Bazaar,
    #[serde(rename = "hg")]
    Mercurial,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that parsing aligns with the examples at:
    /// <https://packaging.python.org/en/latest/specifications/direct-url-data-structure/>
    #[test]
    pub fn test_examples_pypa() {
        // Source archive:
        let example = r#"
        {
            "url": "https://github.com/pypa/pip/archive/1.3.1.zip",
            "archive_info": {
                "hashes": {
                    "sha256": "2dc6b5a470a1bde68946f263f1af1515a2574a150a30d6ce02c6ff742fcc0db8"
                }
            }
        }
        "#;
        serde_json::from_str::<DirectUrlJson>(example).unwrap();

        // Git URL with tag and commit-hash:
        let example = r#"
        {
            "url": "https://github.com/pypa/pip.git",
            "vcs_info": {
                "vcs": "git",
                "requested_revision": "1.3.1",
                "commit_id": "7921be1537eac1e97bc40179a57f0349c2aee67d"
            }
        }
        "#;
        serde_json::from_str::<DirectUrlJson>(example).unwrap();

        // Local directory in editable mode:
        let example = r#"
        {
            "url": "file:///home/user/project",
            "dir_info": {
                "editable": true
            }
        }
        "#;
        serde_json::from_str::<DirectUrlJson>(example).unwrap();
    }

    #[test]
    pub fn canonical_bytes_sort_keys() {
        let value = DirectUrlJson {
            url: Url::parse("https://files.pythonhosted.org/packages/example.whl").unwrap(),
            source: DirectUrlSource::Archive {
                hashes: Some(DirectUrlHashes {
                    sha256: "abc123".to_string(),
                }),
            },
        };
        let bytes = value.to_canonical_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        // `archive_info` sorts before `url`, and there is no trailing newline.
        assert_eq!(
            text,
            r#"{"archive_info":{"hashes":{"sha256":"abc123"}},"url":"https://files.pythonhosted.org/packages/example.whl"}"#
        );
    }
}
