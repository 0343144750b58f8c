//! An in-memory virtual filesystem. Installation builds one of these up and
//! the tar emitter serializes it; it never outlives a single install call.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use thiserror::Error;

/// Mask for the file type bits within a [`FileReference::mode`].
pub const MODE_TYPE_MASK: u32 = 0o170000;
/// Type bits of a regular file.
pub const MODE_REGULAR: u32 = 0o100000;
/// Type bits of a directory.
pub const MODE_DIRECTORY: u32 = 0o040000;
/// Type bits of a symbolic link.
pub const MODE_SYMLINK: u32 = 0o120000;

/// The backing storage of a file's content.
///
/// Content is either held in memory (everything that comes out of a wheel or
/// is synthesized during installation) or referenced on disk (entries
/// collected by the directory packer).
#[derive(Debug, Clone, PartialEq)]
pub enum FileData {
    /// Content held in memory.
    Memory(Vec<u8>),
    /// Content backed by a file on disk, read back on demand.
    Path(PathBuf),
}

impl FileData {
    /// Open a fresh reader over the content.
    pub fn open(&self) -> std::io::Result<Box<dyn Read + Send + '_>> {
        match self {
            FileData::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.as_slice()))),
            FileData::Path(path) => Ok(Box::new(fs_err::File::open(path)?)),
        }
    }

    /// Resolve the content into memory.
    pub fn resolve(&self) -> std::io::Result<Vec<u8>> {
        match self {
            FileData::Memory(bytes) => Ok(bytes.clone()),
            FileData::Path(path) => fs_err::read(path),
        }
    }
}

impl From<Vec<u8>> for FileData {
    fn from(bytes: Vec<u8>) -> Self {
        FileData::Memory(bytes)
    }
}

impl From<&[u8]> for FileData {
    fn from(bytes: &[u8]) -> Self {
        FileData::Memory(bytes.to_vec())
    }
}

impl From<PathBuf> for FileData {
    fn from(path: PathBuf) -> Self {
        FileData::Path(path)
    }
}

/// Identifies a file on the filesystem it was collected from. Two entries
/// with the same identity are hard links to the same inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Device number.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
}

/// A single entry in a [`Vfs`]: content plus the metadata that ends up in the
/// tar header of the emitted layer.
#[derive(Debug, Clone)]
pub struct FileReference {
    /// POSIX mode: type bits plus permission bits.
    pub mode: u32,
    /// Content length in bytes. Zero for directories and symlinks.
    pub size: u64,
    /// Modification time, seconds since the unix epoch. Clamped on emit.
    pub mtime: Option<u64>,
    /// Access time. Clamped on emit.
    pub atime: Option<u64>,
    /// Change time. Clamped on emit.
    pub ctime: Option<u64>,
    /// Owning user id.
    pub uid: Option<u64>,
    /// Owning group id.
    pub gid: Option<u64>,
    /// Owning user name.
    pub uname: Option<String>,
    /// Owning group name.
    pub gname: Option<String>,
    /// Target of a symbolic link.
    pub linkname: Option<String>,
    /// Inode identity used to detect hard links.
    pub identity: Option<FileIdentity>,
    /// The content of the file.
    pub data: FileData,
}

impl FileReference {
    /// A regular file with in-memory content.
    pub fn regular(permissions: u32, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            mode: MODE_REGULAR | (permissions & 0o7777),
            size: content.len() as u64,
            data: FileData::Memory(content),
            ..Self::empty()
        }
    }

    /// A directory entry.
    pub fn directory(permissions: u32) -> Self {
        Self {
            mode: MODE_DIRECTORY | (permissions & 0o7777),
            ..Self::empty()
        }
    }

    /// A symbolic link to `target`.
    pub fn symlink(target: impl Into<String>) -> Self {
        Self {
            mode: MODE_SYMLINK | 0o777,
            linkname: Some(target.into()),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            mode: 0,
            size: 0,
            mtime: None,
            atime: None,
            ctime: None,
            uid: None,
            gid: None,
            uname: None,
            gname: None,
            linkname: None,
            identity: None,
            data: FileData::Memory(Vec::new()),
        }
    }

    /// Whether this entry is a regular file.
    pub fn is_file(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_REGULAR
    }

    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_DIRECTORY
    }

    /// Whether this entry is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_SYMLINK
    }

    /// The permission bits of the mode.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Open a fresh reader over the content.
    pub fn open(&self) -> std::io::Result<Box<dyn Read + Send + '_>> {
        self.data.open()
    }
}

/// An error returned when a path cannot be stored in a [`Vfs`].
#[derive(Debug, Error)]
pub enum VfsError {
    /// The path is empty.
    #[error("empty path")]
    EmptyPath,

    /// The path starts with a `/`.
    #[error("path cannot be absolute: {0}")]
    AbsolutePath(String),

    /// The path contains a `.`, `..` or empty component.
    #[error("path cannot contain '.' or '..' components: {0}")]
    NonCanonicalPath(String),
}

/// A mapping from slash-separated archive paths to [`FileReference`]s.
///
/// Keys are unique and never contain a leading slash or a `.`/`..`
/// component. Insertion order carries no meaning; the tar emitter imposes its
/// own total order when serializing.
#[derive(Debug, Default, Clone)]
pub struct Vfs {
    files: BTreeMap<String, FileReference>,
}

impl Vfs {
    /// An empty filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any previous entry with the same path.
    pub fn insert(
        &mut self,
        full_name: impl Into<String>,
        file: FileReference,
    ) -> Result<(), VfsError> {
        let full_name = full_name.into();
        validate_path(&full_name)?;
        self.files.insert(full_name, file);
        Ok(())
    }

    /// Remove an entry, returning it if it was present.
    pub fn remove(&mut self, full_name: &str) -> Option<FileReference> {
        self.files.remove(full_name)
    }

    /// Look up an entry by path.
    pub fn get(&self, full_name: &str) -> Option<&FileReference> {
        self.files.get(full_name)
    }

    /// Look up an entry mutably by path.
    pub fn get_mut(&mut self, full_name: &str) -> Option<&mut FileReference> {
        self.files.get_mut(full_name)
    }

    /// Whether the filesystem contains an entry for the given path.
    pub fn contains(&self, full_name: &str) -> bool {
        self.files.contains_key(full_name)
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the filesystem holds no entries.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterate over `(path, entry)` pairs in byte-lexicographic path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileReference)> {
        self.files.iter().map(|(name, file)| (name.as_str(), file))
    }

    /// Iterate mutably over `(path, entry)` pairs.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut FileReference)> {
        self.files.iter_mut().map(|(name, file)| (name.as_str(), file))
    }

    /// Iterate over the paths.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Insert a directory entry for every missing ancestor of the existing
    /// entries. `make` produces the template entry for a new directory.
    pub fn add_missing_directories(&mut self, make: impl Fn() -> FileReference) {
        let mut missing = Vec::new();
        for name in self.files.keys() {
            let mut offset = 0;
            while let Some(position) = name[offset..].find('/') {
                let parent = &name[..offset + position];
                if !self.files.contains_key(parent) {
                    missing.push(parent.to_string());
                }
                offset += position + 1;
            }
        }
        for parent in missing {
            self.files.entry(parent).or_insert_with(&make);
        }
    }
}

impl IntoIterator for Vfs {
    type Item = (String, FileReference);
    type IntoIter = std::collections::btree_map::IntoIter<String, FileReference>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.into_iter()
    }
}

fn validate_path(full_name: &str) -> Result<(), VfsError> {
    if full_name.is_empty() {
        return Err(VfsError::EmptyPath);
    }
    if full_name.starts_with('/') {
        return Err(VfsError::AbsolutePath(full_name.to_string()));
    }
    if full_name
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(VfsError::NonCanonicalPath(full_name.to_string()));
    }
    Ok(())
}
