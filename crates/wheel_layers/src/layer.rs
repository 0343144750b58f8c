//! Serializes a [`Vfs`] into a deterministic, uncompressed tar stream that
//! can be used directly as an OCI image layer.

use crate::clock::ReproducibleClock;
use crate::vfs::{FileIdentity, FileReference, Vfs};
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use tar::{Builder, EntryType, Header};
use thiserror::Error;

/// An error produced while serializing or re-reading a layer.
#[derive(Debug, Error)]
pub enum LayerError {
    /// An underlying read or write failed.
    #[error("failed to serialize {0}")]
    Io(String, #[source] std::io::Error),

    /// A symlink entry has no target recorded.
    #[error("symlink {0} has no target")]
    MissingLinkTarget(String),

    /// A file's content was shorter than its recorded size.
    #[error("content of {0} is shorter than its recorded size")]
    ShortRead(String),
}

/// Compare two archive paths segment by segment.
///
/// Paths are split on `/` and the segments compared lexicographically; a
/// path that is a strict prefix of another sorts first. This differs from
/// plain byte comparison: `"a-b"` sorts *after* `"a/x"` because `a` < `a-b`
/// at the first segment.
pub(crate) fn compare_segmented(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}

/// An uncompressed tar byte stream usable as one step in an OCI image.
///
/// The bytes are produced once and shared; [`Layer::open`] yields a fresh
/// reader over them every time it is called.
#[derive(Debug, Clone)]
pub struct Layer {
    bytes: Arc<[u8]>,
}

impl Layer {
    /// Serialize a [`Vfs`] into a layer.
    ///
    /// Entries are emitted in segment-wise path order, every timestamp is
    /// clamped to the clock's clamp time, hard links are deduplicated by
    /// inode identity, and headers are POSIX ustar with PAX extension
    /// records only where a field exceeds the ustar limits. The stream is
    /// terminated by the customary two zero blocks.
    pub fn from_vfs(vfs: &Vfs, clock: &ReproducibleClock) -> Result<Self, LayerError> {
        let mut names: Vec<&str> = vfs.keys().collect();
        names.sort_by(|a, b| compare_segmented(a, b));

        let mut builder = Builder::new(Vec::new());
        let mut emitted: HashMap<FileIdentity, &str> = HashMap::new();
        for name in names {
            let file = vfs.get(name).expect("name was taken from this vfs");
            append_entry(&mut builder, name, file, clock, &mut emitted)?;
        }

        let bytes = builder
            .into_inner()
            .map_err(|err| LayerError::Io("<archive>".to_string(), err))?;
        Ok(Self {
            bytes: bytes.into(),
        })
    }

    /// The raw bytes of the uncompressed tar stream.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The length of the stream in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the stream is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Open a fresh reader over the stream.
    pub fn open(&self) -> impl Read + Send + 'static {
        Cursor::new(self.bytes.clone())
    }

    /// The OCI diff-id of this layer: the sha256 digest of the uncompressed
    /// stream, formatted as `sha256:<hex>`.
    pub fn diff_id(&self) -> String {
        format!("sha256:{}", HEXLOWER.encode(&Sha256::digest(&self.bytes)))
    }

    /// Parse the stream back into a [`Vfs`].
    ///
    /// Hard links are resolved by assigning a shared inode identity to the
    /// link and its target, so a re-serialization of the result yields the
    /// same byte stream.
    pub fn to_vfs(&self) -> Result<Vfs, LayerError> {
        let mut archive = tar::Archive::new(Cursor::new(self.bytes.clone()));
        let mut vfs = Vfs::new();
        let mut pending_pax: HashMap<String, String> = HashMap::new();
        let mut next_inode = 1u64;

        let entries = archive
            .entries()
            .map_err(|err| LayerError::Io("<archive>".to_string(), err))?;
        for entry in entries {
            let mut entry = entry.map_err(|err| LayerError::Io("<archive>".to_string(), err))?;
            let entry_type = entry.header().entry_type();

            if entry_type == EntryType::XHeader {
                let mut data = Vec::new();
                entry
                    .read_to_end(&mut data)
                    .map_err(|err| LayerError::Io("<pax>".to_string(), err))?;
                pending_pax = parse_pax_records(&data);
                continue;
            }

            let header_path = entry
                .path()
                .map_err(|err| LayerError::Io("<archive>".to_string(), err))?
                .to_string_lossy()
                .into_owned();
            let full_name = pending_pax
                .remove("path")
                .unwrap_or(header_path)
                .trim_end_matches('/')
                .to_string();
            let linkname = pending_pax.remove("linkname").or_else(|| {
                entry
                    .link_name()
                    .ok()
                    .flatten()
                    .map(|p| p.to_string_lossy().into_owned())
            });
            pending_pax.clear();

            let header = entry.header();
            let mode = header
                .mode()
                .map_err(|err| LayerError::Io(full_name.clone(), err))?;
            let mtime = header
                .mtime()
                .map_err(|err| LayerError::Io(full_name.clone(), err))?;
            let uid = header
                .uid()
                .map_err(|err| LayerError::Io(full_name.clone(), err))?;
            let gid = header
                .gid()
                .map_err(|err| LayerError::Io(full_name.clone(), err))?;
            let uname = header.username().ok().flatten().map(ToOwned::to_owned);
            let gname = header.groupname().ok().flatten().map(ToOwned::to_owned);

            let mut file = match entry_type {
                EntryType::Directory => FileReference::directory(mode),
                EntryType::Symlink => FileReference::symlink(
                    linkname
                        .clone()
                        .ok_or_else(|| LayerError::MissingLinkTarget(full_name.clone()))?,
                ),
                EntryType::Link => {
                    let target = linkname
                        .clone()
                        .ok_or_else(|| LayerError::MissingLinkTarget(full_name.clone()))?;
                    // Share an identity with the original so a later
                    // serialization collapses the pair back into a link.
                    let identity = match vfs.get_mut(&target) {
                        Some(original) => *original.identity.get_or_insert_with(|| {
                            let identity = FileIdentity {
                                dev: 0,
                                ino: next_inode,
                            };
                            next_inode += 1;
                            identity
                        }),
                        None => {
                            return Err(LayerError::MissingLinkTarget(full_name.clone()));
                        }
                    };
                    let original = vfs.get(&target).expect("checked above");
                    let mut link = original.clone();
                    link.identity = Some(identity);
                    link
                }
                _ => {
                    let mut content = Vec::new();
                    entry
                        .read_to_end(&mut content)
                        .map_err(|err| LayerError::Io(full_name.clone(), err))?;
                    FileReference::regular(mode, content)
                }
            };
            file.mode = (file.mode & crate::vfs::MODE_TYPE_MASK) | (mode & 0o7777);
            file.mtime = Some(mtime);
            file.uid = Some(uid);
            file.gid = Some(gid);
            file.uname = uname;
            file.gname = gname;

            vfs.insert(full_name.clone(), file).map_err(|err| {
                LayerError::Io(
                    full_name,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, err),
                )
            })?;
        }

        Ok(vfs)
    }
}

fn append_entry<'a, W: Write>(
    builder: &mut Builder<W>,
    full_name: &'a str,
    file: &FileReference,
    clock: &ReproducibleClock,
    emitted: &mut HashMap<FileIdentity, &'a str>,
) -> Result<(), LayerError> {
    let mtime = clock.clamp(file.mtime.unwrap_or_else(|| clock.clamp_time()));

    let mut header = Header::new_ustar();
    header.set_mode(file.permissions());
    header.set_uid(file.uid.unwrap_or(0));
    header.set_gid(file.gid.unwrap_or(0));
    header.set_mtime(mtime);
    if let Some(uname) = file.uname.as_deref() {
        header
            .set_username(uname)
            .map_err(|err| LayerError::Io(full_name.to_string(), err))?;
    }
    if let Some(gname) = file.gname.as_deref() {
        header
            .set_groupname(gname)
            .map_err(|err| LayerError::Io(full_name.to_string(), err))?;
    }

    // A previously emitted entry with the same inode identity turns this
    // entry into a hard link referencing the earlier path.
    if let Some(identity) = file.identity {
        if let Some(original) = emitted.get(&identity) {
            header.set_entry_type(EntryType::Link);
            header.set_size(0);
            set_entry_path(builder, &mut header, full_name, mtime)?;
            set_entry_link(builder, &mut header, full_name, original, mtime)?;
            header.set_cksum();
            return builder
                .append(&header, std::io::empty())
                .map_err(|err| LayerError::Io(full_name.to_string(), err));
        }
        emitted.insert(identity, full_name);
    }

    if file.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        let name = format!("{full_name}/");
        set_entry_path(builder, &mut header, &name, mtime)?;
        header.set_cksum();
        builder
            .append(&header, std::io::empty())
            .map_err(|err| LayerError::Io(full_name.to_string(), err))
    } else if file.is_symlink() {
        let target = file
            .linkname
            .as_deref()
            .ok_or_else(|| LayerError::MissingLinkTarget(full_name.to_string()))?;
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        set_entry_path(builder, &mut header, full_name, mtime)?;
        set_entry_link(builder, &mut header, full_name, target, mtime)?;
        header.set_cksum();
        builder
            .append(&header, std::io::empty())
            .map_err(|err| LayerError::Io(full_name.to_string(), err))
    } else {
        header.set_entry_type(EntryType::Regular);
        header.set_size(file.size);
        set_entry_path(builder, &mut header, full_name, mtime)?;
        header.set_cksum();
        let reader = file
            .open()
            .map_err(|err| LayerError::Io(full_name.to_string(), err))?;
        let mut reader = reader.take(file.size);
        builder
            .append(&header, &mut reader)
            .map_err(|err| LayerError::Io(full_name.to_string(), err))?;
        if reader.limit() > 0 {
            return Err(LayerError::ShortRead(full_name.to_string()));
        }
        Ok(())
    }
}

/// Store the entry path in the header, falling back to a PAX `path` record
/// when it does not fit the ustar name and prefix fields.
fn set_entry_path<W: Write>(
    builder: &mut Builder<W>,
    header: &mut Header,
    name: &str,
    mtime: u64,
) -> Result<(), LayerError> {
    if header.set_path(name).is_ok() {
        return Ok(());
    }
    append_pax_records(builder, &[("path", name)], mtime)
        .map_err(|err| LayerError::Io(name.to_string(), err))?;
    header
        .set_path(truncate_field(name, 100))
        .map_err(|err| LayerError::Io(name.to_string(), err))
}

/// Store the link target in the header, falling back to a PAX `linkname`
/// record when it does not fit the ustar field.
fn set_entry_link<W: Write>(
    builder: &mut Builder<W>,
    header: &mut Header,
    name: &str,
    target: &str,
    mtime: u64,
) -> Result<(), LayerError> {
    if header.set_link_name(target).is_ok() {
        return Ok(());
    }
    append_pax_records(builder, &[("linkname", target)], mtime)
        .map_err(|err| LayerError::Io(name.to_string(), err))?;
    header
        .set_link_name(truncate_field(target, 100))
        .map_err(|err| LayerError::Io(name.to_string(), err))
}

/// Write a PAX extended header entry carrying the given records. Each record
/// is encoded as `<len> <key>=<value>\n` where `<len>` counts the whole
/// record including its own digits.
fn append_pax_records<W: Write>(
    builder: &mut Builder<W>,
    records: &[(&str, &str)],
    mtime: u64,
) -> std::io::Result<()> {
    let mut data = Vec::new();
    for (key, value) in records {
        let fixed = key.len() + value.len() + 3;
        let mut length = fixed + decimal_width(fixed);
        while length != fixed + decimal_width(length) {
            length = fixed + decimal_width(length);
        }
        write!(&mut data, "{length} {key}={value}\n")?;
    }

    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::XHeader);
    header.set_path("PaxHeaders.0/extended")?;
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(mtime);
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder.append(&header, data.as_slice())
}

fn decimal_width(mut n: usize) -> usize {
    let mut width = 1;
    while n >= 10 {
        n /= 10;
        width += 1;
    }
    width
}

/// Truncate to at most `limit` bytes without splitting a UTF-8 sequence.
fn truncate_field(value: &str, limit: usize) -> &str {
    if value.len() <= limit {
        return value;
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn parse_pax_records(data: &[u8]) -> HashMap<String, String> {
    let mut records = HashMap::new();
    let mut rest = data;
    while !rest.is_empty() {
        let Some(space) = rest.iter().position(|&b| b == b' ') else {
            break;
        };
        let Ok(length) = std::str::from_utf8(&rest[..space])
            .unwrap_or("")
            .parse::<usize>()
        else {
            break;
        };
        if length <= space + 1 || length > rest.len() {
            break;
        }
        let record = &rest[space + 1..length];
        rest = &rest[length..];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(equals) = record.iter().position(|&b| b == b'=') {
            let key = String::from_utf8_lossy(&record[..equals]).into_owned();
            let value = String::from_utf8_lossy(&record[equals + 1..]).into_owned();
            records.insert(key, value);
        }
    }
    records
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vfs::{FileIdentity, FileReference, Vfs};
    use rstest::rstest;
    use std::cmp::Ordering;

    #[rstest]
    #[case("a", "a-b", Ordering::Less)]
    #[case("a/x", "a-b", Ordering::Less)]
    #[case("a-b", "a/x", Ordering::Greater)]
    #[case("a", "a/x", Ordering::Less)]
    #[case("foo/bar", "foo/bar", Ordering::Equal)]
    #[case("foo/bar", "foo/bar/baz", Ordering::Less)]
    fn segment_order(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(compare_segmented(a, b), expected);
    }

    fn sample_vfs() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.insert("a-b", FileReference::regular(0o644, b"dash".as_slice()))
            .unwrap();
        vfs.insert("a", FileReference::directory(0o755)).unwrap();
        vfs.insert("a/x", FileReference::regular(0o755, b"nested".as_slice()))
            .unwrap();
        vfs.insert("link", FileReference::symlink("a/x")).unwrap();
        vfs
    }

    #[test]
    fn emits_entries_in_segment_order() {
        let clock = ReproducibleClock::fixed(1000);
        let layer = Layer::from_vfs(&sample_vfs(), &clock).unwrap();

        let mut archive = tar::Archive::new(layer.open());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a/", "a/x", "a-b", "link"]);
    }

    #[test]
    fn clamps_timestamps() {
        let clock = ReproducibleClock::fixed(1000);
        let mut vfs = sample_vfs();
        vfs.get_mut("a/x").unwrap().mtime = Some(5000);
        vfs.get_mut("a-b").unwrap().mtime = Some(10);

        let layer = Layer::from_vfs(&vfs, &clock).unwrap();
        let mut archive = tar::Archive::new(layer.open());
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert!(entry.header().mtime().unwrap() <= 1000);
            if entry.path().unwrap().to_string_lossy() == "a-b" {
                assert_eq!(entry.header().mtime().unwrap(), 10);
            }
        }
    }

    #[test]
    fn serialization_is_deterministic() {
        let clock = ReproducibleClock::fixed(1000);
        let first = Layer::from_vfs(&sample_vfs(), &clock).unwrap();
        let second = Layer::from_vfs(&sample_vfs(), &clock).unwrap();
        assert_eq!(first.bytes(), second.bytes());
        assert_eq!(first.diff_id(), second.diff_id());
    }

    #[test]
    fn terminates_with_two_zero_blocks() {
        let clock = ReproducibleClock::fixed(1000);
        let layer = Layer::from_vfs(&sample_vfs(), &clock).unwrap();
        assert_eq!(layer.len() % 512, 0);
        assert!(layer.bytes()[layer.len() - 1024..].iter().all(|&b| b == 0));
    }

    #[test]
    fn hard_links_are_emitted_once() {
        let clock = ReproducibleClock::fixed(1000);
        let identity = FileIdentity { dev: 1, ino: 42 };
        let mut vfs = Vfs::new();
        let mut first = FileReference::regular(0o644, b"shared".as_slice());
        first.identity = Some(identity);
        let second = first.clone();
        vfs.insert("data/one", first).unwrap();
        vfs.insert("data/two", second).unwrap();

        let layer = Layer::from_vfs(&vfs, &clock).unwrap();
        let mut archive = tar::Archive::new(layer.open());
        let entries: Vec<_> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().into_owned(),
                    e.header().entry_type(),
                    e.link_name()
                        .unwrap()
                        .map(|l| l.to_string_lossy().into_owned()),
                )
            })
            .collect();

        assert_eq!(entries[0].0, "data/one");
        assert_eq!(entries[0].1, EntryType::Regular);
        assert_eq!(entries[1].0, "data/two");
        assert_eq!(entries[1].1, EntryType::Link);
        assert_eq!(entries[1].2.as_deref(), Some("data/one"));
    }

    #[test]
    fn long_paths_get_a_pax_record() {
        let clock = ReproducibleClock::fixed(1000);
        let long_name = format!("{}/file.txt", "very-long-directory-name".repeat(8));
        let mut vfs = Vfs::new();
        vfs.insert(
            long_name.clone(),
            FileReference::regular(0o644, b"x".as_slice()),
        )
        .unwrap();

        let layer = Layer::from_vfs(&vfs, &clock).unwrap();
        let needle = format!("path={long_name}");
        assert!(layer
            .bytes()
            .windows(needle.len())
            .any(|window| window == needle.as_bytes()));

        // The parsed archive resolves the full path again.
        let round = layer.to_vfs().unwrap();
        assert!(round.contains(&long_name));
    }

    #[test]
    fn round_trip_is_idempotent() {
        let clock = ReproducibleClock::fixed(1000);
        let mut vfs = sample_vfs();
        for (_, file) in vfs.iter_mut() {
            file.mtime = Some(900);
            file.uid = Some(0);
            file.gid = Some(0);
        }
        let layer = Layer::from_vfs(&vfs, &clock).unwrap();
        let reread = layer.to_vfs().unwrap();
        let again = Layer::from_vfs(&reread, &clock).unwrap();
        assert_eq!(layer.bytes(), again.bytes());
    }
}
