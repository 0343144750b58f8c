//! Functionality to install wheels into reproducible image layers.

use crate::clock::ReproducibleClock;
use crate::layer::{Layer, LayerError};
use crate::python_env::{ByteCodeCompiler, CompilationError, PycSource};
use crate::types::{DirectUrlJson, HashAlgorithm, NormalizedPackageName};
use crate::vfs::{FileReference, Vfs, VfsError, MODE_REGULAR};
use crate::wheel::{Wheel, WheelError};
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod hooks;
mod install_paths;
mod scripts;

pub use install_paths::InstallPaths;

use hooks::{direct_url_hook, installer_hook, record_hook, requested_hook, PostInstallHook};
use scripts::{install_entry_points, rewrite_shebang, Scripts};

/// An error that can occur while installing a wheel into a layer.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Reading or validating the wheel failed.
    #[error(transparent)]
    Wheel(#[from] WheelError),

    /// A destination path could not be stored.
    #[error(transparent)]
    Vfs(#[from] VfsError),

    /// The wheel contains a `.data` directory outside the scheme.
    #[error("unrecognized .data directory: {0}")]
    UnsupportedDataDirectory(String),

    /// The `entry_points.txt` file is invalid.
    #[error("entry_points.txt invalid, {0}")]
    EntryPointsInvalid(String),

    /// Byte-compiling the installed sources failed.
    #[error("bytecode compilation failed")]
    Compilation(#[source] CompilationError),

    /// An underlying read or write failed.
    #[error("failed to write {0}")]
    IoError(String, #[source] std::io::Error),

    /// The `direct_url.json` file could not be serialized.
    #[error("failed to serialize direct_url.json")]
    DirectUrlSerde(#[from] serde_json::Error),

    /// The `RECORD` file could not be composed.
    #[error("RECORD file could not be written")]
    RecordCsv(#[from] csv::Error),

    /// Serializing the layer failed.
    #[error(transparent)]
    Layer(#[from] LayerError),

    /// The cancellation token tripped.
    #[error("the installation was cancelled")]
    Cancelled,
}

/// The ownership stamped onto every entry of the emitted layer that does not
/// carry its own.
#[derive(Debug, Clone)]
pub struct Ownership {
    /// Owning user id.
    pub uid: u64,
    /// Owning group id.
    pub gid: u64,
    /// Owning user name.
    pub uname: String,
    /// Owning group name.
    pub gname: String,
}

impl Default for Ownership {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            uname: "root".to_string(),
            gname: "root".to_string(),
        }
    }
}

/// The description of the environment a wheel is installed for.
pub struct Platform<'a> {
    /// Where each category of wheel content lands.
    pub paths: InstallPaths,
    /// Interpreter command line for console scripts, without the leading `#!`.
    pub console_shebang: String,
    /// Interpreter command line for GUI scripts, without the leading `#!`.
    pub gui_shebang: String,
    /// Ownership of the emitted files.
    pub ownership: Ownership,
    /// The bytecode compiler matching the platform's interpreter.
    pub py_compile: &'a dyn ByteCodeCompiler,
}

/// Additional optional settings to pass to [`install_wheel`].
///
/// Typically you will default most fields.
pub struct InstallOptions {
    /// The name written to the dist-info `INSTALLER` file. INSTALLER files
    /// are used to track the installer of a package. See
    /// [PEP 376](https://peps.python.org/pep-0376/) for more information.
    pub installer: String,

    /// When set, the install is treated as requested by a user and a
    /// `REQUESTED` file is written: empty for an empty string, otherwise
    /// holding the given reason. `None` omits the file entirely.
    pub requested: Option<String>,

    /// The `direct_url.json` content to write to the dist-info folder of the
    /// package. The installer cannot know where the wheel came from, so this
    /// must be supplied by the caller.
    pub direct_url: Option<DirectUrlJson>,

    /// The extras of the wheel that should be activated. This affects the
    /// creation of entry points. If `None` is specified, extras are *not*
    /// taken into account. This is different from specifying an empty set
    /// because `None` disables the filtering entirely. This is the default.
    pub extras: Option<HashSet<String>>,

    /// The hash algorithm used for the rows of the regenerated `RECORD`.
    pub record_hash: HashAlgorithm,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            installer: env!("CARGO_PKG_NAME").to_string(),
            requested: None,
            direct_url: None,
            extras: None,
            record_hash: HashAlgorithm::default(),
        }
    }
}

/// Install a wheel for the given platform and serialize the result into an
/// uncompressed tar layer.
///
/// The produced byte stream matches what the reference installer would
/// place on disk under the scheme's prefix: paths are mapped onto the
/// scheme, entry point scripts are synthesized, `#!python` shebangs are
/// rewritten, every installed `.py` is byte-compiled, and the dist-info
/// bookkeeping files are regenerated. All timestamps are clamped to the
/// clock's clamp time so the output is identical across hosts and runs.
///
/// No partial layer is ever produced: the first failure aborts the install.
pub fn install_wheel(
    wheel: &Wheel,
    platform: &Platform<'_>,
    options: &InstallOptions,
    clock: &ReproducibleClock,
    cancel: &CancellationToken,
) -> Result<Layer, InstallError> {
    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }
    let clamp_time = clock.clamp_time();

    // 1. Read the wheel into a virtual filesystem and validate it.
    let (wheel_vfs, vitals) = wheel.to_vfs()?;
    let scripts = Scripts::from_vfs(&wheel_vfs, &vitals.dist_info, options.extras.as_ref())?;

    let normalized_name: NormalizedPackageName = wheel.name().distribution.clone().into();
    let library_root = if vitals.metadata.root_is_purelib {
        &platform.paths.purelib
    } else {
        &platform.paths.platlib
    };
    let dist_info = if library_root.is_empty() {
        vitals.dist_info.clone()
    } else {
        format!("{}/{}", library_root, vitals.dist_info)
    };

    tracing::debug!(
        wheel = %wheel.name(),
        dist_info = %dist_info,
        "installing wheel"
    );

    // 2. Map every member onto its location in the scheme.
    let transformer = WheelPathTransformer {
        data: &vitals.data,
        root_is_purelib: vitals.metadata.root_is_purelib,
        paths: &platform.paths,
        distribution: normalized_name.as_str(),
    };
    let mut vfs = Vfs::new();
    let mut installed_scripts = Vec::new();
    for (full_name, file) in wheel_vfs {
        let Some((destination, is_script)) = transformer.analyze_path(&full_name)? else {
            continue;
        };
        if is_script {
            // Wrapper scripts that setuptools generated for declared entry
            // points are replaced by the launchers synthesized below.
            let file_name = destination.rsplit('/').next().unwrap_or(&destination);
            if scripts.is_entrypoint_wrapper(file_name) {
                continue;
            }
            installed_scripts.push(destination.clone());
        }
        vfs.insert(destination, file)?;
    }

    // 3. Rewrite shebangs of wheel-provided scripts and synthesize the
    //    declared entry points.
    for script in installed_scripts {
        let file = vfs.get_mut(&script).expect("the script was just inserted");
        let content = file
            .data
            .resolve()
            .map_err(|err| InstallError::IoError(script.clone(), err))?;
        if let Some(rewritten) =
            rewrite_shebang(&content, &platform.console_shebang, &platform.gui_shebang)
        {
            file.size = rewritten.len() as u64;
            file.data = rewritten.into();
        }
        file.mode = MODE_REGULAR | 0o755;
    }
    install_entry_points(
        &mut vfs,
        &scripts,
        &platform.paths,
        &platform.console_shebang,
        &platform.gui_shebang,
        clamp_time,
    )?;

    // 4. Byte-compile every installed python source.
    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }
    let mut sources = Vec::new();
    for (full_name, file) in vfs.iter() {
        if file.is_file() && full_name.ends_with(".py") {
            sources.push(PycSource {
                full_name: full_name.to_string(),
                content: file
                    .data
                    .resolve()
                    .map_err(|err| InstallError::IoError(full_name.to_string(), err))?,
            });
        }
    }
    let compiled = platform
        .py_compile
        .compile(&sources, clamp_time, cancel)
        .map_err(|err| match err {
            CompilationError::Cancelled => InstallError::Cancelled,
            other => InstallError::Compilation(other),
        })?;
    for module in compiled {
        let mut file = FileReference::regular(0o644, module.content);
        file.mtime = Some(clamp_time);
        vfs.insert(module.full_name, file)?;
    }

    // 5. Run the post-install hooks; RECORD always runs last so that it
    //    covers everything the earlier hooks wrote.
    let mut post_install: Vec<PostInstallHook<'_>> = Vec::new();
    if let Some(reason) = &options.requested {
        post_install.push(requested_hook(reason.clone()));
    }
    post_install.push(installer_hook(options.installer.clone()));
    if let Some(direct_url) = &options.direct_url {
        post_install.push(direct_url_hook(direct_url));
    }
    post_install.push(record_hook(options.record_hash));
    for hook in post_install {
        hook(cancel, clamp_time, &mut vfs, &dist_info)?;
    }

    // 6. Complete the tree and normalize ownership and timestamps.
    vfs.add_missing_directories(|| {
        let mut directory = FileReference::directory(0o755);
        directory.mtime = Some(clamp_time);
        directory
    });
    for (_, file) in vfs.iter_mut() {
        if file.uid.is_none() {
            file.uid = Some(platform.ownership.uid);
        }
        if file.gid.is_none() {
            file.gid = Some(platform.ownership.gid);
        }
        if file.uname.is_none() {
            file.uname = Some(platform.ownership.uname.clone());
        }
        if file.gname.is_none() {
            file.gname = Some(platform.ownership.gname.clone());
        }
        file.mtime = Some(clock.clamp(file.mtime.unwrap_or(clamp_time)));
        file.atime = file.atime.map(|atime| clock.clamp(atime));
        file.ctime = file.ctime.map(|ctime| clock.clamp(ctime));
    }

    // 7. Serialize.
    if cancel.is_cancelled() {
        return Err(InstallError::Cancelled);
    }
    let layer = Layer::from_vfs(&vfs, clock)?;
    tracing::debug!(
        wheel = %wheel.name(),
        diff_id = %layer.diff_id(),
        bytes = layer.len(),
        "wheel installed"
    );
    Ok(layer)
}

/// Implements the logic to determine where a file from a wheel should be
/// placed in the layer and whether we should apply script handling.
///
/// This implements the logic from <https://peps.python.org/pep-0427/#details>
struct WheelPathTransformer<'a> {
    /// The name of the data directory in the wheel archive.
    data: &'a str,

    /// Whether the wheel is a purelib or a platlib.
    root_is_purelib: bool,

    /// The scheme that decides where files land.
    paths: &'a InstallPaths,

    /// The normalized name of the distribution.
    distribution: &'a str,
}

impl<'a> WheelPathTransformer<'a> {
    /// Given a path from a wheel archive, determine its final destination
    /// path. Returns `None` if the path should be ignored.
    fn analyze_path(&self, full_name: &str) -> Result<Option<(String, bool)>, InstallError> {
        let (category, rest) = match full_name
            .strip_prefix(self.data)
            .and_then(|rest| rest.strip_prefix('/'))
        {
            Some(data_path) => match data_path.split_once('/') {
                Some((category, rest)) => (category, rest),
                None => {
                    // A bare `<data>/<category>` entry carries nothing to
                    // install, but an unknown category is still a hard error.
                    return match self.paths.match_category(data_path, self.distribution) {
                        Some(_) => Ok(None),
                        None => Err(InstallError::UnsupportedDataDirectory(
                            data_path.to_string(),
                        )),
                    };
                }
            },
            None => {
                let category = if self.root_is_purelib {
                    "purelib"
                } else {
                    "platlib"
                };
                (category, full_name)
            }
        };

        match self.paths.match_category(category, self.distribution) {
            Some(base) => {
                let destination = if base.is_empty() {
                    rest.to_string()
                } else {
                    format!("{base}/{rest}")
                };
                Ok(Some((destination, category == "scripts")))
            }
            None => Err(InstallError::UnsupportedDataDirectory(category.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::python_env::CompiledModule;
    use crate::types::{DirectUrlSource, Record};
    use crate::utils::relative_to;
    use crate::wheel::testing::TestWheelBuilder;
    use url::Url;

    const SITE_PACKAGES: &str = "opt/app/lib/python3.9/site-packages";

    /// Produces placeholder bytecode without an interpreter. The content
    /// depends only on the file name so installs under different prefixes
    /// stay comparable.
    struct StubCompiler;

    impl ByteCodeCompiler for StubCompiler {
        fn cache_tag(&self) -> &str {
            "cpython-39"
        }

        fn compile(
            &self,
            sources: &[PycSource],
            _clamp_time: u64,
            cancel: &CancellationToken,
        ) -> Result<Vec<CompiledModule>, CompilationError> {
            if cancel.is_cancelled() {
                return Err(CompilationError::Cancelled);
            }
            Ok(sources
                .iter()
                .map(|source| {
                    let (directory, file_name) = match source.full_name.rsplit_once('/') {
                        Some((directory, file_name)) => (format!("{directory}/"), file_name),
                        None => (String::new(), source.full_name.as_str()),
                    };
                    let stem = file_name.strip_suffix(".py").unwrap_or(file_name);
                    CompiledModule {
                        source: source.full_name.clone(),
                        full_name: format!(
                            "{directory}__pycache__/{stem}.{}.pyc",
                            self.cache_tag()
                        ),
                        content: format!("bytecode of {file_name}").into_bytes(),
                    }
                })
                .collect())
        }
    }

    fn test_platform(prefix: &str) -> Platform<'static> {
        Platform {
            paths: InstallPaths::for_prefix((3, 9, 0), prefix),
            console_shebang: "/usr/bin/python3".to_string(),
            gui_shebang: "/usr/bin/python3".to_string(),
            ownership: Ownership::default(),
            py_compile: &StubCompiler,
        }
    }

    fn demo_wheel() -> Wheel {
        TestWheelBuilder::new("demo-1.0-py3-none-any.whl")
            .file("demo/__init__.py", b"")
            .file("demo/cli.py", b"def main():\n    pass\n")
            .metadata_file(
                "entry_points.txt",
                b"[console_scripts]\ndemo = demo.cli:main\n",
            )
            .executable("demo-1.0.data/scripts/dscript", b"#!python\nprint('hi')\n")
            .file("demo-1.0.data/data/share/doc.txt", b"docs\n")
            .build()
    }

    fn install(wheel: &Wheel, prefix: &str, options: &InstallOptions) -> Layer {
        install_wheel(
            wheel,
            &test_platform(prefix),
            options,
            &ReproducibleClock::fixed(1600000000),
            &CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn installs_the_expected_tree() {
        let layer = install(&demo_wheel(), "opt/app", &InstallOptions::default());
        let vfs = layer.to_vfs().unwrap();

        // Library files and their bytecode.
        assert!(vfs.contains(&format!("{SITE_PACKAGES}/demo/__init__.py")));
        assert!(vfs.contains(&format!(
            "{SITE_PACKAGES}/demo/__pycache__/__init__.cpython-39.pyc"
        )));
        assert!(vfs.contains(&format!(
            "{SITE_PACKAGES}/demo/__pycache__/cli.cpython-39.pyc"
        )));

        // The entry point launcher.
        let launcher = vfs.get("opt/app/bin/demo").unwrap();
        assert_eq!(launcher.permissions(), 0o755);
        let content = String::from_utf8(launcher.data.resolve().unwrap()).unwrap();
        assert!(content.starts_with("#!/usr/bin/python3\n"));
        assert!(content.contains("from demo.cli import main"));

        // The wheel-provided script with its shebang rewritten.
        let script = vfs.get("opt/app/bin/dscript").unwrap();
        assert_eq!(script.permissions(), 0o755);
        assert_eq!(
            script.data.resolve().unwrap(),
            b"#!/usr/bin/python3\nprint('hi')\n"
        );

        // Data files relative to the prefix.
        assert!(vfs.contains("opt/app/share/doc.txt"));

        // Bookkeeping.
        assert!(vfs.contains(&format!("{SITE_PACKAGES}/demo-1.0.dist-info/INSTALLER")));
        assert!(vfs.contains(&format!("{SITE_PACKAGES}/demo-1.0.dist-info/RECORD")));
        assert!(!vfs.contains(&format!("{SITE_PACKAGES}/demo-1.0.dist-info/REQUESTED")));

        // Every ancestor directory is materialized and owned by root.
        for directory in ["opt", "opt/app", "opt/app/bin", "opt/app/lib"] {
            let entry = vfs.get(directory).unwrap();
            assert!(entry.is_dir());
            assert_eq!(entry.uid, Some(0));
            assert_eq!(entry.uname.as_deref(), Some("root"));
        }
    }

    #[test]
    fn install_is_deterministic() {
        let first = install(&demo_wheel(), "opt/app", &InstallOptions::default());
        let second = install(&demo_wheel(), "opt/app", &InstallOptions::default());
        assert_eq!(first.bytes(), second.bytes());
    }

    #[test]
    fn record_covers_every_installed_file() {
        let layer = install(&demo_wheel(), "opt/app", &InstallOptions::default());
        let vfs = layer.to_vfs().unwrap();

        let record_path = format!("{SITE_PACKAGES}/demo-1.0.dist-info/RECORD");
        let record_bytes = vfs.get(&record_path).unwrap().data.resolve().unwrap();
        let record = Record::from_reader(record_bytes.as_slice()).unwrap();

        for (full_name, file) in vfs.iter() {
            if !file.is_file() {
                continue;
            }
            let relative = relative_to(full_name, SITE_PACKAGES);
            let entry = record
                .entry(&relative)
                .unwrap_or_else(|| panic!("{relative} missing from RECORD"));
            if full_name == record_path || full_name.ends_with(".pyc") {
                assert!(entry.hash.is_none());
                assert!(entry.size.is_none());
            } else {
                let content = file.data.resolve().unwrap();
                assert_eq!(
                    entry.hash.as_deref(),
                    Some(HashAlgorithm::Sha256.format_record_hash(&content).as_str())
                );
                assert_eq!(entry.size, Some(content.len() as u64));
            }
        }
    }

    #[test]
    fn layers_for_different_prefixes_differ_only_in_paths() {
        let first = install(&demo_wheel(), "opt/x", &InstallOptions::default());
        let second = install(&demo_wheel(), "opt/y", &InstallOptions::default());

        let first_vfs = first.to_vfs().unwrap();
        let second_vfs = second.to_vfs().unwrap();
        assert_eq!(first_vfs.len(), second_vfs.len());

        for (name, file) in first_vfs.iter() {
            let substituted = name.replace("opt/x", "opt/y");
            let twin = second_vfs
                .get(&substituted)
                .unwrap_or_else(|| panic!("{substituted} missing from second layer"));
            assert_eq!(file.mode, twin.mode, "{name}");
            assert_eq!(
                file.data.resolve().unwrap(),
                twin.data.resolve().unwrap(),
                "{name}"
            );
        }
    }

    #[test]
    fn requested_reason_is_recorded() {
        let options = InstallOptions {
            requested: Some(String::new()),
            ..Default::default()
        };
        let layer = install(&demo_wheel(), "opt/app", &options);
        let vfs = layer.to_vfs().unwrap();
        let requested = vfs
            .get(&format!("{SITE_PACKAGES}/demo-1.0.dist-info/REQUESTED"))
            .unwrap();
        assert_eq!(requested.size, 0);
    }

    #[test]
    fn direct_url_is_written_when_supplied() {
        let options = InstallOptions {
            direct_url: Some(DirectUrlJson {
                url: Url::parse("file:///wheels/demo-1.0-py3-none-any.whl").unwrap(),
                source: DirectUrlSource::Archive { hashes: None },
            }),
            ..Default::default()
        };
        let layer = install(&demo_wheel(), "opt/app", &options);
        let vfs = layer.to_vfs().unwrap();
        let direct_url = vfs
            .get(&format!(
                "{SITE_PACKAGES}/demo-1.0.dist-info/direct_url.json"
            ))
            .unwrap();
        let content = String::from_utf8(direct_url.data.resolve().unwrap()).unwrap();
        assert!(content.contains("\"url\":\"file:///wheels/demo-1.0-py3-none-any.whl\""));
        assert!(!content.ends_with('\n'));
    }

    #[test]
    fn entry_point_wrappers_from_the_wheel_are_dropped() {
        let wheel = TestWheelBuilder::new("demo-1.0-py3-none-any.whl")
            .file("demo/cli.py", b"def main():\n    pass\n")
            .metadata_file(
                "entry_points.txt",
                b"[console_scripts]\ndemo = demo.cli:main\n",
            )
            .executable("demo-1.0.data/scripts/demo-script.py", b"#!python\n")
            .build();
        let layer = install(&wheel, "opt/app", &InstallOptions::default());
        let vfs = layer.to_vfs().unwrap();
        assert!(!vfs.contains("opt/app/bin/demo-script.py"));
        assert!(vfs.contains("opt/app/bin/demo"));
    }

    #[test]
    fn unknown_data_directory_fails() {
        let wheel = TestWheelBuilder::new("demo-1.0-py3-none-any.whl")
            .file("demo-1.0.data/plugins/extra.txt", b"")
            .build();
        let result = install_wheel(
            &wheel,
            &test_platform("opt/app"),
            &InstallOptions::default(),
            &ReproducibleClock::fixed(1600000000),
            &CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(InstallError::UnsupportedDataDirectory(category)) if category == "plugins"
        ));
    }

    #[test]
    fn cancelled_install_produces_no_layer() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = install_wheel(
            &demo_wheel(),
            &test_platform("opt/app"),
            &InstallOptions::default(),
            &ReproducibleClock::fixed(1600000000),
            &cancel,
        );
        assert!(matches!(result, Err(InstallError::Cancelled)));
    }

    #[test]
    fn every_emitted_mtime_is_clamped() {
        let layer = install(&demo_wheel(), "opt/app", &InstallOptions::default());
        let mut archive = tar::Archive::new(layer.open());
        for entry in archive.entries().unwrap() {
            assert!(entry.unwrap().header().mtime().unwrap() <= 1600000000);
        }
    }

    #[test]
    fn platlib_wheels_install_into_platlib() {
        let wheel = TestWheelBuilder::new("native-1.0-cp39-cp39-linux_x86_64.whl")
            .root_is_purelib(false)
            .file("native/thing.so", b"\x7fELF")
            .build();
        let layer = install(&wheel, "opt/app", &InstallOptions::default());
        let vfs = layer.to_vfs().unwrap();
        // purelib and platlib coincide in the prefix scheme.
        assert!(vfs.contains(&format!("{SITE_PACKAGES}/native/thing.so")));
        assert!(vfs.contains(&format!("{SITE_PACKAGES}/native-1.0.dist-info/RECORD")));
    }
}
