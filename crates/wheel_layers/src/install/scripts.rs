//! Entry-point script synthesis and shebang rewriting.

use super::{InstallError, InstallPaths};
use crate::types::EntryPoint;
use crate::vfs::{FileReference, Vfs};
use configparser::ini::Ini;
use std::collections::{HashMap, HashSet};

/// The scripts a wheel declares in its `entry_points.txt`.
#[derive(Debug, Default)]
pub(crate) struct Scripts {
    pub(crate) console_scripts: Vec<EntryPoint>,
    pub(crate) gui_scripts: Vec<EntryPoint>,
}

impl Scripts {
    /// Read `entry_points.txt` from the wheel filesystem and parse the
    /// `console_scripts` and `gui_scripts` sections.
    pub(crate) fn from_vfs(
        vfs: &Vfs,
        dist_info: &str,
        extras: Option<&HashSet<String>>,
    ) -> Result<Self, InstallError> {
        let Some(entry_points_file) = vfs.get(&format!("{dist_info}/entry_points.txt")) else {
            return Ok(Self::default());
        };

        let contents = entry_points_file
            .data
            .resolve()
            .map_err(|err| InstallError::IoError("entry_points.txt".to_string(), err))?;
        let contents = String::from_utf8_lossy(&contents).into_owned();

        let mut sections = Ini::new_cs().read(contents).map_err(|err| {
            InstallError::EntryPointsInvalid(format!(
                "failed to parse entry_points.txt contents: {err}"
            ))
        })?;

        let console_scripts = sections
            .remove("console_scripts")
            .map(|section| parse_entry_points_from_ini_section(section, extras))
            .transpose()?
            .unwrap_or_default();

        let gui_scripts = sections
            .remove("gui_scripts")
            .map(|section| parse_entry_points_from_ini_section(section, extras))
            .transpose()?
            .unwrap_or_default();

        Ok(Scripts {
            console_scripts,
            gui_scripts,
        })
    }

    /// Returns true if there is an entry point script with the given name.
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.console_scripts.iter().any(|e| e.script_name == name)
            || self.gui_scripts.iter().any(|e| e.script_name == name)
    }

    /// Returns true if a script with the given file name is a wrapper that
    /// setuptools generated for one of the entry points. Such wrappers are
    /// replaced by the scripts synthesized at install time.
    pub(crate) fn is_entrypoint_wrapper(&self, file_name: &str) -> bool {
        let script_name = file_name
            .strip_suffix(".exe")
            .or_else(|| file_name.strip_suffix("-script.py"))
            .or_else(|| file_name.strip_suffix(".pya"))
            .unwrap_or(file_name);
        self.contains(script_name)
    }
}

/// Parse entry points from a section in the `entry_points.txt` file.
fn parse_entry_points_from_ini_section(
    entry_points: HashMap<String, Option<String>>,
    extras: Option<&HashSet<String>>,
) -> Result<Vec<EntryPoint>, InstallError> {
    let mut result = Vec::new();
    for (script_name, entry_point) in entry_points {
        let entry_point = entry_point.ok_or_else(|| {
            InstallError::EntryPointsInvalid(format!("missing entry point for {script_name}"))
        })?;
        match EntryPoint::parse(script_name.clone(), &entry_point, extras) {
            Ok(None) => {}
            Ok(Some(entry_point)) => result.push(entry_point),
            Err(err) => {
                return Err(InstallError::EntryPointsInvalid(format!(
                    "failed to parse entry point for {script_name}: {err}"
                )));
            }
        }
    }
    // The ini parser iterates a hash map; keep script generation stable.
    result.sort_by(|a, b| a.script_name.cmp(&b.script_name));
    Ok(result)
}

/// Synthesize the launcher scripts for every entry point under the scheme's
/// scripts directory. Launchers are regular files with mode `0755`.
pub(crate) fn install_entry_points(
    vfs: &mut Vfs,
    scripts: &Scripts,
    paths: &InstallPaths,
    console_shebang: &str,
    gui_shebang: &str,
    clamp_time: u64,
) -> Result<(), InstallError> {
    let groups = [
        (&scripts.console_scripts, console_shebang),
        (&scripts.gui_scripts, gui_shebang),
    ];
    for (entry_points, shebang) in groups {
        for entry_point in entry_points {
            tracing::debug!(script = %entry_point.script_name, "creating entry point script");
            let launcher = entry_point.launch_script(shebang);
            let mut file = FileReference::regular(0o755, launcher.into_bytes());
            file.mtime = Some(clamp_time);
            vfs.insert(
                format!("{}/{}", paths.scripts, entry_point.script_name),
                file,
            )?;
        }
    }
    Ok(())
}

/// Rewrite the shebang of a wheel-provided script.
///
/// Per the binary distribution format: if the first line of a file in
/// `<dist>.data/scripts/` starts with exactly `#!python`, it is rewritten to
/// point at the real interpreter; `#!pythonw` marks a GUI script. Returns
/// `None` when the content is a native binary or carries a concrete shebang
/// already.
pub(crate) fn rewrite_shebang(
    content: &[u8],
    console_shebang: &str,
    gui_shebang: &str,
) -> Option<Vec<u8>> {
    if !content.starts_with(b"#!python") {
        return None;
    }
    let shebang = if content.starts_with(b"#!pythonw") {
        gui_shebang
    } else {
        console_shebang
    };
    let body_start = content
        .iter()
        .position(|&byte| byte == b'\n')
        .map_or(content.len(), |position| position);
    let mut rewritten = format!("#!{shebang}").into_bytes();
    rewritten.extend_from_slice(&content[body_start..]);
    Some(rewritten)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::install::InstallPaths;

    fn scripts_fixture() -> Scripts {
        Scripts {
            console_scripts: vec![
                EntryPoint::parse("demo".to_string(), "demo.cli:main", None)
                    .unwrap()
                    .unwrap(),
            ],
            gui_scripts: vec![
                EntryPoint::parse("demo-gui".to_string(), "demo.gui:main", None)
                    .unwrap()
                    .unwrap(),
            ],
        }
    }

    #[test]
    fn parses_entry_points_from_vfs() {
        let mut vfs = Vfs::new();
        vfs.insert(
            "demo-1.0.dist-info/entry_points.txt",
            FileReference::regular(
                0o644,
                b"[console_scripts]\ndemo = demo.cli:main\n\n[gui_scripts]\ndemo-gui = demo.gui:main\n"
                    .as_slice(),
            ),
        )
        .unwrap();

        let scripts = Scripts::from_vfs(&vfs, "demo-1.0.dist-info", None).unwrap();
        assert_eq!(scripts.console_scripts.len(), 1);
        assert_eq!(scripts.gui_scripts.len(), 1);
        assert!(scripts.contains("demo"));
        assert!(scripts.is_entrypoint_wrapper("demo-script.py"));
        assert!(scripts.is_entrypoint_wrapper("demo.exe"));
        assert!(!scripts.is_entrypoint_wrapper("other"));
    }

    #[test]
    fn missing_entry_points_file_yields_no_scripts() {
        let vfs = Vfs::new();
        let scripts = Scripts::from_vfs(&vfs, "demo-1.0.dist-info", None).unwrap();
        assert!(scripts.console_scripts.is_empty());
        assert!(scripts.gui_scripts.is_empty());
    }

    #[test]
    fn entry_point_scripts_are_executable() {
        let mut vfs = Vfs::new();
        let paths = InstallPaths::for_prefix((3, 9, 0), "opt/app");
        install_entry_points(
            &mut vfs,
            &scripts_fixture(),
            &paths,
            "/usr/bin/python3",
            "/usr/bin/pythonw3",
            1234,
        )
        .unwrap();

        let console = vfs.get("opt/app/bin/demo").unwrap();
        assert_eq!(console.permissions(), 0o755);
        assert_eq!(console.mtime, Some(1234));
        let content = console.data.resolve().unwrap();
        assert!(content.starts_with(b"#!/usr/bin/python3\n"));

        let gui = vfs.get("opt/app/bin/demo-gui").unwrap();
        let content = gui.data.resolve().unwrap();
        assert!(content.starts_with(b"#!/usr/bin/pythonw3\n"));
    }

    #[test]
    fn shebang_rewriting() {
        // Console scripts get the console shebang.
        let rewritten = rewrite_shebang(b"#!python\nprint('hi')\n", "/py", "/pyw").unwrap();
        assert_eq!(rewritten, b"#!/py\nprint('hi')\n");

        // GUI scripts get the GUI shebang.
        let rewritten = rewrite_shebang(b"#!pythonw\nprint('hi')\n", "/py", "/pyw").unwrap();
        assert_eq!(rewritten, b"#!/pyw\nprint('hi')\n");

        // Anything else is left alone.
        assert!(rewrite_shebang(b"#!/usr/bin/sh\n", "/py", "/pyw").is_none());
        assert!(rewrite_shebang(b"\x7fELF...", "/py", "/pyw").is_none());
    }
}
