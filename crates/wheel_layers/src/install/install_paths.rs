use crate::python_env::PythonInterpreterVersion;

/// The installation scheme: where each logical category of wheel content
/// lands, as slash-separated archive paths already rooted at the install
/// prefix. An empty string means the archive root.
#[derive(Debug, Clone)]
pub struct InstallPaths {
    /// Location of the standard library.
    pub stdlib: String,
    /// Location of the platform-specific standard library.
    pub platstdlib: String,
    /// Location of pure python packages.
    pub purelib: String,
    /// Location of platform-specific packages.
    pub platlib: String,
    /// Location of header files.
    pub include: String,
    /// Location of platform-specific header files.
    pub platinclude: String,
    /// Location of executable scripts.
    pub scripts: String,
    /// Location of data files.
    pub data: String,
}

impl InstallPaths {
    /// Populates mappings of installation targets for the posix prefix
    /// layout, i.e. what `pip install --prefix=<prefix>` produces. The
    /// prefix may be empty for an install rooted at the archive root.
    pub fn for_prefix<V: Into<PythonInterpreterVersion>>(
        version: V,
        prefix: impl AsRef<str>,
    ) -> Self {
        let version = version.into();
        let prefix = prefix.as_ref().trim_matches('/');
        let python = format!("python{}.{}", version.major, version.minor);

        let rooted = |rest: &str| -> String {
            if prefix.is_empty() {
                rest.to_string()
            } else if rest.is_empty() {
                prefix.to_string()
            } else {
                format!("{prefix}/{rest}")
            }
        };

        Self {
            stdlib: rooted(&format!("lib/{python}")),
            platstdlib: rooted(&format!("lib/{python}")),
            purelib: rooted(&format!("lib/{python}/site-packages")),
            platlib: rooted(&format!("lib/{python}/site-packages")),
            include: rooted(&format!("include/{python}")),
            platinclude: rooted(&format!("include/{python}")),
            scripts: rooted("bin"),
            data: rooted(""),
        }
    }

    /// Returns the site-packages location. This is the purelib location.
    pub fn site_packages(&self) -> &str {
        &self.purelib
    }

    /// Returns the location of the headers of a distribution. The location
    /// of headers is specific to a distribution name.
    pub fn headers(&self, distribution_name: &str) -> String {
        format!("{}/{}", self.include, distribution_name)
    }

    /// Matches a `<dist>.data/<category>` directory to its install path.
    /// Returns `None` for categories outside the scheme.
    pub fn match_category(&self, category: &str, distribution_name: &str) -> Option<String> {
        match category {
            "purelib" => Some(self.purelib.clone()),
            "platlib" => Some(self.platlib.clone()),
            "scripts" => Some(self.scripts.clone()),
            "data" => Some(self.data.clone()),
            "headers" => Some(self.headers(distribution_name)),
            _ => None,
        }
    }
}
