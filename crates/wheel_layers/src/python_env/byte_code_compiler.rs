use super::{
    system_python_executable, FindPythonError, ParsePythonInterpreterVersionError,
    PythonInterpreterVersion,
};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A python source file at its install location, to be byte-compiled.
#[derive(Debug, Clone)]
pub struct PycSource {
    /// The archive path of the source, e.g. `lib/python3.9/site-packages/six.py`.
    pub full_name: String,
    /// The source bytes.
    pub content: Vec<u8>,
}

/// The result of byte-compiling a single source file.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    /// The archive path of the source this module was compiled from.
    pub source: String,
    /// The archive path of the cache file, a `__pycache__/<stem>.<tag>.pyc`
    /// sibling of the source.
    pub full_name: String,
    /// The compiled bytes.
    pub content: Vec<u8>,
}

/// An error that can occur when compiling source files.
#[derive(Debug, Error)]
pub enum CompilationError {
    /// A source path does not name a python file.
    #[error("not a python file: {0}")]
    NotAPythonFile(String),

    /// The python executable could not be started.
    #[error("failed to start python executable")]
    FailedToStartPython(#[source] std::io::Error),

    /// The interpreter rejected a source file.
    #[error("failed to compile {0}")]
    FailedToCompile(String),

    /// The compilation host produced a different number of outputs than
    /// sources.
    #[error("the compiler produced {actual} outputs for {expected} sources")]
    OutputMismatch {
        /// Number of sources submitted.
        expected: usize,
        /// Number of outputs received.
        actual: usize,
    },

    /// The compilation host exited with a failure status.
    #[error("the compilation host exited with {0}")]
    HostFailed(String),

    /// An underlying read or write failed.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// The cancellation token tripped while compiling.
    #[error("compilation was cancelled")]
    Cancelled,
}

/// An error that can occur when constructing a [`CompileallCompiler`].
#[derive(Debug, Error)]
pub enum SpawnCompilerError {
    /// No usable interpreter was found.
    #[error(transparent)]
    FindPython(#[from] FindPythonError),

    /// The interpreter version could not be determined.
    #[error(transparent)]
    ParseVersion(#[from] ParsePythonInterpreterVersionError),
}

/// A capability that byte-compiles installed python sources into the `.pyc`
/// format of the target platform's interpreter.
///
/// For each `X.py` submitted, exactly one cache file is produced at
/// `<dir>/__pycache__/<stem>.<tag>.pyc`. Implementations must produce bytes
/// identical to what the platform interpreter would write under
/// `PYTHONHASHSEED=0` with `SOURCE_DATE_EPOCH` set to the clamp time.
pub trait ByteCodeCompiler {
    /// The bytecode cache tag of the target interpreter, e.g. `cpython-311`.
    fn cache_tag(&self) -> &str;

    /// Compile the given sources. `clamp_time` is exported to the compiler
    /// as `SOURCE_DATE_EPOCH`; cancellation is honored by aborting the
    /// compilation and returning [`CompilationError::Cancelled`].
    fn compile(
        &self,
        sources: &[PycSource],
        clamp_time: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompiledModule>, CompilationError>;
}

/// A [`ByteCodeCompiler`] that shells out to a host python interpreter.
///
/// Sources are materialized into a scratch directory, compiled by a small
/// helper script fed through stdin, and the generated cache files are read
/// back. The helper runs with `PYTHONHASHSEED=0` and `SOURCE_DATE_EPOCH`
/// pinned so its output is deterministic.
pub struct CompileallCompiler {
    python: PathBuf,
    cache_tag: String,
}

impl CompileallCompiler {
    /// Create a compiler that uses the system python interpreter.
    pub fn from_env() -> Result<Self, SpawnCompilerError> {
        Self::with_python(system_python_executable()?)
    }

    /// Create a compiler that uses the interpreter at the given path.
    pub fn with_python(python: impl Into<PathBuf>) -> Result<Self, SpawnCompilerError> {
        let python = python.into();
        let version = PythonInterpreterVersion::from_path(&python)?;
        Ok(Self {
            cache_tag: version.cache_tag(),
            python,
        })
    }

    /// The interpreter this compiler invokes.
    pub fn python(&self) -> &PathBuf {
        &self.python
    }
}

impl ByteCodeCompiler for CompileallCompiler {
    fn cache_tag(&self) -> &str {
        &self.cache_tag
    }

    fn compile(
        &self,
        sources: &[PycSource],
        clamp_time: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompiledModule>, CompilationError> {
        if cancel.is_cancelled() {
            return Err(CompilationError::Cancelled);
        }
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        for source in sources {
            if !source.full_name.ends_with(".py") {
                return Err(CompilationError::NotAPythonFile(source.full_name.clone()));
            }
        }

        // Materialize the sources into a scratch directory, preserving their
        // relative locations so the cache files land in the right
        // `__pycache__` siblings.
        let scratch = tempfile::tempdir()?;
        for source in sources {
            let path = scratch.path().join(&source.full_name);
            if let Some(parent) = path.parent() {
                fs_err::create_dir_all(parent)?;
            }
            fs_err::write(&path, &source.content)?;
        }
        let host_source = scratch.path().join("__wheel_layers_compile_host__.py");
        fs_err::write(&host_source, include_str!("compile_pyc.py"))?;

        tracing::debug!(
            sources = sources.len(),
            python = %self.python.display(),
            "byte-compiling installed sources"
        );

        let mut child = Command::new(&self.python)
            .arg("-Wi")
            .arg("-u")
            .arg(&host_source)
            .current_dir(scratch.path())
            .env("PYTHONHASHSEED", "0")
            .env("SOURCE_DATE_EPOCH", clamp_time.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(CompilationError::FailedToStartPython)?;

        // Drain stdout on a separate thread so the host never blocks on a
        // full pipe while we are still feeding stdin.
        let stdout = child.stdout.take().expect("stdout is piped");
        let reader = std::thread::spawn(move || -> std::io::Result<Vec<String>> {
            BufReader::new(stdout).lines().collect()
        });

        let mut stdin = child.stdin.take().expect("stdin is piped");
        for source in sources {
            writeln!(stdin, "{}", source.full_name)?;
        }
        drop(stdin);

        let status = loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CompilationError::Cancelled);
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => std::thread::sleep(Duration::from_millis(10)),
            }
        };

        let lines = reader
            .join()
            .expect("the reader thread does not panic")?;
        if !status.success() {
            return Err(CompilationError::HostFailed(status.to_string()));
        }
        if lines.len() != sources.len() {
            return Err(CompilationError::OutputMismatch {
                expected: sources.len(),
                actual: lines.len(),
            });
        }

        let mut compiled = Vec::with_capacity(sources.len());
        for (source, line) in sources.iter().zip(lines) {
            if let Some(failed) = line.strip_prefix('!') {
                return Err(CompilationError::FailedToCompile(failed.to_string()));
            }
            let full_name = line.trim_start_matches("./").to_string();
            let content = fs_err::read(scratch.path().join(&full_name))?;
            compiled.push(CompiledModule {
                source: source.full_name.clone(),
                full_name,
                content,
            });
        }

        Ok(compiled)
    }
}
