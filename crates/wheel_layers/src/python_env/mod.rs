//! Module for working with the python interpreter of the target platform.
//! Contains functionality for locating an interpreter and for byte-compiling
//! installed sources into the interpreter's `.pyc` format.

mod byte_code_compiler;

mod system_python;

pub use byte_code_compiler::{
    ByteCodeCompiler, CompilationError, CompileallCompiler, CompiledModule, PycSource,
    SpawnCompilerError,
};
pub use system_python::{
    system_python_executable, FindPythonError, ParsePythonInterpreterVersionError,
    PythonInterpreterVersion,
};
