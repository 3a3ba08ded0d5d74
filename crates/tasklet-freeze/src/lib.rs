//! Tasklet Freeze
//!
//! Offline generator that compiles the interpreter's bootstrap source into a
//! [`FrozenModule`] and renders it as a Rust byte array, ready to be linked
//! into the interpreter image and decoded once at start-up.
//!
//! - `lexer`: logos-based tokenizer
//! - `compiler`: token stream compiler with interned tables
//! - `module`: the `TKFZ` binary format and its verification
//! - `emit`: artifact rendering and atomic output

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod compiler;
pub mod emit;
pub mod encoder;
pub mod error;
pub mod lexer;
pub mod module;
pub mod opcode;

pub use compiler::{compile, Compiler};
pub use error::{CompileError, FreezeError, FreezeResult};
pub use module::{Constant, FrozenModule, ModuleError};

use std::fs;
use std::path::Path;
use tracing::debug;

/// Which half of the bootstrap a source file is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapKind {
    /// The core bootstrap
    Bootstrap,
    /// The external (filesystem) half
    External,
}

impl BootstrapKind {
    /// Inputs whose path contains `_external` are the external half
    pub fn from_path(path: &Path) -> Self {
        if path.to_string_lossy().contains("_external") {
            BootstrapKind::External
        } else {
            BootstrapKind::Bootstrap
        }
    }

    /// Module name recorded in the frozen module
    pub fn module_name(self) -> &'static str {
        match self {
            BootstrapKind::Bootstrap => "<frozen bootstrap>",
            BootstrapKind::External => "<frozen bootstrap_external>",
        }
    }

    /// Name of the generated static
    pub fn symbol(self) -> &'static str {
        match self {
            BootstrapKind::Bootstrap => "FROZEN_BOOTSTRAP",
            BootstrapKind::External => "FROZEN_BOOTSTRAP_EXTERNAL",
        }
    }

    /// Module flags for this half
    pub fn flags(self) -> u32 {
        match self {
            BootstrapKind::Bootstrap => 0,
            BootstrapKind::External => module::flags::EXTERNAL,
        }
    }
}

/// Summary of a successful freeze
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeReport {
    /// Bootstrap half that was frozen
    pub kind: BootstrapKind,
    /// Size of the serialized module in bytes
    pub size: usize,
}

/// Compile `source` and serialize the module
pub fn freeze_source(source: &str, kind: BootstrapKind) -> FreezeResult<Vec<u8>> {
    let module = compile(source, kind.module_name(), kind.flags())?;
    let bytes = module.encode()?;
    FrozenModule::decode(&bytes)?;
    Ok(bytes)
}

/// Freeze the bootstrap source at `input` into a Rust artifact at `output`.
///
/// Nothing is written unless every step succeeds.
pub fn freeze(input: &Path, output: &Path) -> FreezeResult<FreezeReport> {
    let source = fs::read_to_string(input).map_err(|source| FreezeError::Read {
        path: input.to_path_buf(),
        source,
    })?;

    let kind = BootstrapKind::from_path(input);
    let bytes = freeze_source(&source, kind)?;
    let artifact = emit::render(kind.symbol(), &bytes);

    emit::write_atomic(output, &artifact).map_err(|source| FreezeError::Write {
        path: output.to_path_buf(),
        source,
    })?;

    debug!(
        input = %input.display(),
        output = %output.display(),
        symbol = kind.symbol(),
        size = bytes.len(),
        "bootstrap frozen"
    );
    Ok(FreezeReport {
        kind,
        size: bytes.len(),
    })
}
