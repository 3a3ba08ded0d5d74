//! Freeze error types

use crate::module::ModuleError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors found while compiling bootstrap source
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// A character that starts no token
    #[error("unexpected character {ch:?} at {line}:{column}")]
    UnexpectedCharacter {
        /// Offending character
        ch: char,
        /// 1-based line
        line: u32,
        /// 1-based column
        column: u32,
    },

    /// A string literal without its closing quote
    #[error("unterminated string literal at {line}:{column}")]
    UnterminatedString {
        /// 1-based line
        line: u32,
        /// 1-based column
        column: u32,
    },

    /// A numeric literal that does not fit the constant pool
    #[error("invalid number {text:?} at {line}:{column}")]
    InvalidNumber {
        /// Literal text
        text: String,
        /// 1-based line
        line: u32,
        /// 1-based column
        column: u32,
    },

    /// A closing bracket with no opening bracket
    #[error("unmatched {found:?} at {line}:{column}")]
    UnmatchedBracket {
        /// Closing bracket found
        found: char,
        /// 1-based line
        line: u32,
        /// 1-based column
        column: u32,
    },

    /// A closing bracket that does not match the innermost open one
    #[error("closing {found:?} at {line}:{column} does not match {open:?}")]
    MismatchedBracket {
        /// Innermost open bracket
        open: char,
        /// Closing bracket found
        found: char,
        /// 1-based line
        line: u32,
        /// 1-based column
        column: u32,
    },

    /// An opening bracket still open at the end of the source
    #[error("{open:?} opened at {line}:{column} is never closed")]
    UnclosedBracket {
        /// Opening bracket
        open: char,
        /// 1-based line
        line: u32,
        /// 1-based column
        column: u32,
    },

    /// A table outgrew its u32 index space
    #[error("too many {0} for one module")]
    TooLarge(&'static str),
}

/// Errors of a whole freeze run
#[derive(Debug, Error)]
pub enum FreezeError {
    /// The input could not be read
    #[error("cannot read '{}'", path.display())]
    Read {
        /// Input path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The input did not compile
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    /// The compiled module failed its own verification
    #[error("frozen module is invalid: {0}")]
    Module(#[from] ModuleError),

    /// The artifact could not be written
    #[error("cannot write '{}'", path.display())]
    Write {
        /// Output path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Freeze result
pub type FreezeResult<T> = Result<T, FreezeError>;
