//! Error handling for the compiler pipeline.
//!
//! Every stage returns `Result<_, CompileError>` and propagates upward; only
//! `main` catches, prints the diagnostic, and exits with status 1. Syntax and
//! semantic errors carry a [`Location`]; internal errors do not (they indicate
//! a compiler bug or unsupported input rather than a user mistake).

use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;

/// A position in a source file. Carried on every token, AST node, and
/// location-bearing diagnostic. Line and column are 1-based.
#[derive(Debug, Clone)]
pub struct Location {
    pub file: Rc<PathBuf>,
    pub line: u32,
    pub col: u32,
}

impl Location {
    pub fn new(file: Rc<PathBuf>, line: u32, col: u32) -> Self {
        Self { file, line, col }
    }
}

impl core::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.col)
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{message}")]
    Syntax { loc: Location, message: String },

    #[error("{message}")]
    Semantic { loc: Location, message: String },

    /// An internal failure: unknown AST tag, unknown opcode, unsupported
    /// conversion, use of an unsupported construct the analyzer let through.
    #[error("{message}")]
    Internal { message: String },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub fn syntax(loc: Location, message: impl Into<String>) -> Self {
        Self::Syntax {
            loc,
            message: message.into(),
        }
    }

    pub fn semantic(loc: Location, message: impl Into<String>) -> Self {
        Self::Semantic {
            loc,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::Syntax { loc, .. } | Self::Semantic { loc, .. } => Some(loc),
            Self::Internal { .. } | Self::Io(_) => None,
        }
    }

    /// Render the diagnostic the way the top-level driver prints it:
    /// `file:line:col:Error: ...` when a location is known, `Error: ...`
    /// otherwise.
    pub fn render(&self) -> String {
        match self.location() {
            Some(loc) => format!("{loc}:Error: {self}"),
            None => format!("Error: {self}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

/// Location helper for diagnostics raised against a whole file rather than a
/// point within it.
pub fn file_start(path: &Path) -> Location {
    Location::new(Rc::new(path.to_path_buf()), 1, 1)
}
