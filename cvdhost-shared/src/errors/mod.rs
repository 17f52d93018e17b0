//! Error model shared by every cvdhost crate.
//!
//! Failures are [`StackTraceError`]s: an [`ErrorKind`] plus an ordered list of
//! [`StackTraceEntry`] frames, innermost first. Each propagation site pushes
//! one frame through the macros in this module, so the rendered error reads as
//! a trace from the call that failed out to the layer that reported it.
//!
//! ```ignore
//! use cvdhost_shared::errors::CvdResult;
//! use cvdhost_shared::{ensure, propagate};
//!
//! fn open_console(path: &str) -> CvdResult<std::fs::File> {
//!     ensure!(!path.is_empty(), "console path is empty");
//!     let file = propagate!(std::fs::File::open(path), "opening {}", path);
//!     Ok(file)
//! }
//! ```

mod entry;
mod format;
mod macros;

use std::fmt;

pub use entry::StackTraceEntry;
pub use format::{
    DEFAULT_ERROR_FORMAT, ERROR_FORMAT_ENV, ErrorFormat, FormatSpecifier, error_format,
    stderr_is_terminal,
};

/// Classification of a failure by how callers are expected to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// Invalid flag or missing required input. Fatal at startup.
    #[error("configuration error")]
    Config,

    /// An allocator had nothing left to hand out.
    #[error("resource unavailable")]
    ResourceUnavailable,

    /// A system call failed with `errno`.
    #[error("os error {errno}")]
    Os { errno: i32 },

    /// Malformed or unexpected peer input.
    #[error("protocol violation")]
    Protocol,

    /// A supervised child exited unexpectedly or with a failure status.
    #[error("child process failure")]
    ChildProcess,

    /// A usage contract was broken (e.g. waiting twice on a subprocess).
    #[error("invariant breach")]
    Invariant,

    /// I/O failure without an errno.
    #[error("i/o error")]
    Io,

    #[error("internal error")]
    Internal,
}

/// Error carrying a stack of propagation frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceError {
    kind: ErrorKind,
    detail: Option<String>,
    stack: Vec<StackTraceEntry>,
}

pub type CvdResult<T> = Result<T, StackTraceError>;

impl StackTraceError {
    /// An error with no frames. The first propagation site adds one.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            stack: Vec::new(),
        }
    }

    /// An error with no frames whose innermost frame message will be `detail`.
    pub fn with_detail(kind: ErrorKind, detail: impl fmt::Display) -> Self {
        Self {
            kind,
            detail: Some(detail.to_string()),
            stack: Vec::new(),
        }
    }

    /// Wrap a foreign error as a protocol violation.
    pub fn protocol(err: impl fmt::Display) -> Self {
        Self::with_detail(ErrorKind::Protocol, err)
    }

    /// Build a single-frame error.
    pub fn from_entry(kind: ErrorKind, entry: StackTraceEntry) -> Self {
        Self::new(kind).push_entry(entry)
    }

    /// Append a frame. The first frame inherits the captured detail text as
    /// its message when it has none of its own.
    pub fn push_entry(mut self, mut entry: StackTraceEntry) -> Self {
        if self.stack.is_empty() {
            if let Some(detail) = self.detail.as_deref() {
                entry.fill_message(detail);
            }
        }
        self.stack.push(entry);
        self
    }

    /// Reclassify the error, keeping its frames.
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The errno for [`ErrorKind::Os`] errors.
    pub fn errno(&self) -> Option<i32> {
        match self.kind {
            ErrorKind::Os { errno } => Some(errno),
            _ => None,
        }
    }

    /// Frames, innermost first.
    pub fn stack(&self) -> &[StackTraceEntry] {
        &self.stack
    }

    /// Render with an explicit format string.
    pub fn format_with(&self, spec: &str) -> String {
        if self.stack.is_empty() {
            return match &self.detail {
                Some(detail) => format!("{}: {}", self.kind, detail),
                None => self.kind.to_string(),
            };
        }
        let format = ErrorFormat::parse(spec);
        let positions: Box<dyn Iterator<Item = usize>> = if format.inner_to_outer {
            Box::new(0..self.stack.len())
        } else {
            Box::new((0..self.stack.len()).rev())
        };
        positions
            .map(|i| self.stack[i].render(format.specifiers_for(i), Some(i)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Frame messages only, outermost first.
    pub fn message(&self) -> String {
        self.format_with("m")
    }

    /// Compact one-line-per-frame trace.
    pub fn trace(&self) -> String {
        self.format_with("v")
    }

    /// Render with `CF_ERROR_FORMAT` (or the default), colored when `color`.
    pub fn format_for_env(&self, color: bool) -> String {
        self.format_with(&error_format(color))
    }
}

impl fmt::Display for StackTraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            f.write_str(&self.trace())
        } else {
            f.write_str(&self.format_for_env(false))
        }
    }
}

impl std::error::Error for StackTraceError {}

impl From<StackTraceEntry> for StackTraceError {
    fn from(entry: StackTraceEntry) -> Self {
        Self::from_entry(ErrorKind::Internal, entry)
    }
}

impl From<std::io::Error> for StackTraceError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::with_detail(ErrorKind::Os { errno }, err),
            None => Self::with_detail(ErrorKind::Io, err),
        }
    }
}

impl From<nix::errno::Errno> for StackTraceError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::with_detail(ErrorKind::Os { errno: errno as i32 }, errno.desc())
    }
}

impl From<serde_json::Error> for StackTraceError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::with_detail(ErrorKind::Io, err)
        } else {
            Self::with_detail(ErrorKind::Protocol, err)
        }
    }
}

impl From<std::ffi::NulError> for StackTraceError {
    fn from(err: std::ffi::NulError) -> Self {
        Self::with_detail(ErrorKind::Config, err)
    }
}

impl From<std::num::ParseIntError> for StackTraceError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::with_detail(ErrorKind::Config, err)
    }
}

/// Values `propagate!` can unwrap: results and options.
pub trait Outcome {
    type Value;

    fn into_outcome(self) -> CvdResult<Self::Value>;
}

impl<T, E: Into<StackTraceError>> Outcome for Result<T, E> {
    type Value = T;

    fn into_outcome(self) -> CvdResult<T> {
        self.map_err(Into::into)
    }
}

impl<T> Outcome for Option<T> {
    type Value = T;

    fn into_outcome(self) -> CvdResult<T> {
        self.ok_or_else(|| StackTraceError::new(ErrorKind::ResourceUnavailable))
    }
}

/// Capture the current thread's errno.
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
