//! Error types for trace persistence.
//!
//! Errors are split by stage (opening a trace, recording, replaying) to
//! keep diagnostics precise. All enums are `#[non_exhaustive]` so variants
//! can be added without breaking callers.
//!
//! A recording that hits any of these is not promised to be replayable;
//! callers are expected to treat every variant as fatal to the current
//! record or replay. Opening errors additionally carry the conventional
//! process exit code for embedding CLIs.

use std::fmt;
use std::io;
use std::path::PathBuf;

use super::schema::CodecError;
use super::substream::Substream;
use super::TRACE_VERSION;

/// The UNIX "data error" exit code (`EX_DATAERR`), used for missing,
/// malformed, or mismatched version files.
pub const EX_DATAERR: i32 = 65;

/// Errors opening a trace for replay.
#[derive(Debug)]
#[non_exhaustive]
pub enum TraceOpenError {
    /// No version file: there is probably no trace at this path.
    NotFound { path: PathBuf },
    /// The version file exists but can't be read.
    Unreadable { path: PathBuf, source: io::Error },
    /// The version line is not a decimal integer.
    MalformedVersion { path: PathBuf, raw: String },
    /// The trace was recorded by a different format version.
    VersionMismatch { path: PathBuf, found: i64 },
    /// The header message after the version line failed to decode.
    MalformedHeader { path: PathBuf, source: CodecError },
    /// A substream file failed to open.
    OpenSubstream {
        substream: Substream,
        path: PathBuf,
        source: io::Error,
    },
}

impl TraceOpenError {
    /// Process exit code an embedding CLI should use for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. }
            | Self::Unreadable { .. }
            | Self::MalformedVersion { .. }
            | Self::VersionMismatch { .. }
            | Self::MalformedHeader { .. } => EX_DATAERR,
            Self::OpenSubstream { .. } => 1,
        }
    }
}

impl fmt::Display for TraceOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { path } => write!(
                f,
                "trace version file `{}' not found; there is probably no trace there",
                path.display()
            ),
            Self::Unreadable { path, source } => write!(
                f,
                "trace version file `{}' not readable: {source}",
                path.display()
            ),
            Self::MalformedVersion { path, raw } => write!(
                f,
                "trace version file `{}' has invalid version `{raw}'",
                path.display()
            ),
            Self::VersionMismatch { path, found } => write!(
                f,
                "recorded trace `{}' has incompatible version {found}; expected \
                 {TRACE_VERSION}. Replay it with the version that recorded it, \
                 or the trace is corrupted",
                path.display()
            ),
            Self::MalformedHeader { path, source } => write!(
                f,
                "trace header in `{}' failed to decode: {source}",
                path.display()
            ),
            Self::OpenSubstream {
                substream,
                path,
                source,
            } => write!(
                f,
                "can't open {} substream `{}': {source}",
                substream.name(),
                path.display()
            ),
        }
    }
}

impl std::error::Error for TraceOpenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unreadable { source, .. } | Self::OpenSubstream { source, .. } => Some(source),
            Self::MalformedHeader { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors while recording a trace.
#[derive(Debug)]
#[non_exhaustive]
pub enum TraceWriteError {
    /// Trace directory (or an ancestor) could not be created.
    CreateDir { path: PathBuf, source: io::Error },
    /// A substream file could not be created.
    OpenSubstream {
        substream: Substream,
        path: PathBuf,
        source: io::Error,
    },
    /// A write to a substream failed; the recording cannot continue.
    Write {
        substream: Substream,
        source: io::Error,
    },
    /// The version file could not be created or written.
    VersionFile { path: PathBuf, source: io::Error },
    /// The file-clone probe's scratch file could not be created.
    CloneProbe { path: PathBuf, source: io::Error },
}

impl fmt::Display for TraceWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateDir { path, source } => write!(
                f,
                "can't create trace directory `{}': {source}",
                path.display()
            ),
            Self::OpenSubstream {
                substream,
                path,
                source,
            } => write!(
                f,
                "can't create {} substream `{}': {source}",
                substream.name(),
                path.display()
            ),
            Self::Write { substream, source } => {
                write!(f, "failed writing {} substream: {source}", substream.name())
            }
            Self::VersionFile { path, source } => {
                write!(f, "can't write version file `{}': {source}", path.display())
            }
            Self::CloneProbe { path, source } => write!(
                f,
                "can't create clone-probe file `{}': {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for TraceWriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDir { source, .. }
            | Self::OpenSubstream { source, .. }
            | Self::Write { source, .. }
            | Self::VersionFile { source, .. }
            | Self::CloneProbe { source, .. } => Some(source),
        }
    }
}

/// Errors while replaying a trace.
#[derive(Debug)]
#[non_exhaustive]
pub enum TraceReadError {
    /// A substream delivered fewer bytes than a record requires.
    Read {
        substream: Substream,
        source: io::Error,
    },
    /// A packed message failed to decode.
    Codec {
        substream: Substream,
        source: CodecError,
    },
    /// A record's frame time disagrees with the logical clock.
    TimeMismatch { got: u64, expected: u64 },
    /// A record carries frame time zero, which no writer produces.
    InvalidFrameTime,
    /// Unknown architecture tag in an event frame.
    UnknownArch { tag: u8 },
    /// Unknown extra-register format tag in an event frame.
    UnknownExtraRegFormat { tag: u8 },
    /// A file-backed mapping's backing file can't be stat'ed; replay is
    /// impossible.
    BackingFileStat { path: PathBuf, source: io::Error },
    /// Structurally invalid record contents.
    Corrupt { detail: &'static str },
}

impl fmt::Display for TraceReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { substream, source } => {
                write!(f, "failed reading {} substream: {source}", substream.name())
            }
            Self::Codec { substream, source } => write!(
                f,
                "malformed message in {} substream: {source}",
                substream.name()
            ),
            Self::TimeMismatch { got, expected } => {
                write!(f, "record has frame time {got}, expected {expected}")
            }
            Self::InvalidFrameTime => write!(f, "record has invalid frame time 0"),
            Self::UnknownArch { tag } => write!(f, "unknown architecture tag {tag}"),
            Self::UnknownExtraRegFormat { tag } => {
                write!(f, "unknown extra-register format tag {tag}")
            }
            Self::BackingFileStat { path, source } => write!(
                f,
                "failed to stat backing file `{}': {source}; replay is impossible",
                path.display()
            ),
            Self::Corrupt { detail } => write!(f, "corrupt trace record: {detail}"),
        }
    }
}

impl std::error::Error for TraceReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } | Self::BackingFileStat { source, .. } => Some(source),
            Self::Codec { source, .. } => Some(source),
            _ => None,
        }
    }
}
