//! Trace directory location and creation.
//!
//! The trace root is resolved once into an explicit [`TraceLocator`] value
//! that callers thread into the writer and reader; there is no hidden
//! process-global. Resolution precedence:
//!
//! 1. `_RR_TRACE_DIR` if set.
//! 2. An existing XDG data directory (`$XDG_DATA_HOME/rr`, else
//!    `$HOME/.local/share/rr`).
//! 3. The existing legacy `$HOME/.rr` (backwards compatibility).
//! 4. The XDG path if derivable, otherwise `/tmp/rr`.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use super::errors::TraceWriteError;

/// Name of the best-effort "most recent trace" symlink in the root.
pub const LATEST_TRACE_NAME: &str = "latest-trace";

/// Name of the per-trace version file.
const VERSION_FILE_NAME: &str = "version";

/// Resolved trace root, threaded explicitly into writers and readers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceLocator {
    root: PathBuf,
}

impl TraceLocator {
    /// Locator for an explicit root directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locator resolved from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let root = resolve_root(
            std::env::var_os("_RR_TRACE_DIR").map(PathBuf::from),
            std::env::var_os("XDG_DATA_HOME").map(PathBuf::from),
            std::env::var_os("HOME").map(PathBuf::from),
        );
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the "latest trace" symlink.
    #[must_use]
    pub fn latest_trace_symlink(&self) -> PathBuf {
        self.root.join(LATEST_TRACE_NAME)
    }

    /// Creates a fresh trace directory `<root>/<basename>-<nonce>`.
    ///
    /// The root and its ancestors are created with mode 0700 if missing
    /// (racing creators are tolerated). The nonce is the smallest
    /// non-negative integer whose directory can be atomically created, so
    /// concurrent recorders never share a trace directory.
    pub fn make_trace_dir(&self, exe_path: &str) -> Result<PathBuf, TraceWriteError> {
        ensure_dir(&self.root).map_err(|source| TraceWriteError::CreateDir {
            path: self.root.clone(),
            source,
        })?;

        let basename = base_file_name(exe_path);
        for nonce in 0u32.. {
            let dir = self.root.join(format!("{basename}-{nonce}"));
            match DirBuilder::new().mode(0o770).create(&dir) {
                Ok(()) => return Ok(dir),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(TraceWriteError::CreateDir { path: dir, source }),
            }
        }
        unreachable!("nonce space exhausted");
    }

    /// Points the "latest trace" symlink at `dir`, best-effort.
    ///
    /// The link is unlinked and re-created once. If another recorder
    /// re-creates it in between, that trace wins and this call still
    /// succeeds.
    pub fn update_latest_symlink(&self, dir: &Path) -> io::Result<()> {
        let link = self.latest_trace_symlink();
        let _ = std::fs::remove_file(&link);
        match std::os::unix::fs::symlink(dir, &link) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Path of the version file inside a trace directory.
#[must_use]
pub fn version_file_path(trace_dir: &Path) -> PathBuf {
    trace_dir.join(VERSION_FILE_NAME)
}

/// Final path component, used to name trace directories and backing-file
/// copies after the thing they came from.
#[must_use]
pub(crate) fn base_file_name(file_name: &str) -> &str {
    match file_name.rfind('/') {
        Some(idx) => &file_name[idx + 1..],
        None => file_name,
    }
}

/// Root-resolution precedence, separated from env access for testability.
fn resolve_root(
    override_dir: Option<PathBuf>,
    xdg_data_home: Option<PathBuf>,
    home: Option<PathBuf>,
) -> PathBuf {
    if let Some(dir) = override_dir {
        if !dir.as_os_str().is_empty() {
            return dir;
        }
    }

    let xdg_dir = xdg_data_home
        .filter(|d| !d.as_os_str().is_empty())
        .map(|d| d.join("rr"))
        .or_else(|| home.as_ref().map(|h| h.join(".local/share/rr")));
    let legacy_dir = home
        .filter(|h| !h.as_os_str().is_empty())
        .map(|h| h.join(".rr"));

    if let Some(dir) = &xdg_dir {
        if dir.exists() {
            return dir.clone();
        }
    }
    if let Some(dir) = legacy_dir {
        if dir.exists() {
            return dir;
        }
    }
    xdg_dir.unwrap_or_else(|| PathBuf::from("/tmp/rr"))
}

/// Creates `dir` and any missing ancestors with mode 0700.
///
/// Tolerates concurrent creators; fails if the final path exists but is
/// not a directory.
fn ensure_dir(dir: &Path) -> io::Result<()> {
    match DirBuilder::new().recursive(true).mode(0o700).create(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err),
    }
    let metadata = std::fs::metadata(dir)?;
    if !metadata.is_dir() {
        return Err(io::Error::other("trace root exists but is not a directory"));
    }
    Ok(())
}
