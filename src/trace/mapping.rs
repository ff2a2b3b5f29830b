//! Memory-mapping records and the copy heuristic.
//!
//! Every mapping a recorded task establishes is persisted with a backing
//! source that tells the replayer where the mapped bytes come from:
//! zero-filled, copied into the trace's raw-data stream, or a file (a
//! reflink/hardlink inside the trace directory, or the original path).

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use super::frame::FrameTime;

/// Address range and kernel metadata of one mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelMapping {
    start: u64,
    end: u64,
    fsname: String,
    device: u64,
    inode: u64,
    prot: i32,
    flags: i32,
    file_offset_bytes: u64,
}

impl KernelMapping {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        start: u64,
        end: u64,
        fsname: impl Into<String>,
        device: u64,
        inode: u64,
        prot: i32,
        flags: i32,
        file_offset_bytes: u64,
    ) -> Self {
        Self {
            start,
            end,
            fsname: fsname.into(),
            device,
            inode,
            prot,
            flags,
            file_offset_bytes,
        }
    }

    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Kernel-reported name of the mapped object.
    #[must_use]
    pub fn fsname(&self) -> &str {
        &self.fsname
    }

    #[must_use]
    pub const fn device(&self) -> u64 {
        self.device
    }

    #[must_use]
    pub const fn inode(&self) -> u64 {
        self.inode
    }

    #[must_use]
    pub const fn prot(&self) -> i32 {
        self.prot
    }

    #[must_use]
    pub const fn flags(&self) -> i32 {
        self.flags
    }

    #[must_use]
    pub const fn file_offset_bytes(&self) -> u64 {
        self.file_offset_bytes
    }
}

/// Snapshot of the mapped file's stat metadata at record time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub inode: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub mtime: i64,
}

impl FileStat {
    /// Snapshot from live filesystem metadata.
    #[must_use]
    pub fn of(metadata: &fs::Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            inode: metadata.ino(),
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            size: metadata.size() as i64,
            mtime: metadata.mtime(),
        }
    }
}

/// Why the recorder is establishing this mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingOrigin {
    /// Image mapped during exec.
    Exec,
    /// mmap issued by the recorded task.
    Syscall,
    /// An existing mapping being moved or resized.
    Remap,
    /// A mapping rewritten by instruction patching.
    Patch,
    /// Recorder-owned scratch buffer mapped into the task.
    Buffer,
}

/// Backing source chosen by the classifier, as written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackingSource {
    /// Replayer maps zero-filled pages.
    Zero,
    /// Bytes follow in the trace's raw-data stream.
    Trace,
    /// Bytes come from a file; relative names resolve against the trace
    /// directory.
    File { backing_file_name: String },
}

/// Backing source as seen by the replayer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappedDataSource {
    Zero,
    Trace,
    File,
}

/// Replayer-side description of where a mapping's bytes live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedData {
    /// Frame the mapping record belongs to.
    pub time: FrameTime,
    pub source: MappedDataSource,
    /// For `File` sources: resolved path of the backing file.
    pub file_name: PathBuf,
    /// For `File` sources: byte offset of the mapped region in the file.
    pub data_offset_bytes: u64,
    /// Recorded size of the backing file.
    pub file_size_bytes: i64,
}

/// Whether the caller must stream the mapping's bytes into the trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordInTrace {
    RecordInTrace,
    DontRecordInTrace,
}

/// Stat-snapshot validation mode for file-backed mappings at replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidateSourceFile {
    Validate,
    DontValidate,
}

/// Whether a mapping read may consume records from future frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeConstraint {
    /// Only consume a record stamped with the current frame time.
    CurrentTimeOnly,
    AnyTime,
}

/// Copy-eligibility heuristic for file-backed mappings.
///
/// Files nobody can write are assumed immutable, as are private mappings
/// of executable images (program text on networked or package-managed
/// filesystems). Everything else gets copied into the trace so later
/// modification of the file cannot diverge replay.
#[must_use]
pub fn should_copy_mmap_region(km: &KernelMapping, stat: &FileStat) -> bool {
    if stat.mode & 0o222 == 0 {
        return false;
    }
    let private_mapping = km.flags() & libc::MAP_PRIVATE != 0;
    if private_mapping && stat.mode & 0o111 != 0 {
        return false;
    }
    true
}
