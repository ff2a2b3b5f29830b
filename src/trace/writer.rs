//! Writer core: records a trace into six compressed substreams.
//!
//! Construction creates the trace directory, opens every substream,
//! writes the version file (version line plus framed header message), and
//! probes the filesystem for reflink support. After that the writer is a
//! plain record sink; only `write_frame` advances the logical clock, and
//! auxiliary records attach to the current frame by carrying its time.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::compress::CompressedWriter;

use super::dir::{base_file_name, version_file_path, TraceLocator};
use super::errors::TraceWriteError;
use super::frame::{BasicInfo, FrameTime, TraceFrame};
use super::mapping::{
    should_copy_mmap_region, BackingSource, FileStat, KernelMapping, MappedData, MappedDataSource,
    MappingOrigin, RecordInTrace,
};
use super::raw::{GenericHeader, RawDataHeader};
use super::schema::{self, mmap_msg, task_event_msg, HeaderMsg, MMapMsg, TaskEventMsg};
use super::stream::TraceStream;
use super::substream::Substream;
use super::task_event::TaskEventKind;
use super::TRACE_VERSION;

/// Recording metadata embedded in the trace header.
///
/// CPUID records must be collected after any CPU binding is in place,
/// since they depend on the bound CPU; the engine takes them as bytes and
/// does not interpret them.
#[derive(Clone, Debug)]
pub struct TraceMetadata {
    /// CPU the recording is bound to, or -1 for unbound.
    pub bind_to_cpu: i32,
    pub has_cpuid_faulting: bool,
    /// Raw CPUID record bytes for the bound CPU.
    pub cpuid_records: Vec<u8>,
    /// Whether the mapping classifier may reflink mapped files into the
    /// trace.
    pub use_file_cloning: bool,
}

impl Default for TraceMetadata {
    fn default() -> Self {
        Self {
            bind_to_cpu: -1,
            has_cpuid_faulting: false,
            cpuid_records: Vec::new(),
            use_file_cloning: true,
        }
    }
}

/// Records a trace. One writer owns its directory exclusively until
/// `close`.
pub struct TraceWriter {
    stream: TraceStream,
    writers: Vec<CompressedWriter>,
    uuid: [u8; 16],
    use_file_cloning: bool,
    supports_file_data_cloning: bool,
    /// Monotonic counter naming `mmap_clone_*` / `mmap_hardlink_*` files.
    mmap_count: u32,
    /// `(dev, inode)` pairs recorded by original path on the assumption
    /// that nobody rewrites them. Writer-local; never persisted.
    files_assumed_immutable: HashSet<(u64, u64)>,
}

impl TraceWriter {
    /// Creates a trace directory under `locator` for `exe_path` and opens
    /// it for recording. The logical clock starts at 1.
    pub fn create(
        locator: &TraceLocator,
        exe_path: &str,
        meta: &TraceMetadata,
    ) -> Result<Self, TraceWriteError> {
        let trace_dir = locator.make_trace_dir(exe_path)?;

        let mut writers = Vec::with_capacity(Substream::COUNT);
        for substream in Substream::ALL {
            let path = trace_dir.join(substream.name());
            let writer =
                CompressedWriter::create(&path, substream.block_size(), substream.threads())
                    .map_err(|source| TraceWriteError::OpenSubstream {
                        substream,
                        path,
                        source,
                    })?;
            writers.push(writer);
        }

        let version_path = version_file_path(&trace_dir);
        let mut version_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&version_path)
            .map_err(|source| TraceWriteError::VersionFile {
                path: version_path.clone(),
                source,
            })?;

        let uuid = *Uuid::new_v4().as_bytes();
        let header = HeaderMsg {
            bind_to_cpu: meta.bind_to_cpu,
            has_cpuid_faulting: meta.has_cpuid_faulting,
            cpuid_records: meta.cpuid_records.clone(),
            uuid: uuid.to_vec(),
        };
        version_file
            .write_all(format!("{TRACE_VERSION}\n").as_bytes())
            .map_err(|source| TraceWriteError::VersionFile {
                path: version_path.clone(),
                source,
            })?;
        schema::write_message(&mut version_file, &header).map_err(|source| {
            TraceWriteError::VersionFile {
                path: version_path.clone(),
                source,
            }
        })?;

        let supports_file_data_cloning = probe_file_data_cloning(&version_file, &trace_dir)?;

        Ok(Self {
            stream: TraceStream::new(trace_dir, 1),
            writers,
            uuid,
            use_file_cloning: meta.use_file_cloning,
            supports_file_data_cloning,
            mmap_count: 0,
            files_assumed_immutable: HashSet::new(),
        })
    }

    /// Directory the trace is being recorded into.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.stream.dir()
    }

    /// Current logical time; the time the next frame must carry.
    #[must_use]
    pub fn time(&self) -> FrameTime {
        self.stream.time()
    }

    /// The trace's random identifier, as written to the header.
    #[must_use]
    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// Whether the clone probe found reflink support on the trace
    /// filesystem. A hint for higher layers; the classifier discovers
    /// clone failures on its own.
    #[must_use]
    pub fn supports_file_data_cloning(&self) -> bool {
        self.supports_file_data_cloning
    }

    /// Name reserved for per-task cloned file data
    /// (`cloned_data_<tid>_<serial>`).
    #[must_use]
    pub fn file_data_clone_file_name(&self, tid: i32, serial: u32) -> PathBuf {
        self.stream.file_data_clone_file_name(tid, serial)
    }

    /// True iff every substream is healthy.
    #[must_use]
    pub fn good(&self) -> bool {
        self.writers.iter().all(CompressedWriter::good)
    }

    /// Appends an event frame and advances the logical clock.
    ///
    /// This is the only operation that ticks the clock; one logical event
    /// corresponds to exactly one events-stream record.
    pub fn write_frame(&mut self, frame: &TraceFrame) -> Result<(), TraceWriteError> {
        debug_assert_eq!(frame.time(), self.stream.time(), "frame written out of order");

        let basic = BasicInfo::from_frame(frame);
        let events = self.writer(Substream::Events);
        events
            .write_all(&basic.encode())
            .map_err(write_err(Substream::Events))?;

        if let Some(info) = frame.exec_info() {
            let extra_len = info.extra_regs.data().len() as u32;
            events
                .write_all(&[info.regs.arch().as_tag()])
                .map_err(write_err(Substream::Events))?;
            events
                .write_all(info.regs.as_bytes())
                .map_err(write_err(Substream::Events))?;
            events
                .write_all(&[info.extra_regs.format().as_tag()])
                .map_err(write_err(Substream::Events))?;
            events
                .write_all(&extra_len.to_le_bytes())
                .map_err(write_err(Substream::Events))?;
            if extra_len > 0 {
                events
                    .write_all(info.extra_regs.data())
                    .map_err(write_err(Substream::Events))?;
            }
        }

        self.stream.tick_time();
        Ok(())
    }

    /// Appends a task lifecycle record stamped with the current frame
    /// time.
    pub fn write_task_event(
        &mut self,
        tid: i32,
        event: &TaskEventKind,
    ) -> Result<(), TraceWriteError> {
        let variant = match event {
            TaskEventKind::Clone {
                parent_tid,
                own_ns_tid,
                flags,
            } => task_event_msg::Variant::Clone(task_event_msg::CloneMsg {
                parent_tid: *parent_tid,
                own_ns_tid: *own_ns_tid,
                flags: *flags,
            }),
            TaskEventKind::Exec {
                file_name,
                cmd_line,
            } => task_event_msg::Variant::Exec(task_event_msg::ExecMsg {
                file_name: file_name.clone().into_bytes(),
                cmd_line: cmd_line.iter().map(|arg| arg.clone().into_bytes()).collect(),
            }),
            TaskEventKind::Exit { exit_status } => {
                task_event_msg::Variant::Exit(task_event_msg::ExitMsg {
                    exit_status: *exit_status,
                })
            }
        };
        let msg = TaskEventMsg {
            frame_time: self.stream.time(),
            tid,
            variant: Some(variant),
        };
        schema::write_message(self.writer(Substream::Tasks), &msg)
            .map_err(write_err(Substream::Tasks))
    }

    /// Classifies a mapping's backing source, appends the mapping record,
    /// and tells the caller whether to stream the mapped bytes via
    /// [`Self::write_raw`].
    pub fn write_mapped_region(
        &mut self,
        km: &KernelMapping,
        stat: &FileStat,
        origin: MappingOrigin,
    ) -> Result<RecordInTrace, TraceWriteError> {
        let source = self.classify_backing_source(km, stat, origin);
        let record_in_trace = match source {
            BackingSource::Trace => RecordInTrace::RecordInTrace,
            _ => RecordInTrace::DontRecordInTrace,
        };

        let msg = mmap_record(self.stream.time(), km, stat, &source);
        schema::write_message(self.writer(Substream::Mmaps), &msg)
            .map_err(write_err(Substream::Mmaps))?;

        self.mmap_count += 1;
        Ok(record_in_trace)
    }

    /// Appends a mapping record with a caller-supplied backing decision to
    /// an arbitrary mmaps stream.
    ///
    /// Used by tools that rewrite a trace's mapping stream; the record
    /// carries `data.time` rather than this writer's clock and only the
    /// file size from the stat snapshot.
    pub fn write_mapped_region_to_stream(
        mmaps: &mut CompressedWriter,
        data: &MappedData,
        km: &KernelMapping,
    ) -> Result<(), TraceWriteError> {
        let source = match data.source {
            MappedDataSource::Zero => BackingSource::Zero,
            MappedDataSource::Trace => BackingSource::Trace,
            MappedDataSource::File => BackingSource::File {
                backing_file_name: data.file_name.to_string_lossy().into_owned(),
            },
        };
        let stat = FileStat {
            size: data.file_size_bytes,
            ..FileStat::default()
        };
        let msg = mmap_record(data.time, km, &stat, &source);
        schema::write_message(mmaps, &msg).map_err(write_err(Substream::Mmaps))
    }

    /// Appends one raw capture: the descriptor to `data_header`, the
    /// payload to `data`.
    pub fn write_raw(&mut self, rec_tid: i32, addr: u64, data: &[u8]) -> Result<(), TraceWriteError> {
        let header = RawDataHeader {
            time: self.stream.time(),
            rec_tid,
            addr,
            len: data.len() as u64,
        };
        self.writer(Substream::RawDataHeader)
            .write_all(&header.encode())
            .map_err(write_err(Substream::RawDataHeader))?;
        self.writer(Substream::RawData)
            .write_all(data)
            .map_err(write_err(Substream::RawData))
    }

    /// Appends one generic record stamped with the current frame time.
    pub fn write_generic(&mut self, data: &[u8]) -> Result<(), TraceWriteError> {
        let header = GenericHeader {
            time: self.stream.time(),
            len: data.len() as u64,
        };
        let generic = self.writer(Substream::Generic);
        generic
            .write_all(&header.encode())
            .map_err(write_err(Substream::Generic))?;
        generic
            .write_all(data)
            .map_err(write_err(Substream::Generic))
    }

    /// Finalizes all six substreams. After a successful close the trace
    /// directory is a complete replayable artifact.
    pub fn close(&mut self) -> Result<(), TraceWriteError> {
        for (index, writer) in self.writers.iter_mut().enumerate() {
            writer.close().map_err(write_err(Substream::ALL[index]))?;
        }
        Ok(())
    }

    /// Points the root's "latest trace" symlink at this trace,
    /// best-effort.
    pub fn make_latest_trace(&self, locator: &TraceLocator) -> io::Result<()> {
        locator.update_latest_symlink(self.stream.dir())
    }

    fn writer(&mut self, substream: Substream) -> &mut CompressedWriter {
        &mut self.writers[substream.index()]
    }

    /// Selects the backing source for a mapping. First matching rule
    /// wins:
    ///
    /// 1. Remap/patch origins re-cover existing pages: zero.
    /// 2. SysV shared memory has no stable file: copy into the trace.
    /// 3. Anonymous-style syscall mappings: zero.
    /// 4. Recorder scratch buffers: zero.
    /// 5. Private file mapping that reflinks cheaply: the clone.
    /// 6. Copy-eligible and not yet assumed immutable: copy into the
    ///    trace.
    /// 7. Otherwise pin the file: reflink, else hardlink, else record the
    ///    original path, and assume the file immutable from here on.
    fn classify_backing_source(
        &mut self,
        km: &KernelMapping,
        stat: &FileStat,
        origin: MappingOrigin,
    ) -> BackingSource {
        if matches!(origin, MappingOrigin::Remap | MappingOrigin::Patch) {
            return BackingSource::Zero;
        }
        if km.fsname().starts_with("/SYSV") {
            return BackingSource::Trace;
        }
        if origin == MappingOrigin::Syscall
            && (km.inode() == 0 || km.fsname() == "/dev/zero (deleted)")
        {
            return BackingSource::Zero;
        }
        if origin == MappingOrigin::Buffer {
            return BackingSource::Zero;
        }
        if km.flags() & libc::MAP_PRIVATE != 0 {
            if let Some(backing_file_name) = self.try_clone_file(km.fsname()) {
                return BackingSource::File { backing_file_name };
            }
        }
        if should_copy_mmap_region(km, stat)
            && !self.files_assumed_immutable.contains(&(stat.dev, stat.inode))
        {
            return BackingSource::Trace;
        }
        // The heuristics decided mapping the file at replay is OK even if
        // it's MAP_SHARED. Clone anyway so the file changing between
        // record and replay can't hurt; hardlinking at least survives
        // deletion or replacement (not in-place rewrites).
        let backing_file_name = match self.try_clone_file(km.fsname()) {
            Some(name) => name,
            None => {
                let name = self.try_hardlink_file(km.fsname());
                self.files_assumed_immutable.insert((stat.dev, stat.inode));
                name
            }
        };
        BackingSource::File { backing_file_name }
    }

    /// Reflinks `file_name` into the trace as
    /// `mmap_clone_<n>_<basename>`. Any failure rolls back the
    /// destination and reports `None`.
    fn try_clone_file(&self, file_name: &str) -> Option<String> {
        if !self.use_file_cloning {
            return None;
        }
        let name = format!("mmap_clone_{}_{}", self.mmap_count, base_file_name(file_name));
        let src = File::open(file_name).ok()?;
        let dest_path = self.stream.dir().join(&name);
        let dest = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o700)
            .open(&dest_path)
            .ok()?;

        let ret = unsafe { libc::ioctl(dest.as_raw_fd(), libc::FICLONE, src.as_raw_fd()) };
        if ret < 0 {
            // Cross-filesystem, or the filesystem doesn't support clones.
            drop(dest);
            let _ = std::fs::remove_file(&dest_path);
            return None;
        }
        Some(name)
    }

    /// Hardlinks `file_name` into the trace as
    /// `mmap_hardlink_<n>_<basename>`; on failure (cross-filesystem, for
    /// example) returns the original path verbatim.
    fn try_hardlink_file(&self, file_name: &str) -> String {
        let name = format!(
            "mmap_hardlink_{}_{}",
            self.mmap_count,
            base_file_name(file_name)
        );
        match std::fs::hard_link(file_name, self.stream.dir().join(&name)) {
            Ok(()) => name,
            Err(_) => file_name.to_string(),
        }
    }
}

fn write_err(substream: Substream) -> impl FnOnce(io::Error) -> TraceWriteError {
    move |source| TraceWriteError::Write { substream, source }
}

fn mmap_record(
    time: FrameTime,
    km: &KernelMapping,
    stat: &FileStat,
    source: &BackingSource,
) -> MMapMsg {
    let source = match source {
        BackingSource::Zero => mmap_msg::Source::Zero(mmap_msg::ZeroMsg {}),
        BackingSource::Trace => mmap_msg::Source::Trace(mmap_msg::TraceMsg {}),
        BackingSource::File { backing_file_name } => mmap_msg::Source::File(mmap_msg::FileMsg {
            backing_file_name: backing_file_name.clone().into_bytes(),
        }),
    };
    MMapMsg {
        frame_time: time,
        start: km.start(),
        end: km.end(),
        fsname: km.fsname().as_bytes().to_vec(),
        device: km.device(),
        inode: km.inode(),
        prot: km.prot(),
        flags: km.flags(),
        file_offset_bytes: km.file_offset_bytes(),
        stat_mode: stat.mode,
        stat_uid: stat.uid,
        stat_gid: stat.gid,
        stat_size: stat.size,
        stat_mtime: stat.mtime,
        source: Some(source),
    }
}

/// Probes reflink support by range-cloning the version file into a
/// throwaway file in the trace directory. The throwaway is always
/// unlinked; only its creation failing is an error.
fn probe_file_data_cloning(version_file: &File, trace_dir: &Path) -> Result<bool, TraceWriteError> {
    let probe_path = trace_dir.join("tmp_clone");
    let probe = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&probe_path)
        .map_err(|source| TraceWriteError::CloneProbe {
            path: probe_path.clone(),
            source,
        })?;

    let src_length = version_file
        .metadata()
        .map_err(|source| TraceWriteError::CloneProbe {
            path: probe_path.clone(),
            source,
        })?
        .len();
    let args = libc::file_clone_range {
        src_fd: i64::from(version_file.as_raw_fd()),
        src_offset: 0,
        src_length,
        dest_offset: 0,
    };
    let ret = unsafe { libc::ioctl(probe.as_raw_fd(), libc::FICLONERANGE, &args) };
    drop(probe);
    let _ = std::fs::remove_file(&probe_path);
    Ok(ret == 0)
}
