//! Reader core: replays a trace from six compressed substreams.
//!
//! Opening validates the version file (exact match against
//! [`super::TRACE_VERSION`]) and decodes the header message that follows
//! the version line on the same descriptor position. The logical clock
//! starts at 0 so the first frame read lands on the recorder's initial
//! time of 1.
//!
//! Speculative reads (`peek_frame`, `CurrentTimeOnly` mapping reads, the
//! conditional raw/generic readers) use the substream checkpoint API and
//! never disturb any other substream or the clock.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::compress::CompressedReader;

use super::dir::{version_file_path, TraceLocator};
use super::errors::{TraceOpenError, TraceReadError};
use super::frame::{
    BasicInfo, ExtraRegFormat, ExtraRegisters, FrameTime, Registers, SupportedArch, TraceFrame,
    MAX_USER_REGS_SIZE,
};
use super::mapping::{
    KernelMapping, MappedData, MappedDataSource, TimeConstraint, ValidateSourceFile,
};
use super::raw::{GenericHeader, RawData, RawDataHeader};
use super::schema::{self, mmap_msg, task_event_msg, HeaderMsg, MMapMsg, TaskEventMsg};
use super::stream::TraceStream;
use super::substream::Substream;
use super::task_event::{TaskEventKind, TraceTaskEvent};
use super::TRACE_VERSION;

/// Longest version line the reader will accept.
const MAX_VERSION_LINE: usize = 32;

/// Upper bound on a single raw capture's declared length; no recorder
/// produces more, so anything larger is a corrupt header.
const MAX_RAW_DATA_LEN: u64 = 1 << 32;

/// Backing-file names with this prefix were reflinked into the trace at
/// record time and skip stat validation.
const CLONE_PREFIX: &str = "mmap_clone_";

/// Replays a trace. Cloning yields an independent cursor for speculative
/// reads.
#[derive(Debug)]
pub struct TraceReader {
    stream: TraceStream,
    readers: Vec<CompressedReader>,
    bind_to_cpu: i32,
    uses_cpuid_faulting: bool,
    cpuid_records: Vec<u8>,
    uuid: [u8; 16],
}

impl TraceReader {
    /// Opens the trace at `dir` for replay.
    pub fn open(dir: &Path) -> Result<Self, TraceOpenError> {
        let trace_dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());

        let version_path = version_file_path(&trace_dir);
        let mut version_file = File::open(&version_path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                TraceOpenError::NotFound {
                    path: version_path.clone(),
                }
            } else {
                TraceOpenError::Unreadable {
                    path: version_path.clone(),
                    source,
                }
            }
        })?;

        let version_line = read_version_line(&mut version_file, &version_path)?;
        let version: i64 =
            version_line
                .parse()
                .map_err(|_| TraceOpenError::MalformedVersion {
                    path: version_path.clone(),
                    raw: version_line.clone(),
                })?;
        if version != i64::from(TRACE_VERSION) {
            return Err(TraceOpenError::VersionMismatch {
                path: version_path,
                found: version,
            });
        }

        // The header message starts at the byte right after the newline,
        // on the same descriptor position.
        let header: HeaderMsg = schema::read_message(&mut version_file).map_err(|source| {
            TraceOpenError::MalformedHeader {
                path: version_path.clone(),
                source,
            }
        })?;
        let uuid: [u8; 16] =
            header
                .uuid
                .as_slice()
                .try_into()
                .map_err(|_| TraceOpenError::MalformedHeader {
                    path: version_path.clone(),
                    source: schema::CodecError::Decode(prost::DecodeError::new(
                        "header uuid must be 16 bytes",
                    )),
                })?;

        let mut readers = Vec::with_capacity(Substream::COUNT);
        for substream in Substream::ALL {
            let path = trace_dir.join(substream.name());
            let reader =
                CompressedReader::open(&path).map_err(|source| TraceOpenError::OpenSubstream {
                    substream,
                    path,
                    source,
                })?;
            readers.push(reader);
        }

        Ok(Self {
            // Time 0, so the first frame read ticks to the recorder's
            // initial time of 1.
            stream: TraceStream::new(trace_dir, 0),
            readers,
            bind_to_cpu: header.bind_to_cpu,
            uses_cpuid_faulting: header.has_cpuid_faulting,
            cpuid_records: header.cpuid_records,
            uuid,
        })
    }

    /// Opens the most recently recorded trace under `locator`, via the
    /// "latest trace" symlink.
    pub fn open_latest(locator: &TraceLocator) -> Result<Self, TraceOpenError> {
        Self::open(&locator.latest_trace_symlink())
    }

    /// Returns an independent reader at the same logical position.
    ///
    /// Advancing either reader does not affect the other; both observe
    /// identical upcoming records.
    pub fn try_clone(&self) -> std::io::Result<Self> {
        let mut readers = Vec::with_capacity(self.readers.len());
        for reader in &self.readers {
            readers.push(reader.try_clone()?);
        }
        Ok(Self {
            stream: self.stream.clone(),
            readers,
            bind_to_cpu: self.bind_to_cpu,
            uses_cpuid_faulting: self.uses_cpuid_faulting,
            cpuid_records: self.cpuid_records.clone(),
            uuid: self.uuid,
        })
    }

    /// Directory the trace is replayed from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.stream.dir()
    }

    /// Time of the most recently read frame (0 before the first read).
    #[must_use]
    pub fn time(&self) -> FrameTime {
        self.stream.time()
    }

    #[must_use]
    pub fn bind_to_cpu(&self) -> i32 {
        self.bind_to_cpu
    }

    #[must_use]
    pub fn uses_cpuid_faulting(&self) -> bool {
        self.uses_cpuid_faulting
    }

    /// Raw CPUID record bytes captured at record time.
    #[must_use]
    pub fn cpuid_records(&self) -> &[u8] {
        &self.cpuid_records
    }

    /// The trace's random identifier from the header.
    #[must_use]
    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// Name reserved for per-task cloned file data
    /// (`cloned_data_<tid>_<serial>`).
    #[must_use]
    pub fn file_data_clone_file_name(&self, tid: i32, serial: u32) -> PathBuf {
        self.stream.file_data_clone_file_name(tid, serial)
    }

    /// True iff the events stream is exhausted.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.readers[Substream::Events.index()].at_end()
    }

    /// Reads the next event frame, advancing the logical clock.
    pub fn read_frame(&mut self) -> Result<TraceFrame, TraceReadError> {
        let events = &mut self.readers[Substream::Events.index()];

        let mut basic_bytes = [0u8; BasicInfo::SIZE];
        events
            .read_exact(&mut basic_bytes)
            .map_err(read_err(Substream::Events))?;
        let basic = BasicInfo::decode(&basic_bytes);

        let frame = if basic.event.has_exec_info() {
            let mut tag = [0u8; 1];
            events
                .read_exact(&mut tag)
                .map_err(read_err(Substream::Events))?;
            let arch = SupportedArch::from_tag(tag[0])
                .ok_or(TraceReadError::UnknownArch { tag: tag[0] })?;

            let mut regs_bytes = [0u8; MAX_USER_REGS_SIZE];
            events
                .read_exact(&mut regs_bytes[..arch.user_regs_size()])
                .map_err(read_err(Substream::Events))?;
            let regs = Registers::from_bytes(arch, &regs_bytes[..arch.user_regs_size()]);

            let mut format_tag = [0u8; 1];
            events
                .read_exact(&mut format_tag)
                .map_err(read_err(Substream::Events))?;
            let format = ExtraRegFormat::from_tag(format_tag[0])
                .ok_or(TraceReadError::UnknownExtraRegFormat { tag: format_tag[0] })?;

            let mut len_bytes = [0u8; 4];
            events
                .read_exact(&mut len_bytes)
                .map_err(read_err(Substream::Events))?;
            let extra_len = u32::from_le_bytes(len_bytes);

            let extra_regs = if extra_len > 0 {
                let mut data = vec![0u8; extra_len as usize];
                events
                    .read_exact(&mut data)
                    .map_err(read_err(Substream::Events))?;
                ExtraRegisters::from_raw(format, data)
            } else {
                if format != ExtraRegFormat::None {
                    return Err(TraceReadError::Corrupt {
                        detail: "empty extra-register block with non-empty format",
                    });
                }
                ExtraRegisters::empty()
            };

            TraceFrame::with_exec_info(
                basic.time,
                basic.tid,
                basic.event,
                basic.ticks,
                basic.monotonic_sec,
                regs,
                extra_regs,
            )
        } else {
            TraceFrame::new(
                basic.time,
                basic.tid,
                basic.event,
                basic.ticks,
                basic.monotonic_sec,
            )
        };

        self.stream.tick_time();
        if frame.time() != self.stream.time() {
            return Err(TraceReadError::TimeMismatch {
                got: frame.time(),
                expected: self.stream.time(),
            });
        }
        Ok(frame)
    }

    /// Reads the next frame without consuming it or moving the clock.
    ///
    /// Returns `None` at end of trace.
    pub fn peek_frame(&mut self) -> Result<Option<TraceFrame>, TraceReadError> {
        self.readers[Substream::Events.index()].save_state();
        let saved_time = self.stream.time();
        let result = if self.at_end() {
            Ok(None)
        } else {
            self.read_frame().map(Some)
        };
        self.readers[Substream::Events.index()].restore_state();
        self.stream.set_time(saved_time);
        result
    }

    /// Rewinds every substream to the start of the trace and resets the
    /// clock to 0.
    pub fn rewind(&mut self) {
        for reader in &mut self.readers {
            reader.rewind();
        }
        self.stream.set_time(0);
    }

    /// Reads the next task lifecycle record, or `None` at end of stream.
    pub fn read_task_event(&mut self) -> Result<Option<TraceTaskEvent>, TraceReadError> {
        let tasks = &mut self.readers[Substream::Tasks.index()];
        if tasks.at_end() {
            return Ok(None);
        }
        let msg: TaskEventMsg = schema::read_message(tasks).map_err(codec_err(Substream::Tasks))?;

        let tid = valid_tid(msg.tid)?;
        let kind = match msg.variant {
            Some(task_event_msg::Variant::Clone(clone)) => TaskEventKind::Clone {
                parent_tid: valid_tid(clone.parent_tid)?,
                own_ns_tid: valid_tid(clone.own_ns_tid)?,
                flags: clone.flags,
            },
            Some(task_event_msg::Variant::Exec(exec)) => TaskEventKind::Exec {
                file_name: String::from_utf8_lossy(&exec.file_name).into_owned(),
                cmd_line: exec
                    .cmd_line
                    .iter()
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect(),
            },
            Some(task_event_msg::Variant::Exit(exit)) => TaskEventKind::Exit {
                exit_status: exit.exit_status,
            },
            None => {
                return Err(TraceReadError::Corrupt {
                    detail: "task event without a variant",
                })
            }
        };
        Ok(Some(TraceTaskEvent::new(msg.frame_time, tid, kind)))
    }

    /// Reads the next mapping record.
    ///
    /// With [`TimeConstraint::CurrentTimeOnly`] the read is speculative:
    /// if the upcoming record belongs to a different frame it is left
    /// unconsumed and `None` is returned. With
    /// [`ValidateSourceFile::Validate`], file-backed mappings with a
    /// non-zero stat snapshot are compared against the live file; a
    /// divergence logs a warning and replay continues.
    pub fn read_mapped_region(
        &mut self,
        validate: ValidateSourceFile,
        time_constraint: TimeConstraint,
    ) -> Result<Option<(KernelMapping, MappedData)>, TraceReadError> {
        let mmaps = &mut self.readers[Substream::Mmaps.index()];
        if mmaps.at_end() {
            return Ok(None);
        }

        if time_constraint == TimeConstraint::CurrentTimeOnly {
            mmaps.save_state();
        }
        let msg: Result<MMapMsg, _> = schema::read_message(mmaps);
        let msg = match msg {
            Ok(msg) => msg,
            Err(source) => {
                if time_constraint == TimeConstraint::CurrentTimeOnly {
                    mmaps.restore_state();
                }
                return Err(codec_err(Substream::Mmaps)(source));
            }
        };
        if time_constraint == TimeConstraint::CurrentTimeOnly {
            if msg.frame_time != self.stream.time() {
                mmaps.restore_state();
                return Ok(None);
            }
            mmaps.discard_state();
        }
        if msg.frame_time == 0 {
            return Err(TraceReadError::InvalidFrameTime);
        }

        let fsname = String::from_utf8_lossy(&msg.fsname).into_owned();
        if msg.stat_size < 0 {
            return Err(TraceReadError::Corrupt {
                detail: "negative stat size in mapping record",
            });
        }

        let mut data = MappedData {
            time: msg.frame_time,
            source: MappedDataSource::Zero,
            file_name: PathBuf::new(),
            data_offset_bytes: 0,
            file_size_bytes: msg.stat_size,
        };

        match &msg.source {
            Some(mmap_msg::Source::Zero(_)) => data.source = MappedDataSource::Zero,
            Some(mmap_msg::Source::Trace(_)) => data.source = MappedDataSource::Trace,
            Some(mmap_msg::Source::File(file)) => {
                data.source = MappedDataSource::File;
                let backing_name = String::from_utf8_lossy(&file.backing_file_name).into_owned();
                let is_clone = backing_name.starts_with(CLONE_PREFIX);
                let backing_path = if backing_name.starts_with('/') {
                    PathBuf::from(&backing_name)
                } else {
                    // Relative backing names resolve against the trace
                    // directory.
                    self.stream.dir().join(&backing_name)
                };

                let has_stat_snapshot = msg.stat_mode != 0
                    || msg.stat_uid != 0
                    || msg.stat_gid != 0
                    || msg.stat_mtime != 0;
                if !is_clone && validate == ValidateSourceFile::Validate && has_stat_snapshot {
                    validate_backing_file(&backing_path, &fsname, &msg)?;
                }

                data.file_name = backing_path;
                data.data_offset_bytes = msg.file_offset_bytes;
            }
            None => {
                return Err(TraceReadError::Corrupt {
                    detail: "mapping record without a backing source",
                })
            }
        }

        let km = KernelMapping::new(
            msg.start,
            msg.end,
            fsname,
            msg.device,
            msg.inode,
            msg.prot,
            msg.flags,
            msg.file_offset_bytes,
        );
        Ok(Some((km, data)))
    }

    /// Reads one raw capture: descriptor from `data_header`, payload from
    /// `data`. The descriptor's time must equal the current frame time.
    pub fn read_raw_data(&mut self) -> Result<RawData, TraceReadError> {
        let mut header_bytes = [0u8; RawDataHeader::SIZE];
        self.readers[Substream::RawDataHeader.index()]
            .read_exact(&mut header_bytes)
            .map_err(read_err(Substream::RawDataHeader))?;
        let header = RawDataHeader::decode(&header_bytes);

        if header.time != self.stream.time() {
            return Err(TraceReadError::TimeMismatch {
                got: header.time,
                expected: self.stream.time(),
            });
        }
        if header.len > MAX_RAW_DATA_LEN {
            return Err(TraceReadError::Corrupt {
                detail: "implausible raw data length",
            });
        }

        let mut data = vec![0u8; header.len as usize];
        self.readers[Substream::RawData.index()]
            .read_exact(&mut data)
            .map_err(read_err(Substream::RawData))?;
        Ok(RawData {
            rec_tid: header.rec_tid,
            addr: header.addr,
            data,
        })
    }

    /// Consumes the next raw capture iff it belongs to `frame`.
    ///
    /// A peeked time before `frame` would mean the caller skipped records
    /// it owned; that is a trace-order violation.
    pub fn read_raw_data_for_frame(
        &mut self,
        frame: &TraceFrame,
    ) -> Result<Option<RawData>, TraceReadError> {
        let Some(time) = self.peek_time(Substream::RawDataHeader)? else {
            return Ok(None);
        };
        debug_assert!(time >= frame.time(), "raw data record left behind");
        if time > frame.time() {
            return Ok(None);
        }
        self.read_raw_data().map(Some)
    }

    /// Reads one generic record; its time must equal the current frame
    /// time.
    pub fn read_generic(&mut self) -> Result<Vec<u8>, TraceReadError> {
        let generic = &mut self.readers[Substream::Generic.index()];
        let mut header_bytes = [0u8; GenericHeader::SIZE];
        generic
            .read_exact(&mut header_bytes)
            .map_err(read_err(Substream::Generic))?;
        let header = GenericHeader::decode(&header_bytes);

        if header.time != self.stream.time() {
            return Err(TraceReadError::TimeMismatch {
                got: header.time,
                expected: self.stream.time(),
            });
        }
        if header.len > MAX_RAW_DATA_LEN {
            return Err(TraceReadError::Corrupt {
                detail: "implausible generic record length",
            });
        }

        let mut data = vec![0u8; header.len as usize];
        generic
            .read_exact(&mut data)
            .map_err(read_err(Substream::Generic))?;
        Ok(data)
    }

    /// Consumes the next generic record iff it belongs to `frame`.
    pub fn read_generic_for_frame(
        &mut self,
        frame: &TraceFrame,
    ) -> Result<Option<Vec<u8>>, TraceReadError> {
        let Some(time) = self.peek_time(Substream::Generic)? else {
            return Ok(None);
        };
        debug_assert!(time >= frame.time(), "generic record left behind");
        if time > frame.time() {
            return Ok(None);
        }
        self.read_generic().map(Some)
    }

    /// Total on-disk bytes across all substreams.
    #[must_use]
    pub fn compressed_bytes(&self) -> u64 {
        self.readers
            .iter()
            .map(CompressedReader::compressed_bytes)
            .sum()
    }

    /// Total decompressed bytes across all substreams.
    pub fn uncompressed_bytes(&self) -> std::io::Result<u64> {
        let mut total = 0u64;
        for reader in &self.readers {
            total += reader.uncompressed_bytes()?;
        }
        Ok(total)
    }

    /// Peeks the leading u64 frame time of the next record in a
    /// raw-struct substream, without consuming. `None` at end of stream.
    fn peek_time(&mut self, substream: Substream) -> Result<Option<FrameTime>, TraceReadError> {
        let reader = &mut self.readers[substream.index()];
        if reader.at_end() {
            return Ok(None);
        }
        reader.save_state();
        let mut time_bytes = [0u8; 8];
        let result = reader.read_exact(&mut time_bytes);
        reader.restore_state();
        result.map_err(read_err(substream))?;
        Ok(Some(u64::from_le_bytes(time_bytes)))
    }
}

/// Reads bytes up to the first newline into a version string.
///
/// One byte at a time, so the descriptor position lands exactly on the
/// header message that follows the newline.
fn read_version_line(file: &mut File, path: &Path) -> Result<String, TraceOpenError> {
    let mut line = String::new();
    loop {
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte)
            .map_err(|source| TraceOpenError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;
        if byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() >= MAX_VERSION_LINE || !byte[0].is_ascii() {
            return Err(TraceOpenError::MalformedVersion {
                path: path.to_path_buf(),
                raw: line,
            });
        }
        line.push(char::from(byte[0]));
    }
}

fn read_err(substream: Substream) -> impl FnOnce(std::io::Error) -> TraceReadError {
    move |source| TraceReadError::Read { substream, source }
}

fn codec_err(substream: Substream) -> impl FnOnce(schema::CodecError) -> TraceReadError {
    move |source| TraceReadError::Codec { substream, source }
}

fn valid_tid(tid: i32) -> Result<i32, TraceReadError> {
    if tid <= 0 {
        return Err(TraceReadError::Corrupt {
            detail: "non-positive tid in task event",
        });
    }
    Ok(tid)
}

/// Compares the live backing file against the recorded stat snapshot.
///
/// A mismatch means replay divergence is likely; log it and keep going,
/// since the divergence may land in state the replay never looks at.
fn validate_backing_file(
    backing_path: &Path,
    fsname: &str,
    msg: &MMapMsg,
) -> Result<(), TraceReadError> {
    let live = std::fs::metadata(backing_path).map_err(|source| {
        TraceReadError::BackingFileStat {
            path: backing_path.to_path_buf(),
            source,
        }
    })?;

    use std::os::unix::fs::MetadataExt;
    if live.ino() != msg.inode
        || live.mode() != msg.stat_mode
        || live.uid() != msg.stat_uid
        || live.gid() != msg.stat_gid
        || live.size() as i64 != msg.stat_size
        || live.mtime() != msg.stat_mtime
    {
        warn!(
            fsname = %fsname,
            backing_file = %backing_path.display(),
            live_inode = live.ino(),
            recorded_inode = msg.inode,
            live_size = live.size(),
            recorded_size = msg.stat_size,
            live_mtime = live.mtime(),
            recorded_mtime = msg.stat_mtime,
            "backing file metadata changed; replay divergence likely, continuing anyway"
        );
    }
    Ok(())
}
