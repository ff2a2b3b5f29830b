//! Trace persistence: the on-disk record/replay artifact.
//!
//! A trace is a directory holding a `version` file plus six compressed
//! substreams that share one logical clock. The modules here split along
//! the natural seams:
//!
//! 1. `substream` names the six streams and their compression parameters.
//! 2. `frame`, `raw`, `task_event`, `mapping` define the record types and
//!    their fixed little-endian layouts where raw dumps are used.
//! 3. `schema` defines the packed messages (header, tasks, mmaps) and the
//!    length-delimited framing shared by substreams and the version file.
//! 4. `dir` locates and creates trace directories and maintains the
//!    `latest-trace` symlink.
//! 5. `writer` and `reader` are the record/replay endpoints.
//!
//! # Invariants
//! - Every record carrying a frame time is written at the writer's current
//!   `global_time`; readers verify the time they decode.
//! - Only event frames advance the clock; auxiliary records attach to the
//!   current frame by carrying its time.
//! - Raw-data headers and raw-data payloads advance in lock-step.

pub mod dir;
pub mod errors;
pub mod frame;
pub mod mapping;
pub mod raw;
pub mod schema;
pub mod substream;
pub mod task_event;

mod reader;
mod stream;
mod writer;

pub use dir::TraceLocator;
pub use errors::{TraceOpenError, TraceReadError, TraceWriteError, EX_DATAERR};
pub use frame::{
    EncodedEvent, ExecInfo, ExtraRegFormat, ExtraRegisters, FrameTime, Registers, SupportedArch,
    Ticks, TraceFrame,
};
pub use mapping::{
    should_copy_mmap_region, BackingSource, FileStat, KernelMapping, MappedData, MappedDataSource,
    MappingOrigin, RecordInTrace, TimeConstraint, ValidateSourceFile,
};
pub use raw::RawData;
pub use reader::TraceReader;
pub use substream::Substream;
pub use task_event::{TaskEventKind, TraceTaskEvent};
pub use writer::{TraceMetadata, TraceWriter};

/// On-disk trace format version.
///
/// This tracks the trace format, not the crate version; bump it on any
/// change to the layout of the substreams or the version file, or every
/// existing trace becomes unreplayable without the reader saying why.
pub const TRACE_VERSION: u32 = 85;
