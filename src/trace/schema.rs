//! Packed-message schema and stream framing.
//!
//! Three record types are schema-encoded rather than raw-dumped: the trace
//! header in the `version` file, task events, and mapping records. Each is
//! framed as a varint length prefix followed by the packed message, both
//! inside compressed substreams and in the version file. The field tags
//! below are part of the on-disk contract; renumbering them is a format
//! change.

use std::fmt;
use std::io::{self, Read, Write};

use prost::Message;

/// Trace metadata header, appended to the `version` file after the
/// version line.
#[derive(Clone, PartialEq, Message)]
pub struct HeaderMsg {
    /// CPU the recording was bound to, or -1.
    #[prost(int32, tag = "1")]
    pub bind_to_cpu: i32,
    #[prost(bool, tag = "2")]
    pub has_cpuid_faulting: bool,
    /// Raw CPUID record bytes captured on the bound CPU.
    #[prost(bytes = "vec", tag = "3")]
    pub cpuid_records: Vec<u8>,
    /// 16 random bytes identifying the trace.
    #[prost(bytes = "vec", tag = "4")]
    pub uuid: Vec<u8>,
}

/// One record of the tasks substream.
#[derive(Clone, PartialEq, Message)]
pub struct TaskEventMsg {
    #[prost(uint64, tag = "1")]
    pub frame_time: u64,
    #[prost(int32, tag = "2")]
    pub tid: i32,
    #[prost(oneof = "task_event_msg::Variant", tags = "3, 4, 5")]
    pub variant: Option<task_event_msg::Variant>,
}

pub mod task_event_msg {
    use prost::{Message, Oneof};

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Variant {
        #[prost(message, tag = "3")]
        Clone(CloneMsg),
        #[prost(message, tag = "4")]
        Exec(ExecMsg),
        #[prost(message, tag = "5")]
        Exit(ExitMsg),
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct CloneMsg {
        #[prost(int32, tag = "1")]
        pub parent_tid: i32,
        #[prost(int32, tag = "2")]
        pub own_ns_tid: i32,
        #[prost(uint64, tag = "3")]
        pub flags: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ExecMsg {
        #[prost(bytes = "vec", tag = "1")]
        pub file_name: Vec<u8>,
        #[prost(bytes = "vec", repeated, tag = "2")]
        pub cmd_line: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ExitMsg {
        #[prost(int32, tag = "1")]
        pub exit_status: i32,
    }
}

/// One record of the mmaps substream.
#[derive(Clone, PartialEq, Message)]
pub struct MMapMsg {
    #[prost(uint64, tag = "1")]
    pub frame_time: u64,
    #[prost(uint64, tag = "2")]
    pub start: u64,
    #[prost(uint64, tag = "3")]
    pub end: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub fsname: Vec<u8>,
    #[prost(uint64, tag = "5")]
    pub device: u64,
    #[prost(uint64, tag = "6")]
    pub inode: u64,
    #[prost(int32, tag = "7")]
    pub prot: i32,
    #[prost(int32, tag = "8")]
    pub flags: i32,
    #[prost(uint64, tag = "9")]
    pub file_offset_bytes: u64,
    #[prost(uint32, tag = "10")]
    pub stat_mode: u32,
    #[prost(uint32, tag = "11")]
    pub stat_uid: u32,
    #[prost(uint32, tag = "12")]
    pub stat_gid: u32,
    #[prost(int64, tag = "13")]
    pub stat_size: i64,
    #[prost(int64, tag = "14")]
    pub stat_mtime: i64,
    #[prost(oneof = "mmap_msg::Source", tags = "15, 16, 17")]
    pub source: Option<mmap_msg::Source>,
}

pub mod mmap_msg {
    use prost::{Message, Oneof};

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Source {
        #[prost(message, tag = "15")]
        Zero(ZeroMsg),
        #[prost(message, tag = "16")]
        Trace(TraceMsg),
        #[prost(message, tag = "17")]
        File(FileMsg),
    }

    #[derive(Clone, Copy, PartialEq, Message)]
    pub struct ZeroMsg {}

    #[derive(Clone, Copy, PartialEq, Message)]
    pub struct TraceMsg {}

    #[derive(Clone, PartialEq, Message)]
    pub struct FileMsg {
        #[prost(bytes = "vec", tag = "1")]
        pub backing_file_name: Vec<u8>,
    }
}

/// Hard cap on a framed message's length.
///
/// Bounds the allocation performed on behalf of an untrusted length
/// prefix.
const MAX_MESSAGE_LEN: u64 = 1 << 30;

/// Decode-side failures of the framing layer.
#[derive(Debug)]
#[non_exhaustive]
pub enum CodecError {
    /// I/O error reading the frame.
    Io(io::Error),
    /// The message payload failed to decode.
    Decode(prost::DecodeError),
    /// The varint length prefix was truncated or overlong.
    MalformedLength,
    /// The length prefix exceeds [`MAX_MESSAGE_LEN`].
    MessageTooLarge { len: u64 },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error reading message: {err}"),
            Self::Decode(err) => write!(f, "malformed message: {err}"),
            Self::MalformedLength => write!(f, "malformed message length prefix"),
            Self::MessageTooLarge { len } => {
                write!(f, "message length {len} exceeds limit {MAX_MESSAGE_LEN}")
            }
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Decode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Writes one length-delimited packed message.
pub fn write_message<M: Message>(writer: &mut impl Write, msg: &M) -> io::Result<()> {
    let buf = msg.encode_length_delimited_to_vec();
    writer.write_all(&buf)
}

/// Reads one length-delimited packed message.
///
/// The length prefix is consumed byte-at-a-time so the reader's position
/// ends exactly after the message, with no lookahead.
pub fn read_message<M: Message + Default>(reader: &mut impl Read) -> Result<M, CodecError> {
    let len = read_varint(reader)?;
    if len > MAX_MESSAGE_LEN {
        return Err(CodecError::MessageTooLarge { len });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    M::decode(buf.as_slice()).map_err(CodecError::Decode)
}

fn read_varint(reader: &mut impl Read) -> Result<u64, CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        if shift >= 64 {
            return Err(CodecError::MalformedLength);
        }
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
