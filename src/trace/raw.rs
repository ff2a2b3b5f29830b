//! Fixed-layout headers for the raw-data and generic substreams.
//!
//! Raw captures are split across two streams: a descriptor in
//! `data_header` and the payload bytes in `data`. The i-th descriptor
//! always describes the i-th payload. Generic records keep descriptor and
//! payload in one stream.
//!
//! # `RawDataHeader` layout (28 bytes, little-endian)
//! - `global_time` (u64)
//! - `rec_tid` (i32)
//! - `addr` (u64)
//! - `len` (u64)
//!
//! # Generic record layout
//! - `global_time` (u64)
//! - `len` (u64)
//! - `len` payload bytes

use super::frame::FrameTime;

/// Descriptor for one raw capture, stored in `data_header`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RawDataHeader {
    pub time: FrameTime,
    pub rec_tid: i32,
    pub addr: u64,
    pub len: u64,
}

impl RawDataHeader {
    pub const SIZE: usize = 28;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.time.to_le_bytes());
        out[8..12].copy_from_slice(&self.rec_tid.to_le_bytes());
        out[12..20].copy_from_slice(&self.addr.to_le_bytes());
        out[20..28].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let mut u64_buf = [0u8; 8];
        let mut u32_buf = [0u8; 4];

        u64_buf.copy_from_slice(&bytes[0..8]);
        let time = u64::from_le_bytes(u64_buf);
        u32_buf.copy_from_slice(&bytes[8..12]);
        let rec_tid = i32::from_le_bytes(u32_buf);
        u64_buf.copy_from_slice(&bytes[12..20]);
        let addr = u64::from_le_bytes(u64_buf);
        u64_buf.copy_from_slice(&bytes[20..28]);
        let len = u64::from_le_bytes(u64_buf);

        Self {
            time,
            rec_tid,
            addr,
            len,
        }
    }
}

/// One raw capture as seen by the replayer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawData {
    /// Recorded thread the bytes belong to.
    pub rec_tid: i32,
    /// Address the bytes were captured from in the recorded task.
    pub addr: u64,
    /// Captured bytes.
    pub data: Vec<u8>,
}

/// Descriptor prefix of one generic record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct GenericHeader {
    pub time: FrameTime,
    pub len: u64,
}

impl GenericHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.time.to_le_bytes());
        out[8..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[0..8]);
        let time = u64::from_le_bytes(buf);
        buf.copy_from_slice(&bytes[8..16]);
        let len = u64::from_le_bytes(buf);
        Self { time, len }
    }
}
