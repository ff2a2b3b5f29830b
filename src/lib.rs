//! Trace stream engine for deterministic record-and-replay of native
//! processes.
//!
//! A recorded trace is six parallel, independently compressed substreams
//! sharing one logical clock (`global_time`), plus a `version` file that
//! carries the format version and a schema-framed metadata header. During
//! recording the [`trace::TraceWriter`] persists events, task lifecycle
//! transitions, memory-mapping decisions, raw captured memory, and generic
//! blobs; during replay the [`trace::TraceReader`] reconstructs the exact
//! same sequence.
//!
//! Layout of a trace directory:
//! - `version` — ASCII decimal format version + `\n`, then the packed
//!   header message (CPU binding, CPUID records, trace UUID).
//! - `events`, `data_header`, `data`, `mmaps`, `tasks`, `generic` — the
//!   six compressed substreams.
//! - `mmap_clone_<n>_<basename>` / `mmap_hardlink_<n>_<basename>` —
//!   reflinked or hardlinked copies of mapped files.
//!
//! Two serialization disciplines coexist on disk and must both be
//! preserved: fixed-layout little-endian record dumps (`events`,
//! `data_header`, `generic`, register payloads) and length-delimited
//! packed messages (`tasks`, `mmaps`, the header). See [`trace::schema`].
//!
//! The engine is single-threaded at its public surface; only the
//! per-substream compression pipe uses worker threads internally.

pub mod compress;
pub mod trace;
