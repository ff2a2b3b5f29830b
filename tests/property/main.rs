//! Property tests for the replay-trace engine.
//!
//! Run with: `cargo test --test property`

mod trace_round_trip;
