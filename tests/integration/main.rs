//! Integration tests for the replay-trace engine.
//!
//! Run with: `cargo test --test integration`

mod mapped_regions;
mod version_check;
