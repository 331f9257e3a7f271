//! In-memory store for tests (enable the `test-util` feature outside this crate).
//! Production storage is in `tally-sqlite`.

pub mod memory;
