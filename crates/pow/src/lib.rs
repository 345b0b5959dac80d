//! Compact difficulty targets and per-block work.

pub mod difficulty;
