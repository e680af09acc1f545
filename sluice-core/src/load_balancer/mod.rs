//! Per-route backend selection.

pub mod affinity;
pub mod ewma;
pub mod round_robin;
pub mod selector;
