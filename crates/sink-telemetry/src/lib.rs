//! This crate contains the tracing primitives shared by the sink controllers:
//! console output for humans and rolling JSON log files for machines.
pub mod tracing;

pub use tracing::Tracing;
