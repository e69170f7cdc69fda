//! sortie-core: orchestration core for multi-agent security assessments

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod agents;
pub mod config;
pub mod error;
pub mod providers;
pub mod sandbox;
pub mod scan;
pub mod state;
pub mod telemetry;
pub mod tools;

pub use error::{Error, Result};
pub use scan::{Scan, ScanSummary};
