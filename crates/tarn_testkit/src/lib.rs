//! # Tarn Testkit
//!
//! Test tooling for exercising the journaling layer's crash recovery.
//!
//! - [`FlakyStore`] wraps any blob store and fails scripted operation
//!   classes, cutting the commit pipeline at chosen points
//!   (crash-before-apply, crash-before-punch, ...).
//! - [`RecordingStore`] wraps any blob store and logs operation names
//!   in order, for asserting apply ordering and pipeline shape.
//! - [`fixtures`] holds small helpers shared by integration suites.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
mod flaky;
mod recording;

pub use flaky::{FaultPlan, FaultPoint, FlakyStore};
pub use recording::{Recorder, RecordingStore};
