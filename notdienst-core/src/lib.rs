//! Core library for the on-duty pharmacy signage page.
//!
//! This crate defines:
//! - Configuration from file and environment
//! - Abstraction over pharmacy data sources (XML feed, portal page)
//! - Distance ranking and snapshot change detection
//! - Rendering of the self-refreshing HTML page
//!
//! It is used by `notdienst-cli`, but can also be driven by other binaries.

pub mod config;
pub mod geo;
pub mod model;
pub mod pipeline;
pub mod ranking;
pub mod render;
pub mod snapshot;
pub mod source;

pub use config::Config;
pub use geo::{Coordinate, haversine_km};
pub use model::PharmacyRecord;
pub use pipeline::{Pipeline, RunOutcome};
pub use ranking::rank_by_distance;
pub use render::PageRenderer;
pub use snapshot::{FileSnapshotStore, Rotation, Slot, SnapshotDiffer, SnapshotStore};
pub use source::{PharmacySource, SourceError, SourceId};
