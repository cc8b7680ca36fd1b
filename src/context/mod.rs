//! Device context: what this device can do right now
//!
//! A [`DeviceContext`] is a snapshot of local capability (cores, free memory,
//! network load, location) that answers constraint-satisfaction queries for
//! graph nodes. The [`ContextMonitor`] owns the live snapshot and refreshes it
//! on two independent cadences through a [`ResourceProbe`].

pub mod constraint;
pub mod device;
pub mod monitor;
pub mod probe;

pub use constraint::{geo_flat, geo_include, ConstraintGroup, ConstraintSet, GeoBox, GeoPoint, Requirement};
pub use device::{ContextQuery, DeviceContext};
pub use monitor::{ContextMonitor, SamplingConfig};
pub use probe::{FixedProbe, NetCounters, ProcProbe, ResourceProbe};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Probe error: {0}")]
    ProbeError(String),

    #[error("Invalid constraint `{key}`: {reason}")]
    InvalidConstraint { key: String, reason: String },

    #[error("No network interface available")]
    NoInterface,
}
