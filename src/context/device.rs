//! DeviceContext snapshot and constraint evaluation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::constraint::{geo_include, ConstraintSet, GeoPoint, Requirement};

/// Snapshot of local device capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceContext {
    /// Assigned by the coordinator at registration.
    pub device_id: String,
    pub device_name: String,
    pub cores: u32,
    /// Free memory in MB.
    pub free_mem: f64,
    pub rx_load: f64,
    pub tx_load: f64,
    pub location: Option<GeoPoint>,
    pub sampled_at: DateTime<Utc>,
}

/// The subset of the context reported in heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextQuery {
    pub location: Option<GeoPoint>,
    pub free_mem: f64,
    pub rx_load: f64,
    pub tx_load: f64,
    pub cores: u32,
}

impl DeviceContext {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            cores: 0,
            free_mem: 0.0,
            rx_load: 0.0,
            tx_load: 0.0,
            location: None,
            sampled_at: Utc::now(),
        }
    }

    /// Whether this device meets every requirement in every group of `constraints`.
    pub fn satisfies(&self, constraints: &ConstraintSet) -> bool {
        constraints.groups().all(|(group_id, group)| {
            group.entries().all(|(key, value)| match Requirement::parse(key, value) {
                Ok(Some(requirement)) => self.meets(&requirement),
                Ok(None) => true,
                Err(e) => {
                    log::warn!("Constraint group {} fails closed: {}", group_id, e);
                    false
                }
            })
        })
    }

    /// Evaluate a single requirement against the live metrics.
    pub fn meets(&self, requirement: &Requirement) -> bool {
        match requirement {
            Requirement::Cores(min) => !((self.cores as f64) < *min),
            Requirement::Memory(min) => !(self.free_mem < *min),
            Requirement::Rx(min) => !(self.rx_load < *min),
            Requirement::Tx(min) => !(self.tx_load < *min),
            Requirement::DeviceName(name) => &self.device_name == name,
            Requirement::Location(bbox) => match &self.location {
                Some(point) => geo_include(point, bbox),
                None => false,
            },
        }
    }

    pub fn query(&self) -> ContextQuery {
        ContextQuery {
            location: self.location,
            free_mem: self.free_mem,
            rx_load: self.rx_load,
            tx_load: self.tx_load,
            cores: self.cores,
        }
    }
}
