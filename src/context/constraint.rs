//! Constraint sets attached to graph nodes
//!
//! A node carries a mapping of constraint-group id to attribute thresholds,
//! e.g. `{"g1": {"id": "g1", "cores": 4, "location": {"ne": [..], "sw": [..]}}}`.
//! Groups are kept as raw JSON so that unknown attributes survive a round trip
//! and are simply ignored during evaluation.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::ContextError;

/// Width and height of the flattened map used for location tests.
const FLAT_EXTENT: f64 = 500.0;

/// A geographic point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// A bounding box given by its north-east and south-west corners, each `[lat, lon]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBox {
    pub ne: [f64; 2],
    pub sw: [f64; 2],
}

/// Project a coordinate onto the flat 500x500 map. Returns `(x, y)`.
pub fn geo_flat(lat: f64, lon: f64) -> (f64, f64) {
    let x = (lon + 180.0) * (FLAT_EXTENT / 360.0);
    let y = ((-lat) + 90.0) * (FLAT_EXTENT / 180.0);
    (x, y)
}

/// Whether `point` lies inside `bbox`, edges included.
///
/// A box whose south-west x lies east of its north-east x spans the
/// antimeridian, so its x-range wraps around the map edge.
pub fn geo_include(point: &GeoPoint, bbox: &GeoBox) -> bool {
    let (x, y) = geo_flat(point.lat, point.lng);
    let (ne_x, ne_y) = geo_flat(bbox.ne[0], bbox.ne[1]);
    let (sw_x, sw_y) = geo_flat(bbox.sw[0], bbox.sw[1]);

    let within_x = if sw_x <= ne_x {
        x >= sw_x && x <= ne_x
    } else {
        x >= sw_x || x <= ne_x
    };

    within_x && y >= ne_y && y <= sw_y
}

/// One attribute requirement extracted from a constraint group.
#[derive(Debug, Clone, PartialEq)]
pub enum Requirement {
    Cores(f64),
    /// Free memory in MB.
    Memory(f64),
    Rx(f64),
    Tx(f64),
    DeviceName(String),
    Location(GeoBox),
}

impl Requirement {
    /// Interpret one `key: value` entry of a constraint group.
    ///
    /// Returns `Ok(None)` for bookkeeping and unknown keys.
    pub fn parse(key: &str, value: &Value) -> Result<Option<Self>, ContextError> {
        let requirement = match key {
            "cores" => Requirement::Cores(threshold(key, value)?),
            "memory" => Requirement::Memory(threshold(key, value)?),
            "rx" => Requirement::Rx(threshold(key, value)?),
            "tx" => Requirement::Tx(threshold(key, value)?),
            "deviceName" => match value {
                Value::String(name) => Requirement::DeviceName(name.clone()),
                other => {
                    return Err(ContextError::InvalidConstraint {
                        key: key.to_string(),
                        reason: format!("expected a string, got {}", other),
                    })
                }
            },
            "location" => Requirement::Location(bounding_box(key, value)?),
            _ => return Ok(None),
        };
        Ok(Some(requirement))
    }
}

fn threshold(key: &str, value: &Value) -> Result<f64, ContextError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ContextError::InvalidConstraint {
        key: key.to_string(),
        reason: format!("expected a number, got {}", value),
    })
}

fn bounding_box(key: &str, value: &Value) -> Result<GeoBox, ContextError> {
    let result = match value {
        // Editors sometimes store the box as a JSON string.
        Value::String(s) => serde_json::from_str::<GeoBox>(s),
        other => serde_json::from_value::<GeoBox>(other.clone()),
    };
    result.map_err(|e| ContextError::InvalidConstraint {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// The attributes of a single constraint group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintGroup(BTreeMap<String, Value>);

impl ConstraintGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Constraint-group id → group. Absent, `null` and `{}` all mean unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ConstraintSet(BTreeMap<String, ConstraintGroup>);

impl<'de> Deserialize<'de> for ConstraintSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let groups = Option::<BTreeMap<String, ConstraintGroup>>::deserialize(deserializer)?;
        Ok(Self(groups.unwrap_or_default()))
    }
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, id: impl Into<String>, group: ConstraintGroup) -> Self {
        self.0.insert(id.into(), group);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, group: ConstraintGroup) {
        self.0.insert(id.into(), group);
    }

    pub fn groups(&self) -> impl Iterator<Item = (&String, &ConstraintGroup)> {
        self.0.iter()
    }

    /// Whether this set constrains anything at all.
    pub fn is_constrained(&self) -> bool {
        !self.0.is_empty()
    }
}
