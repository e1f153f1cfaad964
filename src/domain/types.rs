//! Shared types for the parking service

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for spot IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct SpotId(pub i64);

impl std::fmt::Display for SpotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for zone IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ZoneId(pub i64);

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for camera IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct CameraId(pub i64);

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for organization IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct OrgId(pub i64);

impl std::fmt::Display for OrgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Occupancy status of a single spot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotStatus {
    #[default]
    Free,
    Occupied,
    Reserved,
}

impl SpotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotStatus::Free => "free",
            SpotStatus::Occupied => "occupied",
            SpotStatus::Reserved => "reserved",
        }
    }
}

impl std::fmt::Display for SpotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SpotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(SpotStatus::Free),
            "occupied" => Ok(SpotStatus::Occupied),
            "reserved" => Ok(SpotStatus::Reserved),
            other => Err(format!("unknown spot status '{other}'")),
        }
    }
}

/// Axis-aligned rectangle in frame-pixel space, `(x1, y1)` top-left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Region {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Integer center point (floor division)
    #[inline]
    pub fn center(&self) -> (i32, i32) {
        (floor_mid(self.x1, self.x2), floor_mid(self.y1, self.y2))
    }
}

/// Floor of the midpoint, summed in i64 so extreme coordinates cannot overflow.
/// The result lies between `a` and `b`, so it always fits back into i32.
fn floor_mid(a: i32, b: i32) -> i32 {
    (i64::from(a) + i64::from(b)).div_euclid(2) as i32
}

/// Vehicle detection from a single frame. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl VehicleBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Strict containment: points on the box edge are outside
    #[inline]
    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.x1 < x && x < self.x2 && self.y1 < y && y < self.y2
    }
}

/// Grid cell address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridPos {
    pub row: usize,
    pub col: usize,
}

impl GridPos {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl Serialize for GridPos {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.row, self.col).serialize(serializer)
    }
}

/// A single observed spot status transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChangeEvent {
    pub spot_id: SpotId,
    pub status: SpotStatus,
    /// Epoch milliseconds at detection time
    pub ts: u64,
    /// Best-effort plate reading attached to free -> occupied transitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
}

impl StatusChangeEvent {
    pub fn new(spot_id: SpotId, status: SpotStatus) -> Self {
        Self { spot_id, status, ts: epoch_ms(), plate: None }
    }

    pub fn with_plate(mut self, plate: Option<String>) -> Self {
        self.plate = plate;
        self
    }
}
