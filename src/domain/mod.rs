//! Domain models - core parking types and facility layout
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - identifiers, `SpotStatus`, geometry, `StatusChangeEvent`
//! - `grid` - validated zone grid and cell kinds
//! - `layout` - organizations, zones, spots and cameras loaded at startup

pub mod grid;
pub mod layout;
pub mod types;

// Re-export commonly used types at module level
pub use grid::{CellKind, Grid, GridError};
pub use layout::{Camera, Layout, Organization, Spot, SpotRegion, Zone};
pub use types::{
    epoch_ms, CameraId, GridPos, OrgId, Region, SpotId, SpotStatus, StatusChangeEvent, VehicleBox,
    ZoneId,
};
