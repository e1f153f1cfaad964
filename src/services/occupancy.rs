//! Frame-level occupancy mapping
//!
//! A spot is occupied when the center of its region lies strictly inside at
//! least one detected vehicle box. This is point containment, not area
//! overlap: a car that covers most of a spot but not its center leaves the
//! spot free.

use crate::domain::layout::SpotRegion;
use crate::domain::types::{SpotId, SpotStatus, VehicleBox};

/// Occupancy result for a single spot in one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotOccupancy {
    pub spot_id: SpotId,
    pub status: SpotStatus,
    /// First box (in detection order) covering the spot center
    pub covering: Option<VehicleBox>,
}

/// Map vehicle boxes onto spots.
///
/// Returns exactly one result per input spot, in input order. Never yields
/// `Reserved`; reservations are not observable from a camera.
pub fn map_occupancy(spots: &[SpotRegion], boxes: &[VehicleBox]) -> Vec<SpotOccupancy> {
    spots
        .iter()
        .map(|spot| {
            let (cx, cy) = spot.region.center();
            let covering = boxes.iter().find(|b| b.contains(cx, cy)).copied();
            let status = if covering.is_some() { SpotStatus::Occupied } else { SpotStatus::Free };
            SpotOccupancy { spot_id: spot.id, status, covering }
        })
        .collect()
}
