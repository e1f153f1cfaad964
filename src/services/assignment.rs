//! Spot assignment policy
//!
//! First free spot wins, scanning the organization's zones and each zone's
//! spots in declaration order. Live status comes from the store; spots the
//! store has never seen fall back to their persisted status.
//!
//! By default nothing is reserved, so two concurrent callers may be handed
//! the same spot. `assign_and_reserve` closes that race with a
//! compare-and-swap on the store.

use crate::domain::layout::{Layout, Organization};
use crate::domain::types::{SpotId, SpotStatus, StatusChangeEvent, ZoneId};
use crate::services::event_bus::EventBus;
use crate::services::status_store::StatusStore;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub spot_id: SpotId,
    pub spot_name: String,
    #[serde(skip)]
    pub zone_id: ZoneId,
    pub zone_name: String,
}

/// First free spot of the organization, or `None` when everything is taken
pub fn assign_spot(layout: &Layout, org: &Organization, store: &StatusStore) -> Option<Assignment> {
    for zone in layout.org_zones(org) {
        for spot in layout.zone_spots(zone) {
            if store.status_or(spot.id, spot.status) == SpotStatus::Free {
                debug!(org_id = %org.id, spot_id = %spot.id, zone = %zone.name, "spot_assigned");
                return Some(Assignment {
                    spot_id: spot.id,
                    spot_name: spot.name.clone(),
                    zone_id: zone.id,
                    zone_name: zone.name.clone(),
                });
            }
        }
    }
    None
}

/// Like `assign_spot`, but atomically moves the chosen spot free → reserved
/// and publishes the transition. A spot lost to a concurrent caller is
/// skipped and the scan continues.
pub fn assign_and_reserve(
    layout: &Layout,
    org: &Organization,
    store: &StatusStore,
    bus: &EventBus,
) -> Option<Assignment> {
    for zone in layout.org_zones(org) {
        for spot in layout.zone_spots(zone) {
            if !store.compare_and_swap(spot.id, SpotStatus::Free, SpotStatus::Reserved, spot.status)
            {
                continue;
            }
            info!(org_id = %org.id, spot_id = %spot.id, zone = %zone.name, "spot_reserved");
            bus.publish(StatusChangeEvent::new(spot.id, SpotStatus::Reserved));
            return Some(Assignment {
                spot_id: spot.id,
                spot_name: spot.name.clone(),
                zone_id: zone.id,
                zone_name: zone.name.clone(),
            });
        }
    }
    None
}

/// Hand a reserved spot back: reserved → free, published like any change.
/// Returns false when the spot is not currently reserved.
pub fn release_reservation(store: &StatusStore, bus: &EventBus, spot_id: SpotId) -> bool {
    // A spot the store has never seen cannot hold a reservation
    if !store.compare_and_swap(spot_id, SpotStatus::Reserved, SpotStatus::Free, SpotStatus::Free) {
        return false;
    }
    info!(spot_id = %spot_id, "spot_reservation_released");
    bus.publish(StatusChangeEvent::new(spot_id, SpotStatus::Free));
    true
}
