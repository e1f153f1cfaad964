//! Organization occupancy summary

use crate::domain::layout::{Layout, Organization};
use crate::domain::types::SpotStatus;
use crate::services::status_store::StatusStore;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccupancySummary {
    pub total_spots: usize,
    pub occupied_spots: usize,
    /// Everything not occupied, reserved spots included
    pub free_spots: usize,
    /// Percentage, 0 when the organization has no spots
    pub occupancy_rate: f64,
}

pub fn occupancy_summary(layout: &Layout, org: &Organization, store: &StatusStore) -> OccupancySummary {
    let mut total_spots = 0;
    let mut occupied_spots = 0;
    for zone in layout.org_zones(org) {
        for spot in layout.zone_spots(zone) {
            total_spots += 1;
            if store.status_or(spot.id, spot.status) == SpotStatus::Occupied {
                occupied_spots += 1;
            }
        }
    }

    let occupancy_rate = if total_spots > 0 {
        occupied_spots as f64 / total_spots as f64 * 100.0
    } else {
        0.0
    };

    OccupancySummary {
        total_spots,
        occupied_spots,
        free_spots: total_spots - occupied_spots,
        occupancy_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{OrgId, SpotId};

    const LAYOUT: &str = r#"
        [[organizations]]
        id = 1
        name = "Acme"

        [[organizations]]
        id = 2
        name = "Empty"

        [[zones]]
        id = 10
        organization_id = 1
        name = "Level 1"

        [[spots]]
        id = 1
        zone_id = 10
        name = "A1"
        x1 = 0
        y1 = 0
        x2 = 10
        y2 = 10
        status = "occupied"

        [[spots]]
        id = 2
        zone_id = 10
        name = "A2"
        x1 = 10
        y1 = 0
        x2 = 20
        y2 = 10

        [[spots]]
        id = 3
        zone_id = 10
        name = "A3"
        x1 = 20
        y1 = 0
        x2 = 30
        y2 = 10

        [[spots]]
        id = 4
        zone_id = 10
        name = "A4"
        x1 = 30
        y1 = 0
        x2 = 40
        y2 = 10
    "#;

    #[test]
    fn test_summary_mixes_live_and_persisted() {
        let layout = Layout::from_toml_str(LAYOUT).unwrap();
        let org = layout.organization(OrgId(1)).unwrap();
        let store = StatusStore::new();
        store.set(SpotId(2), SpotStatus::Occupied);
        store.set(SpotId(3), SpotStatus::Reserved);

        let summary = occupancy_summary(&layout, org, &store);
        assert_eq!(summary.total_spots, 4);
        assert_eq!(summary.occupied_spots, 2);
        assert_eq!(summary.free_spots, 2);
        assert!((summary.occupancy_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_org_rate_is_zero() {
        let layout = Layout::from_toml_str(LAYOUT).unwrap();
        let org = layout.organization(OrgId(2)).unwrap();
        let summary = occupancy_summary(&layout, org, &StatusStore::new());
        assert_eq!(summary.total_spots, 0);
        assert_eq!(summary.occupancy_rate, 0.0);
    }
}
