//! Facility layout: organizations, zones, spots and cameras
//!
//! Loaded once at startup from a TOML file with flat tables that reference
//! each other by id, mirroring how they are provisioned:
//!
//! ```toml
//! [[organizations]]
//! id = 1
//! name = "Default Org"
//!
//! [[zones]]
//! id = 10
//! organization_id = 1
//! name = "Level 1"
//! grid = [[0, 0, 2], [1, 0, 2]]
//!
//! [[spots]]
//! id = 100
//! zone_id = 10
//! name = "A-01"
//! x1 = 2
//! y1 = 0
//! x2 = 60
//! y2 = 40
//!
//! [[cameras]]
//! id = 1
//! name = "cam-l1"
//! stream_url = "http://10.0.0.5/snapshot.jpg"
//! zone_id = 10
//! ```
//!
//! Declaration order is significant: assignment scans zones and spots in the
//! order they appear in the file.

use crate::domain::grid::{Grid, GridError};
use crate::domain::types::{CameraId, GridPos, OrgId, Region, SpotId, SpotStatus, ZoneId};
use anyhow::{bail, Context};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
struct RawOrganization {
    id: OrgId,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawZone {
    id: ZoneId,
    organization_id: OrgId,
    name: String,
    #[serde(default)]
    grid: Option<Vec<Vec<i64>>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSpot {
    id: SpotId,
    zone_id: ZoneId,
    name: String,
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
    #[serde(default)]
    anchor_row: Option<usize>,
    #[serde(default)]
    anchor_col: Option<usize>,
    #[serde(default)]
    status: SpotStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCamera {
    id: CameraId,
    name: String,
    stream_url: String,
    #[serde(default)]
    zone_id: Option<ZoneId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawLayout {
    #[serde(default)]
    organizations: Vec<RawOrganization>,
    #[serde(default)]
    zones: Vec<RawZone>,
    #[serde(default)]
    spots: Vec<RawSpot>,
    #[serde(default)]
    cameras: Vec<RawCamera>,
}

/// A single parking space
#[derive(Debug, Clone, PartialEq)]
pub struct Spot {
    pub id: SpotId,
    pub zone_id: ZoneId,
    pub name: String,
    /// Bounding region in the camera frame
    pub region: Region,
    /// Grid cell the spot occupies in its zone
    pub anchor: GridPos,
    /// Persisted status, used when the live cache has no entry
    pub status: SpotStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub id: ZoneId,
    pub organization_id: OrgId,
    pub name: String,
    /// Raw grid rows; validated on use
    pub grid: Option<Vec<Vec<i64>>>,
    /// Spots in declaration order
    pub spot_ids: Vec<SpotId>,
}

impl Zone {
    /// Build the validated grid for this zone
    pub fn grid(&self) -> Result<Grid, GridError> {
        let raw = self.grid.as_deref().ok_or(GridError::Missing)?;
        Grid::from_rows(raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
    /// Zones in declaration order
    pub zone_ids: Vec<ZoneId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub id: CameraId,
    pub name: String,
    pub stream_url: String,
    pub zone_id: Option<ZoneId>,
}

/// Spot geometry handed to the occupancy mapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotRegion {
    pub id: SpotId,
    pub region: Region,
}

/// Indexed facility layout
#[derive(Debug, Clone, Default)]
pub struct Layout {
    organizations: Vec<Organization>,
    zones: Vec<Zone>,
    spots: Vec<Spot>,
    cameras: Vec<Camera>,
    zone_index: FxHashMap<ZoneId, usize>,
    spot_index: FxHashMap<SpotId, usize>,
}

impl Layout {
    /// Load a layout from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read layout file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load layout file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw: RawLayout = toml::from_str(content).context("Invalid layout TOML")?;
        Self::build(raw)
    }

    fn build(raw: RawLayout) -> anyhow::Result<Self> {
        let mut organizations: Vec<Organization> = Vec::with_capacity(raw.organizations.len());
        let mut org_index: FxHashMap<OrgId, usize> = FxHashMap::default();
        for org in raw.organizations {
            if org_index.insert(org.id, organizations.len()).is_some() {
                bail!("duplicate organization id {}", org.id);
            }
            organizations.push(Organization { id: org.id, name: org.name, zone_ids: Vec::new() });
        }

        let mut zones: Vec<Zone> = Vec::with_capacity(raw.zones.len());
        let mut zone_index = FxHashMap::default();
        for zone in raw.zones {
            let Some(&org_idx) = org_index.get(&zone.organization_id) else {
                bail!("zone {} references unknown organization {}", zone.id, zone.organization_id);
            };
            if zone_index.insert(zone.id, zones.len()).is_some() {
                bail!("duplicate zone id {}", zone.id);
            }
            organizations[org_idx].zone_ids.push(zone.id);
            zones.push(Zone {
                id: zone.id,
                organization_id: zone.organization_id,
                name: zone.name,
                grid: zone.grid,
                spot_ids: Vec::new(),
            });
        }

        let mut spots: Vec<Spot> = Vec::with_capacity(raw.spots.len());
        let mut spot_index = FxHashMap::default();
        for spot in raw.spots {
            let Some(&zone_idx) = zone_index.get(&spot.zone_id) else {
                bail!("spot {} references unknown zone {}", spot.id, spot.zone_id);
            };
            if spot_index.insert(spot.id, spots.len()).is_some() {
                bail!("duplicate spot id {}", spot.id);
            }
            // Grid anchor defaults to the region's top-left corner as (row=y1, col=x1)
            let anchor = match (spot.anchor_row, spot.anchor_col) {
                (Some(row), Some(col)) => GridPos::new(row, col),
                (None, None) => {
                    let (Ok(row), Ok(col)) = (usize::try_from(spot.y1), usize::try_from(spot.x1))
                    else {
                        bail!("spot {} has a negative region corner and no grid anchor", spot.id);
                    };
                    GridPos::new(row, col)
                }
                _ => bail!("spot {} must set both anchor_row and anchor_col", spot.id),
            };
            zones[zone_idx].spot_ids.push(spot.id);
            spots.push(Spot {
                id: spot.id,
                zone_id: spot.zone_id,
                name: spot.name,
                region: Region::new(spot.x1, spot.y1, spot.x2, spot.y2),
                anchor,
                status: spot.status,
            });
        }

        let mut cameras = Vec::with_capacity(raw.cameras.len());
        for camera in raw.cameras {
            if let Some(zone_id) = camera.zone_id {
                if !zone_index.contains_key(&zone_id) {
                    bail!("camera {} references unknown zone {}", camera.id, zone_id);
                }
            }
            cameras.push(Camera {
                id: camera.id,
                name: camera.name,
                stream_url: camera.stream_url,
                zone_id: camera.zone_id,
            });
        }

        Ok(Self { organizations, zones, spots, cameras, zone_index, spot_index })
    }

    pub fn organizations(&self) -> &[Organization] {
        &self.organizations
    }

    pub fn organization(&self, id: OrgId) -> Option<&Organization> {
        self.organizations.iter().find(|o| o.id == id)
    }

    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    pub fn spots(&self) -> &[Spot] {
        &self.spots
    }

    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.zone_index.get(&id).map(|&i| &self.zones[i])
    }

    pub fn spot(&self, id: SpotId) -> Option<&Spot> {
        self.spot_index.get(&id).map(|&i| &self.spots[i])
    }

    /// Zones of an organization in declaration order
    pub fn org_zones<'a>(&'a self, org: &'a Organization) -> impl Iterator<Item = &'a Zone> + 'a {
        org.zone_ids.iter().filter_map(move |id| self.zone(*id))
    }

    /// Spots of a zone in declaration order
    pub fn zone_spots<'a>(&'a self, zone: &'a Zone) -> impl Iterator<Item = &'a Spot> + 'a {
        zone.spot_ids.iter().filter_map(move |id| self.spot(*id))
    }

    /// Spot regions watched by a camera (the spots of its zone)
    pub fn camera_spots(&self, camera: &Camera) -> Vec<SpotRegion> {
        let Some(zone) = camera.zone_id.and_then(|id| self.zone(id)) else {
            return Vec::new();
        };
        self.zone_spots(zone).map(|s| SpotRegion { id: s.id, region: s.region }).collect()
    }

    /// Override persisted default statuses (e.g. from the persistence snapshot)
    pub fn apply_persisted(&mut self, statuses: &FxHashMap<SpotId, SpotStatus>) -> usize {
        let mut applied = 0;
        for spot in &mut self.spots {
            if let Some(&status) = statuses.get(&spot.id) {
                spot.status = status;
                applied += 1;
            }
        }
        applied
    }

    /// Zones whose grid is missing, malformed, or does not bound its spot anchors
    pub fn invalid_grids(&self) -> Vec<(ZoneId, GridError)> {
        let mut invalid = Vec::new();
        for zone in &self.zones {
            let grid = match zone.grid() {
                Ok(grid) => grid,
                Err(e) => {
                    invalid.push((zone.id, e));
                    continue;
                }
            };
            if let Some(err) =
                self.zone_spots(zone).find_map(|s| grid.check_anchor(s.anchor).err())
            {
                invalid.push((zone.id, err));
            }
        }
        invalid
    }
}
