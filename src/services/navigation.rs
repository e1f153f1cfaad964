//! Grid navigation: A* search and turn-by-turn instructions
//!
//! Search runs on a zone grid addressed by (row, col) with 4-directional
//! moves. Only ROAD cells are walkable, except the target cell itself, which
//! is always enterable (spots are not road). The heuristic is the squared
//! Euclidean distance. It is not admissible, so returned paths are feasible
//! but not guaranteed shortest once walls force detours.

use crate::domain::grid::{CellKind, Grid, GridError};
use crate::domain::layout::Layout;
use crate::domain::types::{GridPos, SpotId, ZoneId};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use thiserror::Error;

/// One step of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    Arrived,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Left => "LEFT",
            Direction::Right => "RIGHT",
            Direction::Arrived => "ARRIVED",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-scoped routing failures. None of these touch shared state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("spot {0} not found")]
    UnknownSpot(SpotId),
    #[error("zone {0} not found")]
    UnknownZone(ZoneId),
    #[error("invalid grid for zone {zone_id}: {source}")]
    InvalidGrid { zone_id: ZoneId, source: GridError },
    #[error("start ({row}, {col}) lies outside the {rows}x{cols} grid")]
    StartOutOfBounds { row: i64, col: i64, rows: usize, cols: usize },
}

/// A computed route to a spot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub path: Vec<GridPos>,
    pub instructions: Vec<Direction>,
}

/// Frontier entry, ordered so `BinaryHeap` pops the lowest f first and,
/// among equal f, the earliest pushed.
#[derive(Debug, PartialEq, Eq)]
struct FrontierEntry {
    f: u64,
    seq: u64,
    g: u64,
    pos: GridPos,
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.f.cmp(&self.f).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[inline]
fn squared_distance(a: GridPos, b: GridPos) -> u64 {
    let dr = a.row.abs_diff(b.row) as u64;
    let dc = a.col.abs_diff(b.col) as u64;
    dr * dr + dc * dc
}

/// A* from `start` to `target`.
///
/// Returns the path including both endpoints, or `None` when the target is
/// unreachable. Both positions must lie inside the grid.
pub fn find_path(grid: &Grid, start: GridPos, target: GridPos) -> Option<Vec<GridPos>> {
    if !grid.contains(start) || !grid.contains(target) {
        return None;
    }

    let mut frontier = BinaryHeap::new();
    // Best g currently queued for each not-yet-closed cell
    let mut queued_g: FxHashMap<GridPos, u64> = FxHashMap::default();
    let mut closed: FxHashSet<GridPos> = FxHashSet::default();
    let mut parent: FxHashMap<GridPos, GridPos> = FxHashMap::default();
    let mut seq = 0u64;

    frontier.push(FrontierEntry { f: 0, seq, g: 0, pos: start });
    queued_g.insert(start, 0);

    while let Some(current) = frontier.pop() {
        // Stale duplicate of an already expanded cell
        if !closed.insert(current.pos) {
            continue;
        }
        queued_g.remove(&current.pos);

        if current.pos == target {
            return Some(reconstruct(&parent, start, target));
        }

        for next in grid.neighbours(current.pos) {
            if next != target && grid.get(next) != Some(CellKind::Road) {
                continue;
            }
            if closed.contains(&next) {
                continue;
            }

            let g = current.g + 1;
            if queued_g.get(&next).is_some_and(|&queued| queued <= g) {
                continue;
            }

            seq += 1;
            queued_g.insert(next, g);
            parent.insert(next, current.pos);
            frontier.push(FrontierEntry { f: g + squared_distance(next, target), seq, g, pos: next });
        }
    }

    None
}

fn reconstruct(parent: &FxHashMap<GridPos, GridPos>, start: GridPos, target: GridPos) -> Vec<GridPos> {
    let mut path = vec![target];
    let mut cursor = target;
    while cursor != start {
        match parent.get(&cursor) {
            Some(&prev) => {
                path.push(prev);
                cursor = prev;
            }
            None => break,
        }
    }
    path.reverse();
    path
}

/// Turn a path into one direction token per step.
///
/// Paths shorter than two cells yield `[Arrived]`. A step that is not a unit
/// move produces no token; rows are checked before columns.
pub fn instructions(path: &[GridPos]) -> Vec<Direction> {
    if path.len() < 2 {
        return vec![Direction::Arrived];
    }

    path.windows(2)
        .filter_map(|step| {
            let (from, to) = (step[0], step[1]);
            if to.row == from.row + 1 {
                Some(Direction::Down)
            } else if to.row + 1 == from.row {
                Some(Direction::Up)
            } else if to.col == from.col + 1 {
                Some(Direction::Right)
            } else if to.col + 1 == from.col {
                Some(Direction::Left)
            } else {
                None
            }
        })
        .collect()
}

/// Plan a route from a start cell to a spot's anchor in the spot's zone.
///
/// `Ok(None)` is the normal "no path" outcome.
pub fn plan_route(
    layout: &Layout,
    target_spot_id: SpotId,
    start_row: i64,
    start_col: i64,
) -> Result<Option<Route>, RouteError> {
    let spot = layout.spot(target_spot_id).ok_or(RouteError::UnknownSpot(target_spot_id))?;
    let zone = layout.zone(spot.zone_id).ok_or(RouteError::UnknownZone(spot.zone_id))?;
    let invalid = |source| RouteError::InvalidGrid { zone_id: zone.id, source };
    let grid = zone.grid().map_err(invalid)?;
    grid.check_anchor(spot.anchor).map_err(invalid)?;

    let start = match (usize::try_from(start_row), usize::try_from(start_col)) {
        (Ok(row), Ok(col)) if grid.contains(GridPos::new(row, col)) => GridPos::new(row, col),
        _ => {
            return Err(RouteError::StartOutOfBounds {
                row: start_row,
                col: start_col,
                rows: grid.rows(),
                cols: grid.cols(),
            })
        }
    };

    Ok(find_path(&grid, start, spot.anchor).map(|path| {
        let instructions = instructions(&path);
        Route { path, instructions }
    }))
}
