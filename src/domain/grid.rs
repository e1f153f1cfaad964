//! Zone occupancy grid
//!
//! Zones carry their grid as raw integer rows (as provisioned). A `Grid` is
//! only built on demand, so a malformed grid fails the request that touches
//! it and nothing else.

use crate::domain::types::GridPos;
use thiserror::Error;

/// Kind of a single grid cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Road,
    Wall,
    EmptySpot,
    OccupiedSpot,
}

impl CellKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(CellKind::Road),
            1 => Some(CellKind::Wall),
            2 => Some(CellKind::EmptySpot),
            3 => Some(CellKind::OccupiedSpot),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            CellKind::Road => 0,
            CellKind::Wall => 1,
            CellKind::EmptySpot => 2,
            CellKind::OccupiedSpot => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("zone has no grid data")]
    Missing,
    #[error("grid has no cells")]
    Empty,
    #[error("grid row {row} has {found} cells, expected {expected}")]
    Ragged { row: usize, expected: usize, found: usize },
    #[error("grid cell ({row}, {col}) has unknown value {value}")]
    UnknownCell { row: usize, col: usize, value: i64 },
    #[error("spot anchor ({row}, {col}) lies outside the {rows}x{cols} grid")]
    AnchorOutOfBounds { row: usize, col: usize, rows: usize, cols: usize },
}

/// Validated rectangular grid, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    rows: usize,
    cols: usize,
    cells: Vec<CellKind>,
}

impl Grid {
    /// Validate raw rows into a grid
    pub fn from_rows(raw: &[Vec<i64>]) -> Result<Self, GridError> {
        let cols = raw.first().map(Vec::len).unwrap_or(0);
        if raw.is_empty() || cols == 0 {
            return Err(GridError::Empty);
        }

        let mut cells = Vec::with_capacity(raw.len() * cols);
        for (row, values) in raw.iter().enumerate() {
            if values.len() != cols {
                return Err(GridError::Ragged { row, expected: cols, found: values.len() });
            }
            for (col, &value) in values.iter().enumerate() {
                let kind =
                    CellKind::from_code(value).ok_or(GridError::UnknownCell { row, col, value })?;
                cells.push(kind);
            }
        }

        Ok(Self { rows: raw.len(), cols, cells })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn contains(&self, pos: GridPos) -> bool {
        pos.row < self.rows && pos.col < self.cols
    }

    pub fn get(&self, pos: GridPos) -> Option<CellKind> {
        if self.contains(pos) {
            Some(self.cells[pos.row * self.cols + pos.col])
        } else {
            None
        }
    }

    /// Check a spot anchor against the grid dimensions
    pub fn check_anchor(&self, pos: GridPos) -> Result<(), GridError> {
        if self.contains(pos) {
            Ok(())
        } else {
            Err(GridError::AnchorOutOfBounds {
                row: pos.row,
                col: pos.col,
                rows: self.rows,
                cols: self.cols,
            })
        }
    }

    /// In-bounds 4-neighbours of `pos` in the order left, right, up, down
    pub fn neighbours(&self, pos: GridPos) -> impl Iterator<Item = GridPos> + '_ {
        const DELTAS: [(isize, isize); 4] = [(0, -1), (0, 1), (-1, 0), (1, 0)];
        DELTAS.iter().filter_map(move |&(dr, dc)| {
            let row = pos.row.checked_add_signed(dr)?;
            let col = pos.col.checked_add_signed(dc)?;
            let next = GridPos::new(row, col);
            self.contains(next).then_some(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows_valid() {
        let grid = Grid::from_rows(&[vec![0, 1], vec![2, 3]]).unwrap();
        assert_eq!(grid.rows(), 2);
        assert_eq!(grid.cols(), 2);
        assert_eq!(grid.get(GridPos::new(0, 1)), Some(CellKind::Wall));
        assert_eq!(grid.get(GridPos::new(1, 0)), Some(CellKind::EmptySpot));
        assert_eq!(grid.get(GridPos::new(2, 0)), None);
    }

    #[test]
    fn test_from_rows_rejects_malformed() {
        assert_eq!(Grid::from_rows(&[]), Err(GridError::Empty));
        assert_eq!(Grid::from_rows(&[vec![]]), Err(GridError::Empty));
        assert_eq!(
            Grid::from_rows(&[vec![0, 0], vec![0]]),
            Err(GridError::Ragged { row: 1, expected: 2, found: 1 })
        );
        assert_eq!(
            Grid::from_rows(&[vec![0, 7]]),
            Err(GridError::UnknownCell { row: 0, col: 1, value: 7 })
        );
    }

    #[test]
    fn test_neighbours_order_and_bounds() {
        let grid = Grid::from_rows(&[vec![0; 3], vec![0; 3], vec![0; 3]]).unwrap();
        let centre: Vec<_> = grid.neighbours(GridPos::new(1, 1)).collect();
        assert_eq!(
            centre,
            vec![GridPos::new(1, 0), GridPos::new(1, 2), GridPos::new(0, 1), GridPos::new(2, 1)]
        );
        let corner: Vec<_> = grid.neighbours(GridPos::new(0, 0)).collect();
        assert_eq!(corner, vec![GridPos::new(0, 1), GridPos::new(1, 0)]);
    }

    #[test]
    fn test_check_anchor() {
        let grid = Grid::from_rows(&[vec![0, 0]]).unwrap();
        assert!(grid.check_anchor(GridPos::new(0, 1)).is_ok());
        assert!(matches!(
            grid.check_anchor(GridPos::new(1, 0)),
            Err(GridError::AnchorOutOfBounds { .. })
        ));
    }
}
