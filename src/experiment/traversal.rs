//! Serpentine grid traversal.
//!
//! Rows are scanned alternately left-to-right and right-to-left so the stage never
//! travels back to the start of a row. After the last full row the traversal turns
//! into row `nb_point_y`, visits its entry point and stops, which yields
//! `nb_point_x * nb_point_y + 1` points.
//!
//! ```text
//! nb_point_x = 3, nb_point_y = 2
//!
//! y=2  *
//! y=1  5 <- 4 <- 3
//! y=0  0 -> 1 -> 2
//! ```

use serde::Serialize;

/// Grid indices of one scan point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GridPoint {
    /// Column index
    pub x_index: u32,
    /// Row index
    pub y_index: u32,
}

impl GridPoint {
    /// Point at `(x_index, y_index)`.
    pub const fn new(x_index: u32, y_index: u32) -> Self {
        Self { x_index, y_index }
    }
}

impl std::fmt::Display for GridPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x_index, self.y_index)
    }
}

/// Cursor of a running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanState {
    x_index: u32,
    y_index: u32,
    x_direction: i8,
}

impl Default for ScanState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanState {
    /// Cursor at `(0, 0)` heading towards increasing X.
    pub const fn new() -> Self {
        Self {
            x_index: 0,
            y_index: 0,
            x_direction: 1,
        }
    }

    /// Point under the cursor.
    pub fn current(&self) -> GridPoint {
        GridPoint::new(self.x_index, self.y_index)
    }

    /// Current row direction, `1` or `-1`.
    pub fn x_direction(&self) -> i8 {
        self.x_direction
    }

    /// Whether the point under the cursor is the last one of the scan.
    pub fn is_last(&self, nb_point_y: u32) -> bool {
        self.y_index >= nb_point_y
    }

    /// Step to the next point.
    ///
    /// Leaving `[0, nb_point_x)` reverses the direction, steps back into range and
    /// moves to the next row.
    pub fn advance(&mut self, nb_point_x: u32) {
        let next = i64::from(self.x_index) + i64::from(self.x_direction);
        if next < 0 || next >= i64::from(nb_point_x) {
            self.x_direction = -self.x_direction;
            self.y_index += 1;
        } else {
            // in range by the check above
            self.x_index = next as u32;
        }
    }
}

/// Iterator over the serpentine visiting order.
#[derive(Debug, Clone)]
pub struct Boustrophedon {
    state: ScanState,
    nb_point_x: u32,
    nb_point_y: u32,
    finished: bool,
}

impl Boustrophedon {
    /// Traversal of a `nb_point_x` by `nb_point_y` grid.
    ///
    /// A grid without columns yields nothing.
    pub fn new(nb_point_x: u32, nb_point_y: u32) -> Self {
        Self {
            state: ScanState::new(),
            nb_point_x,
            nb_point_y,
            finished: nb_point_x == 0,
        }
    }
}

impl Iterator for Boustrophedon {
    type Item = GridPoint;

    fn next(&mut self) -> Option<GridPoint> {
        if self.finished {
            return None;
        }
        let point = self.state.current();
        if self.state.is_last(self.nb_point_y) {
            self.finished = true;
        } else {
            self.state.advance(self.nb_point_x);
        }
        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            return (0, Some(0));
        }
        let total = u64::from(self.nb_point_x) * u64::from(self.nb_point_y) + 1;
        let row_offset = if self.state.x_direction > 0 {
            u64::from(self.state.x_index)
        } else {
            u64::from(self.nb_point_x - 1 - self.state.x_index)
        };
        let visited = u64::from(self.state.y_index) * u64::from(self.nb_point_x) + row_offset;
        let remaining = usize::try_from(total - visited).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Boustrophedon {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn points(nb_x: u32, nb_y: u32) -> Vec<(u32, u32)> {
        Boustrophedon::new(nb_x, nb_y)
            .map(|p| (p.x_index, p.y_index))
            .collect()
    }

    #[test]
    fn three_by_two_order() {
        assert_eq!(
            points(3, 2),
            vec![(0, 0), (1, 0), (2, 0), (2, 1), (1, 1), (0, 1), (0, 2)]
        );
    }

    #[test]
    fn no_repeats_no_gaps() {
        let visited = points(5, 4);
        assert_eq!(visited.len(), 5 * 4 + 1);

        let unique: HashSet<_> = visited.iter().copied().collect();
        assert_eq!(unique.len(), visited.len());

        // consecutive points differ by one step along exactly one axis
        for pair in visited.windows(2) {
            let dx = (i64::from(pair[0].0) - i64::from(pair[1].0)).abs();
            let dy = (i64::from(pair[0].1) - i64::from(pair[1].1)).abs();
            assert_eq!(dx + dy, 1, "{:?}", pair);
        }
    }

    #[test]
    fn single_column_walks_up() {
        assert_eq!(points(1, 3), vec![(0, 0), (0, 1), (0, 2), (0, 3)]);
    }

    #[test]
    fn single_row_grid() {
        assert_eq!(points(4, 0), vec![(0, 0)]);
        assert_eq!(points(2, 1), vec![(0, 0), (1, 0), (1, 1)]);
    }

    #[test]
    fn empty_grid_yields_nothing() {
        assert_eq!(points(0, 3), Vec::<(u32, u32)>::new());
    }

    #[test]
    fn size_hint_tracks_remaining() {
        let mut iter = Boustrophedon::new(3, 2);
        assert_eq!(iter.len(), 7);
        for expected in (0..7).rev() {
            iter.next();
            assert_eq!(iter.len(), expected);
        }
        assert!(iter.next().is_none());
    }

    #[test]
    fn direction_flips_at_row_end() {
        let mut state = ScanState::new();
        state.advance(2);
        assert_eq!(state.current(), GridPoint::new(1, 0));
        state.advance(2);
        assert_eq!(state.current(), GridPoint::new(1, 1));
        assert_eq!(state.x_direction(), -1);
    }
}
