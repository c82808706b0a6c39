//! Uniform grid partitioning of the level, used to scope "nearby" queries.

use crate::error::{Error, Result};
use crate::math::Point2d;
use crate::util::Interval;
use crate::{AgentId, WaypointId};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;
use smallvec::SmallVec;

/// The rectangular extents of a level on the horizontal plane.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Bounds {
    pub x: Interval<f64>,
    pub y: Interval<f64>,
}

impl Bounds {
    /// Creates bounds from two opposite corners.
    pub fn from_corners(a: Point2d, b: Point2d) -> Self {
        Self {
            x: Interval::new(f64::min(a.x, b.x), f64::max(a.x, b.x)),
            y: Interval::new(f64::min(a.y, b.y), f64::max(a.y, b.y)),
        }
    }

    /// Returns true if the point lies within the bounds.
    pub fn contains(&self, point: Point2d) -> bool {
        self.x.contains(point.x) && self.y.contains(point.y)
    }
}

/// Identifies a cell of a [SpatialGrid].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId {
    pub col: usize,
    pub row: usize,
}

/// A single grid cell.
#[derive(Clone, Debug, Default)]
struct Cell {
    /// The waypoints positioned inside the cell; fixed once built.
    waypoints: Vec<WaypointId>,
    /// The agents currently registered in the cell.
    agents: SmallVec<[AgentId; 4]>,
}

/// Partitions a level into square cells.
///
/// Waypoints are assigned to cells once when the grid is built. Agents are registered
/// and moved between cells as they travel.
#[derive(Clone, Debug)]
pub struct SpatialGrid {
    bounds: Bounds,
    cell_size: f64,
    cols: usize,
    rows: usize,
    /// Row-major cells.
    cells: Vec<Cell>,
    /// The cell each registered agent is in.
    agent_cells: SecondaryMap<AgentId, CellId>,
}

impl SpatialGrid {
    /// Builds a grid covering `bounds` with cells of `cell_size` metres,
    /// and assigns each waypoint to the cell containing its position.
    pub fn build(
        bounds: Bounds,
        cell_size: f64,
        waypoints: impl IntoIterator<Item = (WaypointId, Point2d)>,
    ) -> Result<Self> {
        if !(cell_size > 0.0) || !cell_size.is_finite() {
            return Err(Error::Configuration(format!(
                "cell size must be positive, got {cell_size}"
            )));
        }
        if !(bounds.x.length() >= 0.0 && bounds.y.length() >= 0.0) {
            return Err(Error::Configuration(format!("invalid level bounds {bounds:?}")));
        }

        let cols = usize::max((bounds.x.length() / cell_size).ceil() as usize, 1);
        let rows = usize::max((bounds.y.length() / cell_size).ceil() as usize, 1);
        let mut grid = Self {
            bounds,
            cell_size,
            cols,
            rows,
            cells: vec![Cell::default(); cols * rows],
            agent_cells: SecondaryMap::new(),
        };

        for (id, pos) in waypoints {
            let cell = grid.cell_at(pos);
            let idx = grid.flat_index(cell);
            grid.cells[idx].waypoints.push(id);
        }

        Ok(grid)
    }

    /// The level bounds covered by the grid.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// The cell size in m.
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// The number of (columns, rows) in the grid.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    /// Gets the cell containing a world position.
    /// Positions outside the level are clamped to the nearest edge cell.
    pub fn cell_at(&self, pos: Point2d) -> CellId {
        CellId {
            col: self.bounds.x.bucket(pos.x, self.cell_size, self.cols),
            row: self.bounds.y.bucket(pos.y, self.cell_size, self.rows),
        }
    }

    /// Gets the `(2 * radius + 1)^2` cells around `centre`, omitting any that fall off the grid.
    pub fn neighbor_cells(&self, centre: CellId, radius: usize, include_centre: bool) -> Vec<CellId> {
        let cols = centre.col.saturating_sub(radius)..=usize::min(centre.col.saturating_add(radius), self.cols - 1);
        let rows = centre.row.saturating_sub(radius)..=usize::min(centre.row.saturating_add(radius), self.rows - 1);
        itertools::iproduct!(rows, cols)
            .map(|(row, col)| CellId { col, row })
            .filter(|cell| include_centre || *cell != centre)
            .collect()
    }

    /// The number of cells needed to cover `distance` metres in every direction,
    /// never more than it takes to cover the whole grid.
    pub fn radius_for(&self, distance: f64) -> usize {
        let cells = (distance.max(0.0) / self.cell_size).ceil();
        let span = usize::max(self.cols, self.rows);
        if cells >= span as f64 {
            span
        } else {
            cells as usize
        }
    }

    /// The waypoints inside a cell.
    pub fn waypoints_in_cell(&self, cell: CellId) -> &[WaypointId] {
        self.get(cell).map(|c| &c.waypoints[..]).unwrap_or(&[])
    }

    /// The agents currently registered in a cell.
    pub fn agents_in_cell(&self, cell: CellId) -> &[AgentId] {
        self.get(cell).map(|c| &c.agents[..]).unwrap_or(&[])
    }

    /// The agents registered within `radius` cells of `centre`.
    pub fn agents_near(&self, centre: CellId, radius: usize) -> impl Iterator<Item = AgentId> + '_ {
        self.neighbor_cells(centre, radius, true)
            .into_iter()
            .flat_map(move |cell| self.agents_in_cell(cell).iter().copied())
    }

    /// The cell an agent is registered in, if any.
    pub fn agent_cell(&self, agent: AgentId) -> Option<CellId> {
        self.agent_cells.get(agent).copied()
    }

    /// Registers an agent in a cell. An agent already registered is moved instead.
    pub fn register_agent(&mut self, agent: AgentId, cell: CellId) {
        match self.agent_cell(agent) {
            Some(old) => self.move_agent(agent, old, cell),
            None => {
                let cell = self.clamp_cell(cell);
                self.agent_cells.insert(agent, cell);
                let idx = self.flat_index(cell);
                self.cells[idx].agents.push(agent);
            }
        }
    }

    /// Moves an agent from one cell to another.
    pub fn move_agent(&mut self, agent: AgentId, old: CellId, new: CellId) {
        let new = self.clamp_cell(new);
        if old == new && self.agent_cell(agent) == Some(new) {
            return;
        }
        // Trust the recorded membership over the caller's `old`
        let old = self.agent_cell(agent).unwrap_or(old);
        self.remove_from_cell(agent, old);
        self.agent_cells.insert(agent, new);
        let idx = self.flat_index(new);
        self.cells[idx].agents.push(agent);
    }

    /// Moves an agent to the cell containing `pos`, if it has crossed into a new cell.
    /// Returns `true` iff the agent changed cells.
    pub fn update_agent(&mut self, agent: AgentId, pos: Point2d) -> bool {
        let cell = self.cell_at(pos);
        match self.agent_cell(agent) {
            Some(old) if old == cell => false,
            Some(old) => {
                self.move_agent(agent, old, cell);
                true
            }
            None => {
                self.register_agent(agent, cell);
                true
            }
        }
    }

    /// Removes an agent from the grid.
    pub fn unregister_agent(&mut self, agent: AgentId) {
        if let Some(cell) = self.agent_cells.remove(agent) {
            self.remove_from_cell(agent, cell);
        }
    }

    /// The number of registered agents.
    pub fn agent_count(&self) -> usize {
        self.agent_cells.len()
    }

    fn remove_from_cell(&mut self, agent: AgentId, cell: CellId) {
        let idx = self.flat_index(cell);
        let agents = &mut self.cells[idx].agents;
        if let Some(pos) = agents.iter().position(|id| *id == agent) {
            agents.swap_remove(pos);
        }
    }

    fn get(&self, cell: CellId) -> Option<&Cell> {
        if cell.col < self.cols && cell.row < self.rows {
            self.cells.get(self.flat_index(cell))
        } else {
            None
        }
    }

    fn clamp_cell(&self, cell: CellId) -> CellId {
        CellId {
            col: usize::min(cell.col, self.cols - 1),
            row: usize::min(cell.row, self.rows - 1),
        }
    }

    #[inline]
    fn flat_index(&self, cell: CellId) -> usize {
        cell.row * self.cols + cell.col
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slotmap::SlotMap;

    fn bounds(w: f64, h: f64) -> Bounds {
        Bounds::from_corners(Point2d::new(0.0, 0.0), Point2d::new(w, h))
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        let err = SpatialGrid::build(bounds(100.0, 100.0), 0.0, []).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(SpatialGrid::build(bounds(100.0, 100.0), -4.0, []).is_err());
    }

    #[test]
    fn dimensions_round_up() {
        let grid = SpatialGrid::build(bounds(100.0, 45.0), 20.0, []).unwrap();
        assert_eq!(grid.dimensions(), (5, 3));
    }

    #[test]
    fn waypoints_land_in_their_cell() {
        let points = [
            (WaypointId(0), Point2d::new(1.0, 1.0)),
            (WaypointId(1), Point2d::new(55.0, 12.0)),
            (WaypointId(2), Point2d::new(99.9, 99.9)),
            (WaypointId(3), Point2d::new(100.0, 100.0)),
        ];
        let grid = SpatialGrid::build(bounds(100.0, 100.0), 25.0, points).unwrap();
        for (id, pos) in points {
            assert!(grid.waypoints_in_cell(grid.cell_at(pos)).contains(&id));
        }
        assert_eq!(grid.cell_at(Point2d::new(55.0, 12.0)), CellId { col: 2, row: 0 });
    }

    #[test]
    fn out_of_range_positions_clamp() {
        let grid = SpatialGrid::build(bounds(100.0, 100.0), 25.0, []).unwrap();
        assert_eq!(grid.cell_at(Point2d::new(-50.0, 30.0)), CellId { col: 0, row: 1 });
        assert_eq!(grid.cell_at(Point2d::new(500.0, 500.0)), CellId { col: 3, row: 3 });
        assert_eq!(grid.cell_at(Point2d::new(f64::NAN, 0.0)), CellId { col: 0, row: 0 });
    }

    #[test]
    fn neighbor_cells_clamp_at_edges() {
        let grid = SpatialGrid::build(bounds(100.0, 100.0), 10.0, []).unwrap();
        let centre = CellId { col: 5, row: 5 };
        assert_eq!(grid.neighbor_cells(centre, 1, true).len(), 9);
        assert_eq!(grid.neighbor_cells(centre, 2, false).len(), 24);
        assert!(!grid.neighbor_cells(centre, 1, false).contains(&centre));

        let corner = CellId { col: 0, row: 0 };
        assert_eq!(grid.neighbor_cells(corner, 1, true).len(), 4);
        let far = CellId { col: 9, row: 9 };
        assert_eq!(grid.neighbor_cells(far, 1, false).len(), 3);
    }

    #[test]
    fn unbounded_radius_covers_the_grid() {
        let grid = SpatialGrid::build(bounds(100.0, 50.0), 10.0, []).unwrap();
        assert_eq!(grid.radius_for(25.0), 3);
        assert_eq!(grid.radius_for(f64::INFINITY), 10);
        assert_eq!(grid.radius_for(1e300), 10);
        let centre = CellId { col: 9, row: 4 };
        assert_eq!(grid.neighbor_cells(centre, grid.radius_for(f64::INFINITY), true).len(), 50);
        assert_eq!(grid.neighbor_cells(centre, usize::MAX, false).len(), 49);
    }

    #[test]
    fn agents_move_lazily() {
        let mut ids = SlotMap::<AgentId, ()>::with_key();
        let a = ids.insert(());
        let b = ids.insert(());
        let mut grid = SpatialGrid::build(bounds(100.0, 100.0), 10.0, []).unwrap();

        assert!(grid.update_agent(a, Point2d::new(5.0, 5.0)));
        assert!(!grid.update_agent(a, Point2d::new(6.0, 5.0)));
        assert!(grid.update_agent(a, Point2d::new(15.0, 5.0)));
        assert_eq!(grid.agent_cell(a), Some(CellId { col: 1, row: 0 }));
        assert!(grid.agents_in_cell(CellId { col: 0, row: 0 }).is_empty());

        grid.register_agent(b, CellId { col: 1, row: 0 });
        assert_eq!(grid.agents_in_cell(CellId { col: 1, row: 0 }).len(), 2);
        assert_eq!(grid.agents_near(CellId { col: 0, row: 0 }, 1).count(), 2);

        grid.unregister_agent(a);
        grid.unregister_agent(a);
        assert_eq!(grid.agents_in_cell(CellId { col: 1, row: 0 }), &[b]);
        assert_eq!(grid.agent_count(), 1);
    }
}
