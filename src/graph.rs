use crate::error::{Error, Result};
use crate::grid::SpatialGrid;
use crate::math::{signed_angle, Point2d};
use crate::waypoint::{AgentType, Waypoint, WaypointAttributes, WaypointId};
use cgmath::prelude::*;
use log::debug;
use smallvec::SmallVec;

/// Weight applied to the travel time when computing path costs, to keep costs integral.
const COST_SCALE: f64 = 100.0;

/// The directed road and sidewalk graph of a level.
///
/// Built once when a level loads and immutable afterwards, so it may be shared freely.
#[derive(Clone, Debug)]
pub struct WaypointGraph {
    waypoints: Vec<Waypoint>,
}

impl WaypointGraph {
    /// Builds the graph from authoring records.
    ///
    /// Fails with [Error::GraphIntegrity] if a record is out of order, references a
    /// nonexistent waypoint, or lists a predecessor that does not link back to it.
    pub fn new(records: &[WaypointAttributes]) -> Result<Self> {
        let count = records.len();
        let check = |from: WaypointId, to: WaypointId, what: &str| {
            if to.is_invalid() || to.idx() >= count {
                Err(Error::GraphIntegrity {
                    waypoint: from,
                    reason: format!("{what} {to} does not exist"),
                })
            } else {
                Ok(())
            }
        };

        let mut waypoints = Vec::with_capacity(count);
        for (idx, record) in records.iter().enumerate() {
            if record.id.idx() != idx {
                return Err(Error::GraphIntegrity {
                    waypoint: record.id,
                    reason: format!("listed at position {idx}"),
                });
            }
            for id in &record.neighbors {
                check(record.id, *id, "successor")?;
            }
            for id in &record.prevs {
                check(record.id, *id, "predecessor")?;
            }
            for id in &record.other_lanes {
                check(record.id, *id, "adjacent lane")?;
            }
            waypoints.push(Waypoint::new(record));
        }

        // Authored predecessors must be mirrored by a successor link
        for record in records {
            for prev in &record.prevs {
                if !records[prev.idx()].neighbors.contains(&record.id) {
                    return Err(Error::GraphIntegrity {
                        waypoint: record.id,
                        reason: format!("predecessor {prev} does not link back"),
                    });
                }
            }
        }

        // Derive predecessors from successors so that every link is mirrored
        for record in records {
            for next in &record.neighbors {
                let prevs = &mut waypoints[next.idx()].prevs;
                if !prevs.contains(&record.id) {
                    prevs.push(record.id);
                }
            }
        }

        Ok(Self { waypoints })
    }

    /// The number of waypoints in the graph.
    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// Returns an iterator over all the waypoints.
    pub fn iter(&self) -> impl Iterator<Item = &Waypoint> {
        self.waypoints.iter()
    }

    /// Returns an iterator over the position of every waypoint, for building a [SpatialGrid].
    pub fn positions(&self) -> impl Iterator<Item = (WaypointId, Point2d)> + '_ {
        self.waypoints.iter().map(|w| (w.id, w.position))
    }

    /// Gets a waypoint by index.
    pub fn get(&self, id: WaypointId) -> Result<&Waypoint> {
        if id.is_invalid() {
            return Err(Error::InvalidIndex(id));
        }
        self.waypoints.get(id.idx()).ok_or(Error::InvalidIndex(id))
    }

    /// Gets a waypoint by index, or `None` if the index is invalid.
    pub fn try_get(&self, id: WaypointId) -> Option<&Waypoint> {
        self.get(id).ok()
    }

    /// Gets the successors of a waypoint.
    pub fn successors(&self, id: WaypointId) -> Result<&[WaypointId]> {
        self.get(id).map(|w| w.neighbors())
    }

    /// Gets the predecessors of a waypoint.
    pub fn predecessors(&self, id: WaypointId) -> Result<&[WaypointId]> {
        self.get(id).map(|w| w.prevs())
    }

    /// Gets the successors of a waypoint which allow the given agent type.
    ///
    /// An empty result is not an error: the caller decides how to handle the dead end.
    pub fn allowed_successors(&self, id: WaypointId, ty: AgentType) -> SmallVec<[WaypointId; 4]> {
        match self.get(id) {
            Ok(waypoint) => waypoint
                .neighbors()
                .iter()
                .copied()
                .filter(|next| self.waypoints[next.idx()].allows(ty))
                .collect(),
            Err(err) => {
                debug!("allowed_successors: {err}");
                SmallVec::new()
            }
        }
    }

    /// The position of a waypoint.
    pub fn position(&self, id: WaypointId) -> Option<Point2d> {
        self.try_get(id).map(|w| w.position)
    }

    /// Whether a waypoint is flagged as a stop waypoint.
    pub fn is_stop_waypoint(&self, id: WaypointId) -> bool {
        self.try_get(id).map(|w| w.flags.stop).unwrap_or(false)
    }

    /// Finds the waypoint closest to `pos` usable by `ty`, searching only the grid cells
    /// within `radius` metres. Returns `None` if nothing is in range.
    pub fn closest_waypoint(
        &self,
        grid: &SpatialGrid,
        pos: Point2d,
        ty: AgentType,
        radius: f64,
    ) -> Option<WaypointId> {
        let cells = grid.neighbor_cells(grid.cell_at(pos), grid.radius_for(radius), true);
        cells
            .into_iter()
            .flat_map(|cell| grid.waypoints_in_cell(cell))
            .filter_map(|id| self.try_get(*id))
            .filter(|w| w.allows(ty))
            .map(|w| (w.id, w.position.distance2(pos)))
            .filter(|(_, dist2)| *dist2 <= radius * radius)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// The speed limit in m/s at a world position, taken from the closest waypoint.
    pub fn speed_limit_at(
        &self,
        grid: &SpatialGrid,
        pos: Point2d,
        ty: AgentType,
        radius: f64,
    ) -> Option<f64> {
        self.closest_waypoint(grid, pos, ty, radius)
            .map(|id| self.waypoints[id.idx()].max_speed)
    }

    /// The absolute turning angle in radians between consecutive segments of a path.
    /// A path of `n` waypoints yields `n - 2` angles.
    pub fn turn_angles<'a>(&'a self, path: &'a [WaypointId]) -> impl Iterator<Item = f64> + 'a {
        path.windows(3).filter_map(move |w| {
            let [a, b, c] = [w[0], w[1], w[2]].map(|id| self.position(id));
            let (a, b, c) = (a?, b?, c?);
            let (ab, bc) = (b - a, c - b);
            if ab.magnitude2() < 1e-12 || bc.magnitude2() < 1e-12 {
                return Some(0.0);
            }
            Some(signed_angle(ab, bc).abs())
        })
    }

    /// Walks backwards from `start` along single-predecessor links until a merge point
    /// (a waypoint with zero or several predecessors) is reached.
    /// The returned list starts at `start` and ends at the merge point.
    pub fn trace_back_to_merge(&self, start: WaypointId, max_len: usize) -> Vec<WaypointId> {
        let mut out = vec![];
        let mut current = start;
        while let Some(waypoint) = self.try_get(current) {
            if out.contains(&current) || out.len() >= max_len {
                break;
            }
            out.push(current);
            match waypoint.prevs() {
                [prev] => current = *prev,
                _ => break,
            }
        }
        out
    }

    /// Finds the quickest path from `src` to `dst` for an agent of type `ty`.
    /// The returned path excludes `src` and ends at `dst`.
    pub fn find_path(&self, src: WaypointId, dst: WaypointId, ty: AgentType) -> Result<Vec<WaypointId>> {
        self.get(src)?;
        self.get(dst)?;
        let result = pathfinding::directed::dijkstra::dijkstra(
            &src,
            |id| self.weighted_successors(*id, ty),
            |id| *id == dst,
        );
        match result {
            Some((mut path, _)) => {
                path.remove(0);
                Ok(path)
            }
            None => Err(Error::NoRouteFound { from: Some(src) }),
        }
    }

    fn weighted_successors(
        &self,
        id: WaypointId,
        ty: AgentType,
    ) -> impl Iterator<Item = (WaypointId, u64)> + '_ {
        let from = &self.waypoints[id.idx()];
        self.allowed_successors(id, ty).into_iter().map(move |next| {
            let to = &self.waypoints[next.idx()];
            let speed = f64::max(to.max_speed, 0.5);
            let cost = COST_SCALE * from.position.distance(to.position) / speed;
            (next, cost.round() as u64 + 1)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::grid::Bounds;
    use assert_approx_eq::assert_approx_eq;

    fn wp(id: u32, x: f64, y: f64, next: &[u32]) -> WaypointAttributes {
        WaypointAttributes::new(id, Point2d::new(x, y), next)
    }

    /// A straight road 0 -> 1 -> 2 which splits into 3 (left) and 4 (straight).
    fn fork() -> WaypointGraph {
        WaypointGraph::new(&[
            wp(0, 0.0, 0.0, &[1]),
            wp(1, 10.0, 0.0, &[2]),
            wp(2, 20.0, 0.0, &[3, 4]),
            wp(3, 25.0, 10.0, &[]),
            wp(4, 30.0, 0.0, &[]),
        ])
        .unwrap()
    }

    #[test]
    fn links_are_mirrored() {
        let graph = fork();
        for waypoint in graph.iter() {
            for next in waypoint.neighbors() {
                assert!(graph.predecessors(*next).unwrap().contains(&waypoint.id()));
            }
        }
        assert_eq!(graph.predecessors(WaypointId(2)).unwrap(), &[WaypointId(1)]);
    }

    #[test]
    fn dangling_successor_is_rejected() {
        let err = WaypointGraph::new(&[wp(0, 0.0, 0.0, &[1]), wp(1, 1.0, 0.0, &[7])]).unwrap_err();
        assert_eq!(
            err,
            Error::GraphIntegrity {
                waypoint: WaypointId(1),
                reason: "successor #7 does not exist".into(),
            }
        );
    }

    #[test]
    fn unmirrored_predecessor_is_rejected() {
        let mut records = vec![wp(0, 0.0, 0.0, &[]), wp(1, 1.0, 0.0, &[])];
        records[1].prevs = vec![WaypointId(0)];
        let err = WaypointGraph::new(&records).unwrap_err();
        assert!(matches!(err, Error::GraphIntegrity { waypoint: WaypointId(1), .. }));
    }

    #[test]
    fn invalid_index_lookups() {
        let graph = fork();
        assert_eq!(
            graph.get(WaypointId::INVALID).unwrap_err(),
            Error::InvalidIndex(WaypointId::INVALID)
        );
        assert!(graph.get(WaypointId(5)).is_err());
        assert!(graph.allowed_successors(WaypointId(99), AgentType(0)).is_empty());
    }

    #[test]
    fn allowed_successors_filter_by_type() {
        let car = AgentType(0);
        let bus = AgentType(1);
        let mut records = vec![
            wp(0, 0.0, 0.0, &[1, 2]),
            wp(1, 10.0, 5.0, &[]),
            wp(2, 10.0, -5.0, &[]),
        ];
        records[1].allowed = crate::AgentTypes::of(&[bus]);
        let graph = WaypointGraph::new(&records).unwrap();
        assert_eq!(graph.allowed_successors(WaypointId(0), car).as_slice(), &[WaypointId(2)]);
        assert_eq!(graph.allowed_successors(WaypointId(0), bus).len(), 2);
        // Terminal waypoints simply have no successors
        assert!(graph.allowed_successors(WaypointId(2), car).is_empty());
        assert!(graph.get(WaypointId(2)).unwrap().is_terminal());
    }

    #[test]
    fn closest_waypoint_within_radius() {
        let graph = fork();
        let bounds = Bounds::from_corners(Point2d::new(0.0, 0.0), Point2d::new(40.0, 20.0));
        let grid = SpatialGrid::build(bounds, 5.0, graph.positions()).unwrap();

        let near = graph.closest_waypoint(&grid, Point2d::new(11.0, 1.0), AgentType(0), 5.0);
        assert_eq!(near, Some(WaypointId(1)));
        let none = graph.closest_waypoint(&grid, Point2d::new(15.0, 15.0), AgentType(0), 3.0);
        assert_eq!(none, None);
        let limit = graph.speed_limit_at(&grid, Point2d::new(29.0, 0.0), AgentType(0), 4.0);
        assert_approx_eq!(limit.unwrap(), 13.9);
    }

    #[test]
    fn turn_angles_along_path() {
        let graph = fork();
        let path = [WaypointId(1), WaypointId(2), WaypointId(4)];
        assert_approx_eq!(graph.turn_angles(&path).sum::<f64>(), 0.0);
        let path = [WaypointId(1), WaypointId(2), WaypointId(3)];
        let angle = graph.turn_angles(&path).next().unwrap();
        assert_approx_eq!(angle, (10.0f64).atan2(5.0));
    }

    #[test]
    fn trace_back_stops_at_merge() {
        let graph = WaypointGraph::new(&[
            wp(0, 0.0, 0.0, &[2]),
            wp(1, 0.0, 5.0, &[2]),
            wp(2, 5.0, 0.0, &[3]),
            wp(3, 10.0, 0.0, &[4]),
            wp(4, 15.0, 0.0, &[]),
        ])
        .unwrap();
        let trace = graph.trace_back_to_merge(WaypointId(4), 16);
        assert_eq!(trace, vec![WaypointId(4), WaypointId(3), WaypointId(2)]);
    }

    #[test]
    fn find_path_to_destination() {
        let graph = fork();
        let path = graph.find_path(WaypointId(0), WaypointId(3), AgentType(0)).unwrap();
        assert_eq!(path, vec![WaypointId(1), WaypointId(2), WaypointId(3)]);
        assert_eq!(
            graph.find_path(WaypointId(3), WaypointId(0), AgentType(0)).unwrap_err(),
            Error::NoRouteFound {
                from: Some(WaypointId(3))
            }
        );
    }
}
