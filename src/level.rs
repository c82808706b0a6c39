//! The authoring data a level is loaded from.

use crate::grid::Bounds;
use crate::intersection::IntersectionAttributes;
use crate::math::Point2d;
use crate::waypoint::WaypointAttributes;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Everything needed to build a level's waypoint graph, spatial grid and intersections.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LevelData {
    /// The level extents on the horizontal plane.
    pub bounds: Bounds,
    /// The spatial grid cell size in m.
    pub cell_size: f64,
    /// The waypoints, ordered by index.
    pub waypoints: Vec<WaypointAttributes>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub intersections: Vec<IntersectionAttributes>,
}

impl LevelData {
    /// Creates level data whose bounds enclose every waypoint with `margin` metres to spare.
    pub fn fitted(
        waypoints: Vec<WaypointAttributes>,
        intersections: Vec<IntersectionAttributes>,
        cell_size: f64,
        margin: f64,
    ) -> Self {
        let (min, max) = waypoints.iter().fold(
            (Point2d::new(f64::MAX, f64::MAX), Point2d::new(f64::MIN, f64::MIN)),
            |(min, max), w| {
                (
                    Point2d::new(min.x.min(w.position.x), min.y.min(w.position.y)),
                    Point2d::new(max.x.max(w.position.x), max.y.max(w.position.y)),
                )
            },
        );
        let bounds = if waypoints.is_empty() {
            Bounds::from_corners(Point2d::new(-margin, -margin), Point2d::new(margin, margin))
        } else {
            Bounds::from_corners(
                Point2d::new(min.x - margin, min.y - margin),
                Point2d::new(max.x + margin, max.y + margin),
            )
        };
        Self {
            bounds,
            cell_size,
            waypoints,
            intersections,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn fitted_bounds_enclose_waypoints() {
        let level = LevelData::fitted(
            vec![
                WaypointAttributes::new(0, Point2d::new(-3.0, 4.0), &[1]),
                WaypointAttributes::new(1, Point2d::new(12.0, -1.0), &[]),
            ],
            vec![],
            5.0,
            2.0,
        );
        assert_approx_eq!(level.bounds.x.min, -5.0);
        assert_approx_eq!(level.bounds.x.max, 14.0);
        assert_approx_eq!(level.bounds.y.min, -3.0);
        assert_approx_eq!(level.bounds.y.max, 6.0);
    }

    #[test]
    fn empty_level_has_margin_bounds() {
        let level = LevelData::fitted(vec![], vec![], 5.0, 10.0);
        assert!(level.bounds.contains(Point2d::new(0.0, 0.0)));
        assert_approx_eq!(level.bounds.x.length(), 20.0);
    }
}
