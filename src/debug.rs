//! Per-frame debug geometry, collected only with the `debug` feature enabled.

use crate::math::Point2d;
#[cfg(feature = "debug")]
use serde_json::{json, Value};

#[cfg(feature = "debug")]
thread_local!(
    static SHAPES: std::cell::RefCell<Vec<Value>> = Default::default();
);

#[cfg(feature = "debug")]
fn push(shape: Value) {
    SHAPES.with(|shapes| shapes.borrow_mut().push(shape));
}

/// Records a line segment, e.g. from an agent to its target waypoint.
#[allow(unused)]
pub fn debug_line(name: &str, from: Point2d, to: Point2d) {
    #[cfg(feature = "debug")]
    push(json!({
        "type": "line",
        "name": name,
        "from": [from.x, from.y],
        "to": [to.x, to.y],
    }));
}

/// Records a circle, e.g. the reach radius around a waypoint.
#[allow(unused)]
pub fn debug_circle(name: &str, centre: Point2d, radius: f64) {
    #[cfg(feature = "debug")]
    push(json!({
        "type": "circle",
        "name": name,
        "centre": [centre.x, centre.y],
        "radius": radius,
    }));
}

/// Records a polyline through the given points, e.g. an agent's committed path.
#[allow(unused)]
pub fn debug_path(name: &str, points: impl IntoIterator<Item = Point2d>) {
    #[cfg(feature = "debug")]
    push(json!({
        "type": "path",
        "name": name,
        "points": points.into_iter().map(|p| [p.x, p.y]).collect::<Vec<_>>(),
    }));
}

/// Takes every shape recorded since the last call as a JSON array.
#[cfg(feature = "debug")]
pub fn take_debug_frame() -> Value {
    Value::Array(SHAPES.with(|shapes| shapes.take()))
}
