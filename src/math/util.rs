use super::Vector2d;
use cgmath::prelude::*;

/// Rotates a vector 90 degrees anti-clockwise, i.e. from a heading to its left-hand side.
pub fn rot90(vec: Vector2d) -> Vector2d {
    Vector2d::new(-vec.y, vec.x)
}

/// The signed angle in radians that rotates `from` onto `to`.
/// Positive angles turn left (anti-clockwise).
pub fn signed_angle(from: Vector2d, to: Vector2d) -> f64 {
    let cross = from.x * to.y - from.y * to.x;
    cross.atan2(from.dot(to))
}

/// Normalises a vector, returning the zero vector for degenerate input.
pub fn normalize_or_zero(vec: Vector2d) -> Vector2d {
    let mag = vec.magnitude();
    if mag > 1e-9 {
        vec / mag
    } else {
        Vector2d::zero()
    }
}

/// The local frame (left, forward) of an agent with the given heading.
pub fn heading_frame(heading: Vector2d) -> (Vector2d, Vector2d) {
    let forward = normalize_or_zero(heading);
    (rot90(forward), forward)
}
