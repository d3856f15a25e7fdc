//! Planar helpers shared by the physics, rules and collision code.
//!
//! World coordinates have `y` growing downward (south). Headings and wind
//! directions are degrees clockwise from north, so heading 0 points at `-y`.

use nalgebra::{vector, Vector2};

pub type Vec2 = Vector2<f64>;

/// Distance from the boat origin to the bow circle center.
pub const BOAT_BOW_OFFSET: f64 = 10.0;
/// Distance from the boat origin to the stern circle center.
pub const BOAT_STERN_OFFSET: f64 = 10.0;
pub const BOAT_BOW_RADIUS: f64 = 7.0;
pub const BOAT_STERN_RADIUS: f64 = 9.0;
/// Radius multiplier for the pre-contact "nearby" band.
pub const NEARBY_FACTOR: f64 = 1.3;

/// Wraps an angle in degrees to (-180, 180].
pub fn wrap_deg(deg: f64) -> f64 {
    let w = deg.rem_euclid(360.0);
    if w > 180.0 {
        w - 360.0
    } else {
        w
    }
}

/// Wraps an angle in degrees to [0, 360).
pub fn normalize_deg(deg: f64) -> f64 {
    deg.rem_euclid(360.0)
}

/// Unit vector pointing along a compass heading.
pub fn heading_vector(heading_deg: f64) -> Vec2 {
    let r = heading_deg.to_radians();
    vector![r.sin(), -r.cos()]
}

/// Unit vector pointing into the wind, i.e. toward where it blows from.
pub fn upwind_vector(wind_direction_deg: f64) -> Vec2 {
    heading_vector(wind_direction_deg)
}

/// 2D cross product (z component).
pub fn cross(a: &Vec2, b: &Vec2) -> f64 {
    a.x * b.y - a.y * b.x
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Circle {
    pub center: Vec2,
    pub radius: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CirclePart {
    Bow,
    Stern,
}

/// Bow and stern collision circles of a boat, in that order.
pub fn boat_circles(pos: &Vec2, heading_deg: f64) -> [(CirclePart, Circle); 2] {
    let forward = heading_vector(heading_deg);
    [
        (
            CirclePart::Bow,
            Circle {
                center: pos + forward * BOAT_BOW_OFFSET,
                radius: BOAT_BOW_RADIUS,
            },
        ),
        (
            CirclePart::Stern,
            Circle {
                center: pos - forward * BOAT_STERN_OFFSET,
                radius: BOAT_STERN_RADIUS,
            },
        ),
    ]
}

/// Vector that moves `a` out of `b`, or `None` if they don't overlap.
///
/// Coincident centers push along +x so the result is never NaN.
pub fn circle_penetration(a: &Circle, b: &Circle) -> Option<Vec2> {
    let delta = a.center - b.center;
    let dist = delta.magnitude();
    let depth = a.radius + b.radius - dist;
    if depth <= 0.0 {
        return None;
    }
    let normal = if dist > 1e-9 {
        delta / dist
    } else {
        vector![1.0, 0.0]
    };
    Some(normal * depth)
}

pub fn circles_within(a: &Circle, b: &Circle, factor: f64) -> bool {
    (a.center - b.center).magnitude() < (a.radius + b.radius) * factor
}
