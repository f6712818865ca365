//! Coordinates and reachable-region membership.
//!
//! Jobs live in a shared 3D coordinate space; assignment decisions only look
//! at the XY projection. Regions are boundary-inclusive: a point lying exactly
//! on a circle or polygon edge counts as inside.

use serde::{Deserialize, Serialize};

/// Tolerance used for on-boundary tests.
const EPSILON: f64 = 1e-12;

/// A point in the XY plane.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

impl Point2 {
    /// Create a point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// A location in the shared 3D coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate (depth).
    pub z: f64,
}

impl Position {
    /// Create a position.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Projection onto the XY plane.
    #[must_use]
    pub const fn xy(self) -> Point2 {
        Point2::new(self.x, self.y)
    }

    /// True when every component is finite.
    #[must_use]
    pub const fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl std::ops::Sub for Position {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Add for Position {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

/// A bounded area of the XY plane owned by one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "shape")]
pub enum Region {
    /// Disc around a center, e.g. a circular recording chamber.
    Circle {
        /// Center of the disc.
        center: Point2,
        /// Radius of the disc.
        radius: f64,
    },
    /// Axis-aligned rectangle.
    Rect {
        /// Lower-left corner.
        min: Point2,
        /// Upper-right corner.
        max: Point2,
    },
    /// Convex polygon; vertices in either winding order.
    Polygon {
        /// Polygon vertices.
        vertices: Vec<Point2>,
    },
}

impl Region {
    /// Disc region.
    #[must_use]
    pub const fn circle(center: Point2, radius: f64) -> Self {
        Self::Circle { center, radius }
    }

    /// Rectangle region from two opposite corners.
    #[must_use]
    pub fn rect(a: Point2, b: Point2) -> Self {
        Self::Rect {
            min: Point2::new(a.x.min(b.x), a.y.min(b.y)),
            max: Point2::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// Whether `point` lies inside the region, boundary included.
    #[must_use]
    pub fn contains(&self, point: Point2) -> bool {
        match self {
            Self::Circle { center, radius } => center.distance(point) <= radius + EPSILON,
            Self::Rect { min, max } => {
                point.x >= min.x && point.x <= max.x && point.y >= min.y && point.y <= max.y
            }
            Self::Polygon { vertices } => convex_contains(vertices, point),
        }
    }

    /// Shape-level sanity check used by configuration validation.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Circle { radius, .. } if !(radius.is_finite() && *radius > 0.0) => {
                Err(format!("circle radius must be positive, got {radius}"))
            }
            Self::Rect { min, max } if min.x > max.x || min.y > max.y => {
                Err("rect min corner must not exceed max corner".into())
            }
            Self::Polygon { vertices } if vertices.len() < 3 => Err(format!(
                "polygon needs at least 3 vertices, got {}",
                vertices.len()
            )),
            _ => Ok(()),
        }
    }
}

fn cross(o: Point2, a: Point2, b: Point2) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

// Inside iff the point never falls strictly on opposite sides of two edges.
fn convex_contains(vertices: &[Point2], point: Point2) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut has_pos = false;
    let mut has_neg = false;
    for (i, &a) in vertices.iter().enumerate() {
        let b = vertices[(i + 1) % vertices.len()];
        let c = cross(a, b, point);
        if c > EPSILON {
            has_pos = true;
        } else if c < -EPSILON {
            has_neg = true;
        }
        if has_pos && has_neg {
            return false;
        }
    }
    true
}
