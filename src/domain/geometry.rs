//! Room geometry: outline conversions and the derived door segment
//!
//! Calibration points live in normalized room space. Anything measured in
//! meters (margins, exit depth) goes through the outline first; a room
//! without an outline is treated as a 1 m unit square.

use crate::domain::error::TrackingError;
use crate::domain::types::{CalibrationPoint, Outline, Point, PointTag};

/// Extent assumed when a room has no outline
pub const UNIT_OUTLINE: Outline = Outline { width: 1.0, height: 1.0 };

impl Outline {
    /// Outline to use for conversions, defaulting to the unit square
    pub fn or_unit(outline: Option<Outline>) -> Outline {
        outline.unwrap_or(UNIT_OUTLINE)
    }

    pub fn to_meters(&self, p: Point) -> Point {
        Point::new(p.x * self.width, p.y * self.height)
    }

    pub fn to_normalized(&self, p: Point) -> Point {
        let w = if self.width > 0.0 { self.width } else { 1.0 };
        let h = if self.height > 0.0 { self.height } else { 1.0 };
        Point::new(p.x / w, p.y / h)
    }

    /// Whether a point in meters lies within the outline grown by `margin` on every side
    pub fn contains_with_margin(&self, p: Point, margin: f64) -> bool {
        p.x >= -margin && p.x <= self.width + margin && p.y >= -margin && p.y <= self.height + margin
    }
}

/// Door segment derived from the `door_inside` / `door_outside` calibration pair
///
/// All fields are in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoorGeometry {
    pub inside: Point,
    pub outside: Point,
    pub midpoint: Point,
    /// Unit vector pointing from inside to outside
    pub normal: Point,
}

impl DoorGeometry {
    pub fn from_points(
        points: &[CalibrationPoint],
        outline: Option<Outline>,
    ) -> Result<Self, TrackingError> {
        let find = |tag: PointTag| points.iter().find(|p| p.tag == Some(tag));

        let inside = find(PointTag::DoorInside).ok_or_else(|| {
            TrackingError::InvalidRoomGeometry("missing door_inside point".to_string())
        })?;
        let outside = find(PointTag::DoorOutside).ok_or_else(|| {
            TrackingError::InvalidRoomGeometry("missing door_outside point".to_string())
        })?;

        let extent = Outline::or_unit(outline);
        Self::from_segment(extent.to_meters(inside.position), extent.to_meters(outside.position))
    }

    pub fn from_segment(inside: Point, outside: Point) -> Result<Self, TrackingError> {
        let dx = outside.x - inside.x;
        let dy = outside.y - inside.y;
        let len = (dx * dx + dy * dy).sqrt();
        if len < f64::EPSILON {
            return Err(TrackingError::InvalidRoomGeometry(
                "door_inside and door_outside coincide".to_string(),
            ));
        }

        Ok(Self {
            inside,
            outside,
            midpoint: Point::new((inside.x + outside.x) / 2.0, (inside.y + outside.y) / 2.0),
            normal: Point::new(dx / len, dy / len),
        })
    }

    /// Unit vector along the door, 90° counter-clockwise from the normal
    pub fn tangent(&self) -> Point {
        Point::new(-self.normal.y, self.normal.x)
    }
}
