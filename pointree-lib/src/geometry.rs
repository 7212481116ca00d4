use glam::DVec3;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::bounds::Box3;

/// Tolerance used when deciding whether a computed point lies on the inner side of a plane.
const PLANE_EPSILON: f64 = 1e-9;

/// A plane given by a point on it and its normal.
///
/// The normal points away from the half-space that is considered "inside".
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Plane3 {
    pub normal: DVec3,
    pub point: DVec3,
}

impl Plane3 {
    pub const fn new(normal: DVec3, point: DVec3) -> Self {
        Self { normal, point }
    }

    /// Signed distance of `point` along the normal, scaled by the normal's length.
    pub fn height(self, point: DVec3) -> f64 {
        self.normal.dot(point - self.point)
    }

    fn offset(self) -> f64 {
        self.normal.dot(self.point)
    }

    /// The single point shared by three planes; [`None`] if any two of them are parallel.
    pub fn intersect_three(a: Self, b: Self, c: Self) -> Option<DVec3> {
        let bc = b.normal.cross(c.normal);
        let determinant = a.normal.dot(bc);
        if determinant.abs() < f64::EPSILON {
            return None;
        }
        let ca = c.normal.cross(a.normal);
        let ab = a.normal.cross(b.normal);
        Some((bc * a.offset() + ca * b.offset() + ab * c.offset()) / determinant)
    }
}

/// A convex volume given as the intersection of the inner half-spaces of a list of planes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hull3 {
    planes: Vec<Plane3>,
}

impl Hull3 {
    pub fn new(planes: Vec<Plane3>) -> Self {
        Self { planes }
    }

    /// The hull enclosing exactly `bounds`, with one plane per face.
    pub fn from_box(bounds: Box3) -> Self {
        let Box3 { min, max } = bounds;
        Self::new(vec![
            Plane3::new(DVec3::NEG_X, min),
            Plane3::new(DVec3::X, max),
            Plane3::new(DVec3::NEG_Y, min),
            Plane3::new(DVec3::Y, max),
            Plane3::new(DVec3::NEG_Z, min),
            Plane3::new(DVec3::Z, max),
        ])
    }

    pub fn planes(&self) -> &[Plane3] {
        &self.planes
    }

    pub fn contains(&self, point: DVec3) -> bool {
        self.planes.iter().all(|plane| plane.height(point) <= 0.0)
    }

    /// Whether all of `bounds` lies inside the hull.
    pub fn encloses(&self, bounds: Box3) -> bool {
        !bounds.is_empty() && bounds.corners().into_iter().all(|corner| self.contains(corner))
    }

    /// Whether `bounds` may intersect the hull.
    ///
    /// Conservative: only boxes that lie completely outside of a single plane are rejected.
    pub fn intersects(&self, bounds: Box3) -> bool {
        !bounds.is_empty()
            && self.planes.iter().all(|plane| {
                let nearest = DVec3::select(plane.normal.cmpge(DVec3::ZERO), bounds.min, bounds.max);
                plane.height(nearest) <= 0.0
            })
    }

    /// The bounds of the part of `bounds` that lies inside the hull.
    ///
    /// Computed from the corners of the hull formed by the planes of both volumes, so the result is
    /// empty if they do not overlap.
    pub fn intersection_bounds(&self, bounds: Box3) -> Box3 {
        if bounds.is_empty() {
            return bounds;
        }
        let combined = Hull3::from_box(bounds)
            .planes
            .into_iter()
            .chain(self.planes.iter().copied())
            .collect_vec();
        combined
            .iter()
            .tuple_combinations()
            .filter_map(|(&a, &b, &c)| Plane3::intersect_three(a, b, c))
            .filter(|&corner| {
                combined.iter().all(|plane| {
                    plane.height(corner) <= PLANE_EPSILON * plane.normal.length().max(1.0)
                })
            })
            .collect::<Box3>()
            .intersection(bounds)
    }
}

/// A solid sphere.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Sphere3 {
    pub center: DVec3,
    pub radius: f64,
}

impl Sphere3 {
    pub const fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }

    pub fn contains(self, point: DVec3) -> bool {
        self.center.distance_squared(point) <= self.radius * self.radius
    }

    /// Whether any point of `bounds` lies inside the sphere.
    pub fn intersects(self, bounds: Box3) -> bool {
        !bounds.is_empty() && self.contains(bounds.closest_point(self.center))
    }

    /// Whether all of `bounds` lies inside the sphere.
    pub fn encloses(self, bounds: Box3) -> bool {
        !bounds.is_empty() && bounds.corners().into_iter().all(|corner| self.contains(corner))
    }

    pub fn bounds(self) -> Box3 {
        let radius = DVec3::splat(self.radius);
        Box3::new(self.center - radius, self.center + radius)
    }
}
