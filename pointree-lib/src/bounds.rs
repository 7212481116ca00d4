use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::math_enums::Corner3;

/// Floating point axis-aligned bounds in 3D-space.
///
/// Both limits are inclusive. The [`Box3::EMPTY`] box has its lower limit above its upper limit,
/// which makes it the identity for [`Box3::union`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Box3 {
    /// The inclusive lower limit of the bounds.
    pub min: DVec3,
    /// The inclusive upper limit of the bounds.
    pub max: DVec3,
}

impl Default for Box3 {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Box3 {
    /// Bounds that contain nothing and extend to whatever they are united with.
    pub const EMPTY: Self = Self {
        min: DVec3::splat(f64::INFINITY),
        max: DVec3::splat(f64::NEG_INFINITY),
    };

    /// Constructs [`Box3`] from the given inclusive `min` and `max`.
    ///
    /// # Panics
    ///
    /// Panics if `min` exceeds `max` along any axis.
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self::checked_new(min, max).expect("min bounds must not exceed max bounds")
    }

    /// Constructs [`Box3`] from the given inclusive `min` and `max`.
    ///
    /// Returns [`None`] if `min` exceeds `max` along any axis.
    pub fn checked_new(min: DVec3, max: DVec3) -> Option<Self> {
        min.cmple(max).all().then_some(Self { min, max })
    }

    /// Constructs new [`Box3`] covering the single given `point`.
    pub const fn point(point: DVec3) -> Self {
        Self {
            min: point,
            max: point,
        }
    }

    /// The smallest box containing all `points`; [`Box3::EMPTY`] if there are none.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a DVec3>) -> Self {
        points.into_iter().fold(Self::EMPTY, |bounds, &p| bounds.extended(p))
    }

    /// Whether the box contains no point at all.
    pub fn is_empty(self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    /// Whether both limits are finite and ordered.
    pub fn is_valid(self) -> bool {
        !self.is_empty() && self.min.is_finite() && self.max.is_finite()
    }

    pub fn size(self) -> DVec3 {
        if self.is_empty() {
            DVec3::ZERO
        } else {
            self.max - self.min
        }
    }

    pub fn center(self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    /// Returns the box grown just enough to also contain `point`.
    pub fn extended(self, point: DVec3) -> Self {
        Self {
            min: self.min.min(point),
            max: self.max.max(point),
        }
    }

    /// Returns the smallest box containing both `self` and `other`.
    pub fn union(self, other: Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Returns the overlapping part of both boxes, which may be empty.
    pub fn intersection(self, other: Self) -> Self {
        Self {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    /// Whether the specified `point` is part of the bounds.
    pub fn contains(self, point: DVec3) -> bool {
        self.min.cmple(point).all() && point.cmple(self.max).all()
    }

    /// Whether the bounds fully enclose `other`.
    ///
    /// An empty `other` is enclosed by every box.
    pub fn encloses(self, other: Self) -> bool {
        other.is_empty() || (self.min.cmple(other.min).all() && other.max.cmple(self.max).all())
    }

    /// Whether the bounds have any point in common with `other`, touching faces included.
    pub fn intersects(self, other: Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.min.cmple(other.max).all()
            && other.min.cmple(self.max).all()
    }

    /// Returns the corner of the box selected by `corner`.
    pub fn corner(self, corner: Corner3) -> DVec3 {
        DVec3::select(DVec3::from(corner).cmpeq(DVec3::ONE), self.max, self.min)
    }

    /// Returns all eight corners in octant index order.
    pub fn corners(self) -> [DVec3; 8] {
        Corner3::ALL.map(|corner| self.corner(corner))
    }

    /// Returns the point inside the bounds closest to `point`.
    pub fn closest_point(self, point: DVec3) -> DVec3 {
        point.clamp(self.min, self.max)
    }

    /// Returns the bounds enlarged by `amount` on every side.
    pub fn enlarged(self, amount: DVec3) -> Self {
        Self {
            min: self.min - amount,
            max: self.max + amount,
        }
    }
}

impl FromIterator<DVec3> for Box3 {
    fn from_iter<I: IntoIterator<Item = DVec3>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::extended)
    }
}
