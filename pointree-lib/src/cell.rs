use std::fmt;

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::{
    bounds::Box3,
    math_enums::{Axis3, Corner3},
};

/// The address of a cube within the implicit, infinite octree spanning all of 3D-space.
///
/// A regular cell covers `[x, x + 1] * 2^exponent` along each axis, so cells on the same level tile
/// space without gaps and each cell is split into eight cells one level below.
///
/// Since the grid is anchored at the origin, no regular cell can straddle zero. Bounds that do are
/// covered by a cell [centered at the origin](Self::is_centered_at_origin) instead, spanning
/// `[-2^(exponent - 1), 2^(exponent - 1)]` along each axis. Its octants are the eight regular cells
/// one level below that touch the origin.
///
/// Both the lower and the upper limit are considered part of the cell. Two cells only
/// [intersect](Self::intersects) if they share a volume though, not just a face.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    x: i64,
    y: i64,
    z: i64,
    exponent: i32,
}

/// Marks all three coordinates of a cell centered at the origin.
const CENTERED: i64 = i64::MAX;

/// Floor division of `value` by `2^shift`, saturating for shifts of 64 and more.
const fn shr_floor(value: i64, shift: u32) -> i64 {
    if shift >= 64 {
        value >> 63
    } else {
        value >> shift
    }
}

/// Whether the given coordinate belongs to one of the two cells touching the origin.
const fn touches_origin(value: i64) -> bool {
    value == 0 || value == -1
}

/// Returns `2^exponent` as an exact [`f64`].
fn exp2(exponent: i32) -> f64 {
    2f64.powi(exponent)
}

/// Returns the smallest `exponent` with `2^exponent >= value`.
fn ceil_log2(value: f64) -> i32 {
    let mut exponent = value.log2().ceil() as i32;
    while exp2(exponent) < value {
        exponent += 1;
    }
    while exp2(exponent - 1) >= value {
        exponent -= 1;
    }
    exponent
}

impl Cell {
    /// How many levels below the magnitude of a single point its enclosing cell is placed.
    const POINT_EXPONENT_OFFSET: i32 = 24;

    /// Constructs a regular [`Cell`] at the given grid position and `exponent`.
    ///
    /// If `debug_assertions` are enabled, this panics for the reserved centered coordinates.
    pub const fn new(x: i64, y: i64, z: i64, exponent: i32) -> Self {
        debug_assert!(!(x == CENTERED && y == CENTERED && z == CENTERED));
        Self { x, y, z, exponent }
    }

    /// Constructs a [`Cell`] centered at the origin with an edge length of `2^exponent`.
    pub const fn centered(exponent: i32) -> Self {
        Self {
            x: CENTERED,
            y: CENTERED,
            z: CENTERED,
            exponent,
        }
    }

    /// Returns the smallest cell containing all of `bounds`.
    ///
    /// Returns [`None`] if `bounds` are empty or not finite.
    pub fn enclosing_box(bounds: Box3) -> Option<Self> {
        if !bounds.is_valid() {
            return None;
        }

        let straddles = bounds.min.cmplt(DVec3::ZERO) & bounds.max.cmpgt(DVec3::ZERO);
        if straddles.any() {
            let extent = bounds.min.abs().max(bounds.max.abs()).max_element();
            return Some(Self::centered(ceil_log2(extent) + 1));
        }

        let size = bounds.size().max_element();
        let mut exponent = if size > 0.0 {
            ceil_log2(size)
        } else {
            let magnitude = bounds.min.abs().max_element();
            if magnitude > 0.0 {
                ceil_log2(magnitude) - Self::POINT_EXPONENT_OFFSET
            } else {
                -Self::POINT_EXPONENT_OFFSET
            }
        };

        loop {
            let edge = exp2(exponent);
            let grid = (bounds.min / edge).floor();
            if ((grid + DVec3::ONE) * edge).cmpge(bounds.max).all() {
                return Some(Self::new(
                    grid.x as i64,
                    grid.y as i64,
                    grid.z as i64,
                    exponent,
                ));
            }
            exponent += 1;
        }
    }

    /// Returns the smallest cell containing both `a` and `b`.
    pub fn enclosing(a: Self, b: Self) -> Self {
        match (a.is_centered_at_origin(), b.is_centered_at_origin()) {
            (true, true) => Self::centered(a.exponent.max(b.exponent)),
            (true, false) => Self::centered(a.exponent.max(b.centered_exponent())),
            (false, true) => Self::centered(a.centered_exponent().max(b.exponent)),
            (false, false) => {
                let signs_differ = (a.x < 0) != (b.x < 0)
                    || (a.y < 0) != (b.y < 0)
                    || (a.z < 0) != (b.z < 0);
                if signs_differ {
                    return Self::centered(a.centered_exponent().max(b.centered_exponent()));
                }

                let mut a = a.ancestor(a.exponent.max(b.exponent));
                let mut b = b.ancestor(a.exponent);
                while a != b {
                    a = a.parent();
                    b = b.parent();
                }
                a
            }
        }
    }

    /// Whether this is a cell centered at the origin.
    pub const fn is_centered_at_origin(self) -> bool {
        self.x == CENTERED && self.y == CENTERED && self.z == CENTERED
    }

    /// The grid position along `X`; meaningless for centered cells.
    pub const fn x(self) -> i64 {
        self.x
    }

    /// The grid position along `Y`; meaningless for centered cells.
    pub const fn y(self) -> i64 {
        self.y
    }

    /// The grid position along `Z`; meaningless for centered cells.
    pub const fn z(self) -> i64 {
        self.z
    }

    /// The edge length of the cell is `2^exponent`.
    pub const fn exponent(self) -> i32 {
        self.exponent
    }

    /// The edge length of the cell.
    pub fn size(self) -> f64 {
        exp2(self.exponent)
    }

    /// The region of space covered by the cell.
    pub fn bounds(self) -> Box3 {
        if self.is_centered_at_origin() {
            let half = exp2(self.exponent - 1);
            Box3::new(DVec3::splat(-half), DVec3::splat(half))
        } else {
            let edge = exp2(self.exponent);
            let min = DVec3::new(self.x as f64, self.y as f64, self.z as f64) * edge;
            Box3::new(min, min + DVec3::splat(edge))
        }
    }

    pub fn center(self) -> DVec3 {
        if self.is_centered_at_origin() {
            DVec3::ZERO
        } else {
            let edge = exp2(self.exponent);
            (DVec3::new(self.x as f64, self.y as f64, self.z as f64) + DVec3::splat(0.5)) * edge
        }
    }

    /// Returns the regular cell one level up that contains this one.
    ///
    /// # Panics
    ///
    /// Panics if the cell is centered at the origin, since its parent is not a regular cell.
    pub fn parent(self) -> Self {
        assert!(
            !self.is_centered_at_origin(),
            "cell centered at origin has no regular parent"
        );
        Self::new(self.x >> 1, self.y >> 1, self.z >> 1, self.exponent + 1)
    }

    /// Returns the regular cell at `exponent` that contains this one.
    ///
    /// Must only be called on regular cells with an exponent of at most `exponent`.
    fn ancestor(self, exponent: i32) -> Self {
        debug_assert!(!self.is_centered_at_origin() && self.exponent <= exponent);
        let shift = (exponent - self.exponent) as u32;
        Self::new(
            shr_floor(self.x, shift),
            shr_floor(self.y, shift),
            shr_floor(self.z, shift),
            exponent,
        )
    }

    /// The exponent of the smallest centered cell containing this regular cell.
    fn centered_exponent(self) -> i32 {
        let mut level = self.exponent;
        loop {
            let ancestor = self.ancestor(level);
            if touches_origin(ancestor.x) && touches_origin(ancestor.y) && touches_origin(ancestor.z)
            {
                return level + 1;
            }
            level += 1;
        }
    }

    /// Returns the child cell one level below at the given octant.
    ///
    /// For centered cells these are the eight regular cells touching the origin.
    pub fn octant(self, corner: Corner3) -> Self {
        let [bx, by, bz] = Axis3::ALL.map(|axis| i64::from(corner.is_upper(axis)));
        if self.is_centered_at_origin() {
            Self::new(bx - 1, by - 1, bz - 1, self.exponent - 1)
        } else {
            Self::new(
                2 * self.x + bx,
                2 * self.y + by,
                2 * self.z + bz,
                self.exponent - 1,
            )
        }
    }

    /// Returns all eight octants in index order.
    pub fn octants(self) -> [Self; 8] {
        Corner3::ALL.map(|corner| self.octant(corner))
    }

    /// Whether `other` lies completely within this cell.
    ///
    /// Inclusive, so a cell always contains itself.
    pub fn contains(self, other: Self) -> bool {
        match (self.is_centered_at_origin(), other.is_centered_at_origin()) {
            (true, true) => other.exponent <= self.exponent,
            (true, false) => {
                other.exponent < self.exponent && {
                    let ancestor = other.ancestor(self.exponent - 1);
                    touches_origin(ancestor.x)
                        && touches_origin(ancestor.y)
                        && touches_origin(ancestor.z)
                }
            }
            (false, true) => false,
            (false, false) => other.exponent <= self.exponent && other.ancestor(self.exponent) == self,
        }
    }

    /// Whether the two cells share any volume.
    ///
    /// Cells that only touch along a face, edge or corner do not intersect.
    pub fn intersects(self, other: Self) -> bool {
        match (self.is_centered_at_origin(), other.is_centered_at_origin()) {
            (true, true) => true,
            (true, false) => Self::centered_intersects(self.exponent, other),
            (false, true) => Self::centered_intersects(other.exponent, self),
            (false, false) => self.contains(other) || other.contains(self),
        }
    }

    fn centered_intersects(exponent: i32, regular: Self) -> bool {
        let level = regular.exponent.max(exponent - 1);
        let ancestor = regular.ancestor(level);
        touches_origin(ancestor.x) && touches_origin(ancestor.y) && touches_origin(ancestor.z)
    }

    /// Returns the octant of this cell that `point` falls into.
    ///
    /// Points exactly on a splitting plane go to the lower half.
    pub fn octant_of_point(self, point: DVec3) -> Corner3 {
        let center = self.center();
        Corner3::from_upper_halves(point.x > center.x, point.y > center.y, point.z > center.z)
    }

    /// Returns the unique octant of this cell that contains `other`.
    ///
    /// Returns [`None`] if `other` is not strictly smaller than this cell or not contained.
    pub fn octant_containing(self, other: Self) -> Option<Corner3> {
        if other.is_centered_at_origin() || other.exponent >= self.exponent {
            return None;
        }
        let ancestor = other.ancestor(self.exponent - 1);
        let (base_x, base_y, base_z) = if self.is_centered_at_origin() {
            (-1, -1, -1)
        } else {
            (2 * self.x, 2 * self.y, 2 * self.z)
        };
        let bits = [
            ancestor.x - base_x,
            ancestor.y - base_y,
            ancestor.z - base_z,
        ];
        bits.iter().all(|&bit| bit == 0 || bit == 1).then(|| {
            Corner3::from_upper_halves(bits[0] == 1, bits[1] == 1, bits[2] == 1)
        })
    }

    /// The octant of a centered cell that this regular cell falls into.
    ///
    /// # Panics
    ///
    /// Panics if the cell is centered at the origin itself.
    pub fn origin_octant(self) -> Corner3 {
        assert!(
            !self.is_centered_at_origin(),
            "cell centered at origin has no origin octant"
        );
        Corner3::from_upper_halves(self.x >= 0, self.y >= 0, self.z >= 0)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_centered_at_origin() {
            write!(f, "[centered, {}]", self.exponent)
        } else {
            write!(f, "[{}, {}, {}, {}]", self.x, self.y, self.z, self.exponent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_of_regular_and_centered_cells() {
        let cell = Cell::new(1, -2, 3, 1);
        assert_eq!(
            cell.bounds(),
            Box3::new(DVec3::new(2.0, -4.0, 6.0), DVec3::new(4.0, -2.0, 8.0))
        );
        assert_eq!(cell.center(), DVec3::new(3.0, -3.0, 7.0));
        assert_eq!(
            Cell::centered(2).bounds(),
            Box3::new(DVec3::splat(-2.0), DVec3::splat(2.0))
        );
        assert_eq!(Cell::new(0, 0, 0, -1).size(), 0.5);
    }

    #[test]
    fn octants_are_contained_and_one_level_smaller() {
        for cell in [Cell::new(3, -1, 0, 4), Cell::centered(4)] {
            for corner in Corner3::ALL {
                let octant = cell.octant(corner);
                assert_eq!(octant.exponent(), cell.exponent() - 1);
                assert!(cell.contains(octant));
                assert!(cell.bounds().encloses(octant.bounds()));
                assert_eq!(cell.octant_containing(octant), Some(corner));
            }
        }
    }

    #[test]
    fn centered_octants_touch_origin() {
        let cell = Cell::centered(3);
        assert_eq!(cell.octant(Corner3::X0Y0Z0), Cell::new(-1, -1, -1, 2));
        assert_eq!(cell.octant(Corner3::X1Y1Z1), Cell::new(0, 0, 0, 2));
        assert_eq!(cell.octant(Corner3::X1Y0Z1), Cell::new(0, -1, 0, 2));
        assert!(cell.octants().iter().all(|octant| !octant.is_centered_at_origin()));
    }

    #[test]
    fn contains_regular() {
        let cell = Cell::new(0, 0, 0, 3);
        assert!(cell.contains(cell));
        assert!(cell.contains(Cell::new(5, 5, 5, 0)));
        assert!(!cell.contains(Cell::new(8, 5, 5, 0)));
        assert!(!cell.contains(Cell::new(-1, 5, 5, 0)));
        assert!(!cell.contains(Cell::new(0, 0, 0, 4)));
        assert!(!cell.contains(Cell::centered(1)));
    }

    #[test]
    fn contains_centered() {
        let cell = Cell::centered(3);
        assert!(cell.contains(Cell::centered(2)));
        assert!(!cell.contains(Cell::centered(4)));
        assert!(cell.contains(Cell::new(-4, 3, 0, 0)));
        assert!(!cell.contains(Cell::new(4, 0, 0, 0)));
        assert!(!cell.contains(Cell::new(0, 0, 0, 3)));
    }

    #[test]
    fn intersects_requires_shared_volume() {
        let a = Cell::new(0, 0, 0, 0);
        assert!(a.intersects(a));
        assert!(!a.intersects(Cell::new(1, 0, 0, 0)));
        assert!(!a.intersects(Cell::new(5, 5, 5, 0)));
        assert!(a.intersects(Cell::new(0, 0, 0, 2)));
        assert!(Cell::centered(1).intersects(Cell::centered(5)));
        assert!(Cell::centered(1).intersects(Cell::new(-1, 0, -1, 4)));
        assert!(!Cell::centered(1).intersects(Cell::new(1, 0, 0, 4)));
        assert!(Cell::centered(4).intersects(a));
        assert!(!Cell::centered(4).intersects(Cell::new(8, 0, 0, 0)));
    }

    #[test]
    fn enclosing_regular_cells() {
        let cell = Cell::enclosing(Cell::new(0, 0, 0, 0), Cell::new(5, 5, 5, 0));
        assert_eq!(cell, Cell::new(0, 0, 0, 3));
        let cell = Cell::enclosing(Cell::new(-3, -3, 2, 0), Cell::new(-1, -4, 3, 1));
        assert!(!cell.is_centered_at_origin());
        assert!(cell.contains(Cell::new(-3, -3, 2, 0)));
        assert!(cell.contains(Cell::new(-1, -4, 3, 1)));
    }

    #[test]
    fn enclosing_across_origin_is_centered() {
        let cell = Cell::enclosing(Cell::new(-1, 0, 0, 0), Cell::new(0, 0, 0, 0));
        assert_eq!(cell, Cell::centered(1));
        let cell = Cell::enclosing(Cell::centered(2), Cell::new(7, 0, 0, 0));
        assert_eq!(cell, Cell::centered(4));
        assert!(cell.contains(Cell::new(7, 0, 0, 0)));
        assert_eq!(
            Cell::enclosing(Cell::centered(5), Cell::centered(2)),
            Cell::centered(5)
        );
    }

    #[test]
    fn enclosing_box_regular() {
        let bounds = Box3::new(DVec3::new(0.5, 0.5, 0.5), DVec3::new(1.5, 1.0, 1.0));
        let cell = Cell::enclosing_box(bounds).unwrap();
        assert!(!cell.is_centered_at_origin());
        assert!(cell.bounds().encloses(bounds));
        assert!(Cell::enclosing_box(Box3::EMPTY).is_none());
    }

    #[test]
    fn enclosing_box_straddling_zero() {
        let bounds = Box3::new(DVec3::new(-0.5, 1.0, 1.0), DVec3::new(3.0, 2.0, 2.0));
        let cell = Cell::enclosing_box(bounds).unwrap();
        assert_eq!(cell, Cell::centered(3));
        assert!(cell.bounds().encloses(bounds));
    }

    #[test]
    fn enclosing_box_single_point() {
        let point = DVec3::new(10.25, -3.5, 7.0);
        let cell = Cell::enclosing_box(Box3::point(point)).unwrap();
        assert!(cell.bounds().contains(point));
        assert!(cell.exponent() < 0);
        let origin = Cell::enclosing_box(Box3::point(DVec3::ZERO)).unwrap();
        assert!(origin.bounds().contains(DVec3::ZERO));
    }

    #[test]
    fn octant_of_point_uses_center() {
        let cell = Cell::new(0, 0, 0, 1);
        assert_eq!(cell.octant_of_point(DVec3::new(0.5, 1.5, 0.5)), Corner3::X0Y1Z0);
        assert_eq!(cell.octant_of_point(DVec3::splat(1.0)), Corner3::X0Y0Z0);
        assert_eq!(Cell::centered(2).octant_of_point(DVec3::new(1.0, -1.0, 1.0)), Corner3::X1Y0Z1);
    }

    #[test]
    fn octant_containing_rejects_foreign_cells() {
        let cell = Cell::new(0, 0, 0, 3);
        assert_eq!(cell.octant_containing(Cell::new(5, 1, 6, 0)), Some(Corner3::X1Y0Z1));
        assert_eq!(cell.octant_containing(Cell::new(9, 0, 0, 0)), None);
        assert_eq!(cell.octant_containing(cell), None);
    }

    #[test]
    fn origin_octant() {
        assert_eq!(Cell::new(-1, 0, 3, 2).origin_octant(), Corner3::X0Y1Z1);
        assert_eq!(Cell::new(0, -5, -1, 0).origin_octant(), Corner3::X1Y0Z0);
    }

    #[test]
    #[should_panic(expected = "cell centered at origin has no regular parent")]
    fn centered_has_no_parent() {
        Cell::centered(3).parent();
    }
}
