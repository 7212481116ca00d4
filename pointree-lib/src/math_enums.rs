use enum_map::Enum;
use enumset::{EnumSet, EnumSetType};
use glam::{DVec3, UVec3};

/// A three-dimensional axis; `X`, `Y`, or `Z`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Enum, EnumSetType)]
#[enumset(no_super_impls)]
pub enum Axis3 {
    X,
    Y,
    Z,
}

impl Axis3 {
    /// All three axes in `X`, `Y`, `Z` order.
    pub const ALL: [Self; 3] = [Self::X, Self::Y, Self::Z];
}

/// One of the eight octants of a cube, named after the half it occupies along each axis.
///
/// The discriminant is the octant index used throughout the octree: bit 0 selects the upper half
/// along `X`, bit 1 along `Y` and bit 2 along `Z`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Enum, EnumSetType)]
#[enumset(no_super_impls)]
pub enum Corner3 {
    X0Y0Z0,
    X1Y0Z0,
    X0Y1Z0,
    X1Y1Z0,
    X0Y0Z1,
    X1Y0Z1,
    X0Y1Z1,
    X1Y1Z1,
}

impl Corner3 {
    /// All corners in index order.
    pub const ALL: [Self; 8] = [
        Self::X0Y0Z0,
        Self::X1Y0Z0,
        Self::X0Y1Z0,
        Self::X1Y1Z0,
        Self::X0Y0Z1,
        Self::X1Y0Z1,
        Self::X0Y1Z1,
        Self::X1Y1Z1,
    ];

    /// Returns the corner with the given octant index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not in `0..8`.
    pub const fn from_index(index: usize) -> Self {
        assert!(index < 8, "octant index should be less than 8");
        Self::ALL[index]
    }

    /// Returns the corner for the upper (`true`) or lower (`false`) half along each axis.
    pub const fn from_upper_halves(x: bool, y: bool, z: bool) -> Self {
        Self::ALL[x as usize | (y as usize) << 1 | (z as usize) << 2]
    }

    /// The octant index of this corner.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether this corner lies in the upper half along the given `axis`.
    pub const fn is_upper(self, axis: Axis3) -> bool {
        (self as u8) & (1 << axis as u8) != 0
    }

    /// `1` along every axis this corner is in the upper half of, `0` otherwise.
    pub fn offset(self) -> UVec3 {
        UVec3::from(Axis3::ALL.map(|axis| u32::from(self.is_upper(axis))))
    }
}

impl From<Corner3> for UVec3 {
    fn from(corner: Corner3) -> Self {
        corner.offset()
    }
}

impl From<Corner3> for DVec3 {
    fn from(corner: Corner3) -> Self {
        corner.offset().as_dvec3()
    }
}

/// A set of octants.
pub type Corners3 = EnumSet<Corner3>;
