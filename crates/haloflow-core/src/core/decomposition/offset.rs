use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction bit for the +x face.
pub const EAST: u32 = 1;
/// Direction bit for the -x face.
pub const WEST: u32 = 2;
/// Direction bit for the +y face.
pub const NORTH: u32 = 4;
/// Direction bit for the -y face.
pub const SOUTH: u32 = 8;
/// Direction bit for the +z face.
pub const UP: u32 = 16;
/// Direction bit for the -z face.
pub const DOWN: u32 = 32;
/// Every face of a subdomain.
pub const ALL_DIRECTIONS: u32 = EAST | WEST | NORTH | SOUTH | UP | DOWN;

/// Both direction bits of `axis` (0 = x, 1 = y, 2 = z).
pub const fn axis_bits(axis: usize) -> u32 {
    3 << (2 * axis)
}

/// Relative position of a neighbor subdomain in the rank grid, each component in `-1..=1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Offset(pub [i8; 3]);

impl Offset {
    pub const fn new(dx: i8, dy: i8, dz: i8) -> Self {
        Self([dx, dy, dz])
    }

    /// Position in the 3x3x3 neighborhood, `(dx+1) + 3(dy+1) + 9(dz+1)`.
    pub fn index(self) -> usize {
        let [dx, dy, dz] = self.0;
        ((dx + 1) + 3 * (dy + 1) + 9 * (dz + 1)) as usize
    }

    pub fn from_index(index: usize) -> Self {
        let i = index as i8;
        Self([i % 3 - 1, (i / 3) % 3 - 1, i / 9 - 1])
    }

    /// Bit of this offset in a 27-bit adjacency mask.
    pub fn adjacency_bit(self) -> u32 {
        1 << self.index()
    }

    pub fn opposite(self) -> Self {
        let [dx, dy, dz] = self.0;
        Self([-dx, -dy, -dz])
    }

    pub fn is_zero(self) -> bool {
        self.0 == [0, 0, 0]
    }

    /// Face bits an object must cross to reach this neighbor.
    pub fn direction_bits(self) -> u32 {
        let mut bits = 0;
        for axis in 0..3 {
            bits |= match self.0[axis] {
                1 => 1 << (2 * axis),
                -1 => 2 << (2 * axis),
                _ => 0,
            };
        }
        bits
    }

    /// Inverse of [`Offset::direction_bits`]. A positive bit wins when both faces of an
    /// axis are set.
    pub fn from_direction_bits(bits: u32) -> Self {
        let mut offset = [0i8; 3];
        for (axis, component) in offset.iter_mut().enumerate() {
            if bits & (1 << (2 * axis)) != 0 {
                *component = 1;
            } else if bits & (2 << (2 * axis)) != 0 {
                *component = -1;
            }
        }
        Self(offset)
    }

    /// All 26 non-zero offsets in index order.
    pub fn neighborhood() -> impl Iterator<Item = Offset> {
        (0..27).map(Offset::from_index).filter(|o| !o.is_zero())
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [dx, dy, dz] = self.0;
        write!(f, "({:+}, {:+}, {:+})", dx, dy, dz)
    }
}
