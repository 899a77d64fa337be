use std::fmt;

/// A set of physical endpoint numbers (0..32).
///
/// Iteration and [EndpointMap::first_set] go from the lowest number up, so "lowest physical
/// endpoint first" is the order every caller sees.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct EndpointMap(u32);

impl EndpointMap {
    /// Physical endpoints 0 and 1, the control pipe.
    pub const CTRL_ALLOC: Self = Self(0b11);
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, phy: u8) -> bool {
        phy < 32 && self.0 & (1 << phy) != 0
    }

    pub fn set(&mut self, phy: u8) {
        debug_assert!(phy < 32);
        self.0 |= 1 << phy;
    }

    pub fn clear(&mut self, phy: u8) {
        debug_assert!(phy < 32);
        self.0 &= !(1 << phy);
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn first_set(self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = u8> {
        let mut rest = self;
        std::iter::from_fn(move || {
            let phy = rest.first_set()?;
            rest.clear(phy);
            Some(phy)
        })
    }
}

impl fmt::Debug for EndpointMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointMap({:#010x})", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lowest_first() {
        let mut map = EndpointMap::EMPTY;
        map.set(9);
        map.set(3);
        map.set(31);
        assert_eq!(map.first_set(), Some(3));
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![3, 9, 31]);
        map.clear(3);
        assert_eq!(map.first_set(), Some(9));
        assert!(!map.contains(3));
        assert!(!map.contains(40));
    }

    #[test]
    fn set_operations() {
        let a = EndpointMap::from_bits(0b1110);
        let b = EndpointMap::CTRL_ALLOC;
        assert_eq!(a.union(b).bits(), 0b1111);
        assert_eq!(a.difference(b).bits(), 0b1100);
        assert!(EndpointMap::EMPTY.is_empty());
    }
}
