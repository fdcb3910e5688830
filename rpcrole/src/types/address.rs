/*!
Abstraction over an address in a foreign address space.
*/

use std::fmt;
use std::ops;

/**
An address inside a target process's address space.

It internally holds a `u64` value so 32-bit targets can be inspected
from any host. It is never meaningful as a local pointer; every
dereference goes through a [`crate::mem::ProcessMemory`] implementation.
*/
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

/// Constructs an `Address` from a `u32` value.
impl From<u32> for Address {
    fn from(item: u32) -> Self {
        Self(u64::from(item))
    }
}

/// Constructs an `Address` from a `u64` value.
impl From<u64> for Address {
    fn from(item: u64) -> Self {
        Self(item)
    }
}

/// Constructs an `Address` from a `usize` value.
impl From<usize> for Address {
    fn from(item: usize) -> Self {
        Self(item as u64)
    }
}

impl Address {
    /// An address with the value of zero.
    pub const NULL: Address = Address(0);

    /// Returns an address with a value of zero.
    pub const fn null() -> Self {
        Address::NULL
    }

    /// Checks whether the address is zero or not.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Converts the address into a `u64` value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts the address into a `usize` value.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Returns an address with a value of zero.
impl Default for Address {
    fn default() -> Self {
        Self::null()
    }
}

/// Adds a byte offset to an `Address`.
impl ops::Add<usize> for Address {
    type Output = Self;

    fn add(self, other: usize) -> Self {
        Self(self.0 + other as u64)
    }
}

/// Adds a byte offset to an `Address`.
impl ops::AddAssign<usize> for Address {
    fn add_assign(&mut self, other: usize) {
        *self = Self(self.0 + other as u64)
    }
}

/// Subtracts two `Address`es, yielding the byte distance.
impl ops::Sub for Address {
    type Output = u64;

    fn sub(self, other: Self) -> u64 {
        self.0 - other.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
impl fmt::UpperHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}
impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from() {
        assert_eq!(Address::null().is_null(), true);
        assert_eq!(Address::from(1337_u64).as_u64(), 1337);
        assert_eq!(Address::from(4321_usize).as_usize(), 4321);
    }

    #[test]
    fn test_ops() {
        assert_eq!(Address::from(10_u64) + 5, Address::from(15_u64));
        assert_eq!(Address::from(10_u64) - Address::from(5_u64), 5);
    }
}
