/*!
The remote-memory read primitive every other stage is built on.

Implementations copy bytes out of a foreign address space. The contract
is strict: a read either fills the whole output buffer or fails — short
reads are errors, and no implementation retries on its own. Retry policy
(there is none in this tool) belongs to callers.
*/

use crate::error::Result;
use crate::types::Address;

/**
Read access to one target process's address space.

Reading from `ProcessMemory`:
```
use rpcrole::mem::ProcessMemory;
use rpcrole::types::Address;

fn read_header<T: ProcessMemory>(mem: &mut T) -> rpcrole::error::Result<Vec<u8>> {
    mem.read_raw(Address::from(0x1000_u64), 64)
}
```
*/
pub trait ProcessMemory {
    /// Copies exactly `out.len()` bytes from `addr` in the target.
    ///
    /// Fails if any byte in the range cannot be read; partial data is
    /// never returned.
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()>;

    /// Copies `len` bytes from `addr` into a fresh buffer.
    fn read_raw(&mut self, addr: Address, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_raw_into(addr, &mut buf)?;
        Ok(buf)
    }
}

// forward impls
impl<T: ProcessMemory + ?Sized, P: std::ops::DerefMut<Target = T>> ProcessMemory for P {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        (**self).read_raw_into(addr, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummySpace;
    use crate::error::Error;

    #[test]
    fn exact_length_reads() {
        let mut space = DummySpace::new();
        space.map(Address::from(0x1000_u64), vec![0xAA; 16]);

        let buf = space.read_raw(Address::from(0x1000_u64), 16).unwrap();
        assert_eq!(buf, vec![0xAA; 16]);
    }

    #[test]
    fn short_backing_buffer_is_an_error() {
        // 15 bytes mapped, 16 requested
        let mut space = DummySpace::new();
        space.map(Address::from(0x1000_u64), vec![0xAA; 15]);

        let err = space.read_raw(Address::from(0x1000_u64), 16).unwrap_err();
        assert_eq!(err, Error::InvalidAddress);
    }

    #[test]
    fn unmapped_address_is_an_error() {
        let mut space = DummySpace::new();
        let err = space.read_raw(Address::from(0xdead_u64), 8).unwrap_err();
        assert_eq!(err, Error::InvalidAddress);
    }
}
