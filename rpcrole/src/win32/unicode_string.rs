use widestring::U16String;

use crate::error::{Error, Result};
use crate::mem::ProcessMemory;
use crate::types::Address;

/// Resolves a remote UNICODE_STRING payload into a local `String`.
///
/// `length_in_bytes` of zero yields the empty string without touching
/// the target; the loader uses an empty name as an end-of-list marker,
/// so this is a meaningful value and not an error. Odd byte counts are
/// truncated to whole utf-16 units and unpaired surrogates decode to
/// the replacement character instead of failing the read.
pub fn read_unicode_string<T: ProcessMemory>(
    mem: &mut T,
    buffer: Address,
    length_in_bytes: u16,
) -> Result<String> {
    let byte_len = usize::from(length_in_bytes) & !1;
    if byte_len == 0 {
        return Ok(String::new());
    }

    if buffer.is_null() {
        return Err(Error::StringResolution("string buffer is null"));
    }

    let raw = mem
        .read_raw(buffer, byte_len)
        .map_err(|_| Error::StringResolution("string buffer unreadable"))?;

    let units = raw
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect::<Vec<u16>>();
    Ok(U16String::from_vec(units).to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{encode_utf16, DummySpace, PanicSpace};

    #[test]
    fn resolves_wide_strings() {
        let mut space = DummySpace::new();
        let payload = encode_utf16("rpcrt4.dll");
        let len = payload.len() as u16;
        space.map(Address::from(0x2000_u64), payload);

        let s = read_unicode_string(&mut space, Address::from(0x2000_u64), len).unwrap();
        assert_eq!(s, "rpcrt4.dll");
    }

    #[test]
    fn zero_length_never_reads() {
        // PanicSpace fails the test on any read attempt
        let mut space = PanicSpace;
        let s = read_unicode_string(&mut space, Address::from(0x2000_u64), 0).unwrap();
        assert_eq!(s, "");
    }

    #[test]
    fn null_buffer_with_length_is_an_error() {
        let mut space = DummySpace::new();
        let err = read_unicode_string(&mut space, Address::null(), 8).unwrap_err();
        assert_eq!(err, Error::StringResolution("string buffer is null"));
    }

    #[test]
    fn unpaired_surrogate_decodes_lossy() {
        let mut space = DummySpace::new();
        // "a" followed by a lone high surrogate
        let bytes = vec![0x61, 0x00, 0x00, 0xd8];
        space.map(Address::from(0x3000_u64), bytes);

        let s = read_unicode_string(&mut space, Address::from(0x3000_u64), 4).unwrap();
        assert_eq!(s, "a\u{fffd}");
    }

    #[test]
    fn odd_length_truncates_to_whole_units() {
        let mut space = DummySpace::new();
        space.map(Address::from(0x3000_u64), encode_utf16("ab"));

        let s = read_unicode_string(&mut space, Address::from(0x3000_u64), 3).unwrap();
        assert_eq!(s, "a");
    }
}
