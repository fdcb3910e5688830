/*!
Carving a module image out of remote memory and listing its imports.

The carve is one bulk read; everything after that operates purely on
the local buffer and never touches the target again. Parse failures are
reported distinctly from read failures — they mean the carved bytes are
not the image we expected (wrong size, packed or hostile), not that the
target was unreadable.
*/

use log::trace;

use pelite::pe32::Pe as Pe32;
use pelite::pe64::Pe as Pe64;
use pelite::{pe32, pe64, PeView, Wrap};

use crate::error::{Error, Result};
use crate::mem::ProcessMemory;
use crate::types::Address;

/// A locally owned copy of one module's mapped image.
#[derive(Debug)]
pub struct CarvedImage {
    data: Vec<u8>,
}

impl CarvedImage {
    /// Copies `len` bytes starting at `base` out of the target and
    /// validates the PE headers.
    pub fn carve<T: ProcessMemory>(mem: &mut T, base: Address, len: usize) -> Result<Self> {
        if base.is_null() || len == 0 {
            return Err(Error::Other("module base or size is zero"));
        }

        let data = mem
            .read_raw(base, len)
            .map_err(|_| Error::MemoryRead("module image"))?;
        trace!("carved {} bytes at {:x}", data.len(), base);

        // header validation only; the import walk happens on demand
        PeView::from_bytes(&data).map_err(Error::PE)?;

        Ok(Self { data })
    }

    /// Constructs an image from an already local buffer.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        PeView::from_bytes(&data).map_err(Error::PE)?;
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Lists every imported symbol name in import-directory order.
    ///
    /// Duplicates are preserved and ordinal-only imports are skipped.
    /// An image without an import directory fails; an import directory
    /// without named entries yields an empty vector.
    pub fn import_names(&self) -> Result<Vec<String>> {
        match PeView::from_bytes(&self.data).map_err(Error::PE)? {
            Wrap::T32(pe) => import_names_32(pe),
            Wrap::T64(pe) => import_names_64(pe),
        }
    }
}

fn import_names_32(pe: pe32::PeView) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for desc in pe.imports().map_err(Error::PE)? {
        for import in desc.int().map_err(Error::PE)? {
            if let pe32::imports::Import::ByName { name, .. } = import.map_err(Error::PE)? {
                names.push(name.to_str()?.to_string());
            }
        }
    }
    Ok(names)
}

fn import_names_64(pe: pe64::PeView) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for desc in pe.imports().map_err(Error::PE)? {
        for import in desc.int().map_err(Error::PE)? {
            if let pe64::imports::Import::ByName { name, .. } = import.map_err(Error::PE)? {
                names.push(name.to_str()?.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{build_pe_x64, DummySpace};

    #[test]
    fn carve_reads_and_validates() {
        let image = build_pe_x64(&[("kernel32.dll", &["Sleep", "CreateFileW"])]);
        let len = image.len();
        let mut space = DummySpace::new();
        space.map(Address::from(0x7ff8_0000_0000_u64), image);

        let carved = CarvedImage::carve(&mut space, Address::from(0x7ff8_0000_0000_u64), len).unwrap();
        assert_eq!(carved.len(), len);
    }

    #[test]
    fn import_names_preserve_directory_order() {
        let image = build_pe_x64(&[
            ("rpcrt4.dll", &["RpcServerListenEx", "RpcStringBindingComposeA"]),
            ("kernel32.dll", &["Sleep"]),
        ]);
        let carved = CarvedImage::from_bytes(image).unwrap();

        assert_eq!(
            carved.import_names().unwrap(),
            vec!["RpcServerListenEx", "RpcStringBindingComposeA", "Sleep"]
        );
    }

    #[test]
    fn unreadable_image_is_a_read_error() {
        let mut space = DummySpace::new();
        let err = CarvedImage::carve(&mut space, Address::from(0x7ff8_0000_0000_u64), 0x1000)
            .unwrap_err();
        assert_eq!(err, Error::MemoryRead("module image"));
    }

    #[test]
    fn truncated_header_is_a_parse_error() {
        let image = build_pe_x64(&[("kernel32.dll", &["Sleep"])]);
        let mut space = DummySpace::new();
        space.map(Address::from(0x7ff8_0000_0000_u64), image[..0x40].to_vec());

        let err =
            CarvedImage::carve(&mut space, Address::from(0x7ff8_0000_0000_u64), 0x40).unwrap_err();
        assert!(matches!(err, Error::PE(_)));
    }

    #[test]
    fn garbage_bytes_are_a_parse_error() {
        let err = CarvedImage::from_bytes(vec![0x90; 0x400]).unwrap_err();
        assert!(matches!(err, Error::PE(_)));
    }

    #[test]
    fn descriptor_without_named_entries_yields_nothing() {
        let image = build_pe_x64(&[("kernel32.dll", &[])]);
        let carved = CarvedImage::from_bytes(image).unwrap();
        assert_eq!(carved.import_names().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn image_without_import_directory_fails_extraction() {
        let image = build_pe_x64(&[]);
        let carved = CarvedImage::from_bytes(image).unwrap();
        assert!(matches!(carved.import_names(), Err(Error::PE(_))));
    }
}
