/*!
Snapshot loaders for the target's environment block and the records it
points at.

The load is a chain of dependent remote reads: the environment block
yields the loader-state and process-parameter pointers, the loader-state
record yields the module list head. A malformed or zeroed pointer at any
stage aborts the chain with an error naming that stage; the next stage
is never attempted against a bogus address.
*/

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::mem::ProcessMemory;
use crate::offsets::ArchOffsets;
use crate::types::Address;
use crate::win32::unicode_string::read_unicode_string;

/// Local snapshot of the target's environment block.
///
/// Stale the instant the target continues executing; reload instead of
/// caching across walks.
#[derive(Debug, Clone, Copy)]
pub struct Peb {
    /// Remote address this snapshot was taken from.
    pub address: Address,
    /// Remote base of the process's own main executable image.
    pub image_base: Address,
    /// Remote address of the loader-state record.
    pub ldr: Address,
    /// Remote address of the process parameters record.
    pub params: Address,
}

impl Peb {
    pub fn load<T: ProcessMemory>(
        mem: &mut T,
        address: Address,
        offsets: &ArchOffsets,
    ) -> Result<Self> {
        if address.is_null() {
            return Err(Error::ControlBlock("peb address is null"));
        }

        let buf = mem
            .read_raw(address, offsets.peb_read)
            .map_err(|_| Error::MemoryRead("peb"))?;

        let image_base = offsets.read_ptr(&buf, offsets.peb_image_base);
        let ldr = offsets.read_ptr(&buf, offsets.peb_ldr);
        let params = offsets.read_ptr(&buf, offsets.peb_params);
        trace!(
            "peb at {:x}: image_base={:x} ldr={:x} params={:x}",
            address,
            image_base,
            ldr,
            params
        );

        if ldr.is_null() {
            return Err(Error::ControlBlock("peb.Ldr is null"));
        }

        Ok(Self {
            address,
            image_base,
            ldr,
            params,
        })
    }
}

/// Local snapshot of the loader-state record rooting the module list.
///
/// `head` is the sentinel: the remote address of the list head embedded
/// in the record itself. Seeing it again while following forward links
/// is the walk's primary termination test.
#[derive(Debug, Clone, Copy)]
pub struct LdrData {
    pub head: Address,
    pub first: Address,
}

impl LdrData {
    pub fn load<T: ProcessMemory>(
        mem: &mut T,
        ldr: Address,
        offsets: &ArchOffsets,
    ) -> Result<Self> {
        let head = ldr + offsets.ldr_list;

        let buf = mem
            .read_raw(head, offsets.ptr_size)
            .map_err(|_| Error::MemoryRead("peb.Ldr"))?;
        let first = offsets.read_ptr(&buf, 0);
        trace!("ldr at {:x}: head={:x} first={:x}", ldr, head, first);

        if first.is_null() {
            return Err(Error::ControlBlock("module list head is null"));
        }

        Ok(Self { head, first })
    }
}

/// Command line and image path as recorded by the loader.
///
/// Loaded only once a process is known to carry a role; an unresolvable
/// string degrades to empty instead of failing the record.
#[derive(Debug, Clone, Default)]
pub struct ProcessParameters {
    pub image_path: String,
    pub command_line: String,
}

impl ProcessParameters {
    pub fn load<T: ProcessMemory>(
        mem: &mut T,
        params: Address,
        offsets: &ArchOffsets,
    ) -> Result<Self> {
        if params.is_null() {
            return Err(Error::ControlBlock("process parameters pointer is null"));
        }

        let buf = mem
            .read_raw(params, offsets.params_read)
            .map_err(|_| Error::MemoryRead("process parameters"))?;

        let (path_buf, path_len) = offsets.read_unicode_ref(&buf, offsets.params_image_path);
        let (cmd_buf, cmd_len) = offsets.read_unicode_ref(&buf, offsets.params_cmdline);

        let image_path = read_unicode_string(mem, path_buf, path_len).unwrap_or_else(|err| {
            debug!("image path unresolved: {}", err);
            String::new()
        });
        let command_line = read_unicode_string(mem, cmd_buf, cmd_len).unwrap_or_else(|err| {
            debug!("command line unresolved: {}", err);
            String::new()
        });

        Ok(Self {
            image_path,
            command_line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummySpace, SpaceBuilder};
    use crate::offsets::{X64, X86};

    #[test]
    fn load_decodes_all_three_pointers() {
        let mut builder = SpaceBuilder::new(X64);
        builder.peb(0x10000, 0x400000, 0x20000, 0x30000);
        let mut space = builder.build();

        let peb = Peb::load(&mut space, Address::from(0x10000_u64), &X64).unwrap();
        assert_eq!(peb.image_base, Address::from(0x400000_u64));
        assert_eq!(peb.ldr, Address::from(0x20000_u64));
        assert_eq!(peb.params, Address::from(0x30000_u64));
    }

    #[test]
    fn null_ldr_aborts_the_chain() {
        let mut builder = SpaceBuilder::new(X64);
        builder.peb(0x10000, 0x400000, 0, 0x30000);
        let mut space = builder.build();

        let err = Peb::load(&mut space, Address::from(0x10000_u64), &X64).unwrap_err();
        assert_eq!(err, Error::ControlBlock("peb.Ldr is null"));
    }

    #[test]
    fn unreadable_peb_names_the_stage() {
        let mut space = DummySpace::new();
        let err = Peb::load(&mut space, Address::from(0x10000_u64), &X64).unwrap_err();
        assert_eq!(err, Error::MemoryRead("peb"));
    }

    #[test]
    fn ldr_data_reads_the_sentinel_forward_link() {
        let mut builder = SpaceBuilder::new(X86);
        builder.peb(0x10000, 0x400000, 0x20000, 0x30000);
        builder.module(0x40000, 0x400000, 0x1000, "host.exe", r"C:\host.exe");
        let mut space = builder.build();

        let ldr = LdrData::load(&mut space, Address::from(0x20000_u64), &X86).unwrap();
        assert_eq!(ldr.head, Address::from(0x20000_u64 + 0xc));
        assert_eq!(ldr.first, Address::from(0x40000_u64));
    }

    #[test]
    fn parameters_degrade_to_empty_on_bad_strings() {
        let mut builder = SpaceBuilder::new(X64);
        builder.peb(0x10000, 0x400000, 0x20000, 0x30000);
        builder.params(0x30000, r"C:\host.exe", "host.exe -flag");
        let mut space = builder.build();

        // sanity: resolvable strings come through
        let params = ProcessParameters::load(&mut space, Address::from(0x30000_u64), &X64).unwrap();
        assert_eq!(params.image_path, r"C:\host.exe");
        assert_eq!(params.command_line, "host.exe -flag");

        // poke the command line buffer pointer into unmapped space
        let mut builder = SpaceBuilder::new(X64);
        builder.peb(0x10000, 0x400000, 0x20000, 0x30000);
        builder.params(0x30000, r"C:\host.exe", "host.exe -flag");
        builder.corrupt_cmdline_buffer(0x30000, 0xdead0000);
        let mut space = builder.build();

        let params = ProcessParameters::load(&mut space, Address::from(0x30000_u64), &X64).unwrap();
        assert_eq!(params.image_path, r"C:\host.exe");
        assert_eq!(params.command_line, "");
    }
}
