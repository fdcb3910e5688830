/*!
Field offsets of the remote loader structures, per target architecture.

These describe undocumented in-memory layouts (`_PEB`, `_PEB_LDR_DATA`,
`_LDR_DATA_TABLE_ENTRY`, `_RTL_USER_PROCESS_PARAMETERS`). Every field
used here has kept its position since Vista on both architectures; the
variance across OS builds starts *after* `BaseDllName` (the load-count
field changed width and meaning in 6.2), which is why the per-entry
snapshot deliberately stops at `entry_read` bytes and no trailing field
is ever decoded.
*/

use dataview::Pod;

use crate::types::Address;

#[derive(Debug, Copy, Clone)]
pub struct ArchOffsets {
    /// Width of a remote pointer in bytes.
    pub ptr_size: usize,

    /// Bytes to snapshot from the environment block base.
    pub peb_read: usize,
    pub peb_image_base: usize, // _PEB::ImageBaseAddress
    pub peb_ldr: usize,        // _PEB::Ldr
    pub peb_params: usize,     // _PEB::ProcessParameters

    /// _PEB_LDR_DATA::InLoadOrderModuleList (the list head / sentinel).
    pub ldr_list: usize,

    /// Bytes to snapshot per module list entry.
    pub entry_read: usize,
    pub entry_blink: usize,     // InLoadOrderLinks.Blink
    pub entry_base: usize,      // _LDR_DATA_TABLE_ENTRY::DllBase
    pub entry_size: usize,      // _LDR_DATA_TABLE_ENTRY::SizeOfImage
    pub entry_full_name: usize, // _LDR_DATA_TABLE_ENTRY::FullDllName
    pub entry_base_name: usize, // _LDR_DATA_TABLE_ENTRY::BaseDllName

    /// Bytes to snapshot from the process parameters record.
    pub params_read: usize,
    pub params_image_path: usize, // _RTL_USER_PROCESS_PARAMETERS::ImagePathName
    pub params_cmdline: usize,    // _RTL_USER_PROCESS_PARAMETERS::CommandLine
}

pub const X86: ArchOffsets = ArchOffsets {
    ptr_size: 4,

    peb_read: 0x14,
    peb_image_base: 0x8,
    peb_ldr: 0xc,
    peb_params: 0x10,

    ldr_list: 0xc,

    entry_read: 0x34,
    entry_blink: 0x4,
    entry_base: 0x18,
    entry_size: 0x20,
    entry_full_name: 0x24,
    entry_base_name: 0x2c,

    params_read: 0x48,
    params_image_path: 0x38,
    params_cmdline: 0x40,
};

pub const X64: ArchOffsets = ArchOffsets {
    ptr_size: 8,

    peb_read: 0x28,
    peb_image_base: 0x10,
    peb_ldr: 0x18,
    peb_params: 0x20,

    ldr_list: 0x10,

    entry_read: 0x68,
    entry_blink: 0x8,
    entry_base: 0x30,
    entry_size: 0x40,
    entry_full_name: 0x48,
    entry_base_name: 0x58,

    params_read: 0x80,
    params_image_path: 0x60,
    params_cmdline: 0x70,
};

impl ArchOffsets {
    /// Decodes a remote pointer out of a locally snapshotted buffer.
    pub fn read_ptr(&self, buf: &[u8], offset: usize) -> Address {
        let view = Pod::as_data_view(buf);
        match self.ptr_size {
            4 => Address::from(view.copy::<u32>(offset)),
            _ => Address::from(view.copy::<u64>(offset)),
        }
    }

    /// Decodes an embedded UNICODE_STRING into its (buffer, byte length)
    /// pair. The buffer pointer sits one pointer-width past the two u16
    /// length fields on both architectures.
    pub fn read_unicode_ref(&self, buf: &[u8], offset: usize) -> (Address, u16) {
        let view = Pod::as_data_view(buf);
        let length = view.copy::<u16>(offset);
        let buffer = self.read_ptr(buf, offset + self.ptr_size);
        (buffer, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptr_decoding_follows_arch_width() {
        let buf = [0x78, 0x56, 0x34, 0x12, 0xef, 0xcd, 0xab, 0x89];
        assert_eq!(X86.read_ptr(&buf, 0), Address::from(0x1234_5678_u64));
        assert_eq!(X64.read_ptr(&buf, 0), Address::from(0x89ab_cdef_1234_5678_u64));
    }

    #[test]
    fn unicode_ref_decoding() {
        // Length 0x1a, MaximumLength 0x1c, 4 bytes padding, Buffer
        let mut buf = vec![0u8; 0x10];
        buf[0] = 0x1a;
        buf[2] = 0x1c;
        buf[8..16].copy_from_slice(&0x7fff_0000_1000_u64.to_le_bytes());

        let (buffer, len) = X64.read_unicode_ref(&buf, 0);
        assert_eq!(buffer, Address::from(0x7fff_0000_1000_u64));
        assert_eq!(len, 0x1a);
    }
}
