/*!
Fabricated target processes for tests.

`DummySpace` is a sparse remote address space backed by local buffers,
`SpaceBuilder` lays loader structures out inside one the way a live
target would, and `build_pe_x64` produces a minimal but well-formed
PE32+ image with a real import directory. None of this exists outside
test builds.
*/

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::mem::ProcessMemory;
use crate::offsets::ArchOffsets;
use crate::scan::{OpenProcessHandle, ProcessHandle};
use crate::types::Address;
use crate::win32::LdrData;

/// Where the builder parks string payloads.
const STRING_POOL: u64 = 0x0070_0000;

pub fn encode_utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// A sparse fake address space. Reads must fall entirely inside one
/// mapped region; anything else is an invalid address, which also
/// covers the short-read case.
#[derive(Default)]
pub struct DummySpace {
    regions: Vec<(u64, Vec<u8>)>,
}

impl DummySpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, addr: Address, bytes: Vec<u8>) {
        self.regions.push((addr.as_u64(), bytes));
    }

    /// Overwrites bytes inside an already mapped region.
    pub fn patch(&mut self, addr: u64, bytes: &[u8]) {
        for (base, data) in &mut self.regions {
            if addr >= *base && addr + bytes.len() as u64 <= *base + data.len() as u64 {
                let off = (addr - *base) as usize;
                data[off..off + bytes.len()].copy_from_slice(bytes);
                return;
            }
        }
        panic!("patch outside any mapped region: {:#x}", addr);
    }
}

impl ProcessMemory for DummySpace {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let start = addr.as_u64();
        for (base, data) in &self.regions {
            if start >= *base && start + out.len() as u64 <= *base + data.len() as u64 {
                let off = (start - *base) as usize;
                out.copy_from_slice(&data[off..off + out.len()]);
                return Ok(());
            }
        }
        Err(Error::InvalidAddress)
    }
}

/// Fails the test on any read; proves a code path performs none.
pub struct PanicSpace;

impl ProcessMemory for PanicSpace {
    fn read_raw_into(&mut self, _addr: Address, _out: &mut [u8]) -> Result<()> {
        panic!("unexpected remote read");
    }
}

enum ModuleSpec {
    Mapped {
        entry: u64,
        base: u64,
        size: u32,
        name: String,
        path: String,
    },
    /// Linked into the chain but never mapped; reading it fails.
    Broken { entry: u64 },
}

impl ModuleSpec {
    fn entry(&self) -> u64 {
        match self {
            ModuleSpec::Mapped { entry, .. } => *entry,
            ModuleSpec::Broken { entry } => *entry,
        }
    }
}

/// Lays out a fake process image the way the loader would.
pub struct SpaceBuilder {
    offsets: ArchOffsets,
    peb: Option<(u64, u64, u64, u64)>,
    params: Option<(u64, String, String)>,
    modules: Vec<ModuleSpec>,
    images: Vec<(u64, Vec<u8>)>,
    patches: Vec<(u64, Vec<u8>)>,
}

impl SpaceBuilder {
    pub fn new(offsets: ArchOffsets) -> Self {
        Self {
            offsets,
            peb: None,
            params: None,
            modules: Vec::new(),
            images: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn offsets(&self) -> ArchOffsets {
        self.offsets
    }

    pub fn peb(&mut self, addr: u64, image_base: u64, ldr: u64, params: u64) -> &mut Self {
        self.peb = Some((addr, image_base, ldr, params));
        self
    }

    pub fn params(&mut self, addr: u64, image_path: &str, cmdline: &str) -> &mut Self {
        self.params = Some((addr, image_path.into(), cmdline.into()));
        self
    }

    pub fn module(&mut self, entry: u64, base: u64, size: u32, name: &str, path: &str) -> &mut Self {
        self.modules.push(ModuleSpec::Mapped {
            entry,
            base,
            size,
            name: name.into(),
            path: path.into(),
        });
        self
    }

    pub fn broken_module(&mut self, entry: u64) -> &mut Self {
        self.modules.push(ModuleSpec::Broken { entry });
        self
    }

    pub fn image(&mut self, base: u64, bytes: Vec<u8>) -> &mut Self {
        self.images.push((base, bytes));
        self
    }

    /// Redirects a module's FullDllName buffer into unmapped space.
    pub fn corrupt_module_path_buffer(&mut self, entry: u64, bogus: u64) -> &mut Self {
        let off = entry + (self.offsets.entry_full_name + self.offsets.ptr_size) as u64;
        self.patches.push((off, self.ptr_bytes(bogus)));
        self
    }

    /// Redirects the CommandLine buffer into unmapped space.
    pub fn corrupt_cmdline_buffer(&mut self, params: u64, bogus: u64) -> &mut Self {
        let off = params + (self.offsets.params_cmdline + self.offsets.ptr_size) as u64;
        self.patches.push((off, self.ptr_bytes(bogus)));
        self
    }

    /// The loader-state view a control-block load would produce.
    pub fn ldr_data(&self) -> LdrData {
        let (_, _, ldr, _) = self.peb.expect("builder has no peb");
        let head = ldr + self.offsets.ldr_list as u64;
        let first = self
            .modules
            .first()
            .map(|m| m.entry())
            .unwrap_or(head);
        LdrData {
            head: Address::from(head),
            first: Address::from(first),
        }
    }

    fn ptr_bytes(&self, value: u64) -> Vec<u8> {
        match self.offsets.ptr_size {
            4 => (value as u32).to_le_bytes().to_vec(),
            _ => value.to_le_bytes().to_vec(),
        }
    }

    fn write_ptr(&self, buf: &mut [u8], off: usize, value: u64) {
        let bytes = self.ptr_bytes(value);
        buf[off..off + bytes.len()].copy_from_slice(&bytes);
    }

    fn write_unicode_ref(
        &self,
        buf: &mut [u8],
        off: usize,
        text: &str,
        pool: &mut u64,
        space: &mut DummySpace,
    ) {
        let payload = encode_utf16(text);
        let len = payload.len() as u16;
        buf[off..off + 2].copy_from_slice(&len.to_le_bytes());
        buf[off + 2..off + 4].copy_from_slice(&len.to_le_bytes());
        if !payload.is_empty() {
            let addr = *pool;
            *pool += (payload.len() as u64 + 0xf) & !0xf;
            self.write_ptr(buf, off + self.offsets.ptr_size, addr);
            space.map(Address::from(addr), payload);
        }
    }

    pub fn build(&self) -> DummySpace {
        let mut space = DummySpace::new();
        let mut pool = STRING_POOL;
        let offs = &self.offsets;

        if let Some((addr, image_base, ldr, params)) = self.peb {
            let mut buf = vec![0u8; offs.peb_read];
            self.write_ptr(&mut buf, offs.peb_image_base, image_base);
            self.write_ptr(&mut buf, offs.peb_ldr, ldr);
            self.write_ptr(&mut buf, offs.peb_params, params);
            space.map(Address::from(addr), buf);

            if ldr != 0 {
                // the loader record holds the list head; an empty list
                // points the head back at itself
                let head = ldr + offs.ldr_list as u64;
                let first = self.modules.first().map(|m| m.entry()).unwrap_or(head);
                let last = self.modules.last().map(|m| m.entry()).unwrap_or(head);
                let mut buf = vec![0u8; offs.ldr_list + 2 * offs.ptr_size];
                self.write_ptr(&mut buf, offs.ldr_list, first);
                self.write_ptr(&mut buf, offs.ldr_list + offs.ptr_size, last);
                space.map(Address::from(ldr), buf);

                for (idx, spec) in self.modules.iter().enumerate() {
                    let (entry, base, size, name, path) = match spec {
                        ModuleSpec::Mapped {
                            entry,
                            base,
                            size,
                            name,
                            path,
                        } => (*entry, *base, *size, name.as_str(), path.as_str()),
                        ModuleSpec::Broken { .. } => continue,
                    };

                    let flink = self
                        .modules
                        .get(idx + 1)
                        .map(|m| m.entry())
                        .unwrap_or(head);
                    let blink = if idx == 0 {
                        head
                    } else {
                        self.modules[idx - 1].entry()
                    };

                    let mut buf = vec![0u8; offs.entry_read];
                    self.write_ptr(&mut buf, 0, flink);
                    self.write_ptr(&mut buf, offs.entry_blink, blink);
                    self.write_ptr(&mut buf, offs.entry_base, base);
                    buf[offs.entry_size..offs.entry_size + 4]
                        .copy_from_slice(&size.to_le_bytes());
                    self.write_unicode_ref(&mut buf, offs.entry_full_name, path, &mut pool, &mut space);
                    self.write_unicode_ref(&mut buf, offs.entry_base_name, name, &mut pool, &mut space);
                    space.map(Address::from(entry), buf);
                }
            }
        }

        if let Some((addr, image_path, cmdline)) = &self.params {
            let mut buf = vec![0u8; offs.params_read];
            self.write_unicode_ref(&mut buf, offs.params_image_path, image_path, &mut pool, &mut space);
            self.write_unicode_ref(&mut buf, offs.params_cmdline, cmdline, &mut pool, &mut space);
            space.map(Address::from(*addr), buf);
        }

        for (base, bytes) in &self.images {
            space.map(Address::from(*base), bytes.clone());
        }

        for (addr, bytes) in &self.patches {
            space.patch(*addr, bytes);
        }

        space
    }

    /// Builds a scannable process around this space.
    pub fn process(&self, owner: &str) -> DummyProcess {
        let (peb, ..) = self.peb.expect("builder has no peb");
        DummyProcess {
            space: self.build(),
            peb: Address::from(peb),
            owner: Some(owner.to_string()),
        }
    }

    /// Same, but owner resolution fails.
    pub fn process_without_owner(&self) -> DummyProcess {
        let (peb, ..) = self.peb.expect("builder has no peb");
        DummyProcess {
            space: self.build(),
            peb: Address::from(peb),
            owner: None,
        }
    }
}

/// A fake open process handle.
pub struct DummyProcess {
    pub space: DummySpace,
    pub peb: Address,
    pub owner: Option<String>,
}

impl DummyProcess {
    /// A process whose address space is entirely unmapped.
    pub fn empty(peb: u64) -> Self {
        Self {
            space: DummySpace::new(),
            peb: Address::from(peb),
            owner: None,
        }
    }
}

impl ProcessMemory for DummyProcess {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        self.space.read_raw_into(addr, out)
    }
}

impl ProcessHandle for DummyProcess {
    fn peb_address(&mut self) -> Result<Address> {
        Ok(self.peb)
    }

    fn owner(&mut self) -> Result<String> {
        self.owner
            .clone()
            .ok_or(Error::AccessDenied("process token"))
    }
}

/// Hands out fake handles by pid; unknown pids are denied.
#[derive(Default)]
pub struct DummyOpener {
    procs: HashMap<u32, DummyProcess>,
}

impl DummyOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pid: u32, process: DummyProcess) {
        self.procs.insert(pid, process);
    }
}

impl OpenProcessHandle for DummyOpener {
    type Handle = DummyProcess;

    fn open(&mut self, pid: u32) -> Result<Self::Handle> {
        self.procs
            .remove(&pid)
            .ok_or(Error::AccessDenied("open process"))
    }
}

/// Hand-built minimal PE32+ image, identity-mapped (rva == offset),
/// with one import descriptor per `(dll, names)` pair. An empty slice
/// produces an image without an import directory.
pub fn build_pe_x64(imports: &[(&str, &[&str])]) -> Vec<u8> {
    const SIZE: usize = 0x1000;
    const OPT: usize = 0x98; // optional header offset
    const IDATA: usize = 0x200;

    let mut image = vec![0u8; SIZE];

    let w16 = |img: &mut Vec<u8>, off: usize, v: u16| {
        img[off..off + 2].copy_from_slice(&v.to_le_bytes())
    };
    let w32 = |img: &mut Vec<u8>, off: usize, v: u32| {
        img[off..off + 4].copy_from_slice(&v.to_le_bytes())
    };
    let w64 = |img: &mut Vec<u8>, off: usize, v: u64| {
        img[off..off + 8].copy_from_slice(&v.to_le_bytes())
    };

    // DOS header
    w16(&mut image, 0x00, 0x5a4d); // MZ
    w32(&mut image, 0x3c, 0x80); // e_lfanew

    // NT headers
    w32(&mut image, 0x80, 0x0000_4550); // PE\0\0
    w16(&mut image, 0x84, 0x8664); // machine: x64
    w16(&mut image, 0x86, 1); // one section
    w16(&mut image, 0x94, 0xf0); // size of optional header
    w16(&mut image, 0x96, 0x2022); // executable | dll | large-address-aware

    // optional header (PE32+)
    w16(&mut image, OPT, 0x020b);
    w32(&mut image, OPT + 0x14, IDATA as u32); // base of code
    w64(&mut image, OPT + 0x18, 0x1_8000_0000); // image base
    w32(&mut image, OPT + 0x20, 0x200); // section alignment
    w32(&mut image, OPT + 0x24, 0x200); // file alignment
    w16(&mut image, OPT + 0x28, 6); // os version
    w16(&mut image, OPT + 0x30, 6); // subsystem version
    w32(&mut image, OPT + 0x38, SIZE as u32); // size of image
    w32(&mut image, OPT + 0x3c, 0x200); // size of headers
    w16(&mut image, OPT + 0x44, 3); // subsystem: console
    w64(&mut image, OPT + 0x48, 0x10_0000); // stack reserve
    w64(&mut image, OPT + 0x50, 0x1000); // stack commit
    w64(&mut image, OPT + 0x58, 0x10_0000); // heap reserve
    w64(&mut image, OPT + 0x60, 0x1000); // heap commit
    w32(&mut image, OPT + 0x6c, 16); // rva-and-sizes count

    // section header: .idata, identity mapped
    let sect = OPT + 0xf0;
    image[sect..sect + 6].copy_from_slice(b".idata");
    w32(&mut image, sect + 0x08, (SIZE - IDATA) as u32); // virtual size
    w32(&mut image, sect + 0x0c, IDATA as u32); // virtual address
    w32(&mut image, sect + 0x10, (SIZE - IDATA) as u32); // raw size
    w32(&mut image, sect + 0x14, IDATA as u32); // raw pointer
    w32(&mut image, sect + 0x24, 0xc000_0040); // initialized data | r/w

    if imports.is_empty() {
        return image;
    }

    // import descriptors, then per-descriptor thunk tables and names
    let desc_bytes = (imports.len() + 1) * 20;
    let mut cursor = IDATA + desc_bytes;
    let alloc = |need: usize, cursor: &mut usize| {
        let at = *cursor;
        *cursor = (*cursor + need + 7) & !7;
        at
    };

    for (i, (dll, names)) in imports.iter().enumerate() {
        // hint/name entries first so the thunk tables can refer to them
        let mut hint_rvas = Vec::new();
        for name in names.iter() {
            let at = alloc(2 + name.len() + 1, &mut cursor);
            w16(&mut image, at, 0);
            image[at + 2..at + 2 + name.len()].copy_from_slice(name.as_bytes());
            hint_rvas.push(at as u64);
        }

        let dll_at = alloc(dll.len() + 1, &mut cursor);
        image[dll_at..dll_at + dll.len()].copy_from_slice(dll.as_bytes());

        let int_at = alloc((names.len() + 1) * 8, &mut cursor);
        let iat_at = alloc((names.len() + 1) * 8, &mut cursor);
        for (n, rva) in hint_rvas.iter().enumerate() {
            w64(&mut image, int_at + n * 8, *rva);
            w64(&mut image, iat_at + n * 8, *rva);
        }

        let desc = IDATA + i * 20;
        w32(&mut image, desc, int_at as u32); // original first thunk
        w32(&mut image, desc + 0x0c, dll_at as u32); // name
        w32(&mut image, desc + 0x10, iat_at as u32); // first thunk
    }

    // import data directory
    w32(&mut image, OPT + 0x70 + 8, IDATA as u32);
    w32(&mut image, OPT + 0x70 + 12, desc_bytes as u32);

    image
}
