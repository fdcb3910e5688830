/*!
The per-process pipeline and the loop driving it over a process list.

One process at a time: open, snapshot the control block, walk modules
until the RPC runtime shows up, carve it, classify its imports, emit.
Every failure below the loop is caught here, logged with pid and stage,
and never stops the remaining processes. Handles are scoped to one
iteration and closed on every exit path.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::error::{Error, Result};
use crate::mem::ProcessMemory;
use crate::offsets::{ArchOffsets, X64};
use crate::pe::CarvedImage;
use crate::rpc::{Role, RPC_RUNTIME_DLL};
use crate::types::Address;
use crate::win32::{LdrData, ModuleInfo, ModuleList, Peb, ProcessParameters};

/// One record from the process-enumeration collaborator.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
}

/// Read and query access to one target process.
///
/// Implementations own whatever OS capability backs this and release it
/// when dropped; the scanner never holds one past a single process.
pub trait ProcessHandle: ProcessMemory {
    /// The one privileged query: the remote address of the target's
    /// environment block. Not a memory read.
    fn peb_address(&mut self) -> Result<Address>;

    /// Owning user of the target in `DOMAIN\account` form.
    fn owner(&mut self) -> Result<String>;
}

/// Opens process handles with query + memory-read rights.
pub trait OpenProcessHandle {
    type Handle: ProcessHandle;

    fn open(&mut self, pid: u32) -> Result<Self::Handle>;
}

/// One emitted result: a process observed to use the RPC runtime.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct RpcProcess {
    pub pid: u32,
    pub name: String,
    pub user: String,
    pub cmd: String,
    pub path: String,
    pub role: Role,
}

/// Drives the introspection pipeline over a process list.
pub struct Scanner {
    offsets: ArchOffsets,
    target_module: &'static str,
    cancel: Option<Arc<AtomicBool>>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    /// Scanner for native 64-bit targets.
    pub fn new() -> Self {
        Self::with_offsets(X64)
    }

    /// Scanner with an explicit structure layout.
    pub fn with_offsets(offsets: ArchOffsets) -> Self {
        Self {
            offsets,
            target_module: RPC_RUNTIME_DLL,
            cancel: None,
        }
    }

    /// Installs a coarse cancellation flag, checked only between
    /// processes; an in-flight read sequence always runs to completion
    /// or failure first.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Scans `processes` in order, feeding each non-[`Role::None`]
    /// record to `sink` as soon as it is produced.
    ///
    /// Per-process failures are logged and skipped; they never abort
    /// the remaining list.
    pub fn scan<O, F>(&self, opener: &mut O, processes: &[ProcessEntry], mut sink: F)
    where
        O: OpenProcessHandle,
        F: FnMut(RpcProcess),
    {
        for entry in processes {
            if let Some(cancel) = &self.cancel {
                if cancel.load(Ordering::Relaxed) {
                    debug!("cancellation requested, stopping enumeration");
                    break;
                }
            }

            match self.scan_process(opener, entry) {
                Ok(Some(record)) => sink(record),
                Ok(None) => trace!("pid {}: no rpc role", entry.pid),
                Err(err) => warn!("pid {} ({}): {}", entry.pid, entry.name, err),
            }
        }
    }

    /// Runs the whole pipeline for one process.
    ///
    /// The handle acquired here is dropped on every path out of this
    /// function, success or not.
    fn scan_process<O>(&self, opener: &mut O, entry: &ProcessEntry) -> Result<Option<RpcProcess>>
    where
        O: OpenProcessHandle,
    {
        let mut handle = opener.open(entry.pid)?;

        let peb_addr = handle.peb_address()?;
        let peb = Peb::load(&mut handle, peb_addr, &self.offsets)?;
        let ldr = LdrData::load(&mut handle, peb.ldr, &self.offsets)?;
        let list = ModuleList::new(&ldr);

        // the first node is the host's own image; its size is kept as
        // the carve fallback and it is never matched against the target
        let mut host_size = 0u32;
        let mut matched: Option<ModuleInfo> = None;
        for (idx, module) in list.iter(&mut handle, &self.offsets).enumerate() {
            let module = module?;
            if idx == 0 {
                host_size = module.size;
            } else if module.name.eq_ignore_ascii_case(self.target_module) {
                matched = Some(module);
                break;
            }
        }

        let module = match matched {
            Some(module) => module,
            None => return Ok(None),
        };

        // each module is carved with its own size; the host size only
        // covers entries that report zero
        let size = if module.size != 0 { module.size } else { host_size };
        if size == 0 {
            return Err(Error::Other("matched module reports zero image size"));
        }

        trace!(
            "pid {}: carving {} ({} bytes at {:x})",
            entry.pid,
            module.name,
            size,
            module.base
        );
        let image = CarvedImage::carve(&mut handle, module.base, size as usize)?;
        let imports = image.import_names()?;
        let role = Role::classify(imports.iter().map(String::as_str));
        if role == Role::None {
            return Ok(None);
        }

        // command line, path and owner are best-effort decoration; the
        // role has already been determined
        let params = ProcessParameters::load(&mut handle, peb.params, &self.offsets)
            .unwrap_or_else(|err| {
                debug!("pid {}: process parameters unresolved: {}", entry.pid, err);
                ProcessParameters::default()
            });
        let user = handle.owner().unwrap_or_else(|err| {
            debug!("pid {}: owner unresolved: {}", entry.pid, err);
            String::new()
        });

        Ok(Some(RpcProcess {
            pid: entry.pid,
            name: entry.name.clone(),
            user,
            cmd: params.command_line,
            path: params.image_path,
            role,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{build_pe_x64, DummyOpener, DummyProcess, SpaceBuilder};
    use crate::offsets::X64;

    const IMAGE_BASE: u64 = 0x7ff8_0000_0000;

    fn entry(pid: u32, name: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            parent_pid: 4,
            name: name.into(),
        }
    }

    /// A process whose rpcrt4 module imports the given names.
    fn rpc_process(imports: &[&str]) -> DummyProcess {
        let image = build_pe_x64(&[("ntdll.dll", imports)]);
        let mut builder = SpaceBuilder::new(X64);
        builder.peb(0x10000, 0x400000, 0x20000, 0x30000);
        builder.params(0x30000, r"C:\svc\host.exe", "host.exe --serve");
        builder.module(0x40000, 0x400000, 0x5000, "host.exe", r"C:\svc\host.exe");
        builder.module(
            0x41000,
            IMAGE_BASE,
            image.len() as u32,
            "RPCRT4.dll",
            r"C:\Windows\System32\rpcrt4.dll",
        );
        builder.image(IMAGE_BASE, image);
        builder.process("corp\\svcacct")
    }

    /// A process that never loaded the rpc runtime.
    fn plain_process() -> DummyProcess {
        let mut builder = SpaceBuilder::new(X64);
        builder.peb(0x10000, 0x400000, 0x20000, 0x30000);
        builder.params(0x30000, r"C:\plain.exe", "plain.exe");
        builder.module(0x40000, 0x400000, 0x5000, "plain.exe", r"C:\plain.exe");
        builder.module(0x41000, 0x7000_0000, 0x2000, "ntdll.dll", r"C:\Windows\System32\ntdll.dll");
        builder.process("corp\\user")
    }

    #[test]
    fn emits_a_record_for_a_server_process() {
        let mut opener = DummyOpener::new();
        opener.insert(100, rpc_process(&["RpcServerListenEx", "Sleep"]));

        let mut records = Vec::new();
        Scanner::new().scan(&mut opener, &[entry(100, "host.exe")], |r| records.push(r));

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.pid, 100);
        assert_eq!(record.name, "host.exe");
        assert_eq!(record.role, Role::Server);
        assert_eq!(record.user, "corp\\svcacct");
        assert_eq!(record.cmd, "host.exe --serve");
        assert_eq!(record.path, r"C:\svc\host.exe");
    }

    #[test]
    fn classifies_client_and_both() {
        let mut opener = DummyOpener::new();
        opener.insert(1, rpc_process(&["RpcStringBindingComposeA"]));
        opener.insert(2, rpc_process(&["RpcServerListenEx", "RpcStringBindingComposeA"]));

        let mut roles = Vec::new();
        Scanner::new().scan(
            &mut opener,
            &[entry(1, "a.exe"), entry(2, "b.exe")],
            |r| roles.push(r.role),
        );

        assert_eq!(roles, vec![Role::Client, Role::Both]);
    }

    #[test]
    fn none_role_is_not_emitted() {
        let mut opener = DummyOpener::new();
        opener.insert(1, rpc_process(&["CreateFileW"]));

        let mut records = Vec::new();
        Scanner::new().scan(&mut opener, &[entry(1, "a.exe")], |r| records.push(r));

        assert!(records.is_empty());
    }

    #[test]
    fn processes_without_the_runtime_are_skipped() {
        let mut opener = DummyOpener::new();
        opener.insert(1, plain_process());

        let mut records = Vec::new();
        Scanner::new().scan(&mut opener, &[entry(1, "plain.exe")], |r| records.push(r));

        assert!(records.is_empty());
    }

    #[test]
    fn output_follows_input_order_across_roleless_neighbors() {
        let mut opener = DummyOpener::new();
        opener.insert(1, rpc_process(&["RpcServerListenEx"]));
        opener.insert(2, plain_process());
        opener.insert(3, rpc_process(&["RpcStringBindingComposeA"]));

        let mut pids = Vec::new();
        Scanner::new().scan(
            &mut opener,
            &[entry(1, "a.exe"), entry(2, "b.exe"), entry(3, "c.exe")],
            |r| pids.push(r.pid),
        );

        assert_eq!(pids, vec![1, 3]);
    }

    #[test]
    fn one_broken_process_does_not_stop_its_neighbors() {
        let mut opener = DummyOpener::new();
        opener.insert(1, rpc_process(&["RpcServerListenEx"]));
        // pid 2: nothing mapped at all, every read fails
        opener.insert(2, DummyProcess::empty(0x10000));
        opener.insert(3, rpc_process(&["RpcStringBindingComposeA"]));

        let mut pids = Vec::new();
        Scanner::new().scan(
            &mut opener,
            &[entry(1, "a.exe"), entry(2, "b.exe"), entry(3, "c.exe")],
            |r| pids.push(r.pid),
        );

        // output preserves input order with the broken process skipped
        assert_eq!(pids, vec![1, 3]);
    }

    #[test]
    fn unopenable_process_is_skipped() {
        let mut opener = DummyOpener::new();
        opener.insert(2, rpc_process(&["RpcServerListenEx"]));

        let mut pids = Vec::new();
        Scanner::new().scan(
            &mut opener,
            &[entry(1, "gone.exe"), entry(2, "a.exe")],
            |r| pids.push(r.pid),
        );

        assert_eq!(pids, vec![2]);
    }

    #[test]
    fn first_module_is_never_matched_as_the_target() {
        // host executable maliciously named like the runtime; only the
        // later real module may match, and there is none
        let mut builder = SpaceBuilder::new(X64);
        builder.peb(0x10000, 0x400000, 0x20000, 0x30000);
        builder.params(0x30000, r"C:\rpcrt4.dll", "rpcrt4.dll");
        builder.module(0x40000, 0x400000, 0x5000, "rpcrt4.dll", r"C:\rpcrt4.dll");
        builder.module(0x41000, 0x7000_0000, 0x2000, "ntdll.dll", r"C:\Windows\System32\ntdll.dll");

        let mut opener = DummyOpener::new();
        opener.insert(1, builder.process("corp\\user"));

        let mut records = Vec::new();
        Scanner::new().scan(&mut opener, &[entry(1, "rpcrt4.dll")], |r| records.push(r));

        assert!(records.is_empty());
    }

    #[test]
    fn zero_size_module_falls_back_to_host_size() {
        let image = build_pe_x64(&[("ntdll.dll", &["RpcServerListenEx"])]);
        let mut builder = SpaceBuilder::new(X64);
        builder.peb(0x10000, 0x400000, 0x20000, 0x30000);
        builder.params(0x30000, r"C:\host.exe", "host.exe");
        // host size matches the carveable image length
        builder.module(0x40000, 0x400000, image.len() as u32, "host.exe", r"C:\host.exe");
        builder.module(0x41000, IMAGE_BASE, 0, "rpcrt4.dll", r"C:\Windows\System32\rpcrt4.dll");
        builder.image(IMAGE_BASE, image);

        let mut opener = DummyOpener::new();
        opener.insert(1, builder.process("corp\\user"));

        let mut records = Vec::new();
        Scanner::new().scan(&mut opener, &[entry(1, "host.exe")], |r| records.push(r));

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, Role::Server);
    }

    #[test]
    fn decoration_failures_degrade_to_empty_fields() {
        let image = build_pe_x64(&[("ntdll.dll", &["RpcServerListenEx"])]);
        let mut builder = SpaceBuilder::new(X64);
        // params pointer leads nowhere; owner resolution denied
        builder.peb(0x10000, 0x400000, 0x20000, 0xdead_0000);
        builder.module(0x40000, 0x400000, 0x5000, "host.exe", r"C:\host.exe");
        builder.module(
            0x41000,
            IMAGE_BASE,
            image.len() as u32,
            "rpcrt4.dll",
            r"C:\Windows\System32\rpcrt4.dll",
        );
        builder.image(IMAGE_BASE, image);

        let mut opener = DummyOpener::new();
        opener.insert(1, builder.process_without_owner());

        let mut records = Vec::new();
        Scanner::new().scan(&mut opener, &[entry(1, "host.exe")], |r| records.push(r));

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, Role::Server);
        assert_eq!(records[0].user, "");
        assert_eq!(records[0].cmd, "");
        assert_eq!(records[0].path, "");
    }

    #[test]
    fn cancellation_stops_before_the_next_process() {
        let mut opener = DummyOpener::new();
        opener.insert(1, rpc_process(&["RpcServerListenEx"]));

        let cancel = Arc::new(AtomicBool::new(true));
        let mut records = Vec::new();
        Scanner::new()
            .with_cancel(cancel)
            .scan(&mut opener, &[entry(1, "a.exe")], |r| records.push(r));

        assert!(records.is_empty());
    }
}
