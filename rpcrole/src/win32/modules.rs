/*!
Walker over the loader's doubly linked module list.

The list is circular and lives entirely inside the target, which keeps
mutating it while we read. The walk is therefore lazy, bounded and
non-restartable: every node is a one-shot snapshot, termination is
checked on every step and never assumed, and walking again means
reloading the control block first.
*/

use dataview::Pod;
use log::debug;

use crate::error::{Error, Result};
use crate::mem::ProcessMemory;
use crate::offsets::ArchOffsets;
use crate::types::Address;
use crate::win32::peb::LdrData;
use crate::win32::unicode_string::read_unicode_string;

/// Upper bound on nodes followed in one walk. A healthy process loads a
/// few hundred modules; anything past this is a corrupt or adversarial
/// list.
pub const MAX_MODULE_COUNT: usize = 4096;

/// One resolved module-list node.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Remote address of the list node itself.
    pub entry: Address,
    /// Remote base of the module's mapped image.
    pub base: Address,
    /// Byte length of the mapped image.
    pub size: u32,
    /// File name of the module (BaseDllName).
    pub name: String,
    /// On-disk path of the module (FullDllName), empty if unresolvable.
    pub path: String,
}

/// The module list of one control-block snapshot.
pub struct ModuleList {
    head: Address,
    first: Address,
}

impl ModuleList {
    pub fn new(ldr: &LdrData) -> Self {
        Self {
            head: ldr.head,
            first: ldr.first,
        }
    }

    /// Starts a walk. The first yielded module is always the process's
    /// own main executable, not a dependency.
    pub fn iter<'a, T: ProcessMemory>(
        &self,
        mem: &'a mut T,
        offsets: &ArchOffsets,
    ) -> ModuleListIter<'a, T> {
        ModuleListIter {
            mem,
            offsets: *offsets,
            head: self.head,
            cursor: self.first,
            seen: 0,
            done: false,
        }
    }
}

pub struct ModuleListIter<'a, T: ProcessMemory> {
    mem: &'a mut T,
    offsets: ArchOffsets,
    head: Address,
    cursor: Address,
    seen: usize,
    done: bool,
}

impl<'a, T: ProcessMemory> Iterator for ModuleListIter<'a, T> {
    type Item = Result<ModuleInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // the circle closed onto the sentinel before this node
        if self.cursor.is_null() || self.cursor == self.head {
            self.done = true;
            return None;
        }

        if self.seen >= MAX_MODULE_COUNT {
            debug!("module list exceeded {} nodes, stopping", MAX_MODULE_COUNT);
            self.done = true;
            return None;
        }

        let buf = match self.mem.read_raw(self.cursor, self.offsets.entry_read) {
            Ok(buf) => buf,
            Err(_) => {
                self.done = true;
                return Some(Err(Error::MemoryRead("module list entry")));
            }
        };

        let flink = self.offsets.read_ptr(&buf, 0);
        let blink = self.offsets.read_ptr(&buf, self.offsets.entry_blink);
        let base = self.offsets.read_ptr(&buf, self.offsets.entry_base);
        let size = Pod::as_data_view(&buf[..]).copy::<u32>(self.offsets.entry_size);
        let (name_buf, name_len) = self
            .offsets
            .read_unicode_ref(&buf, self.offsets.entry_base_name);
        let (path_buf, path_len) = self
            .offsets
            .read_unicode_ref(&buf, self.offsets.entry_full_name);

        let name = match read_unicode_string(self.mem, name_buf, name_len) {
            Ok(name) => name,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        // an empty name is the secondary end-of-list signal; the node
        // carrying it is not a module
        if name.is_empty() {
            self.done = true;
            return None;
        }

        // the path is informational only
        let path = read_unicode_string(self.mem, path_buf, path_len).unwrap_or_else(|err| {
            debug!("module path unresolved at {:x}: {}", self.cursor, err);
            String::new()
        });

        let entry = self.cursor;

        // primary termination: the forward link closes the circle; the
        // self-link and null checks guard torn or corrupt nodes
        if flink == self.head || flink == self.cursor || flink.is_null() || blink.is_null() {
            self.done = true;
        }
        self.cursor = flink;
        self.seen += 1;

        Some(Ok(ModuleInfo {
            entry,
            base,
            size,
            name,
            path,
        }))
    }
}
