/*!
Parsers for the loader structures of a live Windows target.

Everything in here operates on snapshots pulled through a
[`crate::mem::ProcessMemory`] reader, so it compiles and tests on any
host. The structures are a moving target — the remote process keeps
running while we read — so each load is a one-shot snapshot and a failed
read aborts the current process instead of being retried.
*/

pub mod peb;
#[doc(hidden)]
pub use peb::{LdrData, Peb, ProcessParameters};

pub mod modules;
#[doc(hidden)]
pub use modules::{ModuleInfo, ModuleList, ModuleListIter};

pub mod unicode_string;
#[doc(hidden)]
pub use unicode_string::read_unicode_string;
