/*!
Live Windows bindings for the pipeline's collaborator seams: opening
targets, enumerating the process table and pre-flighting the debug
privilege. Everything else in the crate is host-OS independent.
*/

pub mod process;
#[doc(hidden)]
pub use process::{Win32Opener, Win32ProcessHandle};

pub mod procs;
#[doc(hidden)]
pub use procs::processes;

pub mod privs;
#[doc(hidden)]
pub use privs::enable_debug_privilege;
