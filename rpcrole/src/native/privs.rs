//! Debug-privilege pre-flight for the current process token.

use std::ptr;

use log::debug;

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_SUCCESS, HANDLE, LUID};
use windows_sys::Win32::Security::{
    AdjustTokenPrivileges, LookupPrivilegeValueW, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED,
    TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

use crate::error::{Error, Result};

/// Enables SeDebugPrivilege on the current token.
///
/// Without it most foreign processes refuse to open; with the rights
/// precondition unmet the scan still runs and simply skips everything
/// it cannot open.
pub fn enable_debug_privilege() -> Result<()> {
    let name: Vec<u16> = "SeDebugPrivilege"
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();

    let mut luid = LUID {
        LowPart: 0,
        HighPart: 0,
    };
    if unsafe { LookupPrivilegeValueW(ptr::null(), name.as_ptr(), &mut luid) } == 0 {
        return Err(Error::AccessDenied("debug privilege lookup"));
    }

    let mut token: HANDLE = ptr::null_mut();
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_ADJUST_PRIVILEGES, &mut token) } == 0 {
        return Err(Error::AccessDenied("own process token"));
    }

    let privileges = TOKEN_PRIVILEGES {
        PrivilegeCount: 1,
        Privileges: [LUID_AND_ATTRIBUTES {
            Luid: luid,
            Attributes: SE_PRIVILEGE_ENABLED,
        }],
    };
    let adjusted = unsafe {
        AdjustTokenPrivileges(token, 0, &privileges, 0, ptr::null_mut(), ptr::null_mut())
    };
    // the call reports success even when the privilege was absent
    let assigned = unsafe { GetLastError() } == ERROR_SUCCESS;
    unsafe { CloseHandle(token) };

    if adjusted == 0 || !assigned {
        return Err(Error::AccessDenied("debug privilege not held"));
    }

    debug!("debug privilege enabled");
    Ok(())
}
