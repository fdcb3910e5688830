/*!
An open handle to one live target process.

The handle carries the two rights the pipeline needs and nothing more:
querying basic information and reading virtual memory. It is closed
unconditionally on drop, so the scanner can never leak handles across a
long enumeration.
*/

use std::ptr;

use log::{debug, trace};

use ntapi::ntmmapi::NtReadVirtualMemory;
use ntapi::ntpsapi::{
    NtQueryInformationProcess, ProcessBasicInformation, PROCESS_BASIC_INFORMATION,
};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, HANDLE,
};
use windows_sys::Win32::Security::{
    GetTokenInformation, LookupAccountSidW, TokenUser, SID_NAME_USE, TOKEN_QUERY, TOKEN_USER,
};
use windows_sys::Win32::System::Threading::{
    OpenProcess, OpenProcessToken, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

use crate::error::{Error, Result};
use crate::mem::ProcessMemory;
use crate::scan::{OpenProcessHandle, ProcessHandle};
use crate::types::Address;

// NTSTATUS values surfaced by the calls below (ntstatus.h)
const STATUS_ACCESS_VIOLATION: i32 = 0xc000_0005_u32 as i32;
const STATUS_ACCESS_DENIED: i32 = 0xc000_0022_u32 as i32;
const STATUS_PARTIAL_COPY: i32 = 0x8000_000d_u32 as i32;

#[inline]
fn nt_success(status: i32) -> bool {
    status >= 0
}

pub struct Win32ProcessHandle {
    handle: HANDLE,
    pid: u32,
}

impl Win32ProcessHandle {
    /// Opens `pid` with query + memory-read rights only.
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, 0, pid) };
        if handle.is_null() {
            let code = unsafe { GetLastError() };
            return Err(if code == ERROR_ACCESS_DENIED {
                Error::AccessDenied("open process")
            } else {
                Error::Other("process could not be opened")
            });
        }

        trace!("pid {}: opened handle", pid);
        Ok(Self { handle, pid })
    }
}

impl ProcessMemory for Win32ProcessHandle {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }

        let mut bytes_read: usize = 0;
        let status = unsafe {
            NtReadVirtualMemory(
                self.handle.cast(),
                addr.as_usize() as *mut _,
                out.as_mut_ptr().cast(),
                out.len(),
                &mut bytes_read,
            )
        };

        if !nt_success(status) {
            return Err(match status {
                STATUS_ACCESS_DENIED => Error::AccessDenied("read process memory"),
                STATUS_ACCESS_VIOLATION | STATUS_PARTIAL_COPY => Error::InvalidAddress,
                _ => Error::MemoryRead("remote read failed"),
            });
        }

        // a successful call that copied less than requested is still a
        // failed read, never truncated data
        if bytes_read != out.len() {
            return Err(Error::MemoryRead("short remote read"));
        }

        Ok(())
    }
}

impl ProcessHandle for Win32ProcessHandle {
    fn peb_address(&mut self) -> Result<Address> {
        let mut pbi: PROCESS_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let mut ret_len = 0u32;

        let status = unsafe {
            NtQueryInformationProcess(
                self.handle.cast(),
                ProcessBasicInformation,
                &mut pbi as *mut _ as *mut _,
                std::mem::size_of::<PROCESS_BASIC_INFORMATION>() as u32,
                &mut ret_len,
            )
        };
        if !nt_success(status) {
            return Err(if status == STATUS_ACCESS_DENIED {
                Error::AccessDenied("query process information")
            } else {
                Error::ControlBlock("process basic information query failed")
            });
        }

        let peb = pbi.PebBaseAddress as u64;
        trace!("pid {}: peb at {:x}", self.pid, peb);
        if peb == 0 {
            return Err(Error::ControlBlock("process has no peb"));
        }
        Ok(Address::from(peb))
    }

    fn owner(&mut self) -> Result<String> {
        let mut token: HANDLE = ptr::null_mut();
        if unsafe { OpenProcessToken(self.handle, TOKEN_QUERY, &mut token) } == 0 {
            return Err(Error::AccessDenied("process token"));
        }

        let result = token_owner(token);
        unsafe { CloseHandle(token) };
        result
    }
}

impl Drop for Win32ProcessHandle {
    fn drop(&mut self) {
        debug!("pid {}: closing handle", self.pid);
        unsafe { CloseHandle(self.handle) };
    }
}

fn token_owner(token: HANDLE) -> Result<String> {
    // first call sizes the buffer, second fills it
    let mut len = 0u32;
    unsafe { GetTokenInformation(token, TokenUser, ptr::null_mut(), 0, &mut len) };
    if len == 0 {
        return Err(Error::AccessDenied("token user query"));
    }

    let mut buf = vec![0u8; len as usize];
    if unsafe { GetTokenInformation(token, TokenUser, buf.as_mut_ptr().cast(), len, &mut len) } == 0
    {
        return Err(Error::AccessDenied("token user query"));
    }
    let user = unsafe { ptr::read_unaligned(buf.as_ptr() as *const TOKEN_USER) };
    let sid = user.User.Sid;

    let mut name = [0u16; 256];
    let mut name_len = name.len() as u32;
    let mut domain = [0u16; 256];
    let mut domain_len = domain.len() as u32;
    let mut sid_use: SID_NAME_USE = 0;
    if unsafe {
        LookupAccountSidW(
            ptr::null(),
            sid,
            name.as_mut_ptr(),
            &mut name_len,
            domain.as_mut_ptr(),
            &mut domain_len,
            &mut sid_use,
        )
    } == 0
    {
        return Err(Error::Other("account lookup failed"));
    }

    Ok(format!(
        "{}\\{}",
        String::from_utf16_lossy(&domain[..domain_len as usize]),
        String::from_utf16_lossy(&name[..name_len as usize])
    ))
}

/// Opens live processes for the scanner.
pub struct Win32Opener;

impl OpenProcessHandle for Win32Opener {
    type Handle = Win32ProcessHandle;

    fn open(&mut self, pid: u32) -> Result<Self::Handle> {
        Win32ProcessHandle::open(pid)
    }
}
