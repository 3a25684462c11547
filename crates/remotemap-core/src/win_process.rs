//! `RemoteProcess` over a Windows process handle.

use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::OnceLock;

use windows::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, HMODULE, WAIT_FAILED};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_PROTECTION_FLAGS,
    VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, VirtualQueryEx,
};
use windows::Win32::System::ProcessStatus::{
    EnumProcessModulesEx, GetModuleBaseNameW, GetModuleFileNameExW, LIST_MODULES_ALL,
};
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetCurrentProcess, GetCurrentProcessId, INFINITE, OpenProcess,
    PROCESS_ALL_ACCESS, WaitForSingleObject,
};
use windows::core::w;

use crate::arch::Architecture;
use crate::exports::{ExportDirectory, ExportTarget, ForwarderSymbol};
use crate::pe::{Layout, PeImage, RemoteImage};
use crate::process::{Protection, RemoteProcess, RemoteThread};
use crate::resolver::MAX_FORWARDER_DEPTH;
use crate::{Error, Result};

const MAX_MODULES: usize = 1024;

fn last_error_code() -> u32 {
    unsafe { GetLastError() }.0
}

/// Whether the application compatibility shim engine is loaded in this process.
pub fn shim_engine_loaded() -> bool {
    unsafe { GetModuleHandleW(w!("ShimEng.dll")) }.is_ok()
}

/// An opened target process. The handle is closed on drop.
pub struct WindowsProcess {
    handle: HANDLE,
    owned: bool,
    pid: u32,
    architecture: Architecture,
    last_error_routine: OnceLock<u64>,
}

impl WindowsProcess {
    /// Open a process by id with full access.
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, pid) }
            .map_err(|e| Error::Other(format!("Failed to open process {}: {}", pid, e)))?;

        let mut process = Self {
            handle,
            owned: true,
            pid,
            architecture: Architecture::host(),
            last_error_routine: OnceLock::new(),
        };
        process.architecture = process.read_architecture()?;
        log::debug!(
            "Opened process {} ({:?}{})",
            pid,
            process.architecture,
            if process.is_cross_bitness() { ", cross-bitness" } else { "" }
        );
        Ok(process)
    }

    /// The controller process itself, through its pseudo-handle.
    pub fn current() -> Self {
        Self {
            handle: unsafe { GetCurrentProcess() },
            owned: false,
            pid: unsafe { GetCurrentProcessId() },
            architecture: Architecture::host(),
            last_error_routine: OnceLock::new(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn as_raw(&self) -> HANDLE {
        self.handle
    }

    fn modules(&self) -> Result<Vec<HMODULE>> {
        let mut modules = [HMODULE::default(); MAX_MODULES];
        let mut needed = 0u32;
        unsafe {
            EnumProcessModulesEx(
                self.handle,
                modules.as_mut_ptr(),
                std::mem::size_of_val(&modules) as u32,
                &mut needed,
                LIST_MODULES_ALL,
            )
        }
        .map_err(|e| Error::Other(format!("EnumProcessModulesEx failed: {}", e)))?;

        let count = (needed as usize / std::mem::size_of::<HMODULE>()).min(MAX_MODULES);
        Ok(modules[..count].to_vec())
    }

    /// Machine type of the main executable image.
    fn read_architecture(&self) -> Result<Architecture> {
        let exe = self
            .modules()?
            .first()
            .copied()
            .ok_or_else(|| Error::Other(format!("Process {} has no modules", self.pid)))?;
        let image = PeImage::parse(RemoteImage::new(self, exe.0 as u64), Layout::Mapped)?;
        let machine = image.headers().machine;
        Architecture::from_machine(machine).ok_or_else(|| {
            Error::ImageFormatInvalid(format!("unsupported target machine 0x{:04X}", machine))
        })
    }

    /// Address of an export of an already-loaded module, following forwarders
    /// through other loaded modules.
    fn loaded_export(&self, module: &str, symbol: &str) -> Result<u64> {
        let mut module = module.to_string();
        let mut symbol = ForwarderSymbol::Name(symbol.to_string());

        for _ in 0..MAX_FORWARDER_DEPTH {
            let base = self
                .find_module(&module)?
                .ok_or_else(|| Error::SystemModuleNotFound(module.clone()))?;
            let image = PeImage::parse(RemoteImage::new(self, base), Layout::Mapped)?;
            let not_found = || Error::ExportNotFound {
                module: module.clone(),
                export: symbol.to_string(),
            };
            let exports = ExportDirectory::read(&image)?.ok_or_else(not_found)?;
            let export = match &symbol {
                ForwarderSymbol::Name(name) => exports.by_name(&image, name)?,
                ForwarderSymbol::Ordinal(ordinal) => exports.by_ordinal(&image, *ordinal)?,
            }
            .ok_or_else(not_found)?;

            match export.target {
                ExportTarget::Rva(rva) => return Ok(base + u64::from(rva)),
                ExportTarget::Forwarded(forwarder) => {
                    module = forwarder.module;
                    symbol = forwarder.symbol;
                }
            }
        }

        Err(Error::ForwarderDepthExceeded {
            module,
            symbol: symbol.to_string(),
        })
    }
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        if self.owned {
            unsafe { CloseHandle(self.handle).ok() };
        }
    }
}

impl RemoteProcess for WindowsProcess {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn is_cross_bitness(&self) -> bool {
        self.architecture != Architecture::host()
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<u64> {
        let address = unsafe {
            VirtualAllocEx(
                self.handle,
                None,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_PROTECTION_FLAGS(protection.to_page_flags()),
            )
        };
        if address.is_null() {
            return Err(Error::RemoteAllocationFailed {
                size,
                code: last_error_code(),
            });
        }
        Ok(address as u64)
    }

    fn allocate_preferred(&self, preferred: u64, size: usize, protection: Protection) -> Result<u64> {
        let address = unsafe {
            VirtualAllocEx(
                self.handle,
                Some(preferred as *const c_void),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_PROTECTION_FLAGS(protection.to_page_flags()),
            )
        };
        if address.is_null() {
            log::debug!(
                "Preferred base 0x{:X} unavailable (error {})",
                preferred,
                last_error_code()
            );
            return self.allocate(size, protection);
        }
        Ok(address as u64)
    }

    fn free(&self, address: u64) -> Result<()> {
        unsafe { VirtualFreeEx(self.handle, address as *mut c_void, 0, MEM_RELEASE) }?;
        Ok(())
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                None,
            )
        }
        .map_err(|_| Error::MemoryReadFailed {
            address,
            size: buf.len(),
            code: last_error_code(),
        })
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        unsafe {
            WriteProcessMemory(
                self.handle,
                address as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                None,
            )
        }
        .map_err(|_| Error::MemoryWriteFailed {
            address,
            size: data.len(),
            code: last_error_code(),
        })
    }

    fn query_protection(&self, address: u64) -> Result<Protection> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let len = unsafe {
            VirtualQueryEx(
                self.handle,
                Some(address as *const c_void),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if len == 0 {
            return Err(Error::Other(format!(
                "VirtualQueryEx at 0x{:X} failed (error {})",
                address,
                last_error_code()
            )));
        }
        Protection::from_page_flags(info.Protect.0).ok_or_else(|| {
            Error::Other(format!(
                "Unknown protection 0x{:X} at 0x{:X}",
                info.Protect.0, address
            ))
        })
    }

    fn protect(&self, address: u64, size: usize, protection: Protection) -> Result<Protection> {
        let mut previous = PAGE_PROTECTION_FLAGS::default();
        unsafe {
            VirtualProtectEx(
                self.handle,
                address as *const c_void,
                size,
                PAGE_PROTECTION_FLAGS(protection.to_page_flags()),
                &mut previous,
            )
        }
        .map_err(|_| Error::ProtectionChangeFailed {
            address,
            size,
            code: last_error_code(),
        })?;
        Ok(Protection::from_page_flags(previous.0).unwrap_or(Protection::NoAccess))
    }

    fn spawn_thread(&self, entry: u64, argument: u64) -> Result<RemoteThread> {
        let start: unsafe extern "system" fn(*mut c_void) -> u32 =
            unsafe { std::mem::transmute(entry as usize) };
        let thread = unsafe {
            CreateRemoteThread(
                self.handle,
                None,
                0,
                Some(start),
                Some(argument as *const c_void),
                0,
                None,
            )
        }
        .map_err(|_| Error::RemoteThreadCreationFailed {
            code: last_error_code(),
        })?;
        Ok(RemoteThread(thread.0 as u64))
    }

    fn wait(&self, thread: RemoteThread) -> Result<()> {
        let handle = HANDLE(thread.0 as *mut c_void);
        let status = unsafe { WaitForSingleObject(handle, INFINITE) };
        let result = if status == WAIT_FAILED {
            Err(Error::RemoteThreadWaitFailed {
                code: last_error_code(),
            })
        } else {
            Ok(())
        };
        unsafe { CloseHandle(handle).ok() };
        result
    }

    fn process_path(&self) -> Result<PathBuf> {
        let mut buf = [0u16; 1024];
        let len = unsafe { GetModuleFileNameExW(Some(self.handle), None, &mut buf) };
        if len == 0 {
            return Err(Error::Other(format!(
                "GetModuleFileNameExW failed (error {})",
                last_error_code()
            )));
        }
        Ok(PathBuf::from(String::from_utf16_lossy(&buf[..len as usize])))
    }

    fn find_module(&self, name: &str) -> Result<Option<u64>> {
        for module in self.modules()? {
            let mut buf = [0u16; 260];
            let len = unsafe { GetModuleBaseNameW(self.handle, Some(module), &mut buf) };
            if len > 0 && String::from_utf16_lossy(&buf[..len as usize]).eq_ignore_ascii_case(name)
            {
                return Ok(Some(module.0 as u64));
            }
        }
        Ok(None)
    }

    fn last_error_routine(&self) -> Result<u64> {
        if let Some(&address) = self.last_error_routine.get() {
            return Ok(address);
        }
        let address = self.loaded_export("kernel32.dll", "GetLastError")?;
        log::debug!("GetLastError in process {} at 0x{:X}", self.pid, address);
        Ok(*self.last_error_routine.get_or_init(|| address))
    }
}
