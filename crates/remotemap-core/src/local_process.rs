//! The controller process as its own target, for Unix hosts.
//!
//! Memory comes from anonymous `mmap` regions and stubs run on `std::thread`
//! threads. Stubs are entered with the Windows calling convention of the host
//! architecture, so code produced for a Windows target runs unchanged.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::arch::Architecture;
use crate::process::{Protection, RemoteProcess, RemoteThread};
use crate::{Error, Result};

const PAGE_SIZE: u64 = 0x1000;

thread_local! {
    static LAST_ERROR: Cell<u32> = const { Cell::new(0) };
}

/// Set the value the last-error routine reports on the calling thread.
pub fn set_last_error(code: u32) {
    LAST_ERROR.with(|value| value.set(code));
}

#[cfg(target_arch = "x86_64")]
extern "win64" fn last_error() -> u32 {
    LAST_ERROR.with(|value| value.get())
}

#[cfg(target_arch = "x86")]
extern "stdcall" fn last_error() -> u32 {
    LAST_ERROR.with(|value| value.get())
}

#[cfg(target_arch = "x86_64")]
unsafe fn run_start_routine(entry: u64, argument: u64) -> u32 {
    let routine: extern "win64" fn(u64) -> u32 = unsafe { std::mem::transmute(entry as usize) };
    routine(argument)
}

#[cfg(target_arch = "x86")]
unsafe fn run_start_routine(entry: u64, argument: u64) -> u32 {
    let routine: extern "stdcall" fn(u32) -> u32 = unsafe { std::mem::transmute(entry as usize) };
    routine(argument as u32)
}

fn errno() -> u32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32
}

fn page_align(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn to_prot(protection: Protection) -> libc::c_int {
    match protection {
        Protection::NoAccess => libc::PROT_NONE,
        Protection::ReadOnly => libc::PROT_READ,
        Protection::ReadWrite | Protection::WriteCopy => libc::PROT_READ | libc::PROT_WRITE,
        Protection::Execute => libc::PROT_EXEC,
        Protection::ExecuteRead => libc::PROT_READ | libc::PROT_EXEC,
        Protection::ExecuteReadWrite | Protection::ExecuteWriteCopy => {
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `RemoteProcess` over the current process.
#[derive(Default)]
pub struct LocalProcess {
    /// base -> mapped length
    allocations: Mutex<BTreeMap<u64, usize>>,
    pages: Mutex<BTreeMap<u64, Protection>>,
    threads: Mutex<HashMap<u64, JoinHandle<u32>>>,
    next_thread: AtomicU64,
}

impl LocalProcess {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, hint: u64, size: usize, protection: Protection) -> Result<u64> {
        let length = page_align(size.max(1) as u64) as usize;
        let address = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                length,
                to_prot(protection),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(Error::RemoteAllocationFailed {
                size,
                code: errno(),
            });
        }

        let base = address as u64;
        lock(&self.allocations).insert(base, length);
        let mut pages = lock(&self.pages);
        for page in (base..base + length as u64).step_by(PAGE_SIZE as usize) {
            pages.insert(page, protection);
        }
        Ok(base)
    }

    /// Whether `[address, address + len)` lies inside one allocation.
    fn owns(&self, address: u64, len: usize) -> bool {
        lock(&self.allocations)
            .range(..=address)
            .next_back()
            .is_some_and(|(&base, &length)| {
                address
                    .checked_add(len as u64)
                    .is_some_and(|end| end <= base + length as u64)
            })
    }

    fn page_protections(&self, address: u64, len: usize) -> Vec<(u64, Protection)> {
        let first = address & !(PAGE_SIZE - 1);
        let end = page_align(address + len as u64);
        lock(&self.pages)
            .range(first..end)
            .map(|(&page, &protection)| (page, protection))
            .collect()
    }

    fn set_protection(&self, first: u64, end: u64, protection: Protection) -> Result<()> {
        let rc = unsafe {
            libc::mprotect(
                first as *mut libc::c_void,
                (end - first) as usize,
                to_prot(protection),
            )
        };
        if rc != 0 {
            return Err(Error::ProtectionChangeFailed {
                address: first,
                size: (end - first) as usize,
                code: errno(),
            });
        }
        let mut pages = lock(&self.pages);
        for page in (first..end).step_by(PAGE_SIZE as usize) {
            pages.insert(page, protection);
        }
        Ok(())
    }
}

impl RemoteProcess for LocalProcess {
    fn architecture(&self) -> Architecture {
        Architecture::host()
    }

    fn is_cross_bitness(&self) -> bool {
        false
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<u64> {
        self.map(0, size, protection)
    }

    fn allocate_preferred(&self, preferred: u64, size: usize, protection: Protection) -> Result<u64> {
        // a hint only; the kernel picks another address when it is taken
        self.map(preferred, size, protection)
    }

    fn free(&self, address: u64) -> Result<()> {
        let length = lock(&self.allocations)
            .remove(&address)
            .ok_or_else(|| Error::Other(format!("No allocation at 0x{:X}", address)))?;
        if unsafe { libc::munmap(address as *mut libc::c_void, length) } != 0 {
            return Err(Error::Other(format!(
                "munmap at 0x{:X} failed (errno {})",
                address,
                errno()
            )));
        }
        let mut pages = lock(&self.pages);
        for page in (address..address + length as u64).step_by(PAGE_SIZE as usize) {
            pages.remove(&page);
        }
        Ok(())
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let readable = self.owns(address, buf.len())
            && self
                .page_protections(address, buf.len())
                .iter()
                .all(|(_, p)| !matches!(p, Protection::NoAccess | Protection::Execute));
        if !readable {
            return Err(Error::MemoryReadFailed {
                address,
                size: buf.len(),
                code: libc::EFAULT as u32,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        if !self.owns(address, data.len()) {
            return Err(Error::MemoryWriteFailed {
                address,
                size: data.len(),
                code: libc::EFAULT as u32,
            });
        }

        // like WriteProcessMemory, writes go through read-only pages
        let locked: Vec<(u64, Protection)> = self
            .page_protections(address, data.len())
            .into_iter()
            .filter(|(_, p)| !p.is_writable())
            .collect();
        for &(page, _) in &locked {
            self.set_protection(page, page + PAGE_SIZE, Protection::ExecuteReadWrite)?;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
        }

        for (page, protection) in locked {
            self.set_protection(page, page + PAGE_SIZE, protection)?;
        }
        Ok(())
    }

    fn query_protection(&self, address: u64) -> Result<Protection> {
        lock(&self.pages)
            .get(&(address & !(PAGE_SIZE - 1)))
            .copied()
            .ok_or_else(|| Error::Other(format!("Address 0x{:X} is not tracked", address)))
    }

    fn protect(&self, address: u64, size: usize, protection: Protection) -> Result<Protection> {
        let previous = self.query_protection(address)?;
        let first = address & !(PAGE_SIZE - 1);
        let end = page_align(address + size as u64);
        self.set_protection(first, end, protection)?;
        Ok(previous)
    }

    fn spawn_thread(&self, entry: u64, argument: u64) -> Result<RemoteThread> {
        let handle = std::thread::Builder::new()
            .name("remotemap-stub".into())
            .spawn(move || unsafe { run_start_routine(entry, argument) })
            .map_err(|e| Error::RemoteThreadCreationFailed {
                code: e.raw_os_error().unwrap_or(0) as u32,
            })?;

        let id = self.next_thread.fetch_add(1, Ordering::Relaxed);
        lock(&self.threads).insert(id, handle);
        Ok(RemoteThread(id))
    }

    fn wait(&self, thread: RemoteThread) -> Result<()> {
        let handle = lock(&self.threads)
            .remove(&thread.0)
            .ok_or(Error::RemoteThreadWaitFailed {
                code: libc::ESRCH as u32,
            })?;
        handle
            .join()
            .map(|_| ())
            .map_err(|_| Error::RemoteThreadWaitFailed { code: 0 })
    }

    fn process_path(&self) -> Result<PathBuf> {
        Ok(std::env::current_exe()?)
    }

    fn find_module(&self, _name: &str) -> Result<Option<u64>> {
        Ok(None)
    }

    fn last_error_routine(&self) -> Result<u64> {
        Ok(last_error as usize as u64)
    }
}
