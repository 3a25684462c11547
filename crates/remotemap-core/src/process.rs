//! Process capability used by the call engine and the mapper.
//!
//! Everything the core does to a target goes through [`RemoteProcess`]. The
//! Windows implementation lives in [`crate::win_process`]; on Unix hosts the
//! current process can act as its own target through
//! [`crate::local_process`].

use std::path::PathBuf;

use crate::arch::Architecture;
use crate::{Error, Result};

// =============================================================================
// Page protection
// =============================================================================

/// Page protection of remote memory, mirroring the Win32 `PAGE_*` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    WriteCopy,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
    ExecuteWriteCopy,
}

impl Protection {
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Protection::ReadWrite
                | Protection::WriteCopy
                | Protection::ExecuteReadWrite
                | Protection::ExecuteWriteCopy
        )
    }

    pub fn is_executable(self) -> bool {
        matches!(
            self,
            Protection::Execute
                | Protection::ExecuteRead
                | Protection::ExecuteReadWrite
                | Protection::ExecuteWriteCopy
        )
    }

    /// Win32 `PAGE_*` constant for this protection.
    pub fn to_page_flags(self) -> u32 {
        match self {
            Protection::NoAccess => 0x01,
            Protection::ReadOnly => 0x02,
            Protection::ReadWrite => 0x04,
            Protection::WriteCopy => 0x08,
            Protection::Execute => 0x10,
            Protection::ExecuteRead => 0x20,
            Protection::ExecuteReadWrite => 0x40,
            Protection::ExecuteWriteCopy => 0x80,
        }
    }

    /// Decode a Win32 `PAGE_*` value, ignoring modifier bits such as `PAGE_GUARD`.
    pub fn from_page_flags(flags: u32) -> Option<Self> {
        match flags & 0xFF {
            0x01 => Some(Protection::NoAccess),
            0x02 => Some(Protection::ReadOnly),
            0x04 => Some(Protection::ReadWrite),
            0x08 => Some(Protection::WriteCopy),
            0x10 => Some(Protection::Execute),
            0x20 => Some(Protection::ExecuteRead),
            0x40 => Some(Protection::ExecuteReadWrite),
            0x80 => Some(Protection::ExecuteWriteCopy),
            _ => None,
        }
    }

    /// The nearest writable protection that keeps execute access.
    pub fn writable(self) -> Self {
        if self.is_executable() {
            Protection::ExecuteReadWrite
        } else {
            Protection::ReadWrite
        }
    }
}

// =============================================================================
// Remote process capability
// =============================================================================

/// Opaque handle to a thread started with [`RemoteProcess::spawn_thread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteThread(pub u64);

/// Memory, thread and module primitives over a target process.
pub trait RemoteProcess {
    /// Instruction set of the target.
    fn architecture(&self) -> Architecture;

    /// Whether the target's bitness differs from the controller's.
    fn is_cross_bitness(&self) -> bool;

    /// Reserve and commit `size` bytes anywhere in the target.
    fn allocate(&self, size: usize, protection: Protection) -> Result<u64>;

    /// Reserve and commit `size` bytes, trying `preferred` first.
    fn allocate_preferred(&self, preferred: u64, size: usize, protection: Protection) -> Result<u64> {
        let _ = preferred;
        self.allocate(size, protection)
    }

    /// Release an allocation made by this process object.
    fn free(&self, address: u64) -> Result<()>;

    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    fn write(&self, address: u64, data: &[u8]) -> Result<()>;

    fn query_protection(&self, address: u64) -> Result<Protection>;

    /// Change protection and return the previous one.
    fn protect(&self, address: u64, size: usize, protection: Protection) -> Result<Protection>;

    /// Start a thread at `entry` with a single pointer-sized argument.
    fn spawn_thread(&self, entry: u64, argument: u64) -> Result<RemoteThread>;

    /// Block until the thread terminates. There is no timeout.
    fn wait(&self, thread: RemoteThread) -> Result<()>;

    /// Path of the target's main executable.
    fn process_path(&self) -> Result<PathBuf>;

    /// Base of an already-loaded module, matched by file name case-insensitively.
    fn find_module(&self, name: &str) -> Result<Option<u64>>;

    /// Address of the routine returning the calling thread's last-error value.
    fn last_error_routine(&self) -> Result<u64>;

    fn read_u16(&self, address: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a pointer-sized value for the target's architecture.
    fn read_pointer(&self, address: u64) -> Result<u64> {
        match self.architecture() {
            Architecture::X86 => self.read_u32(address).map(u64::from),
            Architecture::X64 => self.read_u64(address),
        }
    }

    /// Read a NUL-terminated ANSI string of at most `max_len` bytes.
    fn read_c_string(&self, address: u64, max_len: usize) -> Result<String> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        while out.len() < max_len {
            let cursor = address + out.len() as u64;
            // never let a chunk cross into the next page
            let len = chunk.len().min((0x1000 - (cursor & 0xFFF)) as usize);
            self.read(cursor, &mut chunk[..len])?;
            if let Some(end) = chunk[..len].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..end]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk[..len]);
        }
        Err(Error::Other(format!(
            "String at 0x{:X} exceeds {} bytes",
            address, max_len
        )))
    }
}

// =============================================================================
// RAII helpers
// =============================================================================

/// Remote allocation released when dropped.
pub struct ScopedAllocation<'a, P: RemoteProcess + ?Sized> {
    process: &'a P,
    address: u64,
    size: usize,
}

impl<'a, P: RemoteProcess + ?Sized> ScopedAllocation<'a, P> {
    pub fn new(process: &'a P, size: usize, protection: Protection) -> Result<Self> {
        let address = process.allocate(size, protection)?;
        Ok(Self {
            process,
            address,
            size,
        })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Give up ownership; the memory stays allocated in the target.
    pub fn leak(self) -> u64 {
        let address = self.address;
        std::mem::forget(self);
        address
    }
}

impl<P: RemoteProcess + ?Sized> Drop for ScopedAllocation<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.process.free(self.address) {
            log::warn!("Failed to free remote buffer at 0x{:X}: {}", self.address, e);
        }
    }
}

/// Makes a remote range writable for its lifetime, restoring the old
/// protection when dropped. A no-op when the range is already writable.
pub struct ProtectGuard<'a, P: RemoteProcess + ?Sized> {
    process: &'a P,
    address: u64,
    size: usize,
    previous: Option<Protection>,
}

impl<'a, P: RemoteProcess + ?Sized> ProtectGuard<'a, P> {
    pub fn writable(process: &'a P, address: u64, size: usize) -> Result<Self> {
        let current = process.query_protection(address)?;
        let previous = if current.is_writable() {
            None
        } else {
            Some(process.protect(address, size, current.writable())?)
        };
        Ok(Self {
            process,
            address,
            size,
            previous,
        })
    }
}

impl<P: RemoteProcess + ?Sized> Drop for ProtectGuard<'_, P> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous
            && let Err(e) = self.process.protect(self.address, self.size, previous)
        {
            log::warn!(
                "Failed to restore protection at 0x{:X}: {}",
                self.address,
                e
            );
        }
    }
}

/// Write `data` to a possibly read-only remote range.
pub fn write_protected<P: RemoteProcess + ?Sized>(
    process: &P,
    address: u64,
    data: &[u8],
) -> Result<()> {
    let _guard = ProtectGuard::writable(process, address, data.len())?;
    process.write(address, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProcess;

    #[test]
    fn test_page_flags_round_trip() {
        for prot in [
            Protection::NoAccess,
            Protection::ReadOnly,
            Protection::ReadWrite,
            Protection::WriteCopy,
            Protection::Execute,
            Protection::ExecuteRead,
            Protection::ExecuteReadWrite,
            Protection::ExecuteWriteCopy,
        ] {
            assert_eq!(Protection::from_page_flags(prot.to_page_flags()), Some(prot));
        }
        // PAGE_GUARD | PAGE_READONLY
        assert_eq!(Protection::from_page_flags(0x102), Some(Protection::ReadOnly));
    }

    #[test]
    fn test_scoped_allocation_frees_on_drop() {
        let process = FakeProcess::new();
        let address = {
            let alloc = ScopedAllocation::new(&process, 8, Protection::ReadWrite).unwrap();
            alloc.address()
        };
        assert_eq!(process.freed(), vec![address]);
    }

    #[test]
    fn test_scoped_allocation_leak() {
        let process = FakeProcess::new();
        let alloc = ScopedAllocation::new(&process, 8, Protection::ReadWrite).unwrap();
        let address = alloc.leak();
        assert!(process.freed().is_empty());
        assert!(process.is_allocated(address));
    }

    #[test]
    fn test_write_protected_restores() {
        let process = FakeProcess::new();
        let base = process.allocate(0x1000, Protection::ReadOnly).unwrap();

        write_protected(&process, base + 0x10, &[1, 2, 3, 4]).unwrap();

        assert_eq!(process.read_u32(base + 0x10).unwrap(), 0x0403_0201);
        assert_eq!(process.query_protection(base).unwrap(), Protection::ReadOnly);
        let changes = process.protections();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].2, Protection::ReadWrite);
        assert_eq!(changes[1].2, Protection::ReadOnly);
    }

    #[test]
    fn test_read_c_string() {
        let process = FakeProcess::new();
        let base = process.allocate(0x100, Protection::ReadWrite).unwrap();
        process.write(base, b"kernel32.dll\0junk").unwrap();
        assert_eq!(process.read_c_string(base, 256).unwrap(), "kernel32.dll");
    }
}
